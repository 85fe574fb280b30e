/*
Copyright 2025 Connor Nolan

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

// Output containers around a linked image: raw bytes, the BK BIN load
// header, and the RT-11 SAV bootable layout. The tape modulations live in
// wav.rs.

pub mod wav;

pub fn raw(body: &[u8]) -> Vec<u8> {
    body.to_vec()
}

/// BIN: `{link_lo, link_hi, len_lo, len_hi}` then the payload.
pub fn bin(link_address: u16, body: &[u8]) -> Vec<u8> {
    let len = body.len() as u16;
    let mut out = Vec::with_capacity(body.len() + 4);
    out.extend_from_slice(&link_address.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// RT-11 SAV image: 32 zero bytes, a control block at offset 32 holding
/// the link address, the 01000 start word and the final address, a block
/// bitmap at offset 240 marking the 512-byte blocks the program covers,
/// zero padding to offset 512, then the payload.
pub fn sav(link_address: u16, final_address: u16, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 32];

    out.extend_from_slice(&link_address.to_le_bytes());
    out.extend_from_slice(&0o1000u16.to_le_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&final_address.to_le_bytes());

    out.resize(240, 0);

    let block_start = link_address as u32 / 512;
    let block_end = (final_address as u32 + 511) / 512;
    for i in 0..16u32 {
        let mut byte = 0u8;
        for j in 0..8u32 {
            let block = (7 - j) + i * 8;
            if block_start <= block && block < block_end {
                byte |= 1 << j;
            }
        }
        out.push(byte);
    }

    out.resize(512, 0);
    out.extend_from_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_is_identity() {
        assert_eq!(raw(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn test_bin_header() {
        let out = bin(0o1000, &[0x12, 0x34]);
        assert_eq!(out, vec![0x00, 0x02, 0x02, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn test_sav_layout() {
        let body = vec![0xAA; 4];
        let out = sav(0o1000, 0o1004, &body);

        // 512-byte header plus the payload.
        assert_eq!(out.len(), 512 + 4);
        assert!(out[..32].iter().all(|b| *b == 0));
        // Control block: link, 01000 start, zeros, final address.
        assert_eq!(&out[32..34], &0o1000u16.to_le_bytes());
        assert_eq!(&out[34..36], &0o1000u16.to_le_bytes());
        assert_eq!(&out[36..40], &[0, 0, 0, 0]);
        assert_eq!(&out[40..42], &0o1004u16.to_le_bytes());
        // Program covers block 1 only (01000 = 512): MSB-first bitmap.
        assert_eq!(out[240], 0b0100_0000);
        assert!(out[241..256].iter().all(|b| *b == 0));
        assert_eq!(&out[512..], &body[..]);
    }

    #[test]
    fn test_sav_bitmap_spans_blocks() {
        // 01000..05000 covers 512-byte blocks 1, 2, 3, 4.
        let out = sav(0o1000, 0o5000, &[]);
        assert_eq!(out[240], 0b0111_1000);
    }
}
