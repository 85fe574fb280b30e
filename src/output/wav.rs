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

// BK-0010 tape output. Bits are pulse trains over three fixed sample
// levels; a file is sync train, header {link address, length, 16-char
// name}, payload, additive checksum, EOF train, wrapped in an 8-bit mono
// PCM RIFF container. The turbo modulation runs at 40000 Hz, the standard
// one at 21428 Hz.

use crate::koi8;

const H: u8 = 208;
const HS: u8 = 200;
const L: u8 = 48;

fn repeated(pattern: &[u8], count: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(pattern.len() * count);
    for _ in 0..count {
        out.extend_from_slice(pattern);
    }
    out
}

// Bits go out LSB-first within each byte.
fn encode_bits(data: &[u8], one: &[u8], zero: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for byte in data {
        let mut byte = *byte;
        for _ in 0..8 {
            if byte & 1 == 1 {
                out.extend_from_slice(one);
            } else {
                out.extend_from_slice(zero);
            }
            byte >>= 1;
        }
    }
    out
}

fn header(link_address: u16, length: u16, bk_name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(20);
    out.extend_from_slice(&link_address.to_le_bytes());
    out.extend_from_slice(&length.to_le_bytes());

    let padded: String = format!("{bk_name:<16}").chars().take(16).collect();
    let name = koi8::encode(&padded).unwrap_or_else(|_| {
        padded
            .chars()
            .map(|c| if (c as u32) < 0x100 { c as u8 } else { b'?' })
            .collect()
    });
    out.extend_from_slice(&name);
    out
}

// 16-bit additive checksum; the carry folds back into the low 16 bits.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for byte in data {
        sum += *byte as u32;
        sum += sum >> 16;
        sum &= 0xFFFF;
    }
    sum as u16
}

fn pcm_container(data: Vec<u8>, sample_rate: u32) -> Vec<u8> {
    let total_size = 36 + data.len() as u32;
    let mut out = Vec::with_capacity(44 + data.len());
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&total_size.to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    // PCM, one channel, 8-bit samples: byte rate equals sample rate.
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&8u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend(data);
    out
}

pub fn turbo_wav(link_address: u16, bk_name: &str, body: &[u8]) -> Vec<u8> {
    let one: &[u8] = &[H, H, H, L, L];
    let zero: &[u8] = &[H, L, L];
    let pause: &[u8] = &[L, L, L, L];

    let mut data = repeated(&[HS, HS, HS, L, L, L], 1024);
    data.extend(repeated(&[HS], 12));
    data.extend(repeated(&[L], 12));

    data.extend(encode_bits(
        &header(link_address, body.len() as u16, bk_name),
        one,
        zero,
    ));
    data.extend_from_slice(pause);
    data.extend(encode_bits(body, one, zero));
    data.extend_from_slice(pause);
    data.extend(encode_bits(&checksum(body).to_le_bytes(), one, zero));

    // EOF marker.
    data.extend(repeated(&[HS], 3));
    data.extend(repeated(&[L], 3));
    data.extend(repeated(&[HS], 3));
    data.extend(repeated(&[L], 3));

    pcm_container(data, 40000)
}

pub fn wav(link_address: u16, bk_name: &str, body: &[u8]) -> Vec<u8> {
    let mut one: Vec<u8> = vec![HS, HS, L, L];
    one.extend(repeated(&[H], 4));
    one.extend(repeated(&[L], 4));
    let mut zero: Vec<u8> = vec![HS, HS, L, L];
    zero.extend(repeated(&[H], 2));
    zero.extend(repeated(&[L], 2));

    let burst = |carrier: usize| -> Vec<u8> {
        let mut out = repeated(&[HS, HS, L, L], carrier);
        out.extend(repeated(&[HS], 8));
        out.extend(repeated(&[L], 8));
        out.extend(repeated(&[H], 4));
        out.extend(repeated(&[L], 4));
        out
    };

    let mut data = burst(4096);
    data.extend(burst(10));

    data.extend(encode_bits(
        &header(link_address, body.len() as u16, bk_name),
        &one,
        &zero,
    ));
    data.extend(burst(10));
    data.extend(encode_bits(body, &one, &zero));
    data.extend(encode_bits(&checksum(body).to_le_bytes(), &one, &zero));
    data.extend(repeated(&[HS, HS, L, L], 200));

    pcm_container(data, 21428)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_folds_carry() {
        assert_eq!(checksum(&[1, 2, 3]), 6);
        // 0xFFFF + 2 overflows into the carry fold.
        assert_eq!(checksum(&[0xFF; 257]), {
            let mut sum: u32 = 0;
            for _ in 0..257 {
                sum += 0xFF;
                sum += sum >> 16;
                sum &= 0xFFFF;
            }
            sum as u16
        });
    }

    #[test]
    fn test_pcm_container_header() {
        let out = pcm_container(vec![128; 10], 40000);
        assert_eq!(&out[0..4], b"RIFF");
        assert_eq!(&out[8..12], b"WAVE");
        assert_eq!(&out[22..24], &1u16.to_le_bytes());
        assert_eq!(&out[24..28], &40000u32.to_le_bytes());
        assert_eq!(&out[34..36], &8u16.to_le_bytes());
        assert_eq!(&out[40..44], &10u32.to_le_bytes());
        assert_eq!(out.len(), 44 + 10);
    }

    #[test]
    fn test_turbo_wav_is_pcm_with_levels() {
        let out = turbo_wav(0o1000, "TEST", &[0x55]);
        assert_eq!(&out[0..4], b"RIFF");
        assert!(out[44..].iter().all(|s| [H, HS, L].contains(s)));
    }

    #[test]
    fn test_wav_rates_differ() {
        let turbo = turbo_wav(0o1000, "A", &[]);
        let standard = wav(0o1000, "A", &[]);
        assert_eq!(&turbo[24..28], &40000u32.to_le_bytes());
        assert_eq!(&standard[24..28], &21428u32.to_le_bytes());
    }

    #[test]
    fn test_header_name_padded_to_16() {
        let h = header(0o1000, 2, "AB");
        assert_eq!(h.len(), 20);
        assert_eq!(&h[4..6], b"AB");
        assert!(h[6..20].iter().all(|b| *b == b' '));
    }
}
