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

// KOI8-R transcoding for string data. The BK-0010 character generator uses
// KOI8-R, so `.ASCII`/`.ASCIZ` payloads and character literals inside
// expressions go through this table.

// Lowercase Cyrillic, KOI8-R rows 0xC0-0xDF.
const LOWER: &str = "юабцдефгхийклмнопярстужвьызшэщчъ";
// Uppercase Cyrillic, KOI8-R rows 0xE0-0xFF.
const UPPER: &str = "ЮАБЦДЕФГХИЙКЛМНОПЯРСТУЖВЬЫЗШЭЩЧЪ";

fn encode_char(c: char) -> Option<u8> {
    // ASCII passes through, and so do raw <N> escapes in the 0x80-0xFF
    // range that do not collide with the Cyrillic rows.
    if (c as u32) < 0x80 {
        return Some(c as u8);
    }
    if c == 'ё' {
        return Some(0xA3);
    }
    if c == 'Ё' {
        return Some(0xB3);
    }
    if let Some(i) = LOWER.chars().position(|l| l == c) {
        return Some(0xC0 + i as u8);
    }
    if let Some(i) = UPPER.chars().position(|u| u == c) {
        return Some(0xE0 + i as u8);
    }
    if (c as u32) < 0x100 {
        return Some(c as u8);
    }
    None
}

/// Encodes a string to KOI8-R bytes. Returns the first character that has
/// no KOI8-R representation on failure.
pub fn encode(s: &str) -> Result<Vec<u8>, char> {
    let mut out = Vec::with_capacity(s.len());
    for c in s.chars() {
        match encode_char(c) {
            Some(b) => out.push(b),
            None => return Err(c),
        }
    }
    Ok(out)
}
