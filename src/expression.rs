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

// Expression leaves: integer literals, label references carrying the file
// they were written in, and the STATIC_ALLOC bump-allocator pseudo-calls.

use crate::deferred::Deferred;
use crate::source::SourcePos;

pub fn literal(n: i64) -> Deferred {
    Deferred::int(n)
}

/// A reference to a label by name. The defining file is attached so that
/// unqualified names resolve to that file's local labels first and fall
/// back to the global table.
pub fn label_ref(name: impl Into<String>, file_id: impl Into<String>, pos: SourcePos) -> Deferred {
    Deferred::label(name, file_id, pos)
}

/// `STATIC_ALLOC(n)` / `STATIC_ALLOC_BYTE(n)`: an address carved from the
/// bump region anchored at the `MEMORY` label. The byte form rounds odd
/// lengths up to keep the region word-aligned; the word form allocates
/// `2 * n` bytes.
pub fn static_alloc(length: Deferred, is_byte: bool) -> Deferred {
    let byte_length = if is_byte {
        length.add(&length.rem(2))
    } else {
        length.mul(2)
    };
    Deferred::static_alloc(byte_length)
}
