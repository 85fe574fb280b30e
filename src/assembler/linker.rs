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

// The linker: forces every symbol, paints the write log into a byte
// array in log order (later writes win), and slices the image from the
// link address. Project mode repeats the paint per include-root.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::deferred::{Deferred, Value};
use crate::errors::AssemblyError;
use crate::source::SourcePos;

use super::{Assembler, BuildKind, BuildTarget, RootBuild};

#[derive(Debug, Clone)]
pub enum ResolvedKind {
    Raw,
    Bin,
    Sav { final_addr: Option<i64> },
    TurboWav { bk_name: String },
    Wav { bk_name: String },
}

#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub kind: ResolvedKind,
    pub path: PathBuf,
}

/// One linked image: the raw bytes from the link address up, plus the
/// build targets that want to wrap them.
#[derive(Debug)]
pub struct LinkedImage {
    pub bytes: Vec<u8>,
    pub link_address: i64,
    pub targets: Vec<ResolvedTarget>,
}

fn slice_from(array: Vec<u8>, link_address: i64) -> Result<Vec<u8>, AssemblyError> {
    if link_address < 0 {
        return Err(AssemblyError::ExpressionEvaluate {
            pos: SourcePos::default(),
            reason: format!("negative link address {link_address}"),
        });
    }
    let start = (link_address as usize).min(array.len());
    Ok(array[start..].to_vec())
}

impl Assembler<'_> {
    /// Single-image link: everything compiled so far becomes one byte
    /// array.
    pub fn link(&mut self) -> Result<LinkedImage, AssemblyError> {
        self.force_labels()?;

        let writes = self.writes.clone();
        let array = self.paint(&writes)?;
        let link_address = self.link_address.clone().eval_int(self)?;
        let bytes = slice_from(array, link_address)?;

        let build = self.build.clone();
        let targets = self.resolve_targets(&build)?;
        Ok(LinkedImage {
            bytes,
            link_address,
            targets,
        })
    }

    /// Project-mode link: one image per include-root, all sharing the
    /// symbol table that compilation filled in.
    pub fn link_project(&mut self) -> Result<Vec<LinkedImage>, AssemblyError> {
        self.force_labels()?;

        let roots: Vec<(Vec<BuildTarget>, Vec<(Deferred, Deferred)>, Deferred)> = self
            .all_build
            .iter()
            .map(|root: &RootBuild| {
                (
                    root.targets.clone(),
                    root.writes.clone(),
                    root.link_address.clone(),
                )
            })
            .collect();

        let mut images = Vec::new();
        for (targets, writes, link_address) in roots {
            let array = self.paint(&writes)?;
            let link_address = link_address.eval_int(self)?;
            let bytes = slice_from(array, link_address)?;
            let targets = self.resolve_targets(&targets)?;
            images.push(LinkedImage {
                bytes,
                link_address,
                targets,
            });
        }
        Ok(images)
    }

    // Forces every label first so that "label not found" and recursion
    // errors surface deterministically, before any byte is painted.
    fn force_labels(&mut self) -> Result<(), AssemblyError> {
        for key in self.labels.sorted_keys() {
            let value = self
                .labels
                .get(&key)
                .cloned()
                .expect("key came from the table");
            value.eval(self)?;
        }
        Ok(())
    }

    fn paint(&mut self, writes: &[(Deferred, Deferred)]) -> Result<Vec<u8>, AssemblyError> {
        let mut array: Vec<u8> = Vec::new();
        for (addr, value) in writes {
            let values: Vec<i64> = match value.eval(self)? {
                Value::Int(n) => vec![n],
                Value::List(list) => list,
                other => {
                    return Err(AssemblyError::ExpressionEvaluate {
                        pos: SourcePos::default(),
                        reason: format!("expected bytes in write log, got {other:?}"),
                    });
                }
            };
            let addr = addr.eval_int(self)?;
            if addr < 0 {
                return Err(AssemblyError::ExpressionEvaluate {
                    pos: SourcePos::default(),
                    reason: format!("negative write address {addr}"),
                });
            }
            let addr = addr as usize;
            if addr + values.len() > array.len() {
                array.resize(addr + values.len(), 0);
            }
            for (i, byte) in values.iter().enumerate() {
                array[addr + i] = (*byte & 0xFF) as u8;
            }
        }
        Ok(array)
    }

    fn resolve_targets(
        &mut self,
        targets: &[BuildTarget],
    ) -> Result<Vec<ResolvedTarget>, AssemblyError> {
        let mut resolved = Vec::new();
        for target in targets {
            let kind = match &target.kind {
                BuildKind::Raw => ResolvedKind::Raw,
                BuildKind::Bin => ResolvedKind::Bin,
                BuildKind::Sav { final_addr } => ResolvedKind::Sav {
                    final_addr: match final_addr {
                        Some(d) => Some(d.clone().eval_int(self)?),
                        None => None,
                    },
                },
                BuildKind::TurboWav { bk_name } => ResolvedKind::TurboWav {
                    bk_name: bk_name.clone(),
                },
                BuildKind::Wav { bk_name } => ResolvedKind::Wav {
                    bk_name: bk_name.clone(),
                },
            };
            resolved.push(ResolvedTarget {
                kind,
                path: target.path.clone(),
            });
        }
        Ok(resolved)
    }

    /// The listing: per file, every plain local label with its octal
    /// address. Globals, integer sub-labels, `.REPEAT` copies and the
    /// synthetic dot labels are skipped.
    pub fn generate_listing(&mut self) -> Result<String, AssemblyError> {
        let mut by_file: BTreeMap<String, Vec<(i64, String)>> = BTreeMap::new();

        for key in self.labels.sorted_keys() {
            // Keys look like "A: B: file:NAME: 1: ...": find the part
            // carrying the "file:" qualifier, scanning from the right.
            let parts: Vec<&str> = key.split(": ").collect();
            let mut label_parts: Vec<String> = Vec::new();
            let mut file_parts: Vec<String> = Vec::new();
            let mut split_index = parts.len();

            for i in (0..parts.len()).rev() {
                split_index = i;
                if let Some((file, label)) = parts[i].rsplit_once(':') {
                    label_parts.push(label.to_string());
                    file_parts.push(file.to_string());
                    break;
                }
                label_parts.push(parts[i].to_string());
            }

            let mut file_name_parts: Vec<String> =
                parts[..split_index].iter().map(|s| s.to_string()).collect();
            file_name_parts.extend(file_parts);
            let file_name = file_name_parts.join(": ");

            label_parts.reverse();
            let label_name = label_parts.join(": ");

            if file_name.is_empty() {
                // Global label.
                continue;
            }
            if label_name.contains(": ") {
                // Integer sub-label or .REPEAT copy.
                continue;
            }
            if label_name.starts_with('.') {
                // "." simulation.
                continue;
            }

            let value = self
                .labels
                .get(&key)
                .cloned()
                .expect("key came from the table");
            if let Value::Int(addr) = value.eval(self)? {
                by_file.entry(file_name).or_default().push((addr, label_name));
            }
        }

        let mut out = String::new();
        for (file_name, mut labels) in by_file {
            out.push_str(&file_name);
            out.push('\n');
            labels.sort();
            for (addr, name) in labels {
                out.push_str(&format!("{addr:06o} {name}\n"));
            }
            out.push('\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Syntax;
    use crate::file_reader::MockFileReader;
    use std::path::Path;

    fn linked(source: &str) -> (Assembler<'static>, LinkedImage) {
        // Leak the reader so the assembler can outlive this helper.
        let mut reader = MockFileReader::default();
        reader.add_file("main.mac", source);
        let reader: &'static MockFileReader = Box::leak(Box::new(reader));
        let mut asm = Assembler::new(reader, Syntax::Pdpy11, 0o1000, Vec::new());
        asm.set_include_root(Path::new("main.mac"));
        asm.add_file(Path::new("main.mac"), None).unwrap();
        let image = asm.link().unwrap();
        (asm, image)
    }

    #[test]
    fn test_later_write_wins() {
        let (_, image) = linked(".WORD 1\n.LINK 1000\n.WORD 2\n");
        // Both words landed at 01000; the later one is visible.
        assert_eq!(image.bytes, vec![2, 0]);
    }

    #[test]
    fn test_image_sliced_from_link_address() {
        let (_, image) = linked("HALT\n");
        assert_eq!(image.link_address, 0o1000);
        assert_eq!(image.bytes.len(), 2);
    }

    #[test]
    fn test_listing_contains_local_labels() {
        let (mut asm, _) = linked("START: HALT\nLOOP: BR LOOP\n");
        let listing = asm.generate_listing().unwrap();
        assert!(listing.contains("main.mac"));
        assert!(listing.contains("001000 START"));
        assert!(listing.contains("001002 LOOP"));
    }

    #[test]
    fn test_listing_skips_synthetic_and_sublabels() {
        let (mut asm, _) = linked("A: .WORD .\n1: .WORD 1\n");
        let listing = asm.generate_listing().unwrap();
        assert!(listing.contains("001000 A"));
        // Neither the dot's synthetic label nor "A: 1" appear.
        assert_eq!(listing.matches("001000").count(), 1);
        assert!(!listing.contains(": 1"));
    }
}
