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

pub mod assembler;
pub mod ast;
pub mod deferred;
pub mod errors;
pub mod expression;
pub mod file_reader;
pub mod koi8;
pub mod output;
pub mod parser;
pub mod project;
pub mod source;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use assembler::{Assembler, DefineValue, LinkedImage, ResolvedKind};
use ast::Syntax;
use file_reader::FileReader;

/// A container format forced from the command line; it overrides any
/// `make_*` directives the sources carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedFormat {
    Raw,
    Bin,
    Sav,
    TurboWav,
    Wav,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub syntax: Syntax,
    pub link: i64,
    pub defines: Vec<(String, DefineValue)>,
    pub forced_format: Option<ForcedFormat>,
    pub output: Option<PathBuf>,
    pub listing: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            syntax: Syntax::Pdpy11,
            link: 0o1000,
            defines: Vec::new(),
            forced_format: None,
            output: None,
            listing: false,
        }
    }
}

/// Encoded output files plus the optional listing, ready to be written.
#[derive(Debug)]
pub struct Outputs {
    pub files: Vec<(PathBuf, Vec<u8>)>,
    pub listing: Option<(PathBuf, String)>,
}

/// Assembles and links one or more source files into a single image.
/// Every file given is its own include-root; they share one address
/// space and symbol table.
pub fn assemble_files<F: FileReader>(
    files: &[PathBuf],
    options: &Options,
    reader: &F,
) -> Result<Outputs> {
    let first = files.first().context("No files passed")?;

    let mut asm = Assembler::new(reader, options.syntax, options.link, Vec::new());
    for (name, value) in &options.defines {
        asm.define(name, value.clone())?;
    }

    for file in files {
        asm.set_include_root(file);
        asm.add_file(file, None)
            .context("Failed during compilation stage")?;
    }

    let image = asm.link().context("Failed during linking stage")?;

    let mut out_files = Vec::new();
    if options.forced_format.is_some() || image.targets.is_empty() {
        let format = options.forced_format.unwrap_or(ForcedFormat::Bin);
        let path = match &options.output {
            Some(path) => path.clone(),
            None => default_output_path(first, format),
        };
        let kind = forced_kind(format, &path);
        out_files.push((path, encode_target(&kind, &image)));
    } else {
        for target in &image.targets {
            out_files.push((target.path.clone(), encode_target(&target.kind, &image)));
        }
    }

    let listing = if options.listing {
        let path = PathBuf::from(format!("{}.lst", strip_mac(first)));
        let text = asm
            .generate_listing()
            .context("Failed during listing generation")?;
        Some((path, text))
    } else {
        None
    };

    Ok(Outputs {
        files: out_files,
        listing,
    })
}

/// Project mode: walks the directory, compiles every include-root it
/// finds, and encodes each root's build targets.
pub fn assemble_project<F: FileReader>(
    project_dir: &Path,
    options: &Options,
    reader: &F,
) -> Result<Outputs> {
    let file_list = project::collect_project_files(project_dir)
        .with_context(|| format!("Failed to scan project {}", project_dir.display()))?;

    let mut asm = Assembler::new(reader, options.syntax, options.link, file_list);
    for (name, value) in &options.defines {
        asm.define(name, value.clone())?;
    }

    asm.build_project()
        .context("Failed during compilation stage")?;
    let images = asm.link_project().context("Failed during linking stage")?;

    let mut out_files = Vec::new();
    for image in &images {
        for target in &image.targets {
            let (kind, path) = match options.forced_format {
                Some(format) => {
                    let path = forced_output_path(&target.path, format);
                    (forced_kind(format, &path), path)
                }
                None => (target.kind.clone(), target.path.clone()),
            };
            out_files.push((path, encode_target(&kind, image)));
        }
    }

    let listing = if options.listing {
        let path = PathBuf::from(format!("{}.lst", project_dir.display()));
        let text = asm
            .generate_listing()
            .context("Failed during listing generation")?;
        Some((path, text))
    } else {
        None
    };

    Ok(Outputs {
        files: out_files,
        listing,
    })
}

fn encode_target(kind: &ResolvedKind, image: &LinkedImage) -> Vec<u8> {
    let link = image.link_address as u16;
    match kind {
        ResolvedKind::Raw => output::raw(&image.bytes),
        ResolvedKind::Bin => output::bin(link, &image.bytes),
        ResolvedKind::Sav { final_addr } => {
            let final_addr = final_addr
                .unwrap_or(image.link_address + image.bytes.len() as i64)
                as u16;
            output::sav(link, final_addr, &image.bytes)
        }
        ResolvedKind::TurboWav { bk_name } => output::wav::turbo_wav(link, bk_name, &image.bytes),
        ResolvedKind::Wav { bk_name } => output::wav::wav(link, bk_name, &image.bytes),
    }
}

fn forced_kind(format: ForcedFormat, path: &Path) -> ResolvedKind {
    let bk_name = || {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    match format {
        ForcedFormat::Raw => ResolvedKind::Raw,
        ForcedFormat::Bin => ResolvedKind::Bin,
        ForcedFormat::Sav => ResolvedKind::Sav { final_addr: None },
        ForcedFormat::TurboWav => ResolvedKind::TurboWav { bk_name: bk_name() },
        ForcedFormat::Wav => ResolvedKind::Wav { bk_name: bk_name() },
    }
}

fn strip_mac(path: &Path) -> String {
    let shown = path.display().to_string();
    if shown.to_lowercase().ends_with(".mac") {
        shown[..shown.len() - 4].to_string()
    } else {
        shown
    }
}

// The default output name: the first source with `.mac` stripped and the
// format's extension appended. Raw output gets no extension at all.
fn default_output_path(first: &Path, format: ForcedFormat) -> PathBuf {
    let base = strip_mac(first);
    match format {
        ForcedFormat::Raw => PathBuf::from(base),
        ForcedFormat::Bin => PathBuf::from(base + ".bin"),
        ForcedFormat::Sav => PathBuf::from(base + ".sav"),
        ForcedFormat::TurboWav | ForcedFormat::Wav => PathBuf::from(base + ".wav"),
    }
}

fn forced_output_path(original: &Path, format: ForcedFormat) -> PathBuf {
    match format {
        ForcedFormat::Raw => original.with_extension("raw"),
        ForcedFormat::Bin => original.with_extension("bin"),
        ForcedFormat::Sav => original.with_extension("sav"),
        ForcedFormat::TurboWav | ForcedFormat::Wav => original.with_extension("wav"),
    }
}
