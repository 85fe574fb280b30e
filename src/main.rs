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

use anyhow::{Context, Result, bail};
use bkasm::assembler::DefineValue;
use bkasm::ast::Syntax;
use bkasm::errors::AssemblyError;
use bkasm::file_reader::AsmFileReader;
use bkasm::{ForcedFormat, Options, assemble_files, assemble_project};
use clap::Parser as clap_parser;
use std::fs;
use std::path::PathBuf;

#[derive(clap_parser)]
#[clap(version = "0.1.0", about = "PDP-11 cross-assembler for the BK-0010")]
struct Opts {
    /// Source files to assemble and link together
    files: Vec<PathBuf>,

    /// Compile every include-root under a project directory
    #[clap(long)]
    project: Option<PathBuf>,

    /// Emit a BIN image with a load header (the default)
    #[clap(long)]
    bin: bool,

    /// Emit the raw image without any header
    #[clap(long)]
    raw: bool,

    /// Emit an RT-11 SAV bootable image
    #[clap(long)]
    sav: bool,

    /// Emit a standard-speed tape WAV
    #[clap(long)]
    wav: bool,

    /// Emit a turbo-speed tape WAV
    #[clap(long = "turbo-wav")]
    turbo_wav: bool,

    /// Output path (single-file mode only)
    #[clap(short, long)]
    output: Option<PathBuf>,

    /// Link origin, octal unless marked (0x... or trailing dot)
    #[clap(long, default_value = "1000")]
    link: String,

    /// Source dialect: pdp11asm or pdpy11
    #[clap(long, default_value = "pdpy11")]
    syntax: String,

    /// Predefine a global label, -Dname=value
    #[clap(short = 'D', value_name = "NAME=VALUE")]
    define: Vec<String>,

    /// Write a listing file next to the output
    #[clap(long)]
    lst: bool,

    /// One-line file:::line:::col:::message error format
    #[clap(long)]
    sublime: bool,
}

fn main() {
    env_logger::init();
    let opts = Opts::parse();

    if let Err(err) = run(&opts) {
        match err.downcast_ref::<AssemblyError>() {
            Some(asm_err) if opts.sublime => eprintln!("{}", asm_err.format_sublime()),
            Some(asm_err) => eprintln!("{}", asm_err.format_human()),
            None => eprintln!("{err:#}"),
        }
        std::process::exit(1);
    }
}

fn run(opts: &Opts) -> Result<()> {
    if opts.files.is_empty() && opts.project.is_none() {
        bail!("No files passed");
    }
    if !opts.files.is_empty() && opts.project.is_some() {
        bail!("Either a project or a file list may be passed, not both");
    }

    let syntax = match opts.syntax.as_str() {
        "pdp11asm" => Syntax::Pdp11Asm,
        "pdpy11" => Syntax::Pdpy11,
        other => bail!("Invalid syntax (expected 'pdp11asm' or 'pdpy11', got '{other}')"),
    };

    let options = Options {
        syntax,
        link: parse_radix_arg(&opts.link)
            .with_context(|| format!("Invalid --link value '{}'", opts.link))?,
        defines: parse_defines(&opts.define)?,
        forced_format: forced_format(opts)?,
        output: opts.output.clone(),
        listing: opts.lst,
    };

    let reader = AsmFileReader;
    let outputs = match &opts.project {
        Some(project) => assemble_project(project, &options, &reader)?,
        None => assemble_files(&opts.files, &options, &reader)?,
    };

    for (path, bytes) in &outputs.files {
        fs::write(path, bytes)
            .with_context(|| format!("Failed to write output {}", path.display()))?;
        println!("Output: {}", path.display());
    }
    if let Some((path, text)) = &outputs.listing {
        fs::write(path, text)
            .with_context(|| format!("Failed to write listing {}", path.display()))?;
        println!("Listing: {}", path.display());
    }

    Ok(())
}

fn forced_format(opts: &Opts) -> Result<Option<ForcedFormat>> {
    let chosen: Vec<ForcedFormat> = [
        (opts.bin, ForcedFormat::Bin),
        (opts.raw, ForcedFormat::Raw),
        (opts.sav, ForcedFormat::Sav),
        (opts.wav, ForcedFormat::Wav),
        (opts.turbo_wav, ForcedFormat::TurboWav),
    ]
    .iter()
    .filter(|(flag, _)| *flag)
    .map(|(_, format)| *format)
    .collect();

    match chosen.as_slice() {
        [] => Ok(None),
        [format] => Ok(Some(*format)),
        _ => bail!("Only one output format may be forced"),
    }
}

// CLI integers default to octal; 0x... is hex and a trailing dot forces
// decimal, mirroring the in-source rules.
fn parse_radix_arg(value: &str) -> Result<i64> {
    let parsed = if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16)
    } else if let Some(dec) = value.strip_suffix('.') {
        dec.parse()
    } else {
        i64::from_str_radix(value, 8)
    };
    parsed.with_context(|| format!("Cannot parse integer '{value}'"))
}

fn parse_defines(defines: &[String]) -> Result<Vec<(String, DefineValue)>> {
    let mut out = Vec::new();
    for define in defines {
        let Some((name, value)) = define.split_once('=') else {
            bail!("-D expects NAME=VALUE, got '{define}'");
        };
        if value.is_empty() {
            continue;
        }

        let first = value.chars().next().expect("checked non-empty");
        let last = value.chars().last().expect("checked non-empty");
        let is_string = value.chars().count() >= 2
            && first == last
            && (first == '"' || first == '\'' || first == '/');

        let parsed = if is_string {
            let inner: String = {
                let chars: Vec<char> = value.chars().collect();
                chars[1..chars.len() - 1].iter().collect()
            };
            DefineValue::Str(inner)
        } else {
            DefineValue::Int(parse_radix_arg(value)?)
        };
        out.push((name.to_string(), parsed));
    }
    Ok(out)
}
