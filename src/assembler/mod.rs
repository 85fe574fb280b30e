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

// The compiler driver. Consumes parse events file by file, maintains the
// write cursor (PC) and the logical link cursor (link-PC) as deferred
// values, interprets directives, encodes instructions, and appends to the
// write log. The linker half lives in linker.rs.

pub mod command_set;
mod linker;
mod symbol_table;

use std::cell::Cell;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::rc::Rc;

use log::{info, warn};

pub use linker::{LinkedImage, ResolvedKind, ResolvedTarget};
pub use symbol_table::{ExternPolicy, SymbolTable};

use crate::ast::{AddrArg, AddrMode, Arg, Command, Register, Statement, Syntax};
use crate::deferred::{Conversion, Deferred, EvalContext, Value, ValueType, octal};
use crate::errors::AssemblyError;
use crate::expression;
use crate::file_reader::FileReader;
use crate::parser::Parser;
use crate::source::SourcePos;
use command_set::Encoding;

/// A value predefined from the command line (`-Dname=value`).
#[derive(Debug, Clone)]
pub enum DefineValue {
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone)]
pub enum BuildKind {
    Raw,
    Bin,
    Sav { final_addr: Option<Deferred> },
    TurboWav { bk_name: String },
    Wav { bk_name: String },
}

#[derive(Debug, Clone)]
pub struct BuildTarget {
    pub kind: BuildKind,
    pub path: PathBuf,
}

// One include-root's compilation in project mode: its build targets plus
// the write log and link origin they resolve against.
pub(crate) struct RootBuild {
    targets: Vec<BuildTarget>,
    writes: Vec<(Deferred, Deferred)>,
    link_address: Deferred,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Assembler<'r> {
    syntax: Syntax,
    default_link: i64,
    link_address: Deferred,
    file_list: Vec<PathBuf>,
    pub(crate) labels: SymbolTable,
    pc: Deferred,
    link_pc: Deferred,
    all_build: Vec<RootBuild>,
    build: Vec<BuildTarget>,
    writes: Vec<(Deferred, Deferred)>,
    extern_policy: ExternPolicy,
    included_once: HashSet<String>,
    include_root: String,
    static_alloc_tail: Deferred,
    mark_counter: Rc<Cell<usize>>,
    repeat_counter: usize,
    reader: &'r dyn FileReader,
}

impl EvalContext for Assembler<'_> {
    fn lookup_label(&self, file_id: &str, name: &str) -> Option<Deferred> {
        self.labels
            .get(&SymbolTable::local_key(file_id, name))
            .cloned()
            .or_else(|| self.labels.get(name).cloned())
    }

    fn static_alloc(&mut self, byte_length: &Deferred) -> Deferred {
        let address = self.static_alloc_tail.clone();
        self.static_alloc_tail = self.static_alloc_tail.add(byte_length);
        address
    }
}

impl<'r> Assembler<'r> {
    pub fn new(
        reader: &'r dyn FileReader,
        syntax: Syntax,
        link: i64,
        file_list: Vec<PathBuf>,
    ) -> Assembler<'r> {
        let link_address = Deferred::int(link);
        Assembler {
            syntax,
            default_link: link,
            pc: link_address.clone(),
            link_pc: link_address.clone(),
            link_address,
            file_list,
            labels: SymbolTable::new(),
            all_build: Vec::new(),
            build: Vec::new(),
            writes: Vec::new(),
            extern_policy: ExternPolicy::None,
            included_once: HashSet::new(),
            include_root: String::new(),
            // STATIC_ALLOC addresses grow from wherever the program
            // defines MEMORY.
            static_alloc_tail: expression::label_ref(
                "MEMORY",
                "STATIC_ALLOC",
                SourcePos::new("STATIC_ALLOC", 0, 0),
            ),
            mark_counter: Rc::new(Cell::new(0)),
            repeat_counter: 0,
            reader,
        }
    }

    /// Installs a `-Dname=value` definition as a global label.
    pub fn define(&mut self, name: &str, value: DefineValue) -> Result<(), AssemblyError> {
        let name = name.to_uppercase();
        if self.labels.contains(&name) {
            let shown = match &value {
                DefineValue::Int(n) => n.to_string(),
                DefineValue::Str(s) => format!("\"{s}\""),
            };
            return Err(AssemblyError::Compiler {
                pos: SourcePos::new("CLI", 1, 1).with_text(format!("-D{name}={shown}")),
                reason: format!("Duplicate label {name}"),
            });
        }
        let value = match value {
            DefineValue::Int(n) => Deferred::int(n),
            DefineValue::Str(s) => Deferred::from_value(Value::Str(s)),
        };
        self.labels.insert(name, value);
        Ok(())
    }

    pub fn set_include_root(&mut self, file: &Path) {
        self.include_root = file_id(&normalize(file));
    }

    /// Adds one source file (or, in project mode, a directory of sources)
    /// to the current compilation.
    pub fn add_file(
        &mut self,
        file: &Path,
        relative_to: Option<&Path>,
    ) -> Result<(), AssemblyError> {
        let resolved = resolve(file, relative_to);

        if self.reader.is_dir(&resolved) {
            for sub in self.file_list.clone() {
                let sub = normalize(&sub);
                if sub.starts_with(&resolved) && sub != resolved {
                    self.add_file(&sub, None)?;
                }
            }
            return Ok(());
        }

        let code = self
            .reader
            .read_to_string(&resolved)
            .map_err(|e| AssemblyError::Io {
                path: resolved.display().to_string(),
                message: e.to_string(),
            })?;

        self.compile_file(&file_id(&resolved), &code)
    }

    fn compile_file(&mut self, file_id: &str, code: &str) -> Result<(), AssemblyError> {
        info!("Parsing {file_id}");
        let parser = Parser::new(file_id, code, self.syntax, self.mark_counter.clone());
        let statements = parser.parse()?;

        // Included files start from .EXTERN NONE and restore the caller's
        // policy on exit.
        let saved_policy = std::mem::replace(&mut self.extern_policy, ExternPolicy::None);
        let result = (|| -> Result<(), AssemblyError> {
            for statement in &statements {
                if let Flow::Stop = self.handle_statement(file_id, statement)? {
                    break;
                }
            }
            Ok(())
        })();
        self.extern_policy = saved_policy;
        result
    }

    fn handle_statement(
        &mut self,
        file_id: &str,
        statement: &Statement,
    ) -> Result<Flow, AssemblyError> {
        let pos = &statement.pos;

        for label in &statement.labels {
            let value = self.link_pc.clone();
            self.define_label(file_id, label, value, pos)?;
        }

        match &statement.command {
            Command::End => return Ok(Flow::Stop),
            Command::Link(addr) => {
                if file_id == self.include_root {
                    self.pc = addr.clone();
                    self.link_pc = addr.clone();
                    self.link_address = addr.clone();
                } else {
                    let shown = addr
                        .cached_value()
                        .and_then(|v| v.as_int().ok())
                        .map(octal)
                        .unwrap_or_else(|| "?".to_string());
                    warn!("{file_id}: linking from {shown}, output address may differ");
                    self.link_pc = addr.clone();
                }
            }
            Command::Include { path, .. } => self.include(path, file_id, pos)?,
            Command::Pdp11 => {}
            Command::I8080 => {
                return Err(self.err(pos, "Cannot compile 8080 programs"));
            }
            Command::SetSyntax(_) => {}
            Command::Byte(values) => {
                for value in values {
                    self.write_byte(value.clone(), pos);
                }
            }
            Command::Word(values) => {
                for value in values {
                    self.write_word(value.clone(), pos);
                }
            }
            Command::Dword(values) => {
                for value in values {
                    self.write_dword(value.clone(), pos);
                }
            }
            Command::Blkb(count) => {
                self.write_bytes(Deferred::repeat(count, 0));
            }
            Command::Blkw(count) => {
                self.write_bytes(Deferred::repeat(count.mul(2), 0));
            }
            Command::Even => {
                let cond = self.link_pc.rem(2).cmp_eq(0);
                self.write_bytes(Deferred::if_(cond, Vec::new(), vec![0]));
            }
            Command::Align(alignment) => {
                let rem = self.link_pc.rem(alignment);
                let cond = rem.cmp_eq(0);
                let padding = Deferred::repeat(alignment.sub(&rem), 0);
                self.write_bytes(Deferred::if_(cond, Vec::new(), padding));
            }
            Command::Ascii(text) => {
                let bytes = Deferred::from_value(Value::Str(text.clone()))
                    .then(Conversion::Koi8Charlist(pos.clone()), ValueType::List);
                self.write_bytes(bytes);
            }
            Command::MakeRaw { path } => {
                if file_id == self.include_root {
                    let path = self.target_path(file_id, path.as_deref(), None);
                    self.build.push(BuildTarget {
                        kind: BuildKind::Raw,
                        path,
                    });
                }
            }
            Command::MakeBin { path } => {
                if file_id == self.include_root {
                    let path = self.target_path(file_id, path.as_deref(), Some("bin"));
                    self.build.push(BuildTarget {
                        kind: BuildKind::Bin,
                        path,
                    });
                }
            }
            Command::MakeSav { path, final_addr } => {
                if file_id == self.include_root {
                    let path = self.target_path(file_id, path.as_deref(), Some("sav"));
                    self.build.push(BuildTarget {
                        kind: BuildKind::Sav {
                            final_addr: final_addr.clone(),
                        },
                        path,
                    });
                }
            }
            Command::MakeTurboWav { path, bk_name } | Command::MakeWav { path, bk_name } => {
                if file_id == self.include_root {
                    let out = self.target_path(file_id, path.as_deref(), Some("wav"));
                    let bk_name = bk_name.clone().unwrap_or_else(|| {
                        out.file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_default()
                    });
                    let kind = if matches!(statement.command, Command::MakeTurboWav { .. }) {
                        BuildKind::TurboWav { bk_name }
                    } else {
                        BuildKind::Wav { bk_name }
                    };
                    self.build.push(BuildTarget { kind, path: out });
                }
            }
            Command::Convert1251ToKoi8R(_) => {}
            Command::DecimalNumbers(_) => {}
            Command::InsertFile(path) => {
                let resolved = resolve(Path::new(path), Some(Path::new(file_id)));
                let bytes = self.reader.read_binary(&resolved).map_err(|_| {
                    self.err(
                        pos,
                        format!("Error inserting {path} (relative to {file_id})"),
                    )
                })?;
                let bytes: Vec<i64> = bytes.iter().map(|b| *b as i64).collect();
                self.write_bytes(Deferred::from_value(Value::List(bytes)));
            }
            Command::Equ { name, value } => {
                self.define_label(file_id, name, value.clone(), pos)?;
            }
            Command::Repeat { count, body } => {
                self.handle_repeat(file_id, count, body, pos)?;
            }
            Command::Extern(names) => self.handle_extern(names, pos)?,
            Command::Once => {
                if self.included_once.contains(file_id) {
                    return Ok(Flow::Stop);
                }
                self.included_once.insert(file_id.to_string());
            }
            Command::Insn { name, args } => self.encode_insn(name, args, pos)?,
        }

        Ok(Flow::Continue)
    }

    fn handle_repeat(
        &mut self,
        file_id: &str,
        count: &Deferred,
        body: &[Statement],
        pos: &SourcePos,
    ) -> Result<(), AssemblyError> {
        // The count must be resolvable when .REPEAT executes.
        let count = count.eval_int(self)?;

        let mut local_labels: Vec<String> = Vec::new();
        for statement in body {
            for name in &statement.labels {
                if self.is_extern_name(name) {
                    return Err(self.err(
                        pos,
                        format!("Cannot define global label {name} inside .REPEAT"),
                    ));
                }
                local_labels.push(name.clone());
            }
        }

        let repeat_id = self.repeat_counter;
        self.repeat_counter += 1;

        for idx in 0..count.max(0) {
            let suffix = format!(": .REPEAT({repeat_id})[{idx}]");
            let locals = local_labels.clone();
            let rename = move |label: &str| -> String {
                if locals.iter().any(|l| l == label) {
                    format!("{label}{suffix}")
                } else {
                    label.to_string()
                }
            };
            for statement in body {
                let mut mapped = statement.map_labels(&rename);
                mapped.labels = statement
                    .labels
                    .iter()
                    .map(|l| rename(l))
                    .collect();
                if let Flow::Stop = self.handle_statement(file_id, &mapped)? {
                    // .END inside the block continues with the next
                    // iteration.
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_extern(&mut self, names: &[String], pos: &SourcePos) -> Result<(), AssemblyError> {
        let mut is_all = false;
        let mut is_none = false;
        let mut list = Vec::new();
        for name in names {
            match name.as_str() {
                "ALL" => is_all = true,
                "NONE" => is_none = true,
                other => list.push(other.to_string()),
            }
        }

        if is_all && is_none {
            return Err(self.err(pos, ".EXTERN ALL and .EXTERN NONE cannot be used together"));
        } else if is_all && !list.is_empty() {
            return Err(self.err(pos, ".EXTERN ALL and .EXTERN LABEL cannot be used together"));
        } else if is_none && !list.is_empty() {
            return Err(self.err(pos, ".EXTERN NONE and .EXTERN LABEL cannot be used together"));
        }

        self.extern_policy = if is_all {
            ExternPolicy::All
        } else if is_none {
            ExternPolicy::None
        } else {
            ExternPolicy::List(list)
        };
        Ok(())
    }

    // ------------- instruction encoding -------------

    fn encode_insn(
        &mut self,
        name: &str,
        args: &[Arg],
        pos: &SourcePos,
    ) -> Result<(), AssemblyError> {
        let entry = command_set::lookup(name)
            .unwrap_or_else(|| panic!("parser admitted unknown mnemonic {name}"));

        match entry.encoding {
            Encoding::PushMeta => {
                // PUSH src  =>  MOV src, -(SP)
                let desugared = vec![
                    args[0].clone(),
                    Arg::Addr(AddrArg::new(Register::SP, AddrMode::PreDec)),
                ];
                return self.encode_insn("MOV", &desugared, pos);
            }
            Encoding::PopMeta => {
                // POP dst  =>  MOV (SP)+, dst
                let desugared = vec![
                    Arg::Addr(AddrArg::new(Register::SP, AddrMode::PostInc)),
                    args[0].clone(),
                ];
                return self.encode_insn("MOV", &desugared, pos);
            }
            Encoding::Immediate { opcode, max } => {
                let Arg::Imm(value) = &args[0] else {
                    return Err(self.err(pos, format!("Unknown command {name}")));
                };
                let value = value
                    .then(
                        Conversion::ImmTooBig {
                            pos: pos.clone(),
                            max,
                        },
                        ValueType::Int,
                    )
                    .then(Conversion::ImmNegative(pos.clone()), ValueType::Int);
                self.write_word(value.bitor(opcode), pos);
            }
            Encoding::Opcode(opcode) => {
                match args {
                    [] => self.write_word(Deferred::int(opcode as i64), pos),
                    [Arg::Addr(a)] => {
                        self.write_word(Deferred::int((opcode | a.encode()) as i64), pos);
                    }
                    [Arg::Dest(target)] => {
                        // Branch: offset is counted from the address after
                        // the instruction word, in words.
                        let offset = target
                            .sub(&self.link_pc)
                            .sub(2)
                            .then(Conversion::BranchWords(pos.clone()), ValueType::Int)
                            .then(Conversion::BranchRange(pos.clone()), ValueType::Int)
                            .then(Conversion::Int8ToUint8, ValueType::Int);
                        self.write_word(offset.bitor(opcode), pos);
                    }
                    [Arg::Reg(r)] => {
                        self.write_word(Deferred::int((opcode | r.number()) as i64), pos);
                    }
                    [Arg::Addr(src), Arg::Addr(dst)] => {
                        let word = opcode | (src.encode() << 6) | dst.encode();
                        self.write_word(Deferred::int(word as i64), pos);
                    }
                    [Arg::Reg(r), Arg::Addr(a)] => {
                        let word = opcode | (r.number() << 6) | a.encode();
                        self.write_word(Deferred::int(word as i64), pos);
                    }
                    [Arg::Addr(a), Arg::Reg(r)] => {
                        let word = opcode | (r.number() << 6) | a.encode();
                        self.write_word(Deferred::int(word as i64), pos);
                    }
                    [Arg::Reg(r), Arg::Dest(target)] => {
                        // SOB: a backward displacement from the address
                        // after the instruction word.
                        let offset = self
                            .link_pc
                            .add(2)
                            .sub(target)
                            .then(
                                Conversion::SobWords {
                                    pos: pos.clone(),
                                    name: name.to_string(),
                                },
                                ValueType::Int,
                            )
                            .then(
                                Conversion::SobRange {
                                    pos: pos.clone(),
                                    name: name.to_string(),
                                },
                                ValueType::Int,
                            );
                        self.write_word(offset.bitor((opcode | (r.number() << 6)) as i64), pos);
                    }
                    _ => return Err(self.err(pos, format!("Unknown command {name}"))),
                }

                // One extra word per immediate-bearing operand, in textual
                // order. PC-relative shortcuts substitute the offset from
                // the word's own successor address.
                for arg in args {
                    if let Arg::Addr(a) = arg {
                        if let Some(imm) = &a.imm {
                            let additional = if a.is_offset {
                                imm.sub(&self.link_pc).sub(2)
                            } else {
                                imm.clone()
                            };
                            self.write_word(additional, pos);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ------------- write log -------------

    fn write_byte(&mut self, byte: Deferred, pos: &SourcePos) {
        let byte = byte.then(Conversion::ByteRange(pos.clone()), ValueType::Int);
        self.writes.push((self.pc.clone(), byte));
        self.pc = self.pc.add(1);
        self.link_pc = self.link_pc.add(1);
    }

    fn write_word(&mut self, word: Deferred, pos: &SourcePos) {
        let word = word.then(Conversion::WordRange(pos.clone()), ValueType::Int);
        self.writes.push((self.pc.clone(), word.bitand(0xFF)));
        self.writes.push((self.pc.add(1), word.shr(8)));
        self.pc = self.pc.add(2);
        self.link_pc = self.link_pc.add(2);
    }

    // Double words store the high word first, each half little-endian.
    fn write_dword(&mut self, dword: Deferred, pos: &SourcePos) {
        let dword = dword.then(Conversion::DwordRange(pos.clone()), ValueType::Int);
        self.writes
            .push((self.pc.clone(), dword.shr(16).bitand(0xFF)));
        self.writes.push((self.pc.add(1), dword.shr(24)));
        self.writes.push((self.pc.add(2), dword.bitand(0xFF)));
        self.writes
            .push((self.pc.add(3), dword.shr(8).bitand(0xFF)));
        self.pc = self.pc.add(4);
        self.link_pc = self.link_pc.add(4);
    }

    fn write_bytes(&mut self, bytes: Deferred) {
        let length = bytes.then(Conversion::ListLen, ValueType::Int);
        self.writes.push((self.pc.clone(), bytes));
        self.pc = self.pc.add(&length);
        self.link_pc = self.link_pc.add(&length);
    }

    // ------------- labels -------------

    fn is_extern_name(&self, name: &str) -> bool {
        match &self.extern_policy {
            ExternPolicy::All => true,
            ExternPolicy::None => false,
            ExternPolicy::List(list) => list.iter().any(|l| l == name),
        }
    }

    fn define_label(
        &mut self,
        file_id: &str,
        name: &str,
        value: Deferred,
        pos: &SourcePos,
    ) -> Result<(), AssemblyError> {
        if self.is_extern_name(name) {
            // No file may already hold this name as a local label.
            if let Some(owner) = self.labels.local_owner(name) {
                let owner = owner.to_string();
                return Err(self.err(
                    pos,
                    format!("Duplicate global label {name} with local label defined in {owner}"),
                ));
            }
            if self.labels.contains(name) {
                return Err(self.err(pos, format!("Duplicate global label {name}")));
            }
            self.labels.insert(name.to_string(), value.clone());
        } else if self.labels.contains(name) {
            return Err(self.err(
                pos,
                format!("Duplicate global label {name} with local label defined in {file_id}"),
            ));
        }

        let local = SymbolTable::local_key(file_id, name);
        if self.labels.contains(&local) {
            return Err(self.err(pos, format!("Duplicate local label {name}")));
        }
        self.labels.insert(local, value);
        Ok(())
    }

    // ------------- includes & project roots -------------

    fn include(
        &mut self,
        path: &str,
        from_file: &str,
        pos: &SourcePos,
    ) -> Result<(), AssemblyError> {
        let old_pc = self.pc.clone();
        let old_link_pc = self.link_pc.clone();

        match self.add_file(Path::new(path), Some(Path::new(from_file))) {
            Ok(()) => {}
            Err(AssemblyError::Io { .. }) => {
                return Err(self.err(
                    pos,
                    format!("Error including {path} (relative to {from_file})"),
                ));
            }
            Err(other) => return Err(other),
        }

        // The include advanced PC; link-PC follows by the same amount even
        // if the included file moved it around with .LINK.
        let include_length = self.pc.sub(&old_pc);
        self.link_pc = old_link_pc.add(&include_length);
        Ok(())
    }

    /// Project mode: every file containing a `make_*` directive is an
    /// include-root, compiled separately but against the shared symbol
    /// table.
    pub fn build_project(&mut self) -> Result<(), AssemblyError> {
        let mut roots = Vec::new();
        for file in self.file_list.clone() {
            let resolved = normalize(&file);
            let code = self
                .reader
                .read_to_string(&resolved)
                .map_err(|e| AssemblyError::Io {
                    path: resolved.display().to_string(),
                    message: e.to_string(),
                })?;
            info!("Scanning {}", resolved.display());
            let parser = Parser::new(
                file_id(&resolved),
                &code,
                self.syntax,
                self.mark_counter.clone(),
            );
            let statements = parser.parse()?;
            let makes_output = statements.iter().any(|statement| {
                matches!(
                    statement.command,
                    Command::MakeRaw { .. }
                        | Command::MakeBin { .. }
                        | Command::MakeSav { .. }
                        | Command::MakeTurboWav { .. }
                        | Command::MakeWav { .. }
                )
            });
            if makes_output {
                roots.push(resolved);
            }
        }
        roots.sort();
        roots.dedup();

        for root in roots {
            self.link_address = Deferred::int(self.default_link);
            self.pc = self.link_address.clone();
            self.link_pc = self.link_address.clone();
            self.writes = Vec::new();
            self.build = Vec::new();
            self.include_root = file_id(&root);

            info!("Compiling {} as include root", root.display());
            self.add_file(&root, None)?;

            self.all_build.push(RootBuild {
                targets: std::mem::take(&mut self.build),
                writes: std::mem::take(&mut self.writes),
                link_address: self.link_address.clone(),
            });
        }
        Ok(())
    }

    fn target_path(&self, file_id: &str, given: Option<&str>, extension: Option<&str>) -> PathBuf {
        match given {
            Some(name) => {
                let dir = Path::new(file_id).parent().unwrap_or(Path::new(""));
                normalize(&dir.join(name))
            }
            None => {
                let mut base = file_id.to_string();
                if base.to_lowercase().ends_with(".mac") {
                    base.truncate(base.len() - 4);
                }
                if let Some(ext) = extension {
                    base.push('.');
                    base.push_str(ext);
                }
                PathBuf::from(base)
            }
        }
    }

    fn err(&self, pos: &SourcePos, reason: impl Into<String>) -> AssemblyError {
        AssemblyError::Compiler {
            pos: pos.clone(),
            reason: reason.into(),
        }
    }
}

fn file_id(path: &Path) -> String {
    path.display().to_string()
}

/// Lexical path resolution: absolute paths pass through, relative ones
/// attach to the directory of the referencing file. No filesystem access,
/// so the same file always gets the same id.
fn resolve(file: &Path, relative_to: Option<&Path>) -> PathBuf {
    if file.is_absolute() {
        return normalize(file);
    }
    match relative_to {
        Some(reference) => {
            let base = reference.parent().unwrap_or(Path::new(""));
            normalize(&base.join(file))
        }
        None => normalize(file),
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_reader::MockFileReader;

    pub(crate) fn assemble_source(source: &str) -> Result<Vec<u8>, AssemblyError> {
        assemble_source_at(source, 0o1000)
    }

    pub(crate) fn assemble_source_at(source: &str, link: i64) -> Result<Vec<u8>, AssemblyError> {
        let mut reader = MockFileReader::default();
        reader.add_file("main.mac", source);
        let mut asm = Assembler::new(&reader, Syntax::Pdpy11, link, Vec::new());
        asm.set_include_root(Path::new("main.mac"));
        asm.add_file(Path::new("main.mac"), None)?;
        Ok(asm.link()?.bytes)
    }

    #[test]
    fn test_halt_at_origin() {
        // Scenario: HALT at link 01000 emits a single zero word.
        assert_eq!(assemble_source("HALT\n").unwrap(), vec![0x00, 0x00]);
    }

    #[test]
    fn test_immediate_mov_encoding() {
        // MOV #12345, R0 -> 012700 followed by the immediate word.
        assert_eq!(
            assemble_source("MOV #12345, R0\n").unwrap(),
            vec![0xC0, 0x15, 0xE5, 0x14]
        );
    }

    #[test]
    fn test_forward_branch() {
        let bytes = assemble_source("BR L\nNOP\nL: HALT\n").unwrap();
        // BR L encodes offset +1 word: 000401.
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1], 0x01);
        assert_eq!(bytes.len(), 6);
    }

    #[test]
    fn test_backward_branch() {
        let bytes = assemble_source("L: NOP\nBR L\n").unwrap();
        // Offset is -2 words: 000400 | 0376.
        assert_eq!(bytes[2], 0xFE);
        assert_eq!(bytes[3], 0x01);
    }

    #[test]
    fn test_branch_too_far_rejected() {
        let err = assemble_source("BR L\n.BLKB 1000\nL: HALT\n").unwrap_err();
        assert!(err.to_string().contains("Too far branch"));
    }

    #[test]
    fn test_branch_unaligned_rejected() {
        let err = assemble_source("BR L\n.BLKB 3\nL: HALT\n").unwrap_err();
        assert!(err.to_string().contains("Unaligned branch"));
    }

    #[test]
    fn test_sob_encoding() {
        let bytes = assemble_source("L: NOP\nSOB R2, L\n").unwrap();
        // SOB R2, L: offset (01002 + 2 - 01000) / 2 = 2 words.
        // 077000 | 2 << 6 | 2 = 077202.
        assert_eq!(bytes[2], 0x82);
        assert_eq!(bytes[3], 0x7E);
    }

    #[test]
    fn test_sob_forward_rejected() {
        let err = assemble_source("SOB R2, L\nNOP\nL: HALT\n").unwrap_err();
        assert!(err.to_string().contains("Too far SOB"));
    }

    #[test]
    fn test_two_operand_encoding() {
        // MOV R1, (R2) -> 010112.
        let bytes = assemble_source("MOV R1, (R2)\n").unwrap();
        assert_eq!(bytes, vec![0x4A, 0x10]);
    }

    #[test]
    fn test_jsr_encoding() {
        // JSR R5, @#2000 -> 004537 + address word.
        let bytes = assemble_source("JSR R5, @#2000\n").unwrap();
        assert_eq!(bytes, vec![0x5F, 0x09, 0x00, 0x04]);
    }

    #[test]
    fn test_mul_register_field() {
        // MUL R3, R2 -> 070000 | 2 << 6 | 03 = 070203.
        let bytes = assemble_source("MUL R3, R2\n").unwrap();
        assert_eq!(bytes, vec![0x83, 0x70]);
    }

    #[test]
    fn test_emt_trap_mark_no_division() {
        let bytes = assemble_source("EMT 30\nTRAP 377\nMARK 14\n").unwrap();
        // 104030, 104777, 006414: the immediate is OR'd in unchanged.
        assert_eq!(&bytes[0..2], &[0x18, 0x88]);
        assert_eq!(&bytes[2..4], &[0xFF, 0x89]);
        assert_eq!(&bytes[4..6], &[0x0C, 0x0D]);
    }

    #[test]
    fn test_emt_immediate_too_big() {
        let err = assemble_source("EMT 400\n").unwrap_err();
        assert!(err.to_string().contains("Too big immediate"));
    }

    #[test]
    fn test_emt_immediate_negative() {
        let err = assemble_source("EMT -1\n").unwrap_err();
        assert!(err.to_string().contains("Negative immediate"));
    }

    #[test]
    fn test_push_pop_desugar_to_mov() {
        let pushed = assemble_source("PUSH R1\n").unwrap();
        let moved = assemble_source("MOV R1, -(SP)\n").unwrap();
        assert_eq!(pushed, moved);
        let popped = assemble_source("POP R1\n").unwrap();
        let moved = assemble_source("MOV (SP)+, R1\n").unwrap();
        assert_eq!(popped, moved);
    }

    #[test]
    fn test_pc_relative_operand_closure() {
        // CLR X with X two words ahead: extra word = X - (pc + 2).
        let bytes = assemble_source("CLR X\nNOP\nX: HALT\n").unwrap();
        // 005067 (CLR 67 = index-deferred? no: mode N(PC) = 0o67) at 01000,
        // offset word = 01006 - 01004 = 2.
        assert_eq!(&bytes[0..2], &[0x37, 0x0A]);
        assert_eq!(&bytes[2..4], &[0x02, 0x00]);
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let err = assemble_source("A: .WORD 1\nA: .WORD 2\n").unwrap_err();
        assert!(err.to_string().contains("Duplicate local label A"));
    }

    #[test]
    fn test_word_range_wraps_negative() {
        let bytes = assemble_source(".WORD -2\n").unwrap();
        assert_eq!(bytes, vec![0xFE, 0xFF]);
    }

    #[test]
    fn test_byte_too_big_rejected() {
        let err = assemble_source(".BYTE 400\n").unwrap_err();
        assert!(err.to_string().contains("too big"));
    }

    #[test]
    fn test_even_and_align() {
        let bytes = assemble_source(".BYTE 1\n.EVEN\n.WORD 2\n").unwrap();
        assert_eq!(bytes, vec![1, 0, 2, 0]);
        let bytes = assemble_source(".BYTE 1\n.ALIGN 4\n.BYTE 2\n").unwrap();
        assert_eq!(bytes, vec![1, 0, 0, 0, 2]);
    }

    #[test]
    fn test_blkw_emits_zero_words() {
        let bytes = assemble_source(".BLKW 2\n.BYTE 7\n").unwrap();
        assert_eq!(bytes, vec![0, 0, 0, 0, 7]);
    }

    #[test]
    fn test_ascii_and_asciz() {
        let bytes = assemble_source(".ASCIZ \"AB\"\n").unwrap();
        assert_eq!(bytes, vec![0x41, 0x42, 0x00]);
    }

    #[test]
    fn test_dword_word_order() {
        let bytes = assemble_source(".DWORD 1\n").unwrap();
        // High word first, each word little-endian.
        assert_eq!(bytes, vec![0, 0, 1, 0]);
    }

    #[test]
    fn test_equ_and_expression() {
        let bytes = assemble_source("K = 3\n.WORD K * 2 + 1\n").unwrap();
        assert_eq!(bytes, vec![7, 0]);
    }

    #[test]
    fn test_dot_current_address() {
        let bytes = assemble_source(".WORD .\n").unwrap();
        // "." is the statement's own link address.
        assert_eq!(bytes, vec![0x00, 0x02]);
    }

    #[test]
    fn test_repeat_unrolls_with_fresh_labels() {
        // Scenario E: three iterations, each with its own X.
        let bytes = assemble_source(".REPEAT 3 { X: .WORD 0 }\n").unwrap();
        assert_eq!(bytes, vec![0; 6]);
    }

    #[test]
    fn test_repeat_labels_resolve_per_iteration() {
        // A backward reference inside the block resolves to the same
        // iteration's copy.
        let bytes = assemble_source(".REPEAT 2 { X: .WORD X }\n").unwrap();
        assert_eq!(bytes, vec![0x00, 0x02, 0x02, 0x02]);
    }

    #[test]
    fn test_repeat_global_label_rejected() {
        let err = assemble_source(".EXTERN ALL\n.REPEAT 2 { X: .WORD 0 }\n").unwrap_err();
        assert!(
            err.to_string()
                .contains("Cannot define global label X inside .REPEAT")
        );
    }

    #[test]
    fn test_repeat_end_acts_as_continue() {
        let bytes = assemble_source(".REPEAT 2 { .BYTE 1\n.END\n.BYTE 2 }\n").unwrap();
        // The .BYTE 2 after .END is skipped in both iterations.
        assert_eq!(bytes, vec![1, 1]);
    }

    #[test]
    fn test_forward_reference_through_expression() {
        let bytes = assemble_source(".WORD L + 2\nL: HALT\n").unwrap();
        assert_eq!(&bytes[0..2], &[0x04, 0x02]);
    }

    #[test]
    fn test_recursive_definition_detected() {
        let err = assemble_source("A = B\nB = A\n.WORD A\n").unwrap_err();
        assert_eq!(err, AssemblyError::RecursiveDefinition);
    }

    #[test]
    fn test_undefined_label_reported() {
        let err = assemble_source(".WORD NOPE\n").unwrap_err();
        assert!(err.to_string().contains("Label 'NOPE' not found"));
    }

    #[test]
    fn test_i8080_rejected() {
        let err = assemble_source(".I8080\n").unwrap_err();
        assert!(err.to_string().contains("8080"));
    }

    #[test]
    fn test_write_monotonicity() {
        // Addresses in the write log never move backwards without .LINK.
        let source = "MOV #1, R0\n.BYTE 1\n.EVEN\n.ASCII \"ABC\"\n.WORD 5\n";
        let mut reader = MockFileReader::default();
        reader.add_file("main.mac", source);
        let mut asm = Assembler::new(&reader, Syntax::Pdpy11, 0o1000, Vec::new());
        asm.set_include_root(Path::new("main.mac"));
        asm.add_file(Path::new("main.mac"), None).unwrap();
        let writes = asm.writes.clone();
        let mut last = 0;
        for (addr, _) in &writes {
            let addr = addr.clone().eval_int(&mut asm).unwrap();
            assert!(addr >= last, "write address moved backwards");
            last = addr;
        }
    }

    #[test]
    fn test_static_alloc_addresses() {
        let bytes = assemble_source(
            "MEMORY = 160000\nA = STATIC_ALLOC(1)\nB = STATIC_ALLOC_BYTE(3)\n.WORD A, B\n",
        )
        .unwrap();
        // A at MEMORY, B right after A's two bytes.
        assert_eq!(&bytes[0..2], &[0x00, 0xE0]);
        assert_eq!(&bytes[2..4], &[0x02, 0xE0]);
    }
}
