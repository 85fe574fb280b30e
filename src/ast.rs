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

use std::fmt;

use crate::deferred::Deferred;
use crate::source::SourcePos;

// The two accepted source dialects. The dialect only changes the
// expression grammar and a couple of include/operand rules, so it is a
// field of the parser state rather than a separate parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    Pdp11Asm,
    Pdpy11,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    SP,
    PC,
}

impl Register {
    pub fn from_name(name: &str) -> Option<Register> {
        match name {
            "R0" => Some(Register::R0),
            "R1" => Some(Register::R1),
            "R2" => Some(Register::R2),
            "R3" => Some(Register::R3),
            "R4" => Some(Register::R4),
            "R5" => Some(Register::R5),
            "R6" | "SP" => Some(Register::SP),
            "R7" | "PC" => Some(Register::PC),
            _ => None,
        }
    }

    pub fn number(self) -> u16 {
        self as u16
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Register::R0 => "R0",
            Register::R1 => "R1",
            Register::R2 => "R2",
            Register::R3 => "R3",
            Register::R4 => "R4",
            Register::R5 => "R5",
            Register::SP => "SP",
            Register::PC => "PC",
        };
        f.write_str(name)
    }
}

// Addressing modes in encoding order: the discriminant is the three-bit
// mode field of the operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrMode {
    Direct,          // Rn
    Indirect,        // (Rn)
    PostInc,         // (Rn)+
    PostIncIndirect, // @(Rn)+
    PreDec,          // -(Rn)
    PreDecIndirect,  // @-(Rn)
    Index,           // N(Rn)
    IndexIndirect,   // @N(Rn)
}

impl AddrMode {
    pub fn index(self) -> u16 {
        self as u16
    }
}

/// An addressing-mode operand. `imm` carries the extra word for the index
/// modes and for the `#imm`/`@#imm` PC shortcuts; `is_offset` marks the
/// bare-expression PC-relative form whose extra word is rewritten to
/// `imm - (link_pc + 2)` at emission time.
#[derive(Debug, Clone)]
pub struct AddrArg {
    pub reg: Register,
    pub mode: AddrMode,
    pub imm: Option<Deferred>,
    pub is_offset: bool,
}

impl AddrArg {
    pub fn new(reg: Register, mode: AddrMode) -> AddrArg {
        AddrArg {
            reg,
            mode,
            imm: None,
            is_offset: false,
        }
    }

    pub fn with_imm(reg: Register, mode: AddrMode, imm: Deferred) -> AddrArg {
        AddrArg {
            reg,
            mode,
            imm: Some(imm),
            is_offset: false,
        }
    }

    pub fn with_offset(reg: Register, mode: AddrMode, imm: Deferred) -> AddrArg {
        AddrArg {
            reg,
            mode,
            imm: Some(imm),
            is_offset: true,
        }
    }

    /// The six-bit operand field: mode index times eight, plus register.
    pub fn encode(&self) -> u16 {
        (self.mode.index() << 3) | self.reg.number()
    }

    fn map_labels(&self, f: &dyn Fn(&str) -> String) -> AddrArg {
        AddrArg {
            reg: self.reg,
            mode: self.mode,
            imm: self.imm.as_ref().map(|d| d.map_labels(f)),
            is_offset: self.is_offset,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Arg {
    /// Full addressing-mode operand.
    Addr(AddrArg),
    /// Branch or SOB destination address.
    Dest(Deferred),
    /// Small immediate field (EMT/TRAP/MARK).
    Imm(Deferred),
    /// Bare register operand.
    Reg(Register),
}

impl Arg {
    fn map_labels(&self, f: &dyn Fn(&str) -> String) -> Arg {
        match self {
            Arg::Addr(a) => Arg::Addr(a.map_labels(f)),
            Arg::Dest(d) => Arg::Dest(d.map_labels(f)),
            Arg::Imm(d) => Arg::Imm(d.map_labels(f)),
            Arg::Reg(r) => Arg::Reg(*r),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Command {
    /// End of the file's statement stream (explicit `.END`/`END` or EOF).
    /// Inside a `.REPEAT` body it ends the current iteration instead.
    End,
    Link(Deferred),
    Include {
        path: String,
        raw: bool,
    },
    Pdp11,
    I8080,
    SetSyntax(Syntax),
    Byte(Vec<Deferred>),
    Word(Vec<Deferred>),
    Dword(Vec<Deferred>),
    Blkb(Deferred),
    Blkw(Deferred),
    Even,
    Align(Deferred),
    Ascii(String),
    MakeRaw {
        path: Option<String>,
    },
    MakeBin {
        path: Option<String>,
    },
    MakeSav {
        path: Option<String>,
        final_addr: Option<Deferred>,
    },
    MakeTurboWav {
        path: Option<String>,
        bk_name: Option<String>,
    },
    MakeWav {
        path: Option<String>,
        bk_name: Option<String>,
    },
    Convert1251ToKoi8R(bool),
    DecimalNumbers(bool),
    InsertFile(String),
    Equ {
        name: String,
        value: Deferred,
    },
    Repeat {
        count: Deferred,
        body: Vec<Statement>,
    },
    Extern(Vec<String>),
    Once,
    Insn {
        name: String,
        args: Vec<Arg>,
    },
}

/// One parse event: a directive or mnemonic with the labels attached in
/// front of it, plus the source coordinates of the whole statement.
#[derive(Debug, Clone)]
pub struct Statement {
    pub labels: Vec<String>,
    pub command: Command,
    pub pos: SourcePos,
}

impl Statement {
    /// Rewrites every label reference inside the statement's expressions
    /// through `f`. Label definitions are left alone; `.REPEAT` replay
    /// renames those itself.
    pub fn map_labels(&self, f: &dyn Fn(&str) -> String) -> Statement {
        let command = match &self.command {
            Command::Link(d) => Command::Link(d.map_labels(f)),
            Command::Byte(ds) => Command::Byte(ds.iter().map(|d| d.map_labels(f)).collect()),
            Command::Word(ds) => Command::Word(ds.iter().map(|d| d.map_labels(f)).collect()),
            Command::Dword(ds) => Command::Dword(ds.iter().map(|d| d.map_labels(f)).collect()),
            Command::Blkb(d) => Command::Blkb(d.map_labels(f)),
            Command::Blkw(d) => Command::Blkw(d.map_labels(f)),
            Command::Align(d) => Command::Align(d.map_labels(f)),
            Command::MakeSav { path, final_addr } => Command::MakeSav {
                path: path.clone(),
                final_addr: final_addr.as_ref().map(|d| d.map_labels(f)),
            },
            Command::Equ { name, value } => Command::Equ {
                name: name.clone(),
                value: value.map_labels(f),
            },
            Command::Repeat { count, body } => Command::Repeat {
                count: count.map_labels(f),
                body: body.iter().map(|st| st.map_labels(f)).collect(),
            },
            Command::Insn { name, args } => Command::Insn {
                name: name.clone(),
                args: args.iter().map(|a| a.map_labels(f)).collect(),
            },
            other => other.clone(),
        };
        Statement {
            labels: self.labels.clone(),
            command,
            pos: self.pos.clone(),
        }
    }
}
