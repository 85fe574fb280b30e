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

// The PDP-11 command table: each mnemonic maps to its argument shape and
// base opcode. The parser consults the argument shape to drive operand
// parsing; the encoder ORs the operand fields into the base opcode.

/// Argument kinds, in the order the parser reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgSpec {
    /// Addressing-mode operand (six-bit field).
    A,
    /// Branch/SOB destination.
    D,
    /// Small immediate field.
    I,
    /// Bare register.
    R,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Opcode(u16),
    /// Immediate-field instruction with a range cap (EMT/TRAP/MARK).
    Immediate { opcode: u16, max: u16 },
    /// `PUSH src` desugars to `MOV src, -(SP)`.
    PushMeta,
    /// `POP dst` desugars to `MOV (SP)+, dst`.
    PopMeta,
}

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub args: &'static [ArgSpec],
    pub encoding: Encoding,
}

const NO_ARGS: &[ArgSpec] = &[];
const A: &[ArgSpec] = &[ArgSpec::A];
const D: &[ArgSpec] = &[ArgSpec::D];
const I: &[ArgSpec] = &[ArgSpec::I];
const R: &[ArgSpec] = &[ArgSpec::R];
const A_A: &[ArgSpec] = &[ArgSpec::A, ArgSpec::A];
const R_A: &[ArgSpec] = &[ArgSpec::R, ArgSpec::A];
const A_R: &[ArgSpec] = &[ArgSpec::A, ArgSpec::R];
const R_D: &[ArgSpec] = &[ArgSpec::R, ArgSpec::D];

const fn op(args: &'static [ArgSpec], opcode: u16) -> Entry {
    Entry {
        args,
        encoding: Encoding::Opcode(opcode),
    }
}

const fn imm(opcode: u16, max: u16) -> Entry {
    Entry {
        args: I,
        encoding: Encoding::Immediate { opcode, max },
    }
}

pub fn lookup(name: &str) -> Option<Entry> {
    let entry = match name {
        // Zero-argument group.
        "HALT" => op(NO_ARGS, 0o000000),
        "WAIT" => op(NO_ARGS, 0o000001),
        "RTI" => op(NO_ARGS, 0o000002),
        "BPT" => op(NO_ARGS, 0o000003),
        "IOT" => op(NO_ARGS, 0o000004),
        "RESET" => op(NO_ARGS, 0o000005),
        "RTT" => op(NO_ARGS, 0o000006),
        "START" => op(NO_ARGS, 0o000012),
        "STEP" => op(NO_ARGS, 0o000016),
        "NOP" => op(NO_ARGS, 0o000240),
        "CLC" => op(NO_ARGS, 0o000241),
        "CLV" => op(NO_ARGS, 0o000242),
        "CLZ" => op(NO_ARGS, 0o000244),
        "CLN" => op(NO_ARGS, 0o000250),
        "CCC" => op(NO_ARGS, 0o000257),
        "SEC" => op(NO_ARGS, 0o000261),
        "SEV" => op(NO_ARGS, 0o000262),
        "SEZ" => op(NO_ARGS, 0o000264),
        "SEN" => op(NO_ARGS, 0o000270),
        "SCC" => op(NO_ARGS, 0o000277),
        // RTS PC
        "RET" => op(NO_ARGS, 0o000207),

        // Single addressing-mode operand.
        "JMP" => op(A, 0o000100),
        // JSR PC
        "CALL" => op(A, 0o004700),
        "SWAB" => op(A, 0o000300),
        "CLR" => op(A, 0o005000),
        "CLRB" => op(A, 0o105000),
        "COM" => op(A, 0o005100),
        "COMB" => op(A, 0o105100),
        "INC" => op(A, 0o005200),
        "INCB" => op(A, 0o105200),
        "DEC" => op(A, 0o005300),
        "DECB" => op(A, 0o105300),
        "NEG" => op(A, 0o005400),
        "NEGB" => op(A, 0o105400),
        "ADC" => op(A, 0o005500),
        "ADCB" => op(A, 0o105500),
        "SBC" => op(A, 0o005600),
        "SBCB" => op(A, 0o105600),
        "TST" => op(A, 0o005700),
        "TSTB" => op(A, 0o105700),
        "ROR" => op(A, 0o006000),
        "RORB" => op(A, 0o106000),
        "ROL" => op(A, 0o006100),
        "ROLB" => op(A, 0o106100),
        "ASR" => op(A, 0o006200),
        "ASRB" => op(A, 0o106200),
        "ASL" => op(A, 0o006300),
        "ASLB" => op(A, 0o106300),
        "SXT" => op(A, 0o006700),
        "MTPS" => op(A, 0o106400),
        "MFPS" => op(A, 0o106700),

        // Branches.
        "BR" => op(D, 0o000400),
        "BNE" => op(D, 0o001000),
        "BEQ" => op(D, 0o001400),
        "BGE" => op(D, 0o002000),
        "BLT" => op(D, 0o002400),
        "BGT" => op(D, 0o003000),
        "BLE" => op(D, 0o003400),
        "BPL" => op(D, 0o100000),
        "BMI" => op(D, 0o100400),
        "BHI" => op(D, 0o101000),
        "BLOS" => op(D, 0o101400),
        "BVC" => op(D, 0o102000),
        "BVS" => op(D, 0o102400),
        "BCC" | "BHIS" => op(D, 0o103000),
        "BCS" | "BLO" => op(D, 0o103400),

        // Immediate-field traps.
        "EMT" => imm(0o104000, 0o377),
        "TRAP" => imm(0o104400, 0o377),
        "MARK" => imm(0o006400, 0o77),

        // Double addressing-mode operands.
        "MOV" => op(A_A, 0o010000),
        "CMP" => op(A_A, 0o020000),
        "BIT" => op(A_A, 0o030000),
        "BIC" => op(A_A, 0o040000),
        "BIS" => op(A_A, 0o050000),
        "ADD" => op(A_A, 0o060000),
        "MOVB" => op(A_A, 0o110000),
        "CMPB" => op(A_A, 0o120000),
        "BITB" => op(A_A, 0o130000),
        "BICB" => op(A_A, 0o140000),
        "BISB" => op(A_A, 0o150000),
        "SUB" => op(A_A, 0o160000),

        // Register-first group.
        "JSR" => op(R_A, 0o004000),
        "XOR" => op(R_A, 0o074000),

        // EIS: register field holds the destination.
        "MUL" => op(A_R, 0o070000),
        "DIV" => op(A_R, 0o071000),
        "ASH" => op(A_R, 0o072000),
        "ASHC" => op(A_R, 0o073000),

        "SOB" => op(R_D, 0o077000),
        "RTS" => op(R, 0o000200),

        // Stack metacommands.
        "PUSH" => Entry {
            args: A,
            encoding: Encoding::PushMeta,
        },
        "POP" => Entry {
            args: A,
            encoding: Encoding::PopMeta,
        },

        _ => return None,
    };
    Some(entry)
}
