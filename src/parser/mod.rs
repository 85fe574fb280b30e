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

// Recursive-descent parser over a character cursor with backtracking
// transactions. Produces the sequence of labeled statements the assembler
// consumes. The dialect (`pdp11asm` vs `pdpy11`) is a field of the parser
// state; it only branches inside the expression grammar and a couple of
// operand/include rules.

mod transaction;

use std::cell::Cell;
use std::rc::Rc;

use transaction::inv;
pub use transaction::{ParseError, PResult};

use crate::assembler::command_set::{self, ArgSpec};
use crate::ast::{AddrArg, AddrMode, Arg, Command, Register, Statement, Syntax};
use crate::deferred::Deferred;
use crate::errors::AssemblyError;
use crate::expression;
use crate::koi8;
use crate::source::SourcePos;

const WHITESPACE: &str = " \t\r\n";
const PUNCTUATION: &str = ",!@#%^&*()[]\\{}|/~`'\";:?<>.+-=";

fn is_whitespace(c: char) -> bool {
    WHITESPACE.contains(c)
}

fn is_punctuation(c: char) -> bool {
    PUNCTUATION.contains(c)
}

// pdpy11 expression operators, multi-character ones first so the operator
// scanner never bites a `<<` in half.
const OPERATORS: &[&str] = &["<<", ">>", "*", "/", "%", "+", "-", "&", "^", "|"];

fn op_priority(op: &str) -> u8 {
    match op {
        "|" => 0,
        "^" => 1,
        "&" => 2,
        "<<" | ">>" => 3,
        "+" | "-" => 4,
        _ => 5,
    }
}

fn apply_operator(stack: &mut Vec<Deferred>, op: &str) {
    use crate::deferred::BinOp;
    let rhs = stack.pop().expect("expression value stack");
    let lhs = stack.pop().expect("expression value stack");
    let op = match op {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Rem,
        "<<" => BinOp::Shl,
        ">>" => BinOp::Shr,
        "&" => BinOp::And,
        "|" => BinOp::Or,
        "^" => BinOp::Xor,
        _ => unreachable!("unknown operator {op}"),
    };
    stack.push(Deferred::binary_terms(op, lhs, rhs));
}

enum Step {
    Label(String),
    Cmd(Command),
}

pub struct Parser {
    code: Vec<char>,
    pos: usize,
    cmd_start: usize,
    file: String,
    decimal: bool,
    pub syntax: Syntax,
    last_label: String,
    current_labels: Vec<String>,
    frames: Vec<transaction::Frame>,
    last_error_stages: Option<Vec<String>>,
    mark_counter: Rc<Cell<usize>>,
}

impl Parser {
    pub fn new(
        file: impl Into<String>,
        code: &str,
        syntax: Syntax,
        mark_counter: Rc<Cell<usize>>,
    ) -> Parser {
        Parser {
            code: code.chars().collect(),
            pos: 0,
            cmd_start: 0,
            file: file.into(),
            decimal: false,
            syntax,
            last_label: String::new(),
            current_labels: Vec::new(),
            frames: Vec::new(),
            last_error_stages: None,
            mark_counter,
        }
    }

    /// Parses the whole file into its statement stream. Parsing stops at
    /// `.END`/`END`, at EOF, and (in the pdp11asm dialect) after an
    /// `.INCLUDE`, which in that dialect ends the including file.
    pub fn parse(mut self) -> Result<Vec<Statement>, AssemblyError> {
        let mut statements = Vec::new();
        loop {
            match self.parse_statement() {
                Ok(statement) => {
                    let stop = matches!(statement.command, Command::End)
                        || (self.syntax == Syntax::Pdp11Asm
                            && matches!(statement.command, Command::Include { raw: false, .. }));
                    statements.push(statement);
                    if stop {
                        break;
                    }
                }
                Err(ParseError::Invalid(reason)) => {
                    let pos = self.coords_at(self.pos);
                    return Err(AssemblyError::Syntax {
                        pos,
                        stack: self.last_error_stages.clone().unwrap_or_default(),
                        reason,
                    });
                }
            }
        }
        Ok(statements)
    }

    fn parse_statement(&mut self) -> PResult<Statement> {
        self.current_labels = Vec::new();
        loop {
            if self.is_eof() {
                let labels = std::mem::take(&mut self.current_labels);
                return Ok(Statement {
                    labels,
                    command: Command::End,
                    pos: self.coords(),
                });
            }

            let _ = self.skip_whitespace(true);
            self.cmd_start = self.pos;

            let step = self.txn_must(Some("command".to_string()), |p| p.statement_step())?;
            match step {
                Step::Label(name) => self.current_labels.push(name),
                Step::Cmd(command) => {
                    let labels = std::mem::take(&mut self.current_labels);
                    let pos = self.coords();
                    return Ok(Statement {
                        labels,
                        command,
                        pos,
                    });
                }
            }
        }
    }

    fn statement_step(&mut self) -> PResult<Step> {
        let start = self.pos;
        let literal = self.opt_literal()?;

        // Bare directive keywords first.
        if let Some(lit) = literal.as_deref() {
            match lit {
                "ORG" => return self.handle_link().map(Step::Cmd),
                "DB" => return self.handle_byte().map(Step::Cmd),
                "DW" => return self.handle_word().map(Step::Cmd),
                "END" => return Ok(Step::Cmd(Command::End)),
                "DS" => return self.handle_blkb().map(Step::Cmd),
                "ALIGN" => return self.handle_align().map(Step::Cmd),
                "MAKE_RAW" => return self.handle_make_raw().map(Step::Cmd),
                "MAKE_BK0010_ROM" | "MAKE_BIN" => return self.handle_make_bin().map(Step::Cmd),
                "MAKE_SAV" => return self.handle_make_sav().map(Step::Cmd),
                "MAKE_TURBO_WAV" => return self.handle_make_wav(true).map(Step::Cmd),
                "MAKE_WAV" => return self.handle_make_wav(false).map(Step::Cmd),
                "CONVERT1251TOKOI8R" => return self.handle_convert1251().map(Step::Cmd),
                "DECIMALNUMBERS" => return self.handle_decimal_numbers().map(Step::Cmd),
                "INSERT_FILE" => return self.handle_insert_file().map(Step::Cmd),
                _ => {}
            }
        }

        if literal.is_none() {
            // Dotted directives.
            if self.opt_punct('.')? {
                return self.txn_must(Some(".COMMAND".to_string()), |p| {
                    let lit = p.need_literal()?;
                    match lit.as_str() {
                        "LINK" | "LA" => p.handle_link().map(Step::Cmd),
                        "INCLUDE" => p.handle_include(false).map(Step::Cmd),
                        "RAW_INCLUDE" => p.handle_include(true).map(Step::Cmd),
                        "PDP11" => Ok(Step::Cmd(Command::Pdp11)),
                        "I8080" => Ok(Step::Cmd(Command::I8080)),
                        "SYNTAX" => p.handle_syntax().map(Step::Cmd),
                        "DB" | "BYTE" => p.handle_byte().map(Step::Cmd),
                        "DW" | "WORD" => p.handle_word().map(Step::Cmd),
                        "DWORD" => p.handle_dword().map(Step::Cmd),
                        "END" => Ok(Step::Cmd(Command::End)),
                        "DS" | "BLKB" => p.handle_blkb().map(Step::Cmd),
                        "BLKW" => p.handle_blkw().map(Step::Cmd),
                        "EVEN" => Ok(Step::Cmd(Command::Even)),
                        "ALIGN" => p.handle_align().map(Step::Cmd),
                        "ASCII" => p.handle_ascii(false).map(Step::Cmd),
                        "ASCIZ" => p.handle_ascii(true).map(Step::Cmd),
                        "REPEAT" => p.handle_repeat().map(Step::Cmd),
                        "EXTERN" => p.handle_extern().map(Step::Cmd),
                        "ONCE" => Ok(Step::Cmd(Command::Once)),
                        other => Err(inv(format!("Expected .COMMAND, got '.{other}'"))),
                    }
                });
            }

            // Integer label prefix ("1:").
            let label = self.need_integer_label()?;
            self.need_punct(':')?;
            return Ok(Step::Label(format!("{}: {}", self.last_label, label)));
        }

        let lit = literal.expect("checked above");

        if self.opt_punct(':')? {
            // Named label: anchors subsequent integer labels.
            self.last_label = lit.clone();
            return Ok(Step::Label(lit));
        }

        if self.opt_punct('=')? {
            let value = self.need_expression(false)?;
            return Ok(Step::Cmd(Command::Equ { name: lit, value }));
        }

        // NAME EQU expr
        let equ = self.txn(None, true, |p| {
            if p.need_literal()? == "EQU" {
                p.no_rollback();
                p.txn_must(Some("EQU".to_string()), |p| p.need_expression(false))
            } else {
                Err(inv("Rollback"))
            }
        })?;
        if let Some(value) = equ {
            return Ok(Step::Cmd(Command::Equ { name: lit, value }));
        }

        // A mnemonic: reparse it from the start of the statement.
        self.pos = start;
        self.handle_insn().map(Step::Cmd)
    }

    // ------------- directive handlers -------------

    fn handle_link(&mut self) -> PResult<Command> {
        self.txn_must(Some(".LINK".to_string()), |p| {
            Ok(Command::Link(p.need_expression(false)?))
        })
    }

    fn handle_include(&mut self, raw: bool) -> PResult<Command> {
        self.txn_must(Some(".INCLUDE".to_string()), |p| {
            let path = if raw { p.need_raw()? } else { p.need_string()? };
            Ok(Command::Include { path, raw })
        })
    }

    fn handle_syntax(&mut self) -> PResult<Command> {
        self.txn_must(Some(".SYNTAX".to_string()), |p| {
            let name = p.need_literal()?;
            let syntax = if name == "PDP11ASM" {
                Syntax::Pdp11Asm
            } else {
                Syntax::Pdpy11
            };
            p.syntax = syntax;
            Ok(Command::SetSyntax(syntax))
        })
    }

    fn handle_byte(&mut self) -> PResult<Command> {
        self.txn_must(Some(".BYTE".to_string()), |p| {
            Ok(Command::Byte(p.need_expression_list()?))
        })
    }

    fn handle_word(&mut self) -> PResult<Command> {
        self.txn_must(Some(".WORD".to_string()), |p| {
            Ok(Command::Word(p.need_expression_list()?))
        })
    }

    fn handle_dword(&mut self) -> PResult<Command> {
        self.txn_must(Some(".DWORD".to_string()), |p| {
            Ok(Command::Dword(p.need_expression_list()?))
        })
    }

    fn need_expression_list(&mut self) -> PResult<Vec<Deferred>> {
        let mut values = vec![self.need_expression(false)?];
        while self.opt_punct(',')? {
            values.push(self.need_expression(false)?);
        }
        Ok(values)
    }

    fn handle_blkb(&mut self) -> PResult<Command> {
        self.txn_must(Some(".BLKB".to_string()), |p| {
            Ok(Command::Blkb(p.need_expression(false)?))
        })
    }

    fn handle_blkw(&mut self) -> PResult<Command> {
        self.txn_must(Some(".BLKW".to_string()), |p| {
            Ok(Command::Blkw(p.need_expression(false)?))
        })
    }

    fn handle_align(&mut self) -> PResult<Command> {
        self.txn_must(Some(".ALIGN".to_string()), |p| {
            Ok(Command::Align(p.need_expression(false)?))
        })
    }

    fn handle_ascii(&mut self, zero_terminated: bool) -> PResult<Command> {
        self.txn_must(Some(".ASCII / .ASCIZ".to_string()), |p| {
            let mut s = p.need_string()?;
            if zero_terminated {
                s.push('\0');
            }
            Ok(Command::Ascii(s))
        })
    }

    fn handle_make_raw(&mut self) -> PResult<Command> {
        self.txn_must(Some(".MAKE_RAW".to_string()), |p| {
            Ok(Command::MakeRaw {
                path: p.opt_string()?,
            })
        })
    }

    fn handle_make_bin(&mut self) -> PResult<Command> {
        self.txn_must(Some(".MAKE_BIN".to_string()), |p| {
            Ok(Command::MakeBin {
                path: p.opt_string()?,
            })
        })
    }

    fn handle_make_sav(&mut self) -> PResult<Command> {
        self.txn_must(Some(".MAKE_SAV".to_string()), |p| {
            let path = p.opt_string()?;
            let final_addr = if path.is_some() && p.opt_punct(',')? {
                Some(p.need_expression(false)?)
            } else {
                None
            };
            Ok(Command::MakeSav { path, final_addr })
        })
    }

    fn handle_make_wav(&mut self, turbo: bool) -> PResult<Command> {
        let stage = if turbo { ".MAKE_TURBO_WAV" } else { ".MAKE_WAV" };
        self.txn_must(Some(stage.to_string()), move |p| {
            let path = p.opt_string()?;
            let bk_name = if path.is_some() && p.opt_punct(',')? {
                Some(p.need_string()?)
            } else {
                None
            };
            Ok(if turbo {
                Command::MakeTurboWav { path, bk_name }
            } else {
                Command::MakeWav { path, bk_name }
            })
        })
    }

    fn handle_convert1251(&mut self) -> PResult<Command> {
        self.txn_must(Some(".CONVERT1251TOKOI8R".to_string()), |p| {
            Ok(Command::Convert1251ToKoi8R(p.need_bool()?))
        })
    }

    fn handle_decimal_numbers(&mut self) -> PResult<Command> {
        self.txn_must(Some(".DECIMALNUMBERS".to_string()), |p| {
            let on = p.need_bool()?;
            p.decimal = on;
            Ok(Command::DecimalNumbers(on))
        })
    }

    fn handle_insert_file(&mut self) -> PResult<Command> {
        self.txn_must(Some(".INSERT_FILE".to_string()), |p| {
            Ok(Command::InsertFile(p.need_string()?))
        })
    }

    fn handle_repeat(&mut self) -> PResult<Command> {
        self.txn_must(Some(".REPEAT".to_string()), |p| {
            let count = p.need_expression(false)?;
            p.need_punct('{')?;

            // Statements inside the block run through parse_statement,
            // which rebuilds current_labels; keep the repeat's own label
            // prefix safe across that.
            let outer_labels = std::mem::take(&mut p.current_labels);
            let saved_cmd_start = p.cmd_start;

            let mut body = Vec::new();
            loop {
                if p.opt_punct('}')? {
                    p.cmd_start = saved_cmd_start;
                    p.current_labels = outer_labels;
                    return Ok(Command::Repeat { count, body });
                }
                if p.is_eof() {
                    return Err(inv("Expected '}', got EOF"));
                }
                body.push(p.parse_statement()?);
            }
        })
    }

    fn handle_extern(&mut self) -> PResult<Command> {
        self.txn_must(Some(".EXTERN".to_string()), |p| {
            let mut names = vec![p.need_literal()?];
            while p.opt_punct(',')? {
                names.push(p.need_literal()?);
            }
            Ok(Command::Extern(names))
        })
    }

    // ------------- instructions -------------

    fn handle_insn(&mut self) -> PResult<Command> {
        let _ = self.skip_whitespace(true);

        self.txn_must(Some("compilable command".to_string()), |p| {
            let name = p.need_literal()?;
            let Some(entry) = command_set::lookup(&name) else {
                return Err(inv(format!("Expected command name, got '{name}'")));
            };

            let mut args = Vec::new();
            for (i, spec) in entry.args.iter().enumerate() {
                if i != 0 {
                    p.need_punct(',')?;
                }
                match spec {
                    ArgSpec::A => args.push(Arg::Addr(p.need_addr_arg()?)),
                    ArgSpec::D => args.push(Arg::Dest(p.need_expression(true)?)),
                    ArgSpec::I => args.push(Arg::Imm(p.need_expression(false)?)),
                    ArgSpec::R => args.push(Arg::Reg(p.need_register()?)),
                }
            }
            Ok(Command::Insn { name, args })
        })
    }

    /// The addressing-mode recognizer: tries the operand shapes in a fixed
    /// order and returns the first match.
    fn need_addr_arg(&mut self) -> PResult<AddrArg> {
        self.txn_must(Some("argument".to_string()), |p| p.addr_arg_body())
    }

    fn addr_arg_body(&mut self) -> PResult<AddrArg> {
        if self.opt_punct('(')? {
            // (Rn) or (Rn)+
            self.no_rollback();
            let reg = self.need_register()?;
            self.need_punct(')')?;
            if self.opt_punct('+')? {
                return Ok(AddrArg::new(reg, AddrMode::PostInc));
            }
            return Ok(AddrArg::new(reg, AddrMode::Indirect));
        }

        if self.opt_punct('@')? {
            // @Rn, @(Rn)+, @-(Rn), @expr(Rn), @(Rn), @#expr or @expr
            if let Some(expr) = self.opt_expression(false)? {
                self.no_rollback();
                if self.opt_punct('(')? {
                    self.no_rollback();
                    let reg = self.need_register()?;
                    self.need_punct(')')?;
                    return Ok(AddrArg::with_imm(reg, AddrMode::IndexIndirect, expr));
                }
                return Ok(match self.syntax {
                    // pdp11asm compatibility: the displacement is taken
                    // verbatim instead of PC-relative.
                    Syntax::Pdp11Asm => {
                        AddrArg::with_imm(Register::PC, AddrMode::IndexIndirect, expr)
                    }
                    Syntax::Pdpy11 => {
                        AddrArg::with_offset(Register::PC, AddrMode::IndexIndirect, expr)
                    }
                });
            }
            if self.opt_punct('#')? {
                // @#expr = @(PC)+
                self.no_rollback();
                let expr = self.need_expression(false)?;
                return Ok(AddrArg::with_imm(
                    Register::PC,
                    AddrMode::PostIncIndirect,
                    expr,
                ));
            }
            if self.opt_punct('(')? {
                // @(Rn)+ or @(Rn), the latter encoding as @0(Rn)
                self.no_rollback();
                let reg = self.need_register()?;
                self.need_punct(')')?;
                if self.opt_punct('+')? {
                    return Ok(AddrArg::new(reg, AddrMode::PostIncIndirect));
                }
                return Ok(AddrArg::with_imm(
                    reg,
                    AddrMode::IndexIndirect,
                    expression::literal(0),
                ));
            }
            if self.opt_punct('-')? {
                // @-(Rn)
                self.no_rollback();
                self.need_punct('(')?;
                let reg = self.need_register()?;
                self.need_punct(')')?;
                return Ok(AddrArg::new(reg, AddrMode::PreDecIndirect));
            }
            // @Rn = (Rn)
            let reg = self.need_register()?;
            return Ok(AddrArg::new(reg, AddrMode::Indirect));
        }

        // Rn, -(Rn), expr(Rn), expr or #expr
        if let Some(expr) = self.opt_expression(false)? {
            self.no_rollback();
            if self.opt_punct('(')? {
                self.no_rollback();
                let reg = self.need_register()?;
                self.need_punct(')')?;
                return Ok(AddrArg::with_imm(reg, AddrMode::Index, expr));
            }
            // Bare expression: PC-relative displacement.
            return Ok(AddrArg::with_offset(Register::PC, AddrMode::Index, expr));
        }
        if self.opt_punct('-')? {
            self.no_rollback();
            self.need_punct('(')?;
            let reg = self.need_register()?;
            self.need_punct(')')?;
            return Ok(AddrArg::new(reg, AddrMode::PreDec));
        }
        if self.opt_punct('#')? {
            // #expr = (PC)+
            self.no_rollback();
            let expr = self.need_expression(false)?;
            return Ok(AddrArg::with_imm(Register::PC, AddrMode::PostInc, expr));
        }
        let reg = self.need_register()?;
        Ok(AddrArg::new(reg, AddrMode::Direct))
    }

    fn need_register(&mut self) -> PResult<Register> {
        self.txn_must(Some("register".to_string()), |p| {
            let Some(literal) = p.opt_literal()? else {
                return Err(inv("Expected register"));
            };
            Register::from_name(&literal)
                .ok_or_else(|| inv(format!("Expected register, got '{literal}'")))
        })
    }

    // ------------- expressions -------------

    fn need_expression(&mut self, is_label: bool) -> PResult<Deferred> {
        self.txn_must(Some("expression".to_string()), |p| {
            p.expression_body(is_label)
        })
    }

    fn opt_expression(&mut self, is_label: bool) -> PResult<Option<Deferred>> {
        self.txn(Some("expression".to_string()), true, |p| {
            p.expression_body(is_label)
        })
    }

    fn expression_body(&mut self, is_label: bool) -> PResult<Deferred> {
        match self.syntax {
            Syntax::Pdp11Asm => self.expression_pdp11asm(is_label),
            Syntax::Pdpy11 => self.expression_pdpy11(is_label),
        }
    }

    /// pdp11asm expressions: strict left-to-right `+ - * /`, no
    /// precedence, no parentheses.
    fn expression_pdp11asm(&mut self, is_label: bool) -> PResult<Deferred> {
        let (mut value, _) = self.need_value(is_label)?;
        self.no_rollback();
        loop {
            if self.opt_punct('+')? {
                self.no_rollback();
                let (rhs, _) = self.need_value(is_label)?;
                value = value.add(&rhs);
            } else if self.opt_punct('-')? {
                self.no_rollback();
                let (rhs, _) = self.need_value(is_label)?;
                value = value.sub(&rhs);
            } else if self.opt_punct('*')? {
                self.no_rollback();
                let (rhs, _) = self.need_value(is_label)?;
                value = value.mul(&rhs);
            } else if self.opt_punct('/')? {
                self.no_rollback();
                let (rhs, _) = self.need_value(is_label)?;
                value = value.div(&rhs);
            } else {
                break;
            }
        }
        Ok(value)
    }

    /// pdpy11 expressions: shunting-yard over the full operator set, left
    /// associative throughout, parentheses allowed.
    fn expression_pdpy11(&mut self, is_label: bool) -> PResult<Deferred> {
        let mut is_label = is_label;

        if is_label {
            // Macro-11 compatibility scan: when the expression has no
            // parentheses the first integer token is a local label;
            // otherwise integers are numbers and local labels need a ':'
            // suffix. The scan always rolls back.
            let mut has_brackets = false;
            let _ = self.txn(None, true, |p| -> PResult<()> {
                loop {
                    if p.opt_punct('(')? {
                        has_brackets = true;
                        break;
                    }
                    let _ = p.need_value(is_label)?;
                    if p.opt_operator()?.is_none() {
                        break;
                    }
                }
                Err(inv("Rollback"))
            })?;
            if has_brackets {
                is_label = false;
            }
        }

        enum OpToken {
            Paren,
            Op(&'static str),
        }

        let mut stack: Vec<Deferred> = Vec::new();
        let mut op_stack: Vec<OpToken> = Vec::new();

        loop {
            while self.opt_punct('(')? {
                op_stack.push(OpToken::Paren);
            }

            let (value, was_label) = self.need_value(is_label)?;
            stack.push(value);
            if was_label {
                // Only the first label token is treated as a label.
                is_label = false;
            }

            while op_stack.iter().any(|t| matches!(t, OpToken::Paren)) && self.opt_punct(')')? {
                loop {
                    match op_stack.pop() {
                        Some(OpToken::Paren) => break,
                        Some(OpToken::Op(op)) => apply_operator(&mut stack, op),
                        None => return Err(inv("Unmatched ')'")),
                    }
                }
            }

            let Some(current) = self.opt_operator()? else {
                break;
            };
            let current_priority = op_priority(current);

            while let Some(top) = op_stack.last() {
                match top {
                    OpToken::Paren => break,
                    OpToken::Op(top_op) => {
                        if op_priority(top_op) < current_priority {
                            break;
                        }
                        // Equal priority pops too: every operator here is
                        // left-associative.
                        let Some(OpToken::Op(op)) = op_stack.pop() else {
                            unreachable!()
                        };
                        apply_operator(&mut stack, op);
                    }
                }
            }
            op_stack.push(OpToken::Op(current));
        }

        while let Some(top) = op_stack.pop() {
            match top {
                OpToken::Paren => return Err(inv("Unmatched '('")),
                OpToken::Op(op) => apply_operator(&mut stack, op),
            }
        }

        Ok(stack.pop().expect("expression value stack"))
    }

    fn opt_operator(&mut self) -> PResult<Option<&'static str>> {
        self.txn(Some("operator".to_string()), true, |p| {
            for op in OPERATORS {
                if p.opt_punct_str(op)? {
                    return Ok(*op);
                }
            }
            Err(inv("Expected operator"))
        })
    }

    /// One value token. The returned flag says whether the token was a
    /// deferred reference (label, `.`, STATIC_ALLOC) as opposed to a plain
    /// number or character literal.
    fn need_value(&mut self, is_label: bool) -> PResult<(Deferred, bool)> {
        self.txn_must(Some("value".to_string()), |p| p.value_body(is_label))
    }

    fn value_body(&mut self, is_label: bool) -> PResult<(Deferred, bool)> {
        // Character literal: one or two chars pack into a word.
        let string = self.opt_string()?;
        let pos = self.coords();

        if let Some(s) = string {
            self.no_rollback();
            let bytes =
                koi8::encode(&s).map_err(|_| inv("#'string': cannot encode string to KOI8-R"))?;
            return match bytes.len() {
                0 => Err(inv("#'string': expected 1 or 2 chars, got 0")),
                1 => Ok((expression::literal(bytes[0] as i64), false)),
                2 => Ok((
                    expression::literal(bytes[0] as i64 | ((bytes[1] as i64) << 8)),
                    false,
                )),
                n => Err(inv(format!("Cannot fit {n} characters in 1 word: '{s}'"))),
            };
        }

        if is_label {
            // Integer local label reference ("1" meaning "LAST: 1").
            if let Some(label) = self.opt_integer_label()? {
                let name = format!("{}: {}", self.last_label, label);
                return Ok((expression::label_ref(name, self.file.as_str(), pos), true));
            }
        } else {
            // An integer token can still reference a local label when a
            // ':' follows ("1:"); plain digits and 0x/0b/0o forms without
            // the colon stay numbers.
            let colon_label = self.txn(None, true, |p| {
                let label = p.need_integer_label()?;
                let lower = label.to_lowercase();
                if label.chars().all(|c| c.is_ascii_digit())
                    || lower.starts_with("0x")
                    || lower.starts_with("0b")
                    || lower.starts_with("0o")
                {
                    p.need_punct(':')?;
                }
                Ok(label)
            })?;
            if let Some(label) = colon_label {
                let name = format!("{}: {}", self.last_label, label);
                return Ok((expression::label_ref(name, self.file.as_str(), pos), true));
            }
        }

        if let Some(n) = self.opt_integer()? {
            return Ok((expression::literal(n), false));
        }

        // "." is the current address.
        if self.opt_punct('.')? {
            return Ok((self.mark(), true));
        }

        let literal = self.opt_literal()?;
        if let Some(lit) = literal.as_deref() {
            if lit == "STATIC_ALLOC" || lit == "STATIC_ALLOC_BYTE" {
                self.no_rollback();
                let is_byte = lit == "STATIC_ALLOC_BYTE";
                let stage = lit.to_string();
                let value = self.txn_must(Some(stage), |p| {
                    p.need_punct('(')?;
                    let length = p.need_expression(false)?;
                    p.need_punct(')')?;
                    Ok(expression::static_alloc(length, is_byte))
                })?;
                return Ok((value, true));
            }
        }

        match literal {
            Some(lit) if Register::from_name(&lit).is_none() => {
                Ok((expression::label_ref(lit, self.file.as_str(), pos), true))
            }
            _ => Err(inv(
                "Expected integer, string, . (dot), label or STATIC_ALLOC[_BYTE]",
            )),
        }
    }

    /// Compiles the `.` token to a fresh synthetic label attached to the
    /// current statement, so its value is the statement's link address.
    fn mark(&mut self) -> Deferred {
        let n = self.mark_counter.get();
        self.mark_counter.set(n + 1);
        let name = format!(".{n}");
        self.current_labels.push(name.clone());
        expression::label_ref(name, self.file.as_str(), self.coords())
    }

    // ------------- token primitives -------------

    fn need_literal(&mut self) -> PResult<String> {
        self.txn_must(Some("literal".to_string()), |p| p.literal_body())
    }

    fn opt_literal(&mut self) -> PResult<Option<String>> {
        self.txn(Some("literal".to_string()), true, |p| p.literal_body())
    }

    fn literal_body(&mut self) -> PResult<String> {
        self.skip_whitespace(false)?;

        let mut literal = String::new();
        loop {
            let Some(c) = self.peek() else {
                if literal.is_empty() {
                    return Err(inv("Expected literal, got EOF"));
                }
                return Ok(literal);
            };
            if is_whitespace(c) || is_punctuation(c) {
                if literal.is_empty() {
                    return Err(inv(format!("Expected literal, got '{c}'")));
                }
                return Ok(literal);
            }
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() || upper == '_' || upper == '$' {
                literal.push(upper);
                self.pos += 1;
            } else if c.is_ascii_digit() && !literal.is_empty() {
                literal.push(c);
                self.pos += 1;
            } else {
                return Err(inv(format!("Expected literal, got '{c}'")));
            }
        }
    }

    fn need_punct(&mut self, c: char) -> PResult<()> {
        self.txn_must(Some(format!("sign '{c}'")), |p| p.punct_body(c))
    }

    fn opt_punct(&mut self, c: char) -> PResult<bool> {
        Ok(self
            .txn(Some(format!("sign '{c}'")), true, |p| p.punct_body(c))?
            .is_some())
    }

    fn punct_body(&mut self, c: char) -> PResult<()> {
        let _ = self.skip_whitespace(true);
        match self.peek() {
            None => Err(inv(format!("Expected '{c}', got EOF"))),
            Some(got) if got == c => {
                self.pos += 1;
                Ok(())
            }
            Some(got) => Err(inv(format!("Expected '{c}', got '{got}'"))),
        }
    }

    fn opt_punct_str(&mut self, s: &str) -> PResult<bool> {
        Ok(self
            .txn(Some(format!("sign '{s}'")), true, |p| {
                let _ = p.skip_whitespace(true);
                for expected in s.chars() {
                    match p.peek() {
                        Some(got) if got == expected => p.pos += 1,
                        Some(got) => {
                            return Err(inv(format!("Expected '{s}', got '{got}'")));
                        }
                        None => return Err(inv(format!("Expected '{s}', got EOF"))),
                    }
                }
                Ok(())
            })?
            .is_some())
    }

    fn need_char(&mut self, c: char) -> PResult<()> {
        self.txn_must(Some(format!("character '{c}'")), |p| p.char_body(c))
    }

    fn opt_char(&mut self, c: char) -> PResult<bool> {
        Ok(self
            .txn(Some(format!("character '{c}'")), true, |p| p.char_body(c))?
            .is_some())
    }

    // Single raw character, case-insensitive, no whitespace skipping.
    fn char_body(&mut self, c: char) -> PResult<()> {
        match self.peek() {
            None => Err(inv(format!("Expected '{c}', got EOF"))),
            Some(got) if got.to_ascii_uppercase() == c => {
                self.pos += 1;
                Ok(())
            }
            Some(got) => Err(inv(format!("Expected '{c}', got '{got}'"))),
        }
    }

    fn need_integer_label(&mut self) -> PResult<String> {
        self.txn_must(Some("local label".to_string()), |p| p.integer_label_body())
    }

    fn opt_integer_label(&mut self) -> PResult<Option<String>> {
        self.txn(Some("local label".to_string()), true, |p| {
            p.integer_label_body()
        })
    }

    fn integer_label_body(&mut self) -> PResult<String> {
        let _ = self.skip_whitespace(true);

        let mut label = String::new();
        match self.peek() {
            Some(c) if c.is_ascii_digit() => {
                label.push(c);
                self.pos += 1;
            }
            Some(c) => return Err(inv(format!("Expected digit, got '{c}'"))),
            None => return Err(inv("Expected digit, got EOF")),
        }

        loop {
            let Some(c) = self.peek() else {
                return Ok(label);
            };
            if is_whitespace(c) || is_punctuation(c) {
                return Ok(label);
            }
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() || upper.is_ascii_digit() || upper == '_' || upper == '$'
            {
                label.push(upper);
                self.pos += 1;
            } else {
                return Err(inv(format!("Expected literal, got '{c}'")));
            }
        }
    }

    fn need_integer(&mut self) -> PResult<i64> {
        self.txn_must(Some("integer".to_string()), |p| p.integer_body())
    }

    fn opt_integer(&mut self) -> PResult<Option<i64>> {
        self.txn(Some("integer".to_string()), true, |p| p.integer_body())
    }

    fn integer_body(&mut self) -> PResult<i64> {
        let _ = self.skip_whitespace(true);

        let mut integer = String::new();
        let mut radix: Option<u32> = None;

        if self.opt_char('+')? {
            integer.push('+');
        } else if self.opt_char('-')? {
            integer.push('-');
        }

        loop {
            if self.opt_char('.')? {
                // Decimal suffix.
                if integer.is_empty() {
                    return Err(inv("Expected integer, got '.'"));
                } else if radix.is_none() {
                    radix = Some(10);
                    break;
                } else {
                    self.no_rollback();
                    return Err(inv("Two (or more) radix specifiers"));
                }
            }

            if radix.is_none() {
                if self.opt_char('B')? {
                    if integer != "0" {
                        return Err(inv(format!("Expected integer, got '{integer}b'")));
                    }
                    radix = Some(2);
                    self.no_rollback();
                    continue;
                } else if self.opt_char('O')? {
                    if integer != "0" {
                        return Err(inv(format!("Expected integer, got '{integer}o'")));
                    }
                    radix = Some(8);
                    self.no_rollback();
                    continue;
                } else if self.opt_char('X')? {
                    if integer != "0" {
                        return Err(inv(format!("Expected integer, got '{integer}x'")));
                    }
                    radix = Some(16);
                    self.no_rollback();
                    continue;
                }
            }

            let Some(c) = self.peek() else {
                break;
            };
            if is_whitespace(c) || is_punctuation(c) {
                break;
            }
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_hexdigit() {
                integer.push(upper);
                self.pos += 1;
            } else {
                return Err(inv(format!("Expected integer, got '{c}'")));
            }
        }

        let radix = radix.unwrap_or(if self.decimal { 10 } else { 8 });
        i64::from_str_radix(&integer, radix)
            .map_err(|_| inv(format!("Expected integer, got '{integer}' (radix {radix})")))
    }

    /// Everything up to the end of the line, trimmed. Used by
    /// `.RAW_INCLUDE`, whose path is not quoted.
    fn need_raw(&mut self) -> PResult<String> {
        self.txn_must(Some("raw string (terminated by EOL)".to_string()), |p| {
            let mut s = String::new();
            while let Some(c) = p.peek() {
                if c == '\r' || c == '\n' {
                    break;
                }
                s.push(c);
                p.pos += 1;
            }
            Ok(s.trim().to_string())
        })
    }

    fn need_string(&mut self) -> PResult<String> {
        self.txn_must(Some("string".to_string()), |p| p.string_body())
    }

    fn opt_string(&mut self) -> PResult<Option<String>> {
        self.txn(Some("string".to_string()), true, |p| p.string_body())
    }

    /// A string delimited by `"`, `'` or `/`, concatenable with `<N>`
    /// raw-byte escapes on either side.
    fn string_body(&mut self) -> PResult<String> {
        let mut mapped_at_least_once = false;
        let mut string = String::new();

        loop {
            let _ = self.skip_whitespace(true);

            if self.opt_char('<')? {
                let code = self.need_integer()?;
                let c = u32::try_from(code)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| inv(format!("Invalid character code <{code}>")))?;
                string.push(c);
                self.need_char('>')?;
                mapped_at_least_once = true;
                continue;
            }

            let Some(c) = self.peek() else {
                if mapped_at_least_once {
                    return Ok(string);
                }
                return Err(inv("Expected string, got EOF"));
            };

            if c == '"' || c == '\'' || c == '/' {
                let delimiter = c;
                self.pos += 1;
                self.no_rollback();
                loop {
                    match self.peek() {
                        Some(got) if got == delimiter => {
                            self.pos += 1;
                            mapped_at_least_once = true;
                            break;
                        }
                        Some(got) => {
                            string.push(got);
                            self.pos += 1;
                        }
                        None => return Err(inv("Expected string terminator, got EOF")),
                    }
                }
            } else {
                if mapped_at_least_once {
                    return Ok(string);
                }
                return Err(inv(format!("Expected string, got '{c}'")));
            }
        }
    }

    fn need_bool(&mut self) -> PResult<bool> {
        self.txn_must(Some("boolean".to_string()), |p| {
            let _ = p.skip_whitespace(true);
            match p.opt_literal()?.as_deref() {
                Some("ON") | Some("TRUE") | Some("YES") => Ok(true),
                Some("OFF") | Some("FALSE") | Some("NO") => Ok(false),
                Some(other) => Err(inv(format!("Expected boolean, got '{other}'"))),
                None => match p.peek() {
                    Some(c) => Err(inv(format!("Expected boolean, got '{c}'"))),
                    None => Err(inv("Expected boolean, got EOF")),
                },
            }
        })
    }

    // ------------- cursor helpers -------------

    fn peek(&self) -> Option<char> {
        self.code.get(self.pos).copied()
    }

    fn is_eof(&mut self) -> bool {
        let saved = self.pos;
        match self.skip_whitespace(false) {
            Err(_) => true,
            Ok(()) => {
                self.pos = saved;
                false
            }
        }
    }

    fn skip_whitespace(&mut self, allow_eof: bool) -> PResult<()> {
        loop {
            let mut skipped = false;

            while let Some(c) = self.peek() {
                if is_whitespace(c) {
                    self.pos += 1;
                    skipped = true;
                } else {
                    break;
                }
            }

            // ; comment
            if self.peek() == Some(';') {
                skipped = true;
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.pos += 1;
                }
            }

            // // comment
            if self.peek() == Some('/') && self.code.get(self.pos + 1).copied() == Some('/') {
                skipped = true;
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.pos += 1;
                }
            }

            if !skipped {
                break;
            }
        }

        if self.peek().is_none() && !allow_eof {
            return Err(inv("Unexpected EOF"));
        }
        Ok(())
    }

    fn coords(&self) -> SourcePos {
        let mut pos = self.coords_at(self.cmd_start);
        let text: String = self.code[self.cmd_start..self.pos.min(self.code.len())]
            .iter()
            .collect();
        pos.text = text.trim().to_string();
        pos
    }

    fn coords_at(&self, at: usize) -> SourcePos {
        let at = at.min(self.code.len());
        let mut line = 1;
        let mut last_lf = 0;
        for (i, c) in self.code[..at].iter().enumerate() {
            if *c == '\n' {
                line += 1;
                last_lf = i;
            }
        }
        SourcePos::new(self.file.clone(), line, at - last_lf)
    }
}

// ------------- unit tests -------------
