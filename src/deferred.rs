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

// Lazy integer (and byte-list) values. Label addresses depend on how much
// earlier code emits, and earlier code may itself reference later labels,
// so the whole address computation is built as a graph once and evaluated
// on demand at link time. Known operands fold eagerly into a short
// pending-math vector, which keeps the graphs shallow.

use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::AssemblyError;
use crate::koi8;
use crate::source::SourcePos;

/// Formats an integer in octal, the customary radix for PDP-11 addresses.
pub fn octal(n: i64) -> String {
    if n < 0 {
        format!("-{:o}", -n)
    } else {
        format!("{:o}", n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    List(Vec<i64>),
    Str(String),
}

impl Value {
    pub fn as_int(&self) -> Result<i64, AssemblyError> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(type_error(format!("expected integer, got {other:?}"))),
        }
    }

    fn truthy(&self) -> Result<bool, AssemblyError> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(n) => Ok(*n != 0),
            other => Err(type_error(format!("expected condition, got {other:?}"))),
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            Value::Int(_) => ValueType::Int,
            Value::Bool(_) => ValueType::Bool,
            Value::List(_) => ValueType::List,
            Value::Str(_) => ValueType::Str,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int,
    Bool,
    List,
    Str,
    Any,
    Raise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinOp {
    fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Invert,
}

/// Post-conversions queued with `Deferred::then`: range checks, list
/// length, KOI8-R encoding, branch-offset math. Each one carries the
/// source coordinates its diagnostic should point at.
#[derive(Debug, Clone, PartialEq)]
pub enum Conversion {
    ByteRange(SourcePos),
    WordRange(SourcePos),
    DwordRange(SourcePos),
    ListLen,
    Koi8Charlist(SourcePos),
    BranchWords(SourcePos),
    BranchRange(SourcePos),
    SobWords { pos: SourcePos, name: String },
    SobRange { pos: SourcePos, name: String },
    ImmTooBig { pos: SourcePos, max: u16 },
    ImmNegative(SourcePos),
    Int8ToUint8,
}

impl Conversion {
    fn apply(&self, value: Value) -> Result<Value, AssemblyError> {
        match self {
            Conversion::ByteRange(pos) => {
                let n = value.as_int()?;
                if n >= 256 {
                    Err(compiler_error(pos, format!("Byte {} is too big", octal(n))))
                } else if n < -256 {
                    Err(compiler_error(pos, format!("Byte {} is too small", octal(n))))
                } else if n < 0 {
                    Ok(Value::Int(n + 256))
                } else {
                    Ok(Value::Int(n))
                }
            }
            Conversion::WordRange(pos) => {
                let n = value.as_int()?;
                if n >= 65536 {
                    Err(compiler_error(pos, format!("Word {} is too big", octal(n))))
                } else if n < -65536 {
                    Err(compiler_error(pos, format!("Word {} is too small", octal(n))))
                } else if n < 0 {
                    Ok(Value::Int(n + 65536))
                } else {
                    Ok(Value::Int(n))
                }
            }
            Conversion::DwordRange(pos) => {
                let n = value.as_int()?;
                if n >= 0x1_0000_0000 {
                    Err(compiler_error(
                        pos,
                        format!("Double word {} is too big", octal(n)),
                    ))
                } else if n < -0x1_0000_0000 {
                    Err(compiler_error(
                        pos,
                        format!("Double word {} is too small", octal(n)),
                    ))
                } else if n < 0 {
                    Ok(Value::Int(n + 0x1_0000_0000))
                } else {
                    Ok(Value::Int(n))
                }
            }
            Conversion::ListLen => match value {
                Value::List(l) => Ok(Value::Int(l.len() as i64)),
                other => Err(type_error(format!("expected byte list, got {other:?}"))),
            },
            Conversion::Koi8Charlist(pos) => match value {
                Value::Str(s) => match koi8::encode(&s) {
                    Ok(bytes) => Ok(Value::List(bytes.iter().map(|b| *b as i64).collect())),
                    Err(_) => Err(compiler_error(pos, "Cannot encode string to KOI8-R")),
                },
                other => Err(type_error(format!("expected string, got {other:?}"))),
            },
            Conversion::BranchWords(pos) => {
                let n = value.as_int()?;
                if n.rem_euclid(2) == 1 {
                    Err(compiler_error(
                        pos,
                        format!("Unaligned branch: {} bytes", octal(n)),
                    ))
                } else {
                    Ok(Value::Int(n.div_euclid(2)))
                }
            }
            Conversion::BranchRange(pos) => {
                let n = value.as_int()?;
                if !(-128..=127).contains(&n) {
                    Err(compiler_error(
                        pos,
                        format!("Too far branch: {} words", octal(n)),
                    ))
                } else {
                    Ok(Value::Int(n))
                }
            }
            Conversion::SobWords { pos, name } => {
                let n = value.as_int()?;
                if n.rem_euclid(2) == 1 {
                    Err(compiler_error(
                        pos,
                        format!("Unaligned {}: {} bytes", name, octal(n)),
                    ))
                } else {
                    Ok(Value::Int(n.div_euclid(2)))
                }
            }
            Conversion::SobRange { pos, name } => {
                let n = value.as_int()?;
                if !(0..=63).contains(&n) {
                    Err(compiler_error(
                        pos,
                        format!("Too far {}: {} words", name, octal(n)),
                    ))
                } else {
                    Ok(Value::Int(n))
                }
            }
            Conversion::ImmTooBig { pos, max } => {
                let n = value.as_int()?;
                if n > *max as i64 {
                    Err(compiler_error(
                        pos,
                        format!("Too big immediate value: {}", octal(n)),
                    ))
                } else {
                    Ok(Value::Int(n))
                }
            }
            Conversion::ImmNegative(pos) => {
                let n = value.as_int()?;
                if n < 0 {
                    Err(compiler_error(
                        pos,
                        format!("Negative immediate value: {}", octal(n)),
                    ))
                } else {
                    Ok(Value::Int(n))
                }
            }
            Conversion::Int8ToUint8 => {
                let n = value.as_int()?;
                Ok(Value::Int(if n < 0 { n + 256 } else { n }))
            }
        }
    }
}

fn compiler_error(pos: &SourcePos, reason: impl Into<String>) -> AssemblyError {
    AssemblyError::Compiler {
        pos: pos.clone(),
        reason: reason.into(),
    }
}

fn type_error(reason: String) -> AssemblyError {
    AssemblyError::ExpressionEvaluate {
        pos: SourcePos::default(),
        reason,
    }
}

/// The context a deferred graph is evaluated against: the symbol table for
/// label leaves and the bump allocator behind `STATIC_ALLOC`.
pub trait EvalContext {
    fn lookup_label(&self, file_id: &str, name: &str) -> Option<Deferred>;
    fn static_alloc(&mut self, byte_length: &Deferred) -> Deferred;
}

#[derive(Debug)]
pub struct StaticAllocState {
    pub byte_length: Deferred,
    resolved: RefCell<Option<Deferred>>,
}

#[derive(Debug, Clone)]
enum Core {
    Value(Value),
    Label {
        name: String,
        file_id: String,
        pos: SourcePos,
    },
    // Shared so that copies made by pending-math wrapping still allocate
    // exactly once.
    StaticAlloc(Rc<StaticAllocState>),
    Unary {
        op: UnaryOp,
        inner: Deferred,
    },
    Binary {
        op: BinOp,
        lhs: Deferred,
        rhs: Deferred,
    },
    If {
        cond: Deferred,
        when_true: Deferred,
        when_false: Deferred,
    },
    Repeat {
        count: Deferred,
        fill: Deferred,
    },
    And {
        lhs: Deferred,
        rhs: Deferred,
    },
    Or {
        lhs: Deferred,
        rhs: Deferred,
    },
    Then {
        inner: Deferred,
        conv: Conversion,
    },
    Raise(Box<AssemblyError>),
}

#[derive(Debug, Clone)]
struct Pending {
    op: BinOp,
    operand: Value,
    reverse: bool,
}

#[derive(Debug)]
struct Inner {
    core: Core,
    pending: Vec<Pending>,
    cache: Option<Value>,
    ty: ValueType,
    evaluating: bool,
}

#[derive(Debug, Clone)]
pub struct Deferred(Rc<RefCell<Inner>>);

/// Either side of a deferred operation: a known scalar, a known byte list,
/// or another deferred.
#[derive(Debug, Clone)]
pub enum Term {
    Int(i64),
    List(Vec<i64>),
    Defer(Deferred),
}

impl Term {
    fn known(&self) -> Option<Value> {
        match self {
            Term::Int(n) => Some(Value::Int(*n)),
            Term::List(l) => Some(Value::List(l.clone())),
            Term::Defer(d) => d.cached_value(),
        }
    }

    fn value_type(&self) -> ValueType {
        match self {
            Term::Int(_) => ValueType::Int,
            Term::List(_) => ValueType::List,
            Term::Defer(d) => d.ty(),
        }
    }

    fn into_deferred(self) -> Deferred {
        match self {
            Term::Int(n) => Deferred::from_value(Value::Int(n)),
            Term::List(l) => Deferred::from_value(Value::List(l)),
            Term::Defer(d) => d,
        }
    }
}

impl From<i64> for Term {
    fn from(n: i64) -> Self {
        Term::Int(n)
    }
}

impl From<i32> for Term {
    fn from(n: i32) -> Self {
        Term::Int(n as i64)
    }
}

impl From<u16> for Term {
    fn from(n: u16) -> Self {
        Term::Int(n as i64)
    }
}

impl From<Vec<i64>> for Term {
    fn from(l: Vec<i64>) -> Self {
        Term::List(l)
    }
}

impl From<Deferred> for Term {
    fn from(d: Deferred) -> Self {
        Term::Defer(d)
    }
}

impl From<&Deferred> for Term {
    fn from(d: &Deferred) -> Self {
        Term::Defer(d.clone())
    }
}

fn result_type(lhs: ValueType, op: BinOp, rhs: ValueType) -> ValueType {
    if lhs == ValueType::Int && rhs == ValueType::Int {
        if op.is_comparison() {
            ValueType::Bool
        } else {
            ValueType::Int
        }
    } else {
        ValueType::Any
    }
}

fn apply_binop(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, AssemblyError> {
    let a = lhs.as_int()?;
    let b = rhs.as_int()?;
    let int = |n: i64| Ok(Value::Int(n));
    match op {
        BinOp::Add => int(a + b),
        BinOp::Sub => int(a - b),
        BinOp::Mul => int(a * b),
        BinOp::Div => {
            if b == 0 {
                Err(type_error("division by zero in expression".to_string()))
            } else {
                int(python_floordiv(a, b))
            }
        }
        BinOp::Rem => {
            if b == 0 {
                Err(type_error("division by zero in expression".to_string()))
            } else {
                int(python_mod(a, b))
            }
        }
        BinOp::Shl => {
            if b < 0 {
                Err(type_error("negative shift count in expression".to_string()))
            } else {
                int(a << b)
            }
        }
        BinOp::Shr => {
            if b < 0 {
                Err(type_error("negative shift count in expression".to_string()))
            } else {
                int(a >> b)
            }
        }
        BinOp::And => int(a & b),
        BinOp::Or => int(a | b),
        BinOp::Xor => int(a ^ b),
        BinOp::Eq => Ok(Value::Bool(a == b)),
        BinOp::Ne => Ok(Value::Bool(a != b)),
        BinOp::Lt => Ok(Value::Bool(a < b)),
        BinOp::Gt => Ok(Value::Bool(a > b)),
        BinOp::Le => Ok(Value::Bool(a <= b)),
        BinOp::Ge => Ok(Value::Bool(a >= b)),
    }
}

// Division rounding toward negative infinity, as label arithmetic expects.
fn python_floordiv(a: i64, b: i64) -> i64 {
    let q = a / b;
    if (a % b != 0) && ((a < 0) != (b < 0)) {
        q - 1
    } else {
        q
    }
}

fn python_mod(a: i64, b: i64) -> i64 {
    let r = a % b;
    if r != 0 && ((r < 0) != (b < 0)) { r + b } else { r }
}

fn apply_unop(op: UnaryOp, value: Value) -> Result<Value, AssemblyError> {
    let n = value.as_int()?;
    Ok(Value::Int(match op {
        UnaryOp::Neg => -n,
        UnaryOp::Pos => n,
        UnaryOp::Invert => !n,
    }))
}

impl Deferred {
    fn node(core: Core, ty: ValueType) -> Deferred {
        Deferred(Rc::new(RefCell::new(Inner {
            core,
            pending: Vec::new(),
            cache: None,
            ty,
            evaluating: false,
        })))
    }

    pub fn from_value(value: Value) -> Deferred {
        let ty = value.value_type();
        Deferred(Rc::new(RefCell::new(Inner {
            core: Core::Value(value.clone()),
            pending: Vec::new(),
            cache: Some(value),
            ty,
            evaluating: false,
        })))
    }

    pub fn int(n: i64) -> Deferred {
        Deferred::from_value(Value::Int(n))
    }

    pub fn label(name: impl Into<String>, file_id: impl Into<String>, pos: SourcePos) -> Deferred {
        Deferred::node(
            Core::Label {
                name: name.into(),
                file_id: file_id.into(),
                pos,
            },
            ValueType::Int,
        )
    }

    pub fn static_alloc(byte_length: Deferred) -> Deferred {
        Deferred::node(
            Core::StaticAlloc(Rc::new(StaticAllocState {
                byte_length,
                resolved: RefCell::new(None),
            })),
            ValueType::Int,
        )
    }

    pub fn raise(err: AssemblyError) -> Deferred {
        Deferred::node(Core::Raise(Box::new(err)), ValueType::Raise)
    }

    pub fn if_(
        cond: impl Into<Term>,
        when_true: impl Into<Term>,
        when_false: impl Into<Term>,
    ) -> Deferred {
        let cond = cond.into();
        let when_true = when_true.into();
        let when_false = when_false.into();

        if let Some(v) = cond.known() {
            return match v.truthy() {
                Ok(true) => when_true.into_deferred(),
                Ok(false) => when_false.into_deferred(),
                Err(e) => Deferred::raise(e),
            };
        }

        let when_true = when_true.into_deferred();
        let when_false = when_false.into_deferred();
        let ty = match (when_true.ty(), when_false.ty()) {
            (ValueType::Raise, t) => t,
            (t, ValueType::Raise) => t,
            (a, b) if a == b => a,
            _ => ValueType::Any,
        };
        Deferred::node(
            Core::If {
                cond: cond.into_deferred(),
                when_true,
                when_false,
            },
            ty,
        )
    }

    pub fn repeat(count: impl Into<Term>, fill: impl Into<Term>) -> Deferred {
        Deferred::node(
            Core::Repeat {
                count: count.into().into_deferred(),
                fill: fill.into().into_deferred(),
            },
            ValueType::List,
        )
    }

    pub fn and(lhs: impl Into<Term>, rhs: impl Into<Term>) -> Deferred {
        Deferred::node(
            Core::And {
                lhs: lhs.into().into_deferred(),
                rhs: rhs.into().into_deferred(),
            },
            ValueType::Bool,
        )
    }

    pub fn or(lhs: impl Into<Term>, rhs: impl Into<Term>) -> Deferred {
        Deferred::node(
            Core::Or {
                lhs: lhs.into().into_deferred(),
                rhs: rhs.into().into_deferred(),
            },
            ValueType::Bool,
        )
    }

    pub fn ty(&self) -> ValueType {
        self.0.borrow().ty
    }

    pub fn cached_value(&self) -> Option<Value> {
        self.0.borrow().cache.clone()
    }

    /// True only when both sides will provably evaluate to the same value:
    /// both already constant and equal, or literally the same node.
    pub fn same(a: &Deferred, b: &Deferred) -> bool {
        if Rc::ptr_eq(&a.0, &b.0) {
            return true;
        }
        match (a.cached_value(), b.cached_value()) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    }

    fn shallow_copy(&self, ty: ValueType) -> Deferred {
        let inner = self.0.borrow();
        Deferred(Rc::new(RefCell::new(Inner {
            core: inner.core.clone(),
            pending: inner.pending.clone(),
            cache: inner.cache.clone(),
            ty,
            evaluating: false,
        })))
    }

    fn add_pending(&self, op: BinOp, other: Value, reverse: bool) -> Result<(), AssemblyError> {
        let mut inner = self.0.borrow_mut();

        if let Some(cache) = inner.cache.clone() {
            let folded = if reverse {
                apply_binop(op, other.clone(), cache)?
            } else {
                apply_binop(op, cache, other.clone())?
            };
            inner.cache = Some(folded);
        }

        let mut op = op;
        let mut other = other;
        if inner.ty == ValueType::Int {
            if !reverse && op == BinOp::Sub {
                if let Value::Int(k) = other {
                    op = BinOp::Add;
                    other = Value::Int(-k);
                }
            }

            if !reverse {
                if let Some(last) = inner.pending.last_mut() {
                    if last.op == op && !last.reverse {
                        if let (Value::Int(prev), Value::Int(k)) = (&last.operand, &other) {
                            let fused = match op {
                                // Chained shifts compose by total shift count.
                                BinOp::Add | BinOp::Shl | BinOp::Shr => Some(prev + k),
                                BinOp::Mul => Some(prev * k),
                                BinOp::And => Some(prev & k),
                                BinOp::Or => Some(prev | k),
                                BinOp::Xor => Some(prev ^ k),
                                _ => None,
                            };
                            if let Some(fused) = fused {
                                last.operand = Value::Int(fused);
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }

        inner.pending.push(Pending { op, operand: other, reverse });
        Ok(())
    }

    fn binary(op: BinOp, lhs: Term, rhs: Term) -> Deferred {
        let ty = result_type(lhs.value_type(), op, rhs.value_type());
        match (&lhs, rhs.known()) {
            (Term::Defer(a), Some(v)) => {
                let out = a.shallow_copy(ty);
                match out.add_pending(op, v, false) {
                    Ok(()) => out,
                    Err(e) => Deferred::raise(e),
                }
            }
            (Term::Defer(a), None) => {
                let Term::Defer(b) = rhs else { unreachable!() };
                Deferred::node(
                    Core::Binary {
                        op,
                        lhs: a.clone(),
                        rhs: b,
                    },
                    ty,
                )
            }
            _ => match rhs {
                Term::Defer(b) => {
                    // Known value on the left of a deferred right side.
                    let v = lhs.known().expect("non-deferred term is known");
                    let out = b.shallow_copy(ty);
                    match out.add_pending(op, v, true) {
                        Ok(()) => out,
                        Err(e) => Deferred::raise(e),
                    }
                }
                rhs => {
                    let a = lhs.known().expect("non-deferred term is known");
                    let b = rhs.known().expect("non-deferred term is known");
                    match apply_binop(op, a, b) {
                        Ok(v) => Deferred::from_value(v),
                        Err(e) => Deferred::raise(e),
                    }
                }
            },
        }
    }

    pub fn binary_terms(op: BinOp, lhs: impl Into<Term>, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(op, lhs.into(), rhs.into())
    }

    pub fn add(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Add, Term::from(self), rhs.into())
    }

    pub fn sub(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Sub, Term::from(self), rhs.into())
    }

    pub fn mul(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Mul, Term::from(self), rhs.into())
    }

    pub fn div(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Div, Term::from(self), rhs.into())
    }

    pub fn rem(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Rem, Term::from(self), rhs.into())
    }

    pub fn shl(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Shl, Term::from(self), rhs.into())
    }

    pub fn shr(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Shr, Term::from(self), rhs.into())
    }

    pub fn bitand(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::And, Term::from(self), rhs.into())
    }

    pub fn bitor(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Or, Term::from(self), rhs.into())
    }

    pub fn bitxor(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Xor, Term::from(self), rhs.into())
    }

    pub fn cmp_eq(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Eq, Term::from(self), rhs.into())
    }

    pub fn cmp_ne(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Ne, Term::from(self), rhs.into())
    }

    pub fn cmp_lt(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Lt, Term::from(self), rhs.into())
    }

    pub fn cmp_gt(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Gt, Term::from(self), rhs.into())
    }

    pub fn cmp_le(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Le, Term::from(self), rhs.into())
    }

    pub fn cmp_ge(&self, rhs: impl Into<Term>) -> Deferred {
        Deferred::binary(BinOp::Ge, Term::from(self), rhs.into())
    }

    pub fn neg(&self) -> Deferred {
        Deferred::node(
            Core::Unary {
                op: UnaryOp::Neg,
                inner: self.clone(),
            },
            ValueType::Int,
        )
    }

    pub fn pos(&self) -> Deferred {
        Deferred::node(
            Core::Unary {
                op: UnaryOp::Pos,
                inner: self.clone(),
            },
            ValueType::Int,
        )
    }

    pub fn invert(&self) -> Deferred {
        Deferred::node(
            Core::Unary {
                op: UnaryOp::Invert,
                inner: self.clone(),
            },
            ValueType::Int,
        )
    }

    /// Queues a post-conversion, folding immediately when the value is
    /// already known. A failing eager fold becomes a raising deferred so
    /// the diagnostic still surfaces at link time.
    pub fn then(&self, conv: Conversion, ty: ValueType) -> Deferred {
        if let Some(v) = self.cached_value() {
            return match conv.apply(v) {
                Ok(out) => {
                    let d = Deferred::from_value(out);
                    d.0.borrow_mut().ty = ty;
                    d
                }
                Err(e) => Deferred::raise(e),
            };
        }
        Deferred::node(
            Core::Then {
                inner: self.clone(),
                conv,
            },
            ty,
        )
    }

    pub fn eval(&self, ctx: &mut dyn EvalContext) -> Result<Value, AssemblyError> {
        {
            let inner = self.0.borrow();
            if let Some(v) = &inner.cache {
                return Ok(v.clone());
            }
            if inner.evaluating {
                return Err(AssemblyError::RecursiveDefinition);
            }
        }

        self.0.borrow_mut().evaluating = true;
        let result = self.eval_uncached(ctx);
        self.0.borrow_mut().evaluating = false;

        let value = result?;
        self.0.borrow_mut().cache = Some(value.clone());
        Ok(value)
    }

    pub fn eval_int(&self, ctx: &mut dyn EvalContext) -> Result<i64, AssemblyError> {
        self.eval(ctx)?.as_int()
    }

    fn eval_uncached(&self, ctx: &mut dyn EvalContext) -> Result<Value, AssemblyError> {
        let (core, pending) = {
            let inner = self.0.borrow();
            (inner.core.clone(), inner.pending.clone())
        };

        let mut value = match core {
            Core::Value(v) => v,
            Core::Label { name, file_id, pos } => match ctx.lookup_label(&file_id, &name) {
                Some(d) => d.eval(ctx)?,
                None => {
                    return Err(AssemblyError::ExpressionEvaluate {
                        pos,
                        reason: format!("Label '{name}' not found"),
                    });
                }
            },
            Core::StaticAlloc(state) => {
                let resolved = state.resolved.borrow().clone();
                let addr = match resolved {
                    Some(d) => d,
                    None => {
                        let d = ctx.static_alloc(&state.byte_length);
                        *state.resolved.borrow_mut() = Some(d.clone());
                        d
                    }
                };
                addr.eval(ctx)?
            }
            Core::Unary { op, inner } => apply_unop(op, inner.eval(ctx)?)?,
            Core::Binary { op, lhs, rhs } => apply_binop(op, lhs.eval(ctx)?, rhs.eval(ctx)?)?,
            Core::If {
                cond,
                when_true,
                when_false,
            } => {
                if cond.eval(ctx)?.truthy()? {
                    when_true.eval(ctx)?
                } else {
                    when_false.eval(ctx)?
                }
            }
            Core::Repeat { count, fill } => {
                let n = count.eval(ctx)?.as_int()?.max(0) as usize;
                let fill = fill.eval(ctx)?.as_int()?;
                Value::List(vec![fill; n])
            }
            Core::And { lhs, rhs } => {
                if !lhs.eval(ctx)?.truthy()? {
                    Value::Bool(false)
                } else {
                    Value::Bool(rhs.eval(ctx)?.truthy()?)
                }
            }
            Core::Or { lhs, rhs } => {
                if lhs.eval(ctx)?.truthy()? {
                    Value::Bool(true)
                } else {
                    Value::Bool(rhs.eval(ctx)?.truthy()?)
                }
            }
            Core::Then { inner, conv } => conv.apply(inner.eval(ctx)?)?,
            Core::Raise(err) => return Err(*err),
        };

        for p in pending {
            value = if p.reverse {
                apply_binop(p.op, p.operand, value)?
            } else {
                apply_binop(p.op, value, p.operand)?
            };
        }
        Ok(value)
    }

    /// Structurally rewrites label leaves through `f`. Used by `.REPEAT`
    /// unrolling to give every iteration its own copies of the block's
    /// local labels. The result is uncached except for plain values.
    pub fn map_labels(&self, f: &dyn Fn(&str) -> String) -> Deferred {
        let inner = self.0.borrow();
        let (core, cache) = match &inner.core {
            Core::Value(v) => (Core::Value(v.clone()), Some(v.clone())),
            Core::Label { name, file_id, pos } => (
                Core::Label {
                    name: f(name),
                    file_id: file_id.clone(),
                    pos: pos.clone(),
                },
                None,
            ),
            Core::StaticAlloc(state) => (Core::StaticAlloc(state.clone()), None),
            Core::Unary { op, inner } => (
                Core::Unary {
                    op: *op,
                    inner: inner.map_labels(f),
                },
                None,
            ),
            Core::Binary { op, lhs, rhs } => (
                Core::Binary {
                    op: *op,
                    lhs: lhs.map_labels(f),
                    rhs: rhs.map_labels(f),
                },
                None,
            ),
            Core::If {
                cond,
                when_true,
                when_false,
            } => (
                Core::If {
                    cond: cond.map_labels(f),
                    when_true: when_true.map_labels(f),
                    when_false: when_false.map_labels(f),
                },
                None,
            ),
            Core::Repeat { count, fill } => (
                Core::Repeat {
                    count: count.map_labels(f),
                    fill: fill.map_labels(f),
                },
                None,
            ),
            Core::And { lhs, rhs } => (
                Core::And {
                    lhs: lhs.map_labels(f),
                    rhs: rhs.map_labels(f),
                },
                None,
            ),
            Core::Or { lhs, rhs } => (
                Core::Or {
                    lhs: lhs.map_labels(f),
                    rhs: rhs.map_labels(f),
                },
                None,
            ),
            Core::Then { inner, conv } => (
                Core::Then {
                    inner: inner.map_labels(f),
                    conv: conv.clone(),
                },
                None,
            ),
            Core::Raise(e) => (Core::Raise(e.clone()), None),
        };
        Deferred(Rc::new(RefCell::new(Inner {
            core,
            pending: inner.pending.clone(),
            cache,
            ty: inner.ty,
            evaluating: false,
        })))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::TestContext;
    use super::*;

    #[test]
    fn test_constant_folds_eagerly() {
        let d = Deferred::int(2).add(3).mul(4);
        assert_eq!(d.cached_value(), Some(Value::Int(20)));
    }

    #[test]
    fn test_pending_add_fusion() {
        let mut ctx = TestContext::default();
        ctx.labels.insert("L".to_string(), Deferred::int(100));
        let base = Deferred::label("L", "f", SourcePos::default());
        let d = base.add(1).add(2).add(3).sub(4);
        // All four constants fuse into a single pending +2.
        assert_eq!(d.0.borrow().pending.len(), 1);
        assert_eq!(d.eval_int(&mut ctx).unwrap(), 102);
    }

    #[test]
    fn test_shift_fusion_composes_counts() {
        let mut ctx = TestContext::default();
        ctx.labels.insert("L".to_string(), Deferred::int(1));
        let base = Deferred::label("L", "f", SourcePos::default());
        let d = base.shl(2).shl(3);
        assert_eq!(d.0.borrow().pending.len(), 1);
        assert_eq!(d.eval_int(&mut ctx).unwrap(), 32);
    }

    #[test]
    fn test_deferred_matches_eager_evaluation() {
        let mut ctx = TestContext::default();
        let cases: &[(Deferred, i64)] = &[
            (Deferred::int(7).sub(10), -3),
            (Deferred::int(7).div(2), 3),
            (Deferred::int(-7).div(2), -4),
            (Deferred::int(-7).rem(2), 1),
            (Deferred::int(0o177777).bitand(0xFF), 0o377),
            (Deferred::int(5).bitxor(3), 6),
            (Deferred::int(1).neg(), -1),
            (Deferred::int(0).invert(), -1),
        ];
        for (d, expected) in cases {
            assert_eq!(d.eval_int(&mut ctx).unwrap(), *expected);
        }
    }

    #[test]
    fn test_original_not_mutated_by_operations() {
        let a = Deferred::int(10);
        let _b = a.add(5);
        assert_eq!(a.cached_value(), Some(Value::Int(10)));
    }

    #[test]
    fn test_eval_is_idempotent_and_cached() {
        let mut ctx = TestContext::default();
        ctx.labels.insert("L".to_string(), Deferred::int(8));
        let d = Deferred::label("L", "f", SourcePos::default()).add(1);
        assert_eq!(d.eval_int(&mut ctx).unwrap(), 9);
        assert_eq!(d.eval_int(&mut ctx).unwrap(), 9);
        // The leaf lookup ran exactly once; the second eval hit the cache.
        assert_eq!(ctx.lookups.get(), 1);
    }

    #[test]
    fn test_recursive_definition_detected() {
        let mut ctx = TestContext::default();
        let d = Deferred::label("X", "f", SourcePos::default()).add(1);
        ctx.labels.insert("X".to_string(), d.clone());
        assert_eq!(
            d.eval_int(&mut ctx),
            Err(AssemblyError::RecursiveDefinition)
        );
    }

    #[test]
    fn test_if_folds_on_known_condition() {
        let d = Deferred::if_(Deferred::int(1).cmp_eq(1), 10, 20);
        assert_eq!(d.cached_value(), Some(Value::Int(10)));
    }

    #[test]
    fn test_if_defers_on_unknown_condition() {
        let mut ctx = TestContext::default();
        ctx.labels.insert("L".to_string(), Deferred::int(3));
        let cond = Deferred::label("L", "f", SourcePos::default()).rem(2).cmp_eq(0);
        let d = Deferred::if_(cond, vec![], vec![0]);
        assert_eq!(d.eval(&mut ctx).unwrap(), Value::List(vec![0]));
    }

    #[test]
    fn test_repeat_builds_list() {
        let mut ctx = TestContext::default();
        let d = Deferred::repeat(3, 0);
        assert_eq!(d.eval(&mut ctx).unwrap(), Value::List(vec![0, 0, 0]));
    }

    #[test]
    fn test_raise_defers_error() {
        let mut ctx = TestContext::default();
        let d = Deferred::raise(AssemblyError::RecursiveDefinition);
        assert!(d.eval(&mut ctx).is_err());
    }

    #[test]
    fn test_then_range_check() {
        let mut ctx = TestContext::default();
        ctx.labels.insert("L".to_string(), Deferred::int(-1));
        let d = Deferred::label("L", "f", SourcePos::default())
            .then(Conversion::ByteRange(SourcePos::default()), ValueType::Int);
        assert_eq!(d.eval_int(&mut ctx).unwrap(), 255);
    }

    #[test]
    fn test_then_folds_eagerly_on_cached() {
        let d = Deferred::int(-2).then(Conversion::WordRange(SourcePos::default()), ValueType::Int);
        assert_eq!(d.cached_value(), Some(Value::Int(65534)));
    }

    #[test]
    fn test_map_labels_renames_leaves() {
        let mut ctx = TestContext::default();
        ctx.labels.insert("X!s".to_string(), Deferred::int(42));
        let d = Deferred::label("X", "f", SourcePos::default()).add(1);
        let mapped = d.map_labels(&|name| format!("{name}!s"));
        assert_eq!(mapped.eval_int(&mut ctx).unwrap(), 43);
    }

    #[test]
    fn test_same_is_conservative() {
        let a = Deferred::int(5);
        let b = Deferred::int(5);
        let l = Deferred::label("L", "f", SourcePos::default());
        assert!(Deferred::same(&a, &b));
        assert!(Deferred::same(&l, &l));
        assert!(!Deferred::same(&a, &l));
    }

    #[test]
    fn test_and_or_short_circuit() {
        let mut ctx = TestContext::default();
        // The right side references a missing label but is never reached.
        let missing = Deferred::label("NOPE", "f", SourcePos::default());
        let d = Deferred::and(Deferred::int(0), missing.clone());
        assert_eq!(d.eval(&mut ctx).unwrap(), Value::Bool(false));
        let d = Deferred::or(Deferred::int(1), missing);
        assert_eq!(d.eval(&mut ctx).unwrap(), Value::Bool(true));
    }
}
