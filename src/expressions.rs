//! Lazily evaluated expression trees over late-bound symbols
//!
//! A directive's size may depend on labels defined later, and a label's
//! address depends on the sizes of the directives before it. Both reduce
//! to lazy evaluation: every expression node exposes `eval`, labels
//! memoise their first successful result, and the maybe-cyclical nodes
//! guard themselves with a re-entry flag so a dependency cycle surfaces
//! as an error instead of unbounded recursion.

use std::cell::Cell;
use std::collections::HashMap;

use crate::directives::{SectionId, Sections};
use crate::errors::{AsmError, ErrorKind, Origin};
use crate::memory::MemoryFormat;

/// Everything `eval` needs to look at: the sections (for label
/// addresses), the symbol namespace, and the final memory format.
pub struct EvalCx<'a> {
    pub sections: &'a Sections,
    pub namespace: &'a Namespace,
    pub mf: &'a MemoryFormat,
}

pub type Namespace = HashMap<String, Expr>;

/// Marks which kind of instruction operand a value specifier is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecTag {
    /// Immediate value
    Im,
    /// State-memory reference
    Sv,
    /// Const-memory reference
    Cv,
}

/// A concrete value produced by evaluating an expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i128),
    Bytes(Vec<u8>),
    Str(String),
    Spec(SpecTag, i128),
}

impl Value {
    pub fn as_int(&self) -> Option<i128> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }
}

/// An operator usable inside assembler expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExprOp {
    Add,
    Sub,
    Or,
    Xor,
    Mul,
    Div,
    And,
    Shl,
    Shr,
    Pos,
    Neg,
    Inv,
}

impl ExprOp {
    pub fn name(self) -> &'static str {
        match self {
            ExprOp::Add => "+",
            ExprOp::Sub => "-",
            ExprOp::Or => "|",
            ExprOp::Xor => "^",
            ExprOp::Mul => "*",
            ExprOp::Div => "/",
            ExprOp::And => "&",
            ExprOp::Shl => "<<",
            ExprOp::Shr => ">>",
            ExprOp::Pos => "u+",
            ExprOp::Neg => "u-",
            ExprOp::Inv => "u~",
        }
    }

    /// Binding strength, low to high: `+ -` < `| ^` < `* /` < `&` <
    /// `<< >>` < unary. Deliberately not the C ordering.
    pub fn precedence(self) -> u8 {
        match self {
            ExprOp::Add | ExprOp::Sub => 0,
            ExprOp::Or | ExprOp::Xor => 1,
            ExprOp::Mul | ExprOp::Div => 2,
            ExprOp::And => 3,
            ExprOp::Shl | ExprOp::Shr => 4,
            ExprOp::Pos | ExprOp::Neg | ExprOp::Inv => 5,
        }
    }

    pub fn is_unary(self) -> bool {
        matches!(self, ExprOp::Pos | ExprOp::Neg | ExprOp::Inv)
    }

    /// Apply the operator to already-evaluated operands. Division is
    /// floor division; any arithmetic fault comes back as a message for
    /// the caller to wrap.
    fn apply(self, args: &[i128]) -> Result<i128, String> {
        let overflow = || "integer overflow".to_string();
        match self {
            ExprOp::Pos | ExprOp::Neg | ExprOp::Inv => {
                let [a] = args else {
                    return Err("wrong number of operands".to_string());
                };
                match self {
                    ExprOp::Pos => Ok(*a),
                    ExprOp::Neg => a.checked_neg().ok_or_else(overflow),
                    _ => Ok(!a),
                }
            }
            _ => {
                let [a, b] = args else {
                    return Err("wrong number of operands".to_string());
                };
                let (a, b) = (*a, *b);
                match self {
                    ExprOp::Add => a.checked_add(b).ok_or_else(overflow),
                    ExprOp::Sub => a.checked_sub(b).ok_or_else(overflow),
                    ExprOp::Mul => a.checked_mul(b).ok_or_else(overflow),
                    ExprOp::Div => {
                        if b == 0 {
                            return Err("integer division or modulo by zero".to_string());
                        }
                        let q = a.checked_div(b).ok_or_else(overflow)?;
                        let r = a % b;
                        Ok(if r != 0 && (r < 0) != (b < 0) { q - 1 } else { q })
                    }
                    ExprOp::Or => Ok(a | b),
                    ExprOp::Xor => Ok(a ^ b),
                    ExprOp::And => Ok(a & b),
                    ExprOp::Shl => {
                        if b < 0 {
                            return Err("negative shift count".to_string());
                        }
                        if b >= 128 {
                            return if a == 0 { Ok(0) } else { Err(overflow()) };
                        }
                        let shifted = a.wrapping_shl(b as u32);
                        if shifted >> (b as u32) == a {
                            Ok(shifted)
                        } else {
                            Err(overflow())
                        }
                    }
                    ExprOp::Shr => {
                        if b < 0 {
                            return Err("negative shift count".to_string());
                        }
                        Ok(a >> b.min(127) as u32)
                    }
                    _ => Err("wrong number of operands".to_string()),
                }
            }
        }
    }
}

/// A node in the lazy expression tree
#[derive(Debug)]
pub enum Expr {
    Int(i128),
    Bytes(Vec<u8>),
    Str(String),
    /// A numeric literal written with the `w` suffix, meaning "that many
    /// words"; the scale factor is only known once the format is final
    WordScaled {
        inner: Box<Expr>,
        origin: Origin,
    },
    /// A name to be looked up in the namespace at evaluation time
    Variable {
        name: String,
        origin: Origin,
        busy: Cell<bool>,
    },
    Label(Label),
    Operation {
        op: ExprOp,
        args: Vec<Expr>,
        origin: Origin,
    },
    /// Wraps an instruction operand with its value-specifier tag
    Tagged {
        tag: SpecTag,
        inner: Box<Expr>,
        origin: Origin,
    },
}

/// A position in a section, resolved to a byte (or instruction) address
/// on demand and memoised
#[derive(Debug)]
pub struct Label {
    pub name: String,
    pub section: SectionId,
    pub index: usize,
    pub origin: Origin,
    value: Cell<Option<i128>>,
    busy: Cell<bool>,
}

impl Expr {
    pub fn variable(name: impl Into<String>, origin: Origin) -> Expr {
        Expr::Variable {
            name: name.into(),
            origin,
            busy: Cell::new(false),
        }
    }

    pub fn label(name: impl Into<String>, section: SectionId, index: usize, origin: Origin) -> Expr {
        Expr::Label(Label {
            name: name.into(),
            section,
            index,
            origin,
            value: Cell::new(None),
            busy: Cell::new(false),
        })
    }

    pub fn eval(&self, cx: &EvalCx) -> Result<Value, AsmError> {
        match self {
            Expr::Int(v) => Ok(Value::Int(*v)),
            Expr::Bytes(b) => Ok(Value::Bytes(b.clone())),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::WordScaled { inner, origin } => {
                let v = expect_int(inner.eval(cx)?, origin)?;
                v.checked_mul(cx.mf.word_size() as i128)
                    .map(Value::Int)
                    .ok_or_else(|| {
                        AsmError::new(ErrorKind::Evaluation, "integer overflow", origin.clone())
                    })
            }
            Expr::Variable { name, origin, busy } => guarded(busy, name, origin, || {
                match cx.namespace.get(name) {
                    Some(expr) => expr.eval(cx),
                    None => Err(AsmError::new(
                        ErrorKind::Expression,
                        format!("{name} is not defined in this namespace"),
                        origin.clone(),
                    )),
                }
            }),
            Expr::Label(label) => label.eval(cx),
            Expr::Operation { op, args, origin } => {
                let mut operands = Vec::with_capacity(args.len());
                for arg in args {
                    operands.push(expect_int(arg.eval(cx)?, origin)?);
                }
                op.apply(&operands).map(Value::Int).map_err(|detail| {
                    AsmError::new(
                        ErrorKind::Evaluation,
                        format!("Encountered an error evaluating {}", op.name()),
                        origin.clone(),
                    )
                    .with_cause(AsmError::new(ErrorKind::Evaluation, detail, origin.clone()))
                })
            }
            Expr::Tagged { tag, inner, origin } => {
                let v = expect_int(inner.eval(cx)?, origin)?;
                Ok(Value::Spec(*tag, v))
            }
        }
    }
}

impl Label {
    fn eval(&self, cx: &EvalCx) -> Result<Value, AsmError> {
        guarded(&self.busy, &self.name, &self.origin, || {
            if let Some(v) = self.value.get() {
                return Ok(Value::Int(v));
            }

            self.address(cx)
                .map(|addr| {
                    self.value.set(Some(addr));
                    Value::Int(addr)
                })
                .map_err(|err| {
                    AsmError::new(
                        ErrorKind::Label,
                        format!(
                            "The label {} did not have a concrete address when it was referenced",
                            self.name
                        ),
                        self.origin.clone(),
                    )
                    .with_cause(err)
                })
        })
    }

    /// The sum of the sizes of every directive before this label in its
    /// section. Size computation may resolve further labels recursively.
    fn address(&self, cx: &EvalCx) -> Result<i128, AsmError> {
        let mut addr: i128 = 0;
        for directive in &cx.sections.get(self.section)[..self.index] {
            addr += directive.size(cx)? as i128;
        }
        Ok(addr)
    }
}

/// Evaluate `body` with a re-entry flag held; re-entering while the flag
/// is set is a dependency cycle. The flag is released on every exit path.
fn guarded(
    busy: &Cell<bool>,
    name: &str,
    origin: &Origin,
    body: impl FnOnce() -> Result<Value, AsmError>,
) -> Result<Value, AsmError> {
    if busy.get() {
        busy.set(false);
        return Err(AsmError::new(
            ErrorKind::CyclicDependency,
            format!("The expression {name} is cyclical and cannot be resolved"),
            origin.clone(),
        ));
    }

    busy.set(true);
    let result = body();
    busy.set(false);
    result
}

fn expect_int(value: Value, origin: &Origin) -> Result<i128, AsmError> {
    value.as_int().ok_or_else(|| {
        AsmError::new(
            ErrorKind::Evaluation,
            "expected a numeric operand",
            origin.clone(),
        )
    })
}
