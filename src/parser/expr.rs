//! Expression parsing: a flat token read followed by shunting-yard
//!
//! Unary operators are disambiguated by whether the previous token
//! produced a value. Consecutive unary operators stack without popping
//! each other, so `~-+-~+5` parses inside-out.

use crate::errors::{AsmError, ErrorKind, Origin};
use crate::expressions::{Expr, ExprOp, SpecTag};

use super::scanner::{EXPR_OPS, IDENT, Scanner, ascii, read_num_literal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawOp {
    LParen,
    RParen,
    Add,
    Sub,
    Inv,
    Mul,
    Div,
    And,
    Or,
    Xor,
    Shl,
    Shr,
}

impl RawOp {
    fn from_bytes(op: &[u8]) -> RawOp {
        match op {
            b"(" => RawOp::LParen,
            b")" => RawOp::RParen,
            b"+" => RawOp::Add,
            b"-" => RawOp::Sub,
            b"~" => RawOp::Inv,
            b"*" => RawOp::Mul,
            b"/" => RawOp::Div,
            b"&" => RawOp::And,
            b"|" => RawOp::Or,
            b"^" => RawOp::Xor,
            b"<<" => RawOp::Shl,
            b">>" => RawOp::Shr,
            other => unreachable!("operator pattern matched {other:?}"),
        }
    }
}

enum Tok {
    Op(RawOp),
    Val(Expr),
}

fn read_expression_tokens(scan: &mut Scanner) -> Result<Vec<(Tok, Origin)>, AsmError> {
    let mut tokens = Vec::new();
    while !scan.at_end() {
        scan.skip_ignore();
        let mut any = false;

        if let Some(op) = scan.read(&EXPR_OPS) {
            tokens.push((Tok::Op(RawOp::from_bytes(op)), scan.origin()));
            any = true;
        }

        let prefixed = scan.read_str(b"$");
        let ident = scan.read(&IDENT);
        if prefixed || ident.is_some() {
            let mut name = String::new();
            if prefixed {
                name.push('$');
            }
            if let Some(ident) = ident {
                name.push_str(&ascii(ident));
            }
            tokens.push((Tok::Val(Expr::variable(name, scan.origin())), scan.origin()));
            any = true;
        }

        if let Some(lit) = read_num_literal(scan, true)? {
            tokens.push((Tok::Val(lit), scan.origin()));
            any = true;
        }

        if !any {
            break;
        }
    }
    Ok(tokens)
}

// An operator stack entry; `None` marks an open parenthesis.
type OpEntry = (Option<ExprOp>, Origin);

fn push_op(rpn: &mut Vec<Expr>, entry: OpEntry) -> Result<(), AsmError> {
    let (op, origin) = entry;
    let Some(op) = op else {
        return Err(AsmError::unhelpful(origin));
    };

    let mut args = Vec::with_capacity(2);
    if !op.is_unary() {
        let right = rpn.pop().ok_or_else(|| AsmError::unhelpful(origin.clone()))?;
        args.push(right);
    }
    let arg = rpn.pop().ok_or_else(|| AsmError::unhelpful(origin.clone()))?;
    args.insert(0, arg);

    rpn.push(Expr::Operation { op, args, origin });
    Ok(())
}

fn shunt(tokens: Vec<(Tok, Origin)>) -> Result<Expr, AsmError> {
    let mut rpn: Vec<Expr> = Vec::new();
    let mut ops: Vec<OpEntry> = Vec::new();
    let mut expr_prev = false;
    let mut last_origin = None;

    for (tok, origin) in tokens {
        last_origin = Some(origin.clone());
        let raw = match tok {
            Tok::Val(expr) => {
                rpn.push(expr);
                expr_prev = true;
                continue;
            }
            Tok::Op(raw) => raw,
        };

        let op = if expr_prev {
            match raw {
                RawOp::Add => Some(ExprOp::Add),
                RawOp::Sub => Some(ExprOp::Sub),
                RawOp::Inv => return Err(AsmError::unhelpful(origin)),
                other => binary_meaning(other),
            }
        } else {
            match raw {
                RawOp::Add => Some(ExprOp::Pos),
                RawOp::Sub => Some(ExprOp::Neg),
                RawOp::Inv => Some(ExprOp::Inv),
                other => binary_meaning(other),
            }
        };

        match raw {
            RawOp::LParen => {
                ops.push((None, origin));
            }
            RawOp::RParen => {
                let mut matched = false;
                while let Some(top) = ops.pop() {
                    if top.0.is_none() {
                        matched = true;
                        break;
                    }
                    push_op(&mut rpn, top)?;
                }
                if !matched {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        "No matching opening parenthesis",
                        origin,
                    ));
                }
                expr_prev = true;
                continue;
            }
            _ => {
                let op = match op {
                    Some(op) => op,
                    None => return Err(AsmError::unhelpful(origin)),
                };
                while let Some((top, _)) = ops.last() {
                    let Some(top) = *top else {
                        break;
                    };
                    if top.precedence() < op.precedence() {
                        break;
                    }
                    if top.is_unary() && op.is_unary() {
                        break;
                    }
                    if let Some(entry) = ops.pop() {
                        push_op(&mut rpn, entry)?;
                    }
                }
                ops.push((Some(op), origin));
            }
        }
        expr_prev = false;
    }

    while let Some(entry) = ops.pop() {
        push_op(&mut rpn, entry)?;
    }

    let fallback_origin = || {
        last_origin.clone().unwrap_or(Origin {
            file: "<none>".into(),
            line: 0,
            column: 0,
        })
    };
    let result = rpn.pop().ok_or_else(|| AsmError::unhelpful(fallback_origin()))?;
    if !rpn.is_empty() {
        return Err(AsmError::unhelpful(fallback_origin()));
    }
    Ok(result)
}

// The LParen/RParen arms never consult this.
fn binary_meaning(raw: RawOp) -> Option<ExprOp> {
    match raw {
        RawOp::Mul => Some(ExprOp::Mul),
        RawOp::Div => Some(ExprOp::Div),
        RawOp::And => Some(ExprOp::And),
        RawOp::Or => Some(ExprOp::Or),
        RawOp::Xor => Some(ExprOp::Xor),
        RawOp::Shl => Some(ExprOp::Shl),
        RawOp::Shr => Some(ExprOp::Shr),
        _ => None,
    }
}

/// Parse an expression or fail; expressions are never optional in the
/// grammar positions that call this
pub fn expect_expression(scan: &mut Scanner) -> Result<Expr, AsmError> {
    let tokens = read_expression_tokens(scan)?;
    if tokens.is_empty() {
        return Err(AsmError::new(
            ErrorKind::Syntax,
            "Expected expression",
            scan.origin(),
        ));
    }
    shunt(tokens)
}

/// Comma-separated expressions for data directives like `.word 1,2,3`;
/// a trailing comma at end of line is allowed
pub fn read_multi_expr(scan: &mut Scanner) -> Result<Vec<Expr>, AsmError> {
    let mut exprs = Vec::new();
    while !scan.at_end() {
        exprs.push(expect_expression(scan)?);
        scan.skip_ignore();
        if !scan.read_str(b",") {
            break;
        }
    }
    Ok(exprs)
}

/// An instruction operand: `[e]` state reference, `{e}` const
/// reference, or a bare immediate expression
pub fn read_instr_var(scan: &mut Scanner) -> Result<Expr, AsmError> {
    scan.skip_ignore();
    if scan.read_str(b"[") {
        let inner = expect_expression(scan)?;
        scan.skip_ignore();
        if scan.read_str(b"]") {
            return Ok(tagged(SpecTag::Sv, inner, scan));
        }
    } else if scan.read_str(b"{") {
        let inner = expect_expression(scan)?;
        scan.skip_ignore();
        if scan.read_str(b"}") {
            return Ok(tagged(SpecTag::Cv, inner, scan));
        }
    } else {
        let inner = expect_expression(scan)?;
        return Ok(tagged(SpecTag::Im, inner, scan));
    }

    Err(AsmError::unhelpful(scan.origin()))
}

fn tagged(tag: SpecTag, inner: Expr, scan: &Scanner) -> Expr {
    Expr::Tagged {
        tag,
        inner: Box::new(inner),
        origin: scan.origin(),
    }
}
