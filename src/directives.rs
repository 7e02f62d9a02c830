//! Assembled-size-aware building blocks that sections are made of
//!
//! Every directive can report its size without being fully realized,
//! which is what makes label addresses computable before all expressions
//! have concrete values. Realization happens once at program
//! construction: data directives produce bytes, instruction directives
//! produce one code-table entry each.

use crate::errors::{AsmError, ErrorKind, Origin};
use crate::expressions::{EvalCx, Expr, SpecTag, Value};
use crate::program::{BinOp, CmpOp, Instr, Operand, Space, Width};

/// The three independently addressed output regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionId {
    Code,
    Const,
    State,
}

impl SectionId {
    pub fn name(self) -> &'static str {
        match self {
            SectionId::Code => "code",
            SectionId::Const => "const",
            SectionId::State => "state",
        }
    }
}

/// The parsed directive sequences, one per section
#[derive(Debug, Default)]
pub struct Sections {
    pub code: Vec<Directive>,
    pub constant: Vec<Directive>,
    pub state: Vec<Directive>,
}

impl Sections {
    pub fn new() -> Sections {
        Sections::default()
    }

    pub fn get(&self, id: SectionId) -> &[Directive] {
        match id {
            SectionId::Code => &self.code,
            SectionId::Const => &self.constant,
            SectionId::State => &self.state,
        }
    }

    pub fn get_mut(&mut self, id: SectionId) -> &mut Vec<Directive> {
        match id {
            SectionId::Code => &mut self.code,
            SectionId::Const => &mut self.constant,
            SectionId::State => &mut self.state,
        }
    }
}

/// A source-level statement that emits bytes or an instruction tuple
#[derive(Debug)]
pub enum Directive {
    /// `.fill value, count` and `.zero count`
    Fill {
        fill: Expr,
        length: Expr,
        origin: Origin,
    },
    /// String data; the bytes are fixed at parse time
    Ascii { bytes: Vec<u8> },
    /// `.word e, ...` — one word per expression
    Word { exprs: Vec<Expr> },
    /// `.byte e, ...` — one byte per expression
    Byte { exprs: Vec<Expr>, origin: Origin },
    /// One instruction; always occupies a single code-table slot
    Instruction { name: String, args: Vec<Expr> },
}

impl Directive {
    /// The declared size in bytes (code section: in instructions).
    /// Computing a `Fill` size may resolve labels recursively.
    pub fn size(&self, cx: &EvalCx) -> Result<usize, AsmError> {
        match self {
            Directive::Fill { length, origin, .. } => {
                let n = eval_int(length, cx, origin)?;
                if n < 0 {
                    return Err(AsmError::new(
                        ErrorKind::Expression,
                        "Fill length must not be negative",
                        origin.clone(),
                    ));
                }
                Ok(n as usize)
            }
            Directive::Ascii { bytes } => Ok(bytes.len()),
            Directive::Word { exprs } => Ok(cx.mf.word_size() * exprs.len()),
            Directive::Byte { exprs, .. } => Ok(exprs.len()),
            Directive::Instruction { .. } => Ok(1),
        }
    }

    /// Realize a data directive to bytes
    pub fn data(&self, cx: &EvalCx) -> Result<Vec<u8>, AsmError> {
        match self {
            Directive::Fill { fill, origin, .. } => {
                let value = eval_int(fill, cx, origin)?;
                if !(0..=0xFF).contains(&value) {
                    return Err(AsmError::new(
                        ErrorKind::Evaluation,
                        "Fill value must be in range(0, 256)",
                        origin.clone(),
                    ));
                }
                Ok(vec![value as u8; self.size(cx)?])
            }
            Directive::Ascii { bytes } => Ok(bytes.clone()),
            Directive::Word { exprs } => {
                let mut words = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    words.push(eval_word(expr, cx)?);
                }
                Ok(cx.mf.array_from_words(&words))
            }
            Directive::Byte { exprs, origin } => {
                let mut bytes = Vec::with_capacity(exprs.len());
                for expr in exprs {
                    let value = eval_int(expr, cx, origin)?;
                    if !(0..=0xFF).contains(&value) {
                        return Err(AsmError::new(
                            ErrorKind::Evaluation,
                            "Byte value must be in range(0, 256)",
                            origin.clone(),
                        ));
                    }
                    bytes.push(value as u8);
                }
                Ok(bytes)
            }
            // The parser only ever places instructions in the code
            // section, which is realized through `instr`.
            Directive::Instruction { .. } => unreachable!("instruction directive in a data section"),
        }
    }

    /// Realize an instruction directive to a code-table entry
    pub fn instr(&self, cx: &EvalCx) -> Result<Instr, AsmError> {
        let Directive::Instruction { name, args } = self else {
            unreachable!("data directive in the code section");
        };

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(arg.eval(cx)?);
        }
        Ok(realize_instruction(name, &values))
    }
}

fn eval_int(expr: &Expr, cx: &EvalCx, origin: &Origin) -> Result<i128, AsmError> {
    expr.eval(cx)?.as_int().ok_or_else(|| {
        AsmError::new(
            ErrorKind::Evaluation,
            "expected a numeric value",
            origin.clone(),
        )
    })
}

// Word expressions always come from the expression grammar, which only
// produces integers.
fn eval_word(expr: &Expr, cx: &EvalCx) -> Result<i128, AsmError> {
    match expr.eval(cx)? {
        Value::Int(v) => Ok(v),
        other => unreachable!("non-numeric word expression: {other:?}"),
    }
}

/// Map an already-parsed mnemonic and its evaluated arguments onto the
/// instruction set. The parser's operand templates guarantee the shapes,
/// so a mismatch here is a bug in the assembler itself.
fn realize_instruction(name: &str, values: &[Value]) -> Instr {
    let spec = |i: usize| -> Operand {
        match &values[i] {
            Value::Spec(SpecTag::Im, v) => Operand::Im(*v),
            Value::Spec(SpecTag::Sv, v) => Operand::State(*v),
            Value::Spec(SpecTag::Cv, v) => Operand::Const(*v),
            other => unreachable!("{name}: expected a value specifier, got {other:?}"),
        }
    };
    let addr = |i: usize| -> i128 {
        match &values[i] {
            Value::Int(v) => *v,
            other => unreachable!("{name}: expected an address, got {other:?}"),
        }
    };
    let load = |width: Width, space: Space, offset: bool| -> Instr {
        Instr::Load {
            width,
            space,
            dst: addr(0),
            addr: spec(1),
            offset: if offset { Some(spec(2)) } else { None },
        }
    };
    let store = |width: Width, offset: bool| -> Instr {
        if offset {
            Instr::Store {
                width,
                base: spec(0),
                offset: Some(spec(1)),
                src: spec(2),
            }
        } else {
            Instr::Store {
                width,
                base: spec(0),
                offset: None,
                src: spec(1),
            }
        }
    };
    let halt_if = |cmp: CmpOp| -> Instr {
        Instr::HaltIf {
            cmp,
            left: spec(0),
            right: spec(1),
        }
    };
    let binary = |op: BinOp| -> Instr {
        Instr::Binary {
            op,
            dst: addr(0),
            left: spec(1),
            right: spec(2),
        }
    };

    match name {
        "halt" => Instr::Halt,
        "j" => Instr::J(spec(0)),
        "yield" => Instr::Yield(spec(0)),
        "sleep" => Instr::Sleep(spec(0)),
        "heq" => halt_if(CmpOp::Eq),
        "hne" => halt_if(CmpOp::Ne),
        "hlt" => halt_if(CmpOp::Lt),
        "hltu" => halt_if(CmpOp::Ltu),
        "hgt" => halt_if(CmpOp::Gt),
        "hgtu" => halt_if(CmpOp::Gtu),
        "hle" => halt_if(CmpOp::Le),
        "hleu" => halt_if(CmpOp::Leu),
        "hge" => halt_if(CmpOp::Ge),
        "hgeu" => halt_if(CmpOp::Geu),
        "mov" => Instr::Mov {
            dst: addr(0),
            src: spec(1),
        },
        "lws" => load(Width::Word, Space::State, false),
        "lwc" => load(Width::Word, Space::Const, false),
        "lbs" => load(Width::Byte, Space::State, false),
        "lbc" => load(Width::Byte, Space::Const, false),
        "lwso" => load(Width::Word, Space::State, true),
        "lwco" => load(Width::Word, Space::Const, true),
        "lbso" => load(Width::Byte, Space::State, true),
        "lbco" => load(Width::Byte, Space::Const, true),
        "sws" => store(Width::Word, false),
        "sbs" => store(Width::Byte, false),
        "swso" => store(Width::Word, true),
        "sbso" => store(Width::Byte, true),
        "add" => binary(BinOp::Add),
        "sub" => binary(BinOp::Sub),
        "mul" => binary(BinOp::Mul),
        "div" => binary(BinOp::Div),
        "mod" => binary(BinOp::Mod),
        "and" => binary(BinOp::And),
        "or" => binary(BinOp::Or),
        "xor" => binary(BinOp::Xor),
        "asl" => binary(BinOp::Asl),
        "asr" => binary(BinOp::Asr),
        "flag" => match &values[0] {
            Value::Str(ident) => Instr::Flag(ident.clone()),
            other => unreachable!("flag: expected an identifier, got {other:?}"),
        },
        _ => unreachable!("unknown mnemonic {name} survived parsing"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expressions::Namespace;
    use crate::memory::MemoryFormat;

    fn origin() -> Origin {
        Origin {
            file: "<test>".into(),
            line: 1,
            column: 0,
        }
    }

    fn with_cx<R>(f: impl FnOnce(&EvalCx) -> R) -> R {
        let sections = Sections::new();
        let namespace = Namespace::new();
        let mf = MemoryFormat::default();
        f(&EvalCx {
            sections: &sections,
            namespace: &namespace,
            mf: &mf,
        })
    }

    #[test]
    fn test_declared_sizes() {
        with_cx(|cx| {
            let fill = Directive::Fill {
                fill: Expr::Int(0),
                length: Expr::Int(5),
                origin: origin(),
            };
            assert_eq!(fill.size(cx).unwrap(), 5);

            let word = Directive::Word {
                exprs: vec![Expr::Int(1), Expr::Int(2)],
            };
            assert_eq!(word.size(cx).unwrap(), 4);

            let instr = Directive::Instruction {
                name: "halt".to_string(),
                args: vec![],
            };
            assert_eq!(instr.size(cx).unwrap(), 1);
        });
    }

    #[test]
    fn test_negative_fill_length() {
        with_cx(|cx| {
            let fill = Directive::Fill {
                fill: Expr::Int(0),
                length: Expr::Int(-1),
                origin: origin(),
            };
            let err = fill.size(cx).unwrap_err();
            assert!(err.to_string().contains("must not be negative"));
        });
    }

    #[test]
    fn test_byte_range() {
        with_cx(|cx| {
            let byte = Directive::Byte {
                exprs: vec![Expr::Int(256)],
                origin: origin(),
            };
            let err = byte.data(cx).unwrap_err();
            assert!(err.to_string().contains("must be in range"));
        });
    }

    #[test]
    fn test_word_realization_masks() {
        with_cx(|cx| {
            let word = Directive::Word {
                exprs: vec![Expr::Int(-1), Expr::Int(0x12345)],
            };
            assert_eq!(word.data(cx).unwrap(), vec![0xFF, 0xFF, 0x45, 0x23]);
        });
    }

    #[test]
    fn test_instruction_realization() {
        with_cx(|cx| {
            let mov = Directive::Instruction {
                name: "mov".to_string(),
                args: vec![
                    Expr::Int(4),
                    Expr::Tagged {
                        tag: SpecTag::Im,
                        inner: Box::new(Expr::Int(7)),
                        origin: origin(),
                    },
                ],
            };
            assert_eq!(
                mov.instr(cx).unwrap(),
                Instr::Mov {
                    dst: 4,
                    src: Operand::Im(7)
                }
            );
        });
    }
}
