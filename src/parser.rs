//! The assembler front end
//!
//! Source is read line by line into section-indexed directive sequences
//! sharing one symbol namespace; `get_program` then realizes every
//! directive to bytes or code-table entries, resolving labels lazily
//! along the way.

pub mod argv;
pub mod expr;
pub mod scanner;

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use colored::Colorize;

use crate::context::{ExecutionContext, OUTPUT_NAMES, OutputKind};
use crate::directives::{Directive, SectionId, Sections};
use crate::errors::{AsmError, ErrorKind};
use crate::expressions::{EvalCx, Expr, Namespace};
use crate::memory::{MAX_WORD_SIZE, MemoryFormat};
use crate::program::{CodeTable, Program};

use self::argv::{BoundArgs, process_argv};
use self::expr::{expect_expression, read_instr_var, read_multi_expr};
use self::scanner::{
    DIREC, IDENT, Meta, Scanner, WHITESPACE, ascii, expect_space, read_meta, read_num_literal,
    read_string_literal,
};

/// One piece of an operand template: what the argument list must
/// contain next
#[derive(Debug, Clone, Copy)]
enum Piece {
    /// Significant whitespace
    Space,
    /// A literal punctuation byte
    Lit(u8),
    /// A plain expression
    Expr,
    /// A bare identifier
    Ident,
    /// An instruction operand: immediate, `[state]` or `{const}`
    InstArg,
    /// One or more comma-separated expressions
    MultiExpr,
    /// A string literal
    Str,
}

impl fmt::Display for Piece {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Piece::Space => write!(f, "space"),
            Piece::Lit(c) => write!(f, "{}", *c as char),
            Piece::Expr => write!(f, ":expr:"),
            Piece::Ident => write!(f, ":ident:"),
            Piece::InstArg => write!(f, ":inst_arg:"),
            Piece::MultiExpr => write!(f, ":multi_expr:"),
            Piece::Str => write!(f, ":string:"),
        }
    }
}

/// Every mnemonic with its operand template
const INSTRUCTION_TABLE: &[(&[&str], &[Piece])] = &[
    (&["halt"], &[]),
    (&["j", "yield", "sleep"], &[Piece::Space, Piece::InstArg]),
    (
        &["heq", "hne", "hlt", "hltu", "hgt", "hgtu", "hle", "hleu", "hge", "hgeu", "sws", "sbs"],
        &[Piece::Space, Piece::InstArg, Piece::Lit(b','), Piece::InstArg],
    ),
    (
        &["mov", "lws", "lwc", "lbs", "lbc"],
        &[
            Piece::Space,
            Piece::Lit(b'['),
            Piece::Expr,
            Piece::Lit(b']'),
            Piece::Lit(b','),
            Piece::InstArg,
        ],
    ),
    (
        &[
            "add", "sub", "mul", "div", "mod", "and", "or", "xor", "asl", "asr", "lwso", "lwco",
            "lbso", "lbco",
        ],
        &[
            Piece::Space,
            Piece::Lit(b'['),
            Piece::Expr,
            Piece::Lit(b']'),
            Piece::Lit(b','),
            Piece::InstArg,
            Piece::Lit(b','),
            Piece::InstArg,
        ],
    ),
    (
        &["swso", "sbso"],
        &[
            Piece::Space,
            Piece::InstArg,
            Piece::Lit(b','),
            Piece::InstArg,
            Piece::Lit(b','),
            Piece::InstArg,
        ],
    ),
    (&["flag"], &[Piece::Space, Piece::Ident]),
];

/// Walk an operand template against the argument list
fn read_args(scan: &mut Scanner, template: &[Piece]) -> Result<Vec<Expr>, AsmError> {
    let mut args = Vec::new();

    for piece in template {
        if let Piece::Space = piece {
            expect_space(scan)?;
            continue;
        }

        if scan.is_end() {
            let message = match piece {
                Piece::Lit(b',') => {
                    "Expected additional arguments, but found end of argument list".to_string()
                }
                piece => format!("Expected {piece}, but found end of argument list"),
            };
            return Err(AsmError::new(ErrorKind::Syntax, message, scan.origin()));
        }

        match piece {
            Piece::Expr => args.push(expect_expression(scan)?),
            Piece::Ident => {
                let Some(ident) = scan.read(&IDENT) else {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        "Expected identifier",
                        scan.origin(),
                    ));
                };
                args.push(Expr::Str(ascii(ident)));
            }
            Piece::InstArg => args.push(read_instr_var(scan)?),
            Piece::MultiExpr => args.extend(read_multi_expr(scan)?),
            Piece::Str => {
                let Some(literal) = read_string_literal(scan)? else {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        "Expected string literal",
                        scan.origin(),
                    ));
                };
                args.push(Expr::Bytes(literal));
            }
            Piece::Lit(c) => {
                if !scan.read_str(&[*c]) {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        format!("Invalid argument syntax, expected {}", *c as char),
                        scan.origin(),
                    ));
                }
            }
            Piece::Space => {}
        }
    }

    if !scan.is_end() {
        if scan.read_str(b",") {
            return Err(AsmError::new(
                ErrorKind::Syntax,
                "Too many arguments",
                scan.origin(),
            ));
        }
        return Err(AsmError::unhelpful(scan.origin()));
    }

    Ok(args)
}

fn read_instruction(scan: &mut Scanner) -> Result<Directive, AsmError> {
    let Some(name) = scan.read(&DIREC) else {
        return Err(AsmError::unhelpful(scan.origin()));
    };
    let name = ascii(name);

    for (mnemonics, template) in INSTRUCTION_TABLE {
        if mnemonics.contains(&name.as_str()) {
            let args = read_args(scan, template)?;
            return Ok(Directive::Instruction { name, args });
        }
    }

    Err(AsmError::new(
        ErrorKind::Syntax,
        format!("{name} is not an instruction"),
        scan.origin(),
    ))
}

#[derive(Debug)]
pub struct Parser {
    sources: HashMap<Rc<str>, Vec<Vec<u8>>>,
    sections: Sections,
    namespace: Namespace,
    format_word: Option<usize>,
    format_output: Option<OutputKind>,
    args: Vec<String>,
    argv: BoundArgs,
}

impl Parser {
    pub fn new(args: Vec<String>) -> Parser {
        Parser {
            sources: HashMap::new(),
            sections: Sections::new(),
            namespace: Namespace::new(),
            format_word: None,
            format_output: None,
            args,
            argv: BoundArgs::new(),
        }
    }

    /// Split a whole source buffer into lines and parse them
    pub fn parse_source(&mut self, source: &[u8], file: &str) -> Result<(), AsmError> {
        let lines: Vec<Vec<u8>> = source.split(|&b| b == b'\n').map(<[u8]>::to_vec).collect();
        self.parse_lines(&lines, file)
    }

    pub fn parse_lines(&mut self, lines: &[Vec<u8>], file: &str) -> Result<(), AsmError> {
        let file: Rc<str> = Rc::from(file);
        self.sources.insert(Rc::clone(&file), lines.to_vec());

        let mut section = SectionId::Code;
        self.prepare_section(section);
        self.namespace
            .insert("$argc".to_string(), Expr::Int(self.args.len() as i128));

        for (index, line) in lines.iter().enumerate() {
            let mut scan = Scanner::new(line, Rc::clone(&file), index + 1);

            loop {
                if scan.at_end() {
                    break;
                }
                scan.skip_ignore();

                match read_meta(&mut scan) {
                    Some(Meta::Label(name)) => {
                        if self.namespace.contains_key(&name) {
                            return Err(AsmError::new(
                                ErrorKind::NameConflict,
                                format!("Label '{name}' cannot be redefined"),
                                scan.origin(),
                            ));
                        }
                        let at = self.sections.get(section).len();
                        self.namespace
                            .insert(name.clone(), Expr::label(name, section, at, scan.origin()));
                        continue;
                    }
                    Some(Meta::Preproc) => {
                        match scan.read(&IDENT).map(|name| ascii(name)).as_deref() {
                            Some("section") => {
                                expect_space(&mut scan)?;
                                section = read_section(&mut scan)?;
                                self.prepare_section(section);
                            }
                            Some("format") => {
                                expect_space(&mut scan)?;
                                self.read_format_spec(&mut scan)?;
                            }
                            Some("argv") => {
                                expect_space(&mut scan)?;
                                let (bound, usage) = process_argv(&mut scan, &self.args)?;
                                match bound {
                                    Some(bound) => self.argv = bound,
                                    None => {
                                        return Err(AsmError::new(
                                            ErrorKind::Usage,
                                            format!("Usage: {} {}", scan.file(), usage),
                                            scan.origin(),
                                        ));
                                    }
                                }
                            }
                            None => return Err(AsmError::unhelpful(scan.origin())),
                            Some(bad_command) => {
                                return Err(AsmError::new(
                                    ErrorKind::Syntax,
                                    format!("No such preprocessor command '{bad_command}'"),
                                    scan.origin(),
                                ));
                            }
                        }

                        if !scan.is_end() {
                            return Err(AsmError::unhelpful(scan.origin()));
                        }
                        break;
                    }
                    None => break,
                }
            }

            if scan.is_end() {
                continue;
            }

            if section == SectionId::Code {
                let instruction = read_instruction(&mut scan)?;
                self.sections.get_mut(section).push(instruction);
            } else {
                self.add_data_directive(&mut scan, section)?;
            }
        }

        Ok(())
    }

    // Re-entering code appends a halt terminator to the previous block
    fn prepare_section(&mut self, section: SectionId) {
        if section == SectionId::Code && !self.sections.code.is_empty() {
            self.sections.code.push(Directive::Instruction {
                name: "halt".to_string(),
                args: vec![],
            });
        }
    }

    fn read_format_spec(&mut self, scan: &mut Scanner) -> Result<(), AsmError> {
        match scan.read(&IDENT).map(|name| ascii(name)).as_deref() {
            Some("word") => {
                expect_space(scan)?;
                if scan.read_str(b"inf") {
                    return Err(AsmError::new(
                        ErrorKind::UnsupportedWordSize,
                        "The inf word size is not supported by this emulator",
                        scan.origin(),
                    ));
                }

                let size = match read_num_literal(scan, false)? {
                    Some(Expr::Int(size)) if size > 0 => size,
                    _ => {
                        return Err(AsmError::new(
                            ErrorKind::Syntax,
                            "Invalid word size: must be positive integer or inf",
                            scan.origin(),
                        ));
                    }
                };
                if size > MAX_WORD_SIZE as i128 {
                    return Err(AsmError::new(
                        ErrorKind::UnsupportedWordSize,
                        format!("Word size too large: at most {MAX_WORD_SIZE} byte words are supported"),
                        scan.origin(),
                    ));
                }

                set_format(&mut self.format_word, "word", size as usize, scan)
            }
            Some("output") => {
                expect_space(scan)?;
                let Some(name) = scan.read(&IDENT) else {
                    return Err(AsmError::unhelpful(scan.origin()));
                };
                let name = ascii(name);

                let Some(output) = OutputKind::from_name(&name) else {
                    return Err(AsmError::new(
                        ErrorKind::Syntax,
                        format!("Invalid output format: {name}, must be in {OUTPUT_NAMES:?}"),
                        scan.origin(),
                    ));
                };

                set_format(&mut self.format_output, "output", output, scan)
            }
            None => Err(AsmError::unhelpful(scan.origin())),
            Some(bad_spec) => Err(AsmError::new(
                ErrorKind::Syntax,
                format!("Invalid format specifier {bad_spec}"),
                scan.origin(),
            )),
        }
    }

    fn add_data_directive(&mut self, scan: &mut Scanner, section: SectionId) -> Result<(), AsmError> {
        let Some(name) = scan.read(&DIREC) else {
            return Err(AsmError::unhelpful(scan.origin()));
        };
        let name = ascii(name);
        let target = match name.as_str() {
            ".ascii" => {
                let bytes = one_string(read_args(scan, &[Piece::Space, Piece::Str])?);
                vec![Directive::Ascii { bytes }]
            }
            ".asciiz" => {
                let mut bytes = one_string(read_args(scan, &[Piece::Space, Piece::Str])?);
                bytes.push(0);
                vec![Directive::Ascii { bytes }]
            }
            // A word holding the length in bytes, then the bytes
            ".asciip" => {
                let bytes = one_string(read_args(scan, &[Piece::Space, Piece::Str])?);
                vec![
                    Directive::Word {
                        exprs: vec![Expr::Int(bytes.len() as i128)],
                    },
                    Directive::Ascii { bytes },
                ]
            }
            ".word" => {
                let exprs = read_args(scan, &[Piece::Space, Piece::MultiExpr])?;
                vec![Directive::Word { exprs }]
            }
            ".byte" => {
                let exprs = read_args(scan, &[Piece::Space, Piece::MultiExpr])?;
                vec![Directive::Byte {
                    exprs,
                    origin: scan.origin(),
                }]
            }
            ".fill" => {
                let args = read_args(
                    scan,
                    &[Piece::Space, Piece::Expr, Piece::Lit(b','), Piece::Expr],
                )?;
                let Ok([fill, length]) = <[Expr; 2]>::try_from(args) else {
                    unreachable!(".fill template yields two expressions");
                };
                vec![Directive::Fill {
                    fill,
                    length,
                    origin: scan.origin(),
                }]
            }
            ".zero" => {
                let args = read_args(scan, &[Piece::Space, Piece::Expr])?;
                let Ok([length]) = <[Expr; 1]>::try_from(args) else {
                    unreachable!(".zero template yields one expression");
                };
                vec![Directive::Fill {
                    fill: Expr::Int(0),
                    length,
                    origin: scan.origin(),
                }]
            }
            ".arg" => {
                self.add_arg_directive(scan, section)?;
                vec![]
            }
            _ => {
                return Err(AsmError::new(
                    ErrorKind::Syntax,
                    format!("{name} is not a data directive"),
                    scan.origin(),
                ));
            }
        };

        self.sections.get_mut(section).extend(target);
        Ok(())
    }

    /// `.arg <name> <fmt> [array]`: consume a named argv slot and emit
    /// the directives encoding it
    fn add_arg_directive(&mut self, scan: &mut Scanner, section: SectionId) -> Result<(), AsmError> {
        expect_space(scan)?;
        let Some(var_name) = scan.read(&IDENT) else {
            return Err(AsmError::new(
                ErrorKind::Syntax,
                "Expected argument variable name",
                scan.origin(),
            ));
        };
        let var_name = ascii(var_name);
        let Some(args) = self.argv.get(&var_name).cloned() else {
            return Err(AsmError::new(
                ErrorKind::General,
                format!("No argument variable {var_name}"),
                scan.origin(),
            ));
        };

        expect_space(scan)?;
        let Some(arg_format) = scan.read(&IDENT) else {
            return Err(AsmError::new(
                ErrorKind::Syntax,
                "Expected argument format",
                scan.origin(),
            ));
        };
        let arg_format = ascii(arg_format);

        match arg_format.as_str() {
            "word" | "byte" => {
                let mut values = Vec::with_capacity(args.len());
                for arg in &args {
                    let Ok(value) = arg.trim().parse::<i128>() else {
                        return Err(AsmError::new(
                            ErrorKind::Usage,
                            format!("Argument <{var_name}> got invalid int value: {arg}"),
                            scan.origin(),
                        ));
                    };
                    values.push(Expr::Int(value));
                }
                let directive = if arg_format == "word" {
                    Directive::Word { exprs: values }
                } else {
                    Directive::Byte {
                        exprs: values,
                        origin: scan.origin(),
                    }
                };
                self.sections.get_mut(section).push(directive);
            }
            "ascii" | "asciiz" | "asciip" => {
                let add_array = scan.read(&WHITESPACE).is_some() && scan.read_str(b"array");

                // Always have at least one dummy entry for array
                let mut entries: Vec<Vec<Directive>> =
                    if args.is_empty() { vec![vec![]] } else { vec![] };
                match arg_format.as_str() {
                    "ascii" => {
                        // Without an array there is no way to tell
                        // multiple ascii values apart, so they become a
                        // single space-joined value
                        let args = if !args.is_empty() && !add_array {
                            vec![args.join(" ")]
                        } else {
                            args
                        };
                        for arg in args {
                            entries.push(vec![Directive::Ascii {
                                bytes: arg.into_bytes(),
                            }]);
                        }
                        entries.push(vec![]);
                    }
                    "asciiz" => {
                        for arg in args {
                            let mut bytes = arg.into_bytes();
                            bytes.push(0);
                            entries.push(vec![Directive::Ascii { bytes }]);
                        }
                    }
                    _ => {
                        for arg in args {
                            let bytes = arg.into_bytes();
                            entries.push(vec![
                                Directive::Word {
                                    exprs: vec![Expr::Int(bytes.len() as i128)],
                                },
                                Directive::Ascii { bytes },
                            ]);
                        }
                    }
                }

                if add_array {
                    // One pointer word per entry; the entries start
                    // right after the table
                    let mut at = self.sections.get(section).len() + entries.len();
                    for entry in &entries {
                        let pointer = Expr::label("$arg", section, at, scan.origin());
                        self.sections
                            .get_mut(section)
                            .push(Directive::Word { exprs: vec![pointer] });
                        at += entry.len();
                    }
                }
                for entry in entries {
                    self.sections.get_mut(section).extend(entry);
                }
            }
            bad_format => {
                return Err(AsmError::new(
                    ErrorKind::Syntax,
                    format!("Invalid argument format {bad_format}"),
                    scan.origin(),
                ));
            }
        }

        if !scan.is_end() {
            return Err(AsmError::unhelpful(scan.origin()));
        }
        Ok(())
    }

    /// Realize every directive and build the program
    pub fn get_program(&self, warn: bool) -> Result<Program, AsmError> {
        let mf = MemoryFormat::new(self.format_word.unwrap_or(2));
        let cx = EvalCx {
            sections: &self.sections,
            namespace: &self.namespace,
            mf: &mf,
        };

        let mut instrs = Vec::with_capacity(self.sections.code.len());
        for directive in &self.sections.code {
            instrs.push(directive.instr(&cx)?);
        }
        let mut constant = Vec::new();
        for directive in &self.sections.constant {
            constant.extend(directive.data(&cx)?);
        }
        let mut state = Vec::new();
        for directive in &self.sections.state {
            state.extend(directive.data(&cx)?);
        }

        if warn {
            if !mf.is_safe_unsigned(state.len() as i128) {
                warn_oversized(SectionId::State, state.len(), "bytes");
            }
            if !mf.is_safe_unsigned(constant.len() as i128) {
                warn_oversized(SectionId::Const, constant.len(), "bytes");
            }
            if !mf.is_safe_signed(instrs.len() as i128) {
                warn_oversized(SectionId::Code, instrs.len(), "instructions");
            }
        }

        Ok(Program::new(mf, CodeTable::new(instrs), constant, state))
    }

    pub fn output_kind(&self) -> OutputKind {
        self.format_output.unwrap_or(OutputKind::Signed)
    }

    pub fn get_output_context(&self) -> Box<dyn ExecutionContext> {
        self.output_kind().context()
    }

    /// Print the whole error chain, echoing the offending source lines
    pub fn report_error(&self, err: &AsmError) {
        if err.kind() != ErrorKind::Usage {
            eprintln!("{}", "Assembler error:".red().bold());
        }

        let mut current = Some(err);
        while let Some(err) = current {
            eprintln!("{err}");
            if err.kind() != ErrorKind::Usage {
                let origin = err.origin();
                eprintln!("    {origin}");
                if let Some(line) = self
                    .sources
                    .get(origin.file.as_ref())
                    .and_then(|lines| lines.get(origin.line.saturating_sub(1)))
                {
                    eprintln!("    > {}", ascii(line).trim());
                }
            }
            current = err.cause();
        }
    }
}

impl Default for Parser {
    fn default() -> Parser {
        Parser::new(Vec::new())
    }
}

// Programs this large still assemble; addresses past the mask just
// cannot be named in one word.
fn warn_oversized(section: SectionId, size: usize, unit: &str) {
    let warning_title = "warning:".yellow().bold();
    eprintln!(
        "{} {} section too large ({} {}) to be word-addressable",
        warning_title,
        section.name(),
        size,
        unit
    );
}

fn read_section(scan: &mut Scanner) -> Result<SectionId, AsmError> {
    let name = scan.read(&IDENT).map(|name| ascii(name));
    if name.is_none() || !scan.is_end() {
        return Err(AsmError::unhelpful(scan.origin()));
    }

    match name.as_deref() {
        Some("code") => Ok(SectionId::Code),
        Some("const") => Ok(SectionId::Const),
        Some("state") => Ok(SectionId::State),
        Some(bad_section) => Err(AsmError::new(
            ErrorKind::Syntax,
            format!("Section must be one of ['code', 'const', 'state'], not {bad_section}"),
            scan.origin(),
        )),
        None => Err(AsmError::unhelpful(scan.origin())),
    }
}

fn set_format<T: PartialEq + fmt::Display>(
    slot: &mut Option<T>,
    item: &str,
    value: T,
    scan: &Scanner,
) -> Result<(), AsmError> {
    match slot {
        Some(previous) if *previous != value => Err(AsmError::new(
            ErrorKind::General,
            format!(
                "The {item} format was previously set to {previous}, which conflicts with the value {value}"
            ),
            scan.origin(),
        )),
        Some(_) => Ok(()),
        None => {
            *slot = Some(value);
            Ok(())
        }
    }
}

fn one_string(args: Vec<Expr>) -> Vec<u8> {
    match args.into_iter().next() {
        Some(Expr::Bytes(bytes)) => bytes,
        other => unreachable!("string template yields bytes, got {other:?}"),
    }
}
