//! Byte-oriented scanning of one source line
//!
//! Every line is wrapped in a `Scanner` that tracks its file, line
//! number and byte position; token patterns are anchored regexes
//! compiled once. Patterns run with `(?-u)` so classes match single
//! bytes while UTF-8 in string literals passes through untouched.

use std::rc::Rc;
use std::sync::LazyLock;

use regex::bytes::Regex;

use crate::errors::{AsmError, ErrorKind, Origin};
use crate::expressions::Expr;

pub(crate) static IGNORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)^\s*(?:;.*)?").unwrap());
pub(crate) static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?-u)^\s+").unwrap());
pub(crate) static IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)^[a-zA-Z_]\w*").unwrap());
pub(crate) static DIREC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)^[a-zA-Z_.]\w*").unwrap());
pub(crate) static EXPR_OPS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)^(?:>>|<<|[()+\-*/&|^~])").unwrap());

static META: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)^(?:(?P<label>[a-zA-Z_]\w*:)|(?P<preproc>%))").unwrap());

static NUM_LITERAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?-u)^(?:",
        r"(?P<hex>0x[0-9a-fA-F][0-9a-fA-F_]*)",
        r"|(?P<oct>0o[0-7][0-7_]*)",
        r"|(?P<bin>0b[01][01_]*)",
        r"|(?P<dec>[0-9][0-9_]*)",
        r"|(?P<char>'[^'\\]')",
        r"|(?P<esc>'\\)",
        r")",
    ))
    .unwrap()
});

static ESC_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?-u)^(?:(?P<hex>x[0-9a-fA-F]{2})|(?P<code>[abfnrt0'"\\]))"#).unwrap()
});

static STRING_TOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?-u)^(?:(?P<bytes>[^\\"]+)|(?P<escape>\\)|(?P<end>"))"#).unwrap()
});

pub(crate) fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

pub struct Scanner<'a> {
    line: &'a [u8],
    file: Rc<str>,
    line_number: usize,
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(line: &'a [u8], file: Rc<str>, line_number: usize) -> Scanner<'a> {
        Scanner {
            line,
            file,
            line_number,
            pos: 0,
        }
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.line[self.pos..]
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn slice(&self, start: usize, end: usize) -> &'a [u8] {
        &self.line[start..end]
    }

    pub fn advance(&mut self, count: usize) {
        self.pos += count;
    }

    /// Match an anchored pattern at the current position
    pub fn read(&mut self, pat: &Regex) -> Option<&'a [u8]> {
        let found = pat.find(self.rest())?;
        let matched = &self.rest()[..found.end()];
        self.pos += found.end();
        Some(matched)
    }

    /// Consume `literal` if it is next
    pub fn read_str(&mut self, literal: &[u8]) -> bool {
        if self.rest().starts_with(literal) {
            self.pos += literal.len();
            return true;
        }
        false
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.line.len()
    }

    pub fn skip_ignore(&mut self) {
        self.read(&IGNORE);
    }

    /// Skip whitespace and comments; is there any more to read?
    pub fn is_end(&mut self) -> bool {
        self.skip_ignore();
        self.at_end()
    }

    pub fn origin(&self) -> Origin {
        Origin {
            file: Rc::clone(&self.file),
            line: self.line_number,
            column: self.pos,
        }
    }

    pub fn file(&self) -> &Rc<str> {
        &self.file
    }
}

/// Line-leading token: a label declaration or a `%` preprocessor command
pub enum Meta {
    Label(String),
    Preproc,
}

pub fn read_meta(scan: &mut Scanner) -> Option<Meta> {
    let caps = META.captures(scan.rest())?;
    if let Some(m) = caps.name("label") {
        let text = m.as_bytes();
        scan.advance(m.end());
        return Some(Meta::Label(ascii(&text[..text.len() - 1])));
    }
    scan.advance(1);
    Some(Meta::Preproc)
}

/// Require a run of whitespace before the next token
pub fn expect_space(scan: &mut Scanner) -> Result<(), AsmError> {
    if scan.read(&WHITESPACE).is_none() {
        if scan.is_end() {
            return Err(AsmError::new(
                ErrorKind::Syntax,
                "Expected argument",
                scan.origin(),
            ));
        }
        return Err(AsmError::new(
            ErrorKind::Syntax,
            "Expected space",
            scan.origin(),
        ));
    }
    Ok(())
}

/// The escape body after a backslash, shared by character and string
/// literals
pub fn read_escape_code(scan: &mut Scanner) -> Result<u8, AsmError> {
    if let Some(caps) = ESC_CODE.captures(scan.rest()) {
        if let Some(m) = caps.name("hex") {
            let digits = ascii(&m.as_bytes()[1..]);
            scan.advance(m.end());
            return Ok(u8::from_str_radix(&digits, 16).unwrap_or(0));
        }
        if let Some(m) = caps.name("code") {
            let code = m.as_bytes()[0];
            scan.advance(m.end());
            return Ok(match code {
                b'a' => 0x07,
                b'b' => 0x08,
                b'f' => 0x0C,
                b'n' => b'\n',
                b'r' => b'\r',
                b't' => b'\t',
                b'0' => 0,
                code => code,
            });
        }
    }
    Err(AsmError::new(
        ErrorKind::Syntax,
        "Invalid escape sequence",
        scan.origin(),
    ))
}

/// A `"..."` literal, or `None` if the next token is not a string.
/// UTF-8 passes through as raw bytes.
pub fn read_string_literal(scan: &mut Scanner) -> Result<Option<Vec<u8>>, AsmError> {
    if !scan.read_str(b"\"") {
        return Ok(None);
    }

    let mut result = Vec::new();
    while !scan.at_end() {
        let Some(caps) = STRING_TOK.captures(scan.rest()) else {
            break;
        };
        if let Some(m) = caps.name("bytes") {
            result.extend_from_slice(m.as_bytes());
            scan.advance(m.end());
        } else if caps.name("escape").is_some() {
            scan.advance(1);
            result.push(read_escape_code(scan)?);
        } else {
            scan.advance(1);
            return Ok(Some(result));
        }
    }

    Err(AsmError::new(
        ErrorKind::Syntax,
        "Unterminated string literal",
        scan.origin(),
    ))
}

/// A numeric or character literal, or `None` if the next token is not
/// one. With `word_suffix`, a trailing `w` marks word scaling.
pub fn read_num_literal(scan: &mut Scanner, word_suffix: bool) -> Result<Option<Expr>, AsmError> {
    let Some(caps) = NUM_LITERAL.captures(scan.rest()) else {
        return Ok(None);
    };

    for (group, radix) in [("hex", 16), ("oct", 8), ("bin", 2)] {
        if let Some(m) = caps.name(group) {
            let digits = m.as_bytes()[2..].to_vec();
            scan.advance(m.end());
            let value = parse_digits(&digits, radix, scan)?;
            return Ok(Some(with_word_suffix(scan, Expr::Int(value), word_suffix)));
        }
    }
    if let Some(m) = caps.name("dec") {
        let digits = m.as_bytes().to_vec();
        scan.advance(m.end());
        let value = parse_digits(&digits, 10, scan)?;
        return Ok(Some(with_word_suffix(scan, Expr::Int(value), word_suffix)));
    }
    if let Some(m) = caps.name("char") {
        let byte = m.as_bytes()[1];
        scan.advance(m.end());
        return Ok(Some(Expr::Int(byte as i128)));
    }
    if let Some(m) = caps.name("esc") {
        scan.advance(m.end());
        let code = read_escape_code(scan)?;
        scan.read_str(b"'");
        return Ok(Some(Expr::Int(code as i128)));
    }

    Ok(None)
}

// Underscores may only separate digit groups: no doubling, no trailing.
fn parse_digits(digits: &[u8], radix: u32, scan: &Scanner) -> Result<i128, AsmError> {
    let invalid = || {
        AsmError::new(
            ErrorKind::Syntax,
            "Invalid numeric literal",
            scan.origin(),
        )
    };

    if digits.ends_with(b"_") || digits.windows(2).any(|pair| pair == b"__") {
        return Err(invalid());
    }
    let stripped: String = ascii(digits).chars().filter(|c| *c != '_').collect();
    i128::from_str_radix(&stripped, radix).map_err(|_| invalid())
}

fn with_word_suffix(scan: &mut Scanner, expr: Expr, enabled: bool) -> Expr {
    if enabled && scan.read_str(b"w") {
        return Expr::WordScaled {
            inner: Box::new(expr),
            origin: scan.origin(),
        };
    }
    expr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner(line: &[u8]) -> Scanner<'_> {
        Scanner::new(line, "<test>".into(), 1)
    }

    fn literal_value(src: &[u8]) -> i128 {
        let mut scan = scanner(src);
        match read_num_literal(&mut scan, false).unwrap() {
            Some(Expr::Int(v)) => v,
            other => panic!("unexpected literal {other:?}"),
        }
    }

    #[test]
    fn test_read_and_positions() {
        let mut scan = scanner(b"  foo ; bar");
        scan.skip_ignore();
        assert_eq!(scan.pos(), 2);
        assert_eq!(scan.read(&IDENT).unwrap(), b"foo");
        assert!(scan.is_end());
        assert_eq!(scan.origin().line, 1);
    }

    #[test]
    fn test_numeric_literals() {
        assert_eq!(literal_value(b"10"), 10);
        assert_eq!(literal_value(b"010"), 10);
        assert_eq!(literal_value(b"1_234"), 1234);
        assert_eq!(literal_value(b"0x12_ab_CD_ef"), 0x12ab_cdef);
        assert_eq!(literal_value(b"0o1_234_567"), 0o1_234_567);
        assert_eq!(literal_value(b"0b1010_1111"), 0b1010_1111);
        assert_eq!(literal_value(b"'A'"), 'A' as i128);
        assert_eq!(literal_value(b"'\\n'"), b'\n' as i128);
        assert_eq!(literal_value(b"'\\xFF'"), 0xFF);
        assert_eq!(literal_value(b"'\\''"), b'\'' as i128);
    }

    #[test]
    fn test_bad_underscore_grouping() {
        for src in [&b"1__1"[..], b"1_", b"0x1_", b"0b1__1", b"0o1_"] {
            let mut scan = scanner(src);
            assert!(read_num_literal(&mut scan, false).is_err(), "{src:?}");
        }
    }

    #[test]
    fn test_word_suffix_only_when_enabled() {
        let mut scan = scanner(b"10w");
        let expr = read_num_literal(&mut scan, true).unwrap().unwrap();
        assert!(matches!(expr, Expr::WordScaled { .. }));

        let mut scan = scanner(b"10w");
        let expr = read_num_literal(&mut scan, false).unwrap().unwrap();
        assert!(matches!(expr, Expr::Int(10)));
        assert!(!scan.at_end());
    }

    #[test]
    fn test_string_literals() {
        let mut scan = scanner(br#""Hello, world!" tail"#);
        assert_eq!(
            read_string_literal(&mut scan).unwrap().unwrap(),
            b"Hello, world!"
        );
        assert_eq!(scan.rest(), b" tail");

        let mut scan = scanner(b"\"\xF0\x9F\x92\xA9\"");
        assert_eq!(
            read_string_literal(&mut scan).unwrap().unwrap(),
            "\u{1F4A9}".as_bytes()
        );

        let mut scan = scanner(br#""a\tb\x41\\\"""#);
        assert_eq!(
            read_string_literal(&mut scan).unwrap().unwrap(),
            b"a\tb\x41\\\""
        );
    }

    #[test]
    fn test_bad_string_literals() {
        let mut scan = scanner(br#""hello"#);
        let err = read_string_literal(&mut scan).unwrap_err();
        assert!(err.to_string().contains("Unterminated"));

        let mut scan = scanner(br#""\?""#);
        let err = read_string_literal(&mut scan).unwrap_err();
        assert!(err.to_string().contains("Invalid escape sequence"));

        let mut scan = scanner(b"'B'");
        assert!(read_string_literal(&mut scan).unwrap().is_none());
    }

    #[test]
    fn test_meta_tokens() {
        let mut scan = scanner(b"label: j label");
        assert!(matches!(read_meta(&mut scan), Some(Meta::Label(name)) if name == "label"));

        let mut scan = scanner(b"%section code");
        assert!(matches!(read_meta(&mut scan), Some(Meta::Preproc)));

        let mut scan = scanner(b"j label");
        assert!(read_meta(&mut scan).is_none());
    }
}
