//! `%argv` declarations: a tiny docopt-like subset
//!
//! `<name>` binds exactly one argument, `<name>...` one or more,
//! `[<name>]` at most one, `[<name>...]` any number. Trailing mandatory
//! specs bind from the right; everything else binds greedily left to
//! right, and leftover arguments fail the match.

use std::collections::HashMap;

use crate::errors::AsmError;

use super::scanner::{IDENT, Scanner, WHITESPACE, ascii};

/// Arguments bound per spec name, in binding order
pub type BoundArgs = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ArgBinding {
    name: String,
    min: usize,
    /// `None` is unbounded
    max: Option<usize>,
}

fn read_argv_arg_spec(scan: &mut Scanner) -> Result<Option<ArgBinding>, AsmError> {
    let mut result = None;
    if scan.read_str(b"<") {
        let Some(name) = scan.read(&IDENT) else {
            return Err(AsmError::unhelpful(scan.origin()));
        };
        if !scan.read_str(b">") {
            return Err(AsmError::unhelpful(scan.origin()));
        }
        result = Some(ArgBinding {
            name: ascii(name),
            min: 1,
            max: Some(1),
        });
    } else if scan.read_str(b"[") {
        result = read_argv_arg_spec(scan)?;
        if !scan.read_str(b"]") {
            return Err(AsmError::unhelpful(scan.origin()));
        }
        if let Some(binding) = result.as_mut() {
            binding.min = 0;
        }
    }

    if result.is_some() && scan.read_str(b"...") {
        if let Some(binding) = result.as_mut() {
            binding.max = None;
        }
    }

    Ok(result)
}

/// Parse the spec after `%argv` and bind the program arguments against
/// it. A failed match returns `None` together with the literal spec
/// text for the usage message.
pub fn process_argv(
    scan: &mut Scanner,
    args: &[String],
) -> Result<(Option<BoundArgs>, String), AsmError> {
    let mut arg_specs = Vec::new();
    let start = scan.pos();
    let mut end = scan.pos();

    while !scan.at_end() {
        let spec = read_argv_arg_spec(scan)?;
        let mut continued = false;
        if let Some(spec) = spec {
            end = scan.pos();
            arg_specs.push(spec);
            if scan.read(&WHITESPACE).is_some() {
                scan.skip_ignore();
                continued = true;
            }
        }
        if continued {
            continue;
        }
        if !scan.is_end() {
            return Err(AsmError::unhelpful(scan.origin()));
        }
    }

    let usage = ascii(scan.slice(start, end));
    let mut args: Vec<String> = args.to_vec();

    // Trailing mandatory specs bind from the right
    let mut tail: HashMap<String, Vec<String>> = HashMap::new();
    while let Some(last) = arg_specs.last() {
        if !(last.min == 1 && last.max == Some(1)) {
            break;
        }
        let Some(arg) = args.pop() else {
            return Ok((None, usage));
        };
        if let Some(spec) = arg_specs.pop() {
            tail.entry(spec.name).or_default().push(arg);
        }
    }

    let mut result: BoundArgs = HashMap::new();
    for spec in &arg_specs {
        let take = spec.max.unwrap_or(args.len()).min(args.len());
        let matching: Vec<String> = args.drain(..take).collect();
        if matching.len() < spec.min {
            return Ok((None, usage));
        }
        result.entry(spec.name.clone()).or_default().extend(matching);
    }

    for (name, tail_args) in tail {
        result.entry(name).or_default().extend(tail_args);
    }

    if !args.is_empty() {
        return Ok((None, usage));
    }
    Ok((Some(result), usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind(spec: &[u8], args: &[&str]) -> (Option<BoundArgs>, String) {
        let mut scan = Scanner::new(spec, "<test>".into(), 1);
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        process_argv(&mut scan, &args).unwrap()
    }

    fn bound(spec: &[u8], args: &[&str]) -> BoundArgs {
        bind(spec, args).0.unwrap()
    }

    #[test]
    fn test_single_mandatory() {
        let args = bound(b"<count>", &["3"]);
        assert_eq!(args["count"], vec!["3"]);
        assert!(bind(b"<count>", &[]).0.is_none());
        assert!(bind(b"<count>", &["3", "4"]).0.is_none());
    }

    #[test]
    fn test_optional() {
        assert_eq!(bound(b"[<mode>]", &["fast"])["mode"], vec!["fast"]);
        assert_eq!(bound(b"[<mode>]", &[])["mode"], Vec::<String>::new());
        assert!(bind(b"[<mode>]", &["a", "b"]).0.is_none());
    }

    #[test]
    fn test_variadic() {
        let args = bound(b"<files>...", &["a", "b", "c"]);
        assert_eq!(args["files"], vec!["a", "b", "c"]);
        assert!(bind(b"<files>...", &[]).0.is_none());
        assert_eq!(bound(b"[<files>...]", &[])["files"], Vec::<String>::new());
    }

    #[test]
    fn test_trailing_mandatory_binds_from_the_right() {
        let args = bound(b"[<files>...] <out>", &["a", "b", "out.bin"]);
        assert_eq!(args["files"], vec!["a", "b"]);
        assert_eq!(args["out"], vec!["out.bin"]);

        let args = bound(b"[<files>...] <out>", &["out.bin"]);
        assert_eq!(args["files"], Vec::<String>::new());
        assert_eq!(args["out"], vec!["out.bin"]);

        assert!(bind(b"[<files>...] <out>", &[]).0.is_none());
    }

    #[test]
    fn test_usage_text_is_the_literal_spec() {
        let (_, usage) = bind(b"<a> [<b>]  ; trailing comment", &[]);
        assert_eq!(usage, "<a> [<b>]");
    }

    #[test]
    fn test_bad_specs() {
        let mut scan = Scanner::new(b"<", "<test>".into(), 1);
        assert!(process_argv(&mut scan, &[]).is_err());

        let mut scan = Scanner::new(b"<a", "<test>".into(), 1);
        assert!(process_argv(&mut scan, &[]).is_err());

        let mut scan = Scanner::new(b"potato", "<test>".into(), 1);
        assert!(process_argv(&mut scan, &[]).is_err());
    }
}
