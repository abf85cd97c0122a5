//! Pre-execution source validator.
//!
//! The V8 isolate is the real boundary; these checks reject oversized sources
//! and a few runtime-escape spellings before they reach the engine so the
//! caller gets a precise error.

use crate::error::SandboxError;

/// Default maximum source size in bytes (256 KB).
pub const DEFAULT_MAX_CODE_SIZE: usize = 256 * 1024;

/// Patterns that are banned from sandboxed sources.
const BANNED_PATTERNS: &[&str] = &[
    "Deno.",   // Runtime escape
    "import(", // Dynamic imports, no module loader is installed
    "__sandchart",
];

/// Validates a fragment or module source before execution.
///
/// Empty sources are accepted: an empty fragment simply exports `{}`.
pub fn validate_source(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    for pattern in BANNED_PATTERNS {
        if code.contains(pattern) {
            return Err(SandboxError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }

    Ok(())
}

/// Returns true if `name` can be bound as a plain JavaScript parameter name.
pub fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$') && !is_reserved_word(name)
}

fn is_reserved_word(name: &str) -> bool {
    matches!(
        name,
        "break" | "case" | "catch" | "class" | "const" | "continue" | "debugger" | "default"
            | "delete" | "do" | "else" | "export" | "extends" | "false" | "finally" | "for"
            | "function" | "if" | "import" | "in" | "instanceof" | "new" | "null" | "return"
            | "super" | "switch" | "this" | "throw" | "true" | "try" | "typeof" | "var"
            | "void" | "while" | "with" | "yield" | "let" | "static" | "await" | "enum"
            | "arguments" | "eval"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_commonjs_fragment() {
        let code = r#"module.exports = { title: params.title, rows: shared.rows };"#;
        assert!(validate_source(code, None).is_ok());
    }

    #[test]
    fn accepts_empty_source() {
        assert!(validate_source("", None).is_ok());
    }

    #[test]
    fn rejects_oversized_source() {
        let big = "x".repeat(DEFAULT_MAX_CODE_SIZE + 1);
        let err = validate_source(&big, None).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }

    #[test]
    fn custom_max_size() {
        let code = "x".repeat(100);
        assert!(validate_source(&code, Some(50)).is_err());
        assert!(validate_source(&code, Some(200)).is_ok());
    }

    #[test]
    fn rejects_deno_access() {
        let err = validate_source(r#"Deno.readTextFile("/etc/passwd")"#, None).unwrap_err();
        assert!(matches!(err, SandboxError::BannedPattern { .. }));
    }

    #[test]
    fn rejects_dynamic_import() {
        let err = validate_source(r#"const m = await import("fs");"#, None).unwrap_err();
        assert!(matches!(err, SandboxError::BannedPattern { ref pattern } if pattern == "import("));
    }

    #[test]
    fn rejects_internal_host_object() {
        let err = validate_source("__sandchart.register('x', {})", None).unwrap_err();
        assert!(matches!(err, SandboxError::BannedPattern { .. }));
    }

    #[test]
    fn identifiers() {
        assert!(is_js_identifier("params"));
        assert!(is_js_identifier("$data_1"));
        assert!(is_js_identifier("_"));
        assert!(!is_js_identifier("1abc"));
        assert!(!is_js_identifier("with-dash"));
        assert!(!is_js_identifier(""));
        assert!(!is_js_identifier("return"));
    }
}
