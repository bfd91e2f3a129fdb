//! Glob patterns (`*`, `?`) compiled to anchored regexes.

use regex::Regex;

use crate::error::{SandboxError, SandboxResult};

/// Compile `pattern` so that `*` matches any run of characters and `?`
/// matches exactly one. Everything else is literal.
pub fn compile(pattern: &str) -> SandboxResult<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut literal = String::new();
    for c in pattern.chars() {
        match c {
            '*' | '?' => {
                re.push_str(&regex::escape(&literal));
                literal.clear();
                re.push_str(if c == '*' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    re.push_str(&regex::escape(&literal));
    re.push('$');
    Regex::new(&re).map_err(|e| SandboxError::InvalidConfig(format!("glob {pattern:?}: {e}")))
}

/// Whether `pattern` contains any wildcard.
pub fn is_pattern(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_star_and_question() {
        let re = compile("user-*").unwrap();
        assert!(re.is_match("user-42"));
        assert!(re.is_match("user-"));
        assert!(!re.is_match("admin-user-1"));

        let re = compile("ab?d").unwrap();
        assert!(re.is_match("abcd"));
        assert!(!re.is_match("abd"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let re = compile("a.b+(c)").unwrap();
        assert!(re.is_match("a.b+(c)"));
        assert!(!re.is_match("axbb(c)"));
        assert!(is_pattern("x*"));
        assert!(!is_pattern("plain"));
    }
}
