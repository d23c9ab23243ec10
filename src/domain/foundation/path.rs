//! State paths and wildcard subscription patterns.
//!
//! A path is a dotted hierarchical key (`companion.variables.tally`).
//! Subscription patterns add two wildcards: `*` matches exactly one
//! segment, `**` matches zero or more segments. Patterns compile once,
//! at subscription time; the hot path never recompiles.

use regex::Regex;

use super::ValidationError;

/// Maximum path or pattern length in characters.
pub const MAX_PATH_LEN: usize = 256;

/// Validates a concrete state path (no wildcards required).
pub fn validate_path(field: &str, path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(ValidationError::missing(field));
    }
    if path.len() > MAX_PATH_LEN {
        return Err(ValidationError::too_long(field, MAX_PATH_LEN));
    }
    if path.split('.').any(|segment| segment.is_empty()) {
        return Err(ValidationError::invalid_format(
            field,
            "empty path segment",
        ));
    }
    Ok(())
}

/// Translates a wildcard pattern into an anchored regular expression.
///
/// `*` becomes `[^.]+`, `**` becomes `.*`, dots are literal, and every
/// other regex metacharacter in the input is escaped.
pub fn pattern_to_regex(pattern: &str) -> Result<Regex, ValidationError> {
    validate_path("pattern", pattern)?;

    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    expr.push_str(".*");
                } else {
                    expr.push_str("[^.]+");
                }
            }
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr)
        .map_err(|e| ValidationError::invalid_format("pattern", e.to_string()))
}

/// One-shot match of a path against a wildcard pattern.
///
/// Equivalent to compiling the pattern and testing; registries that
/// match repeatedly hold the compiled [`Regex`] instead.
pub fn path_matches_pattern(path: &str, pattern: &str) -> bool {
    pattern_to_regex(pattern)
        .map(|re| re.is_match(path))
        .unwrap_or(false)
}

/// A pattern string paired with its compiled matcher.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    raw: String,
    regex: Regex,
}

impl CompiledPattern {
    pub fn compile(pattern: &str) -> Result<Self, ValidationError> {
        Ok(Self {
            raw: pattern.to_string(),
            regex: pattern_to_regex(pattern)?,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_star_matches_exactly_one_segment() {
        assert!(path_matches_pattern("companion.variables.tally", "companion.*.tally"));
        assert!(!path_matches_pattern("companion.a.b.tally", "companion.*.tally"));
        assert!(!path_matches_pattern("companion.tally", "companion.*.tally"));
    }

    #[test]
    fn double_star_matches_any_depth() {
        assert!(path_matches_pattern("companion.variables.tally", "companion.**"));
        assert!(path_matches_pattern("companion.device.d1.key.5", "companion.**"));
        assert!(path_matches_pattern("a.b", "**"));
    }

    #[test]
    fn double_star_requires_its_literal_prefix() {
        // `a.**` translates to `^a\..*$`; the bare root does not match.
        assert!(!path_matches_pattern("companion", "companion.**"));
    }

    #[test]
    fn dots_are_literal() {
        assert!(!path_matches_pattern("axb", "a.b"));
        assert!(path_matches_pattern("a.b", "a.b"));
    }

    #[test]
    fn other_metacharacters_are_escaped() {
        assert!(!path_matches_pattern("ab", "a+b"));
        assert!(path_matches_pattern("a+b", "a+b"));
        assert!(!path_matches_pattern("a", "[a]"));
    }

    #[test]
    fn compiled_pattern_agrees_with_one_shot_matching() {
        for (path, pattern) in [
            ("companion.variables.tally", "companion.variables.**"),
            ("x.y", "x.*"),
            ("x.y.z", "x.*"),
            ("hub.subscriptions", "hub.**"),
        ] {
            let compiled = CompiledPattern::compile(pattern).unwrap();
            assert_eq!(
                compiled.matches(path),
                path_matches_pattern(path, pattern),
                "mismatch for {path} vs {pattern}"
            );
        }
    }

    #[test]
    fn rejects_empty_and_oversized_paths() {
        assert!(validate_path("path", "").is_err());
        assert!(validate_path("path", &"a".repeat(257)).is_err());
        assert!(validate_path("path", "a..b").is_err());
        assert!(validate_path("path", &"a".repeat(256)).is_ok());
    }
}
