//! Drop-at-end filtering by transaction name.
//!
//! Grounded in `elasticapm.traces.TransactionsStore._should_ignore`: a list
//! of compiled patterns tested with unanchored `search` semantics, not
//! `match`/full-string equality.

use regex::Regex;

/// A configured list of regular expressions checked against a transaction's
/// final name on `end_transaction` (`spec.md` §4.4).
#[derive(Debug, Clone, Default)]
pub struct IgnorePatterns {
    patterns: Vec<Regex>,
}

impl IgnorePatterns {
    /// Compiles `patterns`. Returns the first invalid pattern's error,
    /// mirroring `elasticapm`'s constructor-time `re.compile` failures.
    pub fn compile(patterns: &[String]) -> Result<Self, regex::Error> {
        let compiled = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IgnorePatterns { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if `name` matches any configured pattern anywhere in the string.
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_list_matches_nothing() {
        let ip = IgnorePatterns::default();
        assert!(!ip.matches("GET /users"));
    }

    #[test]
    fn unanchored_search_matches_substring() {
        let ip = IgnorePatterns::compile(&["^OPTIONS".to_string()]).unwrap();
        assert!(ip.matches("OPTIONS /health"));
        assert!(!ip.matches("GET /users"));
    }

    #[test]
    fn multiple_patterns_are_ored() {
        let ip = IgnorePatterns::compile(&["^OPTIONS".to_string(), "healthz$".to_string()]).unwrap();
        assert!(ip.matches("GET /healthz"));
        assert!(ip.matches("OPTIONS /anything"));
        assert!(!ip.matches("GET /users"));
    }

    #[test]
    fn invalid_pattern_is_rejected_at_compile_time() {
        assert!(IgnorePatterns::compile(&["(".to_string()]).is_err());
    }
}
