use regex::{Regex, RegexBuilder};

/// Compiled namespace pattern
///
/// `*` matches any run of characters, everything else is literal and
/// compared case-insensitively. The pattern must match the whole namespace,
/// so `mydb` matches only the namespace `mydb`, never `mydb.coll`.
#[derive(Clone)]
pub struct NamespaceMatcher {
    /// Compiled regex
    regex: Regex,

    /// Pattern as given
    pattern: String,

    /// Anchored regex source (without the case-insensitive flag)
    source: String,
}

impl NamespaceMatcher {
    /// Pattern matching every namespace
    pub const ALL: &'static str = "*";

    /// Compile a namespace pattern. An empty pattern matches everything.
    pub fn compile(pattern: &str) -> Result<Self, regex::Error> {
        let pattern = if pattern.is_empty() { Self::ALL } else { pattern };

        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("(.*?)");
        let source = format!("^{}$", body);
        let regex = RegexBuilder::new(&source).case_insensitive(true).build()?;

        Ok(Self {
            regex,
            pattern: pattern.to_string(),
            source,
        })
    }

    /// Check if a namespace matches this pattern
    pub fn is_match(&self, namespace: &str) -> bool {
        self.regex.is_match(namespace)
    }

    /// Get the pattern as given
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Anchored regex source, for stores that filter server-side.
    /// Must be evaluated case-insensitively.
    pub fn regex_source(&self) -> &str {
        &self.source
    }

    /// Check if the pattern accepts every namespace
    pub fn matches_everything(&self) -> bool {
        self.pattern.chars().all(|c| c == '*')
    }
}

impl std::fmt::Debug for NamespaceMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceMatcher")
            .field("pattern", &self.pattern)
            .field("source", &self.source)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_database() {
        let matcher = NamespaceMatcher::compile("*.x").unwrap();
        assert!(matcher.is_match("db.x"));
        assert!(matcher.is_match("other.x"));
        assert!(!matcher.is_match("db.xx"));
        assert!(!matcher.is_match("db.y"));
    }

    #[test]
    fn test_star_matches_everything() {
        let matcher = NamespaceMatcher::compile("*").unwrap();
        for ns in ["", "a", "db.coll", "admin.$cmd", "x.y.z"] {
            assert!(matcher.is_match(ns), "{ns}");
        }
        assert!(matcher.matches_everything());
        assert!(NamespaceMatcher::compile("").unwrap().matches_everything());
    }

    #[test]
    fn test_bare_database_is_literal() {
        let matcher = NamespaceMatcher::compile("mydb").unwrap();
        assert!(matcher.is_match("mydb"));
        assert!(!matcher.is_match("mydb.anycoll"));

        let matcher = NamespaceMatcher::compile("mydb.*").unwrap();
        assert!(matcher.is_match("mydb.anycoll"));
        assert!(!matcher.is_match("otherdb.anycoll"));
    }

    #[test]
    fn test_exact_namespace() {
        let matcher = NamespaceMatcher::compile("optest.cs").unwrap();
        assert!(matcher.is_match("optest.cs"));
        assert!(!matcher.is_match("optest.css"));
        assert!(!matcher.is_match("optestxcs"));
    }

    #[test]
    fn test_case_insensitive() {
        let matcher = NamespaceMatcher::compile("OpTest.*").unwrap();
        assert!(matcher.is_match("optest.Users"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let matcher = NamespaceMatcher::compile("db.a+b").unwrap();
        assert!(matcher.is_match("db.a+b"));
        assert!(!matcher.is_match("db.aab"));
        assert_eq!(matcher.pattern(), "db.a+b");
    }
}
