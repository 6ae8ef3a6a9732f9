//! Immutable environment snapshot shared by the description parser and tool invocations

use std::collections::BTreeMap;

/// Variable name the description files use to recurse into make.
/// It is bound to itself so delegating commands stay recognizable.
pub const MAKE_VAR: &str = "MAKE";

/// A read-only snapshot of environment variables
///
/// Built once per run and shared by reference; nothing mutates it after
/// construction, and the process environment is never modified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: BTreeMap<String, String>,
}

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current process environment
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Set a variable, replacing any previous value
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Overlay several variables
    pub fn with_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.vars
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Look up a variable
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Iterate over all variables in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_var_replaces_process_value() {
        let env = Environment::new()
            .with_var(MAKE_VAR, "gmake")
            .with_var(MAKE_VAR, MAKE_VAR);
        assert_eq!(env.get(MAKE_VAR), Some("MAKE"));
        assert!(!env.is_empty());
    }

    #[test]
    fn test_with_vars_overrides() {
        let env = Environment::new()
            .with_var("A", "1")
            .with_vars([("A", "2"), ("B", "3")]);
        assert_eq!(env.get("A"), Some("2"));
        assert_eq!(env.len(), 2);
        assert_eq!(env.iter().next(), Some(("A", "2")));
    }
}
