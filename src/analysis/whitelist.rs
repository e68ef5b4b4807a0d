use anyhow::{Context, Result};
use regex::Regex;

/// Patterns of internal class names shared unmapped with the host runtime.
const MINIMAL_PATTERNS: &[&str] = &[
    r"^java/lang/Object$",
    r"^java/lang/StrictMath$",
    r"^java/lang/invoke/CallSite$",
    r"^java/lang/invoke/LambdaMetafactory$",
    r"^java/lang/invoke/MethodHandle$",
    r"^java/lang/invoke/MethodHandles(\$.*)?$",
    r"^java/lang/invoke/MethodType$",
    r"^java/lang/invoke/StringConcatFactory$",
];

/// Set of class-name patterns exempt from namespace remapping.
#[derive(Clone, Debug)]
pub struct Whitelist {
    sources: Vec<String>,
    patterns: Vec<Regex>,
}

impl Whitelist {
    pub fn minimal() -> Self {
        // The built-in patterns are known to compile.
        let patterns = MINIMAL_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();
        Self {
            sources: MINIMAL_PATTERNS.iter().map(|pattern| pattern.to_string()).collect(),
            patterns,
        }
    }

    pub fn empty() -> Self {
        Self {
            sources: Vec::new(),
            patterns: Vec::new(),
        }
    }

    pub fn from_patterns<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::empty().plus(patterns)
    }

    /// Copy extended with more patterns.
    pub fn plus<I, S>(&self, patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut whitelist = self.clone();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            let regex = Regex::new(pattern)
                .with_context(|| format!("invalid whitelist pattern {}", pattern))?;
            whitelist.sources.push(pattern.to_string());
            whitelist.patterns.push(regex);
        }
        Ok(whitelist)
    }

    /// Whether an internal class name matches any pattern.
    pub fn matches(&self, class_name: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(class_name))
    }

    pub fn patterns(&self) -> &[String] {
        &self.sources
    }
}

impl PartialEq for Whitelist {
    fn eq(&self, other: &Self) -> bool {
        self.sources == other.sources
    }
}

impl Eq for Whitelist {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_whitelist_covers_object_and_invoke_machinery() {
        let whitelist = Whitelist::minimal();

        assert!(whitelist.matches("java/lang/Object"));
        assert!(whitelist.matches("java/lang/invoke/MethodHandles$Lookup"));
        assert!(whitelist.matches("java/lang/invoke/LambdaMetafactory"));
        assert!(!whitelist.matches("java/lang/String"));
        assert!(!whitelist.matches("java/lang/ObjectStream"));
    }

    #[test]
    fn extra_patterns_extend_a_copy() {
        let minimal = Whitelist::minimal();
        let extended = minimal.plus(["^com/example/shared/.*$"]).expect("extend");

        assert!(extended.matches("com/example/shared/Value"));
        assert!(!minimal.matches("com/example/shared/Value"));
        assert_ne!(minimal, extended);
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(Whitelist::from_patterns(["("]).is_err());
    }
}
