//! Capability-type patterns (`file.suid`, `system.*`).

use foothold_core::{Error, Fact, Result};
use globset::{GlobBuilder, GlobMatcher};

/// Matches dotted type names exactly, or by glob when the pattern contains
/// glob metacharacters. `*` crosses dots, so `system.*` matches
/// `system.network.service`.
#[derive(Clone, Debug)]
pub struct TypePattern {
    raw: String,
    glob: Option<GlobMatcher>,
}

impl TypePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let glob = if pattern.contains(['*', '?', '[', '{']) {
            let glob = GlobBuilder::new(pattern)
                .literal_separator(false)
                .build()
                .map_err(|e| Error::invalid_argument("pattern", e.to_string()))?;
            Some(glob.compile_matcher())
        } else {
            None
        };
        Ok(Self {
            raw: pattern.to_string(),
            glob,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, ty: &str) -> bool {
        match &self.glob {
            Some(g) => g.is_match(ty),
            None => self.raw == ty,
        }
    }

    pub fn matches_any<S: AsRef<str>>(&self, types: &[S]) -> bool {
        types.iter().any(|t| self.matches(t.as_ref()))
    }

    pub fn matches_fact(&self, fact: &Fact) -> bool {
        self.matches_any(&fact.types)
    }
}
