//! Cache policy: when an enumeration module may be served from stored facts.

use foothold_core::{Schedule, Scope, Uid};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one cached module run.
///
/// `Once` modules key on the module name alone, `PerUser` modules also on the
/// uid they ran as. `Always` modules have no key.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub module: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
}

impl CacheKey {
    pub fn module(name: impl Into<String>) -> Self {
        Self {
            module: name.into(),
            uid: None,
        }
    }

    pub fn per_user(name: impl Into<String>, uid: Uid) -> Self {
        Self {
            module: name.into(),
            uid: Some(uid),
        }
    }

    /// Key for a run of `module` under `schedule`. `uid` is only consulted for
    /// `PerUser`.
    pub fn for_schedule(module: &str, schedule: Schedule, uid: Option<Uid>) -> Option<Self> {
        match schedule {
            Schedule::Once => Some(Self::module(module)),
            Schedule::PerUser => uid.map(|uid| Self::per_user(module, uid)),
            Schedule::Always => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.uid {
            Some(uid) => write!(f, "{}@{}", self.module, uid),
            None => write!(f, "{}", self.module),
        }
    }
}

/// Whether the cache key needs a fresh uid from the target.
pub fn needs_uid(schedule: Schedule) -> bool {
    schedule == Schedule::PerUser
}

/// `Always` modules never touch a store, so they may only emit `None`-scoped
/// facts.
pub fn scope_allowed(schedule: Schedule, scope: Scope) -> bool {
    schedule != Schedule::Always || scope == Scope::None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_per_schedule() {
        assert_eq!(
            CacheKey::for_schedule("m", Schedule::Once, Some(1000)),
            Some(CacheKey::module("m"))
        );
        assert_eq!(
            CacheKey::for_schedule("m", Schedule::PerUser, Some(0)),
            Some(CacheKey::per_user("m", 0))
        );
        assert_eq!(CacheKey::for_schedule("m", Schedule::Always, Some(0)), None);
        assert_ne!(CacheKey::per_user("m", 0), CacheKey::per_user("m", 1000));
    }

    #[test]
    fn always_only_with_none_scope() {
        assert!(scope_allowed(Schedule::Always, Scope::None));
        assert!(!scope_allowed(Schedule::Always, Scope::Host));
        assert!(!scope_allowed(Schedule::Always, Scope::Session));
        assert!(scope_allowed(Schedule::Once, Scope::Host));
    }

    #[test]
    fn display() {
        assert_eq!(CacheKey::per_user("enumerate.x", 0).to_string(), "enumerate.x@0");
        assert_eq!(CacheKey::module("enumerate.x").to_string(), "enumerate.x");
    }
}
