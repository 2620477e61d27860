//! Facts: typed records of what a module discovered about a target.
//!
//! The payload is a JSON object owned by the producing module. Modules define a
//! plain serde struct for it and go through [`Fact::from_payload`] /
//! [`Fact::decode`], so the stored form stays an explicit, versionable record
//! instead of an opaque object graph.

use crate::error::{Error, Result};
use crate::types::{is_valid_type_name, Scope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Fact {
    /// Name of the module that produced the fact.
    pub source: String,
    /// Capability types this fact satisfies, in declaration order.
    pub types: Vec<String>,
    pub scope: Scope,
    /// Suppressed from default listings.
    #[serde(default)]
    pub hidden: bool,
    /// One-line rendering for listings.
    #[serde(default)]
    pub title: String,
    pub data: serde_json::Value,
}

impl Fact {
    /// Build a fact from a raw JSON payload.
    ///
    /// `types` is deduplicated preserving first occurrence; it must be non-empty
    /// and every entry must be a dotted type name.
    pub fn new<I, S>(source: impl Into<String>, types: I, data: serde_json::Value) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let source = source.into();
        let mut ordered: Vec<String> = Vec::new();
        for t in types {
            let t = t.into();
            if !is_valid_type_name(&t) {
                return Err(Error::invalid_module(
                    &source,
                    format!("invalid fact type: {:?}", t),
                ));
            }
            if !ordered.contains(&t) {
                ordered.push(t);
            }
        }
        if ordered.is_empty() {
            return Err(Error::invalid_module(&source, "fact has no types"));
        }
        Ok(Self {
            source,
            types: ordered,
            scope: Scope::Host,
            hidden: false,
            title: String::new(),
            data,
        })
    }

    /// Build a fact from a module-defined payload struct.
    pub fn from_payload<I, S, T>(source: impl Into<String>, types: I, payload: &T) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        T: Serialize,
    {
        let data = serde_json::to_value(payload)?;
        Self::new(source, types, data)
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn has_type(&self, ty: &str) -> bool {
        self.types.iter().any(|t| t == ty)
    }

    /// Decode the payload into the module's own record type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }

    /// Read a single string field from the payload.
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Two facts describe the same discovery when source, types and payload
    /// agree. Scope, visibility and title are presentation.
    pub fn same_discovery(&self, other: &Fact) -> bool {
        self.source == other.source && self.types == other.types && self.data == other.data
    }

    /// Text used in listings: the title, or the compact payload.
    pub fn display_title(&self) -> String {
        if self.title.is_empty() {
            self.data.to_string()
        } else {
            self.title.clone()
        }
    }
}

impl std::fmt::Display for Fact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.types.join(","), self.display_title())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct SuidFile {
        path: String,
        owner: u32,
    }

    #[test]
    fn types_are_deduplicated_in_order() {
        let fact = Fact::new("m", ["b.x", "a.y", "b.x"], json!({})).unwrap();
        assert_eq!(fact.types, vec!["b.x", "a.y"]);
    }

    #[test]
    fn empty_or_invalid_types_rejected() {
        assert!(Fact::new("m", Vec::<String>::new(), json!({})).is_err());
        assert!(Fact::new("m", ["file..suid"], json!({})).is_err());
    }

    #[test]
    fn payload_roundtrip_through_decode() {
        let payload = SuidFile { path: "/usr/bin/passwd".into(), owner: 0 };
        let fact = Fact::from_payload("enumerate.file.suid", ["file.suid"], &payload).unwrap();
        assert_eq!(fact.field_str("path"), Some("/usr/bin/passwd"));
        assert_eq!(fact.decode::<SuidFile>().unwrap(), payload);
    }

    #[test]
    fn same_discovery_ignores_presentation() {
        let a = Fact::new("m", ["file.suid"], json!({"path": "/bin/su"})).unwrap();
        let b = a.clone().with_title("setuid /bin/su").hidden().with_scope(Scope::Session);
        assert!(a.same_discovery(&b));
        let c = Fact::new("m", ["file.suid"], json!({"path": "/bin/mount"})).unwrap();
        assert!(!a.same_discovery(&c));
    }
}
