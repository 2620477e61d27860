//! Module registry: validated name -> module lookup.
//!
//! Modules are registered explicitly at startup (see
//! `foothold_modules::create_default_registry`). Registration checks the
//! descriptor invariants so a malformed module fails loudly at load time
//! instead of at its first run.

use crate::module::{ArgType, Module, ModuleDescriptor, ModuleKind};
use crate::pattern::TypePattern;
use crate::schedule::scope_allowed;
use foothold_core::{is_valid_type_name, Error, PlatformKind, Result};
use globset::GlobBuilder;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and add a module. Names must be unique.
    pub fn register(&mut self, module: impl Module + 'static) -> Result<()> {
        let d = module.descriptor();
        validate(d)?;
        if self.modules.contains_key(&d.name) {
            return Err(Error::invalid_module(&d.name, "already registered"));
        }
        debug!(module = %d.name, kind = ?d.kind, "registered module");
        self.modules.insert(d.name.clone(), Arc::new(module));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Module>> {
        self.modules
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownModule(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Every descriptor, sorted by name.
    pub fn list(&self) -> Vec<&ModuleDescriptor> {
        self.modules.values().map(|m| m.descriptor()).collect()
    }

    /// Descriptors whose name matches a glob.
    pub fn search(&self, pattern: &str) -> Result<Vec<&ModuleDescriptor>> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(false)
            .build()
            .map_err(|e| Error::invalid_argument("pattern", e.to_string()))?
            .compile_matcher();
        Ok(self
            .list()
            .into_iter()
            .filter(|d| glob.is_match(&d.name))
            .collect())
    }

    pub fn compatible(&self, platform: PlatformKind) -> Vec<&ModuleDescriptor> {
        self.list()
            .into_iter()
            .filter(|d| d.supports(platform))
            .collect()
    }

    /// Enumeration modules that provide a type matching `pattern`.
    pub fn modules_providing(&self, pattern: &TypePattern) -> Vec<Arc<dyn Module>> {
        self.modules
            .values()
            .filter(|m| {
                let d = m.descriptor();
                d.is_enumeration() && pattern.matches_any(&d.provides)
            })
            .cloned()
            .collect()
    }
}

/// Descriptor invariants checked at registration.
pub fn validate(d: &ModuleDescriptor) -> Result<()> {
    if !is_valid_type_name(&d.name) {
        return Err(Error::invalid_module(&d.name, "name must be a dotted identifier"));
    }
    if d.kind == ModuleKind::Enumerate {
        if d.provides.is_empty() {
            return Err(Error::invalid_module(&d.name, "enumeration module provides nothing"));
        }
        if let Some(bad) = d.provides.iter().find(|t| !is_valid_type_name(t)) {
            return Err(Error::invalid_module(&d.name, format!("invalid provided type {:?}", bad)));
        }
        if !scope_allowed(d.schedule, d.scope) {
            return Err(Error::invalid_module(
                &d.name,
                format!("schedule always requires scope none, got {}", d.scope),
            ));
        }
    } else if !d.provides.is_empty() {
        return Err(Error::invalid_module(&d.name, "only enumeration modules declare provides"));
    }

    let mut seen = HashSet::new();
    for arg in &d.arguments {
        if !seen.insert(arg.name.as_str()) {
            return Err(Error::invalid_module(&d.name, format!("duplicate argument {}", arg.name)));
        }
    }
    let remainders = d.arguments.iter().filter(|a| a.ty == ArgType::Remainder).count();
    if remainders > 1 || (remainders == 1 && d.allow_kwargs) {
        return Err(Error::invalid_module(
            &d.name,
            "at most one free-form argument (remainder or allow_kwargs)",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ModuleContext;
    use crate::module::{Argument, BoundArgs};
    use async_trait::async_trait;
    use foothold_core::{Schedule, Scope};
    use serde_json::Value;

    struct Stub(ModuleDescriptor);

    #[async_trait]
    impl Module for Stub {
        fn descriptor(&self) -> &ModuleDescriptor {
            &self.0
        }
        async fn run(&self, _ctx: &ModuleContext, _args: &BoundArgs) -> Result<Value> {
            Ok(Value::Null)
        }
    }

    fn enumerate(name: &str, provides: &str) -> ModuleDescriptor {
        ModuleDescriptor::enumerate(name).provides([provides])
    }

    #[test]
    fn always_with_host_scope_fails_registration() {
        let mut reg = ModuleRegistry::new();
        let d = enumerate("enumerate.bad", "x.y").schedule(Schedule::Always).scope(Scope::Host);
        assert!(matches!(reg.register(Stub(d)), Err(Error::InvalidModule { .. })));

        let d = enumerate("enumerate.ok", "x.y").schedule(Schedule::Always).scope(Scope::None);
        reg.register(Stub(d)).unwrap();
    }

    #[test]
    fn enumeration_without_provides_fails() {
        let mut reg = ModuleRegistry::new();
        assert!(reg.register(Stub(ModuleDescriptor::enumerate("enumerate.empty"))).is_err());
        assert!(reg.is_empty());
    }

    #[test]
    fn two_remainders_fail() {
        let d = ModuleDescriptor::base("base.rest")
            .argument(Argument::new("a", ArgType::Remainder))
            .argument(Argument::new("b", ArgType::Remainder));
        assert!(validate(&d).is_err());
        let d = ModuleDescriptor::base("base.rest")
            .argument(Argument::new("a", ArgType::Remainder))
            .allow_kwargs();
        assert!(validate(&d).is_err());
    }

    #[test]
    fn duplicate_names_fail() {
        let mut reg = ModuleRegistry::new();
        reg.register(Stub(enumerate("enumerate.a", "a.b"))).unwrap();
        assert!(reg.register(Stub(enumerate("enumerate.a", "a.b"))).is_err());
    }

    #[test]
    fn lookup_search_and_provides() {
        let mut reg = ModuleRegistry::new();
        reg.register(Stub(enumerate("enumerate.file.suid", "file.suid"))).unwrap();
        reg.register(Stub(enumerate("enumerate.system.network", "system.network.service")))
            .unwrap();
        reg.register(Stub(
            ModuleDescriptor::base("tool.win").platforms(&[PlatformKind::Windows]),
        ))
        .unwrap();

        assert!(matches!(reg.get("nope"), Err(Error::UnknownModule(_))));
        assert_eq!(reg.search("enumerate.*").unwrap().len(), 2);
        assert_eq!(reg.compatible(PlatformKind::Linux).len(), 2);

        let providers = reg.modules_providing(&TypePattern::new("system.*").unwrap());
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name(), "enumerate.system.network");
    }
}
