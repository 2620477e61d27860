//! foothold engine: module contract, registry, scheduling, the per-target
//! fact store, sessions and the tamper ledger.
//!
//! A module is registered once in a [`ModuleRegistry`]; an operator opens a
//! [`Session`] through a [`Context`] and invokes modules by name. Enumeration
//! results are cached in the [`FactStore`] according to each module's
//! schedule and scope.

pub mod context;
pub mod events;
pub mod gtfobins;
pub mod ledger;
pub mod module;
pub mod pattern;
pub mod registry;
pub mod schedule;
pub mod session;
pub mod store;

pub use context::{Context, ModuleContext};
pub use events::{ModuleEvent, ModuleOutput, ModuleRun};
pub use gtfobins::{Capability, Caveat, GtfoBins, Method, Rule, Technique};
pub use ledger::{RevertAction, RevertOutcome, TamperKind, TamperRecord};
pub use module::{parse_kv_args, ArgType, Args, Argument, BoundArgs, Module, ModuleDescriptor, ModuleKind};
pub use pattern::TypePattern;
pub use registry::ModuleRegistry;
pub use schedule::CacheKey;
pub use session::Session;
pub use store::{FactStore, StoreDocument, StoredFact, TargetStore, STORE_VERSION};
