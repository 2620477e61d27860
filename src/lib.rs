//! foothold: post-exploitation module engine.
//!
//! The work happens in the `foothold-*` crates; this crate is the command
//! line front end.

pub mod cli;

pub use foothold_core as core;
pub use foothold_engine as engine;
pub use foothold_modules as modules;
pub use foothold_platform as platform;
