//! Built-in modules.
//!
//! Each module is a self-contained file. To add one: create the file,
//! implement `Module`, add `pub mod <name>;` here and register it in
//! `create_default_registry()` in ../lib.rs.

pub mod authorized_key;
pub mod escalate;
pub mod network;
pub mod processes;
pub mod suid;
