//! foothold core: shared types, facts, configuration and the error taxonomy

pub mod config;
pub mod error;
pub mod fact;
pub mod types;

pub use config::FootholdConfig;
pub use error::{Error, ErrorKind, Result};
pub use fact::Fact;
pub use types::*;
