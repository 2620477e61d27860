//! foothold modules: the built-in enumeration and implant modules.

pub mod modules;

pub use modules::authorized_key::AuthorizedKeyModule;
pub use modules::escalate::EscalateSuidModule;
pub use modules::network::NetworkModule;
pub use modules::processes::ProcessesModule;
pub use modules::suid::SuidModule;

use foothold_core::Result;
use foothold_engine::ModuleRegistry;

/// Registry with every built-in module.
pub fn create_default_registry() -> Result<ModuleRegistry> {
    let mut registry = ModuleRegistry::new();

    // --- Enumeration ---
    registry.register(NetworkModule::new())?;
    registry.register(SuidModule::new())?;
    registry.register(ProcessesModule::new())?;
    registry.register(EscalateSuidModule::new())?;

    // --- Implants ---
    registry.register(AuthorizedKeyModule::new())?;

    Ok(registry)
}
