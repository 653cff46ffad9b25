//! Built-in agent kinds.

pub mod geofencing;

pub use geofencing::{GeofencingAgent, GeofencingKind, GeofencingOptions};

use crate::agent::KindRegistry;

/// Registry holding every built-in kind with its default wiring.
pub fn builtin_registry() -> KindRegistry {
    let mut registry = KindRegistry::new();
    registry.register(GeofencingKind::new());
    registry
}
