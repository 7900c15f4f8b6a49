//! Provider adapters for the colloquy conversation engine.
//!
//! Concrete [`colloquy_core::provider::ProviderClient`] implementations:
//! rig-backed remote clients behind a name registry, and a scripted mock
//! for tests and offline runs.

mod classify;
mod mock;
mod registry;
mod rig_client;

pub use classify::classify_error;
pub use mock::ScriptedProvider;
pub use registry::{
    build_client, detect_configured, provider_spec, registered_providers, resolve_model,
    ProviderSpec,
};
pub use rig_client::RigProviderClient;
