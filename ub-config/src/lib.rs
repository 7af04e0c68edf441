//! Settings DB, client registry, and identity file persistence — the
//! ambient configuration layer that stays deliberately agnostic to how
//! credentials are validated, but that every other component reads
//! tunables from.

pub mod client_registry;
pub mod identity_store;
pub mod settings;

pub use client_registry::ClientRegistry;
pub use identity_store::IdentityStore;
pub use settings::Settings;
