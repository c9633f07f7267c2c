//! Client-side session state shared by every Spyglass surface.
//!
//! Holds the persisted credential pair, the advisory trigger-cooldown
//! markers, and the base-URL resolution rules. Nothing in here talks to
//! the network; the request client in `spyglass-api` borrows credentials
//! from the store one call at a time.

pub mod auth;
pub mod cooldown;
pub mod store;

pub use auth::{
    AuthInputError, CredentialPair, DEFAULT_API_BASE_URL, ENV_API_BASE_URL, ResolvedApiBaseUrl,
    SessionState, normalize_base_url, resolve_api_base_url,
};
pub use cooldown::{CooldownDecision, CooldownGate};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore, StoreError};
