//! Session core for the fitness tracker client.
//!
//! Handles login (OAuth redirect and email/password), JWT identity decoding,
//! proactive and 401-triggered token refresh, and identity change
//! notifications. Everything that talks to the backend on the user's behalf
//! goes through a single `SessionManager`.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod models;

pub use api::{ApiError, AuthApi, ProfileClient, RequestOptions};
pub use auth::{
    FileStore, KeyringStore, MemoryStore, Navigator, RefreshCheck, SessionManager, SessionPhase,
    SessionSettings, SessionStore, Subscription,
};
pub use config::{Config, StorageBackend};
pub use error::{DecodeError, SessionError};
pub use models::{Identity, TokenPair, UserProfileDetails};
