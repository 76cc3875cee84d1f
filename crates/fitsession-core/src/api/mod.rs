//! REST client module for the fitness backend.
//!
//! - `AuthApi`: login, token refresh, OAuth authorization URLs and raw
//!   bearer-authenticated requests
//! - `ProfileClient`: the fitness profile resource, called through a
//!   `SessionManager` so 401s trigger a refresh and retry
//!
//! The backend issues JWT access tokens paired with refresh tokens.

pub mod client;
pub mod error;
pub mod profile;

pub use client::{AuthApi, RequestOptions, DEFAULT_API_BASE_URL};
pub use error::ApiError;
pub use profile::ProfileClient;
