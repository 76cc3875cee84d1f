//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `SessionManager`: token lifecycle, identity, refresh and authenticated requests
//! - `SessionStore`: local persistent storage (file, OS keychain or memory)
//! - `Subscribers`: identity change notifications
//! - `Navigator`: the host's page navigation, used by OAuth redirect login
//!
//! Access tokens are refreshed when they come within 5 minutes of expiry, and
//! once more whenever a resource request is rejected with a 401.

pub mod jwt;
pub mod navigator;
pub mod session;
pub mod storage;
pub mod subscribers;

pub use jwt::Claims;
pub use navigator::{Navigator, RecordingNavigator};
pub use session::{RefreshCheck, SessionManager, SessionPhase, SessionSettings};
pub use storage::{FileStore, KeyringStore, MemoryStore, SessionStore, RETURN_PATH_KEY, TOKENS_KEY};
pub use subscribers::{Listener, Subscribers, Subscription};
