//! Data models shared between the session core and its consumers.
//!
//! - `TokenPair`, `Identity`: credentials and the user decoded from them
//! - Profile types: the fitness profile resource (`/api/v1/fitness/profile`)
//!
//! With the `ts` feature enabled these types also derive TypeScript bindings
//! for the web front end.

pub mod identity;
pub mod profile;

pub use identity::{Identity, TokenPair};
pub use profile::{Goals, PersonalDetails, Preferences, UnitPreferences, UserProfileDetails};
