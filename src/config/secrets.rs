//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for connection credentials.

pub use secrecy::{ExposeSecret, SecretString};
