//! # Authorization
//!
//! Validates bearer credentials before a session starts. The identity it
//! yields is the key the dedup cache files that session's sightings under.

/// OAuth2 token introspection (RFC 7662) over HTTP.
pub mod introspection;

pub use introspection::{bearer_token, AuthError, Introspection, IntrospectionAuthorizer};
