use crate::errors::{Error, Result};
use std::fmt;
use std::sync::Arc;

/// Opaque bearer token attached to the push-channel handshake and to every
/// command and query call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(Arc<str>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = token.into();
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::Auth("no credential provided".to_string()));
        }
        Ok(Self(Arc::from(token)))
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}
