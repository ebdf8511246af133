//! Client identity used to key limiter and quota state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// An opaque identifier for a caller (API key hash, IP, user id, ...).
///
/// How a request is mapped to a `ClientId` is up to the integrating service.
/// Cloning is cheap; the underlying string is shared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Arc<str>);

impl ClientId {
    /// Create a new client identifier.
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_client_id_equality() {
        let a = ClientId::new("api-key-1");
        let b: ClientId = "api-key-1".into();
        let c: ClientId = String::from("api-key-2").into();

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<ClientId> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_client_id_display() {
        let id = ClientId::new("10.0.0.1");
        assert_eq!(id.to_string(), "10.0.0.1");
        assert_eq!(id.as_str(), "10.0.0.1");
    }
}
