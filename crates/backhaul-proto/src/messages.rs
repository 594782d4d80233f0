//! Handshake messages

use serde::{Deserialize, Serialize};

/// Credentials presented by a backend on the control stream.
///
/// Only lives for the duration of the handshake; the relay never persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
    pub domain: String,
}

impl Auth {
    pub fn new(token: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            domain: domain.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_wire_field_names() {
        let auth = Auth::new("orcas are cool", "cetacean.club");
        let json = serde_json::to_value(&auth).unwrap();

        assert_eq!(json["token"], "orcas are cool");
        assert_eq!(json["domain"], "cetacean.club");
        assert_eq!(json.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_auth_rejects_missing_domain() {
        let result: Result<Auth, _> = serde_json::from_str(r#"{"token":"abc"}"#);
        assert!(result.is_err());
    }
}
