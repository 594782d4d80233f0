//! Read-only view of registered connections for operators

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot of one registered connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Backend {
    pub id: String,
    pub proto: String,
    pub user: String,
    pub domain: String,
    pub phi: f64,
    /// Remote address of the backend's transport connection
    pub host: String,
    pub usable: bool,
    pub hits: u64,
    pub connected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_serializes_flat() {
        let backend = Backend {
            id: "b1".to_string(),
            proto: "tcp".to_string(),
            user: "shachi".to_string(),
            domain: "cetacean.club".to_string(),
            phi: 0.25,
            host: "192.0.2.7:50123".to_string(),
            usable: true,
            hits: 3,
            connected_at: Utc::now(),
        };

        let json = serde_json::to_value(&backend).unwrap();
        assert_eq!(json["domain"], "cetacean.club");
        assert_eq!(json["usable"], true);
        assert_eq!(json["hits"], 3);
        assert!(json["connected_at"].is_string());
    }
}
