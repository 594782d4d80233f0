//! Relay configuration

use std::time::Duration;

use crate::error::RelayError;

/// Timings and thresholds for a [`TunnelServer`](crate::TunnelServer)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Period between health pings on each backend connection
    pub health_check_interval: Duration,

    /// Deadline for one health ping
    pub ping_timeout: Duration,

    /// Deadline for opening a stream on a backend session
    pub open_stream_timeout: Duration,

    /// Deadline for session setup plus the auth handshake
    pub auth_timeout: Duration,

    /// Period of the global phi inspection loop
    pub phi_check_interval: Duration,

    /// Phi value above which a backend is reported as suspect
    pub phi_threshold: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(1),
            open_stream_timeout: Duration::from_secs(1),
            auth_timeout: Duration::from_secs(10),
            phi_check_interval: Duration::from_secs(5),
            phi_threshold: 0.9,
        }
    }
}

impl ServerConfig {
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_open_stream_timeout(mut self, timeout: Duration) -> Self {
        self.open_stream_timeout = timeout;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_phi_check(mut self, interval: Duration, threshold: f64) -> Self {
        self.phi_check_interval = interval;
        self.phi_threshold = threshold;
        self
    }

    /// Reject zero periods, which would spin the health and phi loops
    pub fn validate(&self) -> Result<(), RelayError> {
        let periods = [
            ("health_check_interval", self.health_check_interval),
            ("ping_timeout", self.ping_timeout),
            ("open_stream_timeout", self.open_stream_timeout),
            ("auth_timeout", self.auth_timeout),
            ("phi_check_interval", self.phi_check_interval),
        ];

        for (name, period) in periods {
            if period.is_zero() {
                return Err(RelayError::Configuration(format!("{} must be > 0", name)));
            }
        }

        if !self.phi_threshold.is_finite() || self.phi_threshold < 0.0 {
            return Err(RelayError::Configuration(format!(
                "phi_threshold {} is invalid",
                self.phi_threshold
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert_eq!(config.ping_timeout, Duration::from_secs(1));
        assert_eq!(config.open_stream_timeout, Duration::from_secs(1));
        assert_eq!(config.phi_threshold, 0.9);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = ServerConfig::default().with_health_check_interval(Duration::ZERO);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("health_check_interval"));
    }
}
