//! Core configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the wired core and its listeners.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Data directory for the SQLite database.
    pub data_dir: PathBuf,
    /// Bootstrap listener address.
    pub bootstrap_addr: SocketAddr,
    /// mTLS session listener address.
    pub session_addr: SocketAddr,
    /// DNS name the core's server certificate carries.
    pub server_name: String,
    /// Lease sweeper interval.
    pub sweep_interval: Duration,
    /// Heartbeat cadence expected from agents.
    pub heartbeat_interval: Duration,
    /// Retention window for tombstoned secrets.
    pub secret_retention: chrono::Duration,
    /// Remaining-validity window that triggers `cert.expiring` pushes.
    pub cert_expiry_window: chrono::Duration,
    /// Validity of issued agent client certificates, days.
    pub client_cert_validity_days: u32,
    /// Housekeeping interval (token purge, tombstone purge, expiry scan).
    pub housekeeping_interval: Duration,
    /// Login attempts allowed per identifier per minute.
    pub login_rate_limit: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            bootstrap_addr: ([127, 0, 0, 1], 8220).into(),
            session_addr: ([127, 0, 0, 1], 8221).into(),
            server_name: "localhost".to_string(),
            sweep_interval: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            secret_retention: chrono::Duration::days(90),
            cert_expiry_window: chrono::Duration::days(14),
            client_cert_validity_days: 90,
            housekeeping_interval: Duration::from_secs(60),
            login_rate_limit: 30,
        }
    }
}
