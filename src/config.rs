use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "drivebox", about = "Personal multi-user file storage over TLS")]
pub struct Config {
    /// Host/IP to bind (default: localhost only)
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8443)]
    pub port: u16,

    /// Root directory holding one subdirectory per user
    #[arg(long, default_value = "./uploads")]
    pub uploads: PathBuf,

    /// Credentials file with one `username,password` pair per line
    #[arg(long, default_value = "./users.csv")]
    pub users: PathBuf,

    /// PEM certificate chain presented to clients
    #[arg(long, default_value = "./cert.pem")]
    pub cert: PathBuf,

    /// PEM private key matching the certificate
    #[arg(long, default_value = "./key.pem")]
    pub key: PathBuf,

    /// Seconds a connection may stay silent before it is dropped
    #[arg(long, default_value_t = 30)]
    pub read_timeout_secs: u64,

    /// Lifetime of a login session in hours
    #[arg(long, default_value_t = 24)]
    pub session_ttl_hours: u64,
}

impl Config {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours.saturating_mul(60 * 60))
    }
}
