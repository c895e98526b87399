use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Idle interval after which a keepalive ping is written (seconds)
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_in_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            keepalive_interval_in_secs: default_keepalive_interval(),
        }
    }
}

impl ServerConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_in_secs)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address
            .parse()
            .map_err(|e| Error::InvalidConfig(format!("listen_address {}: {}", self.listen_address, e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.socket_addr()?;

        if self.keepalive_interval_in_secs == 0 {
            return Err(Error::InvalidConfig("keepalive_interval_in_secs cannot be 0".into()));
        }

        Ok(())
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:5000".to_string()
}
fn default_keepalive_interval() -> u64 {
    15
}
