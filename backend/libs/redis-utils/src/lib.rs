//! Shared Redis plumbing for the event-stream and flow-control libraries.
//!
//! - [`RedisPool`]: one client, one shared multiplexed connection manager, and on-demand
//!   dedicated connections for commands that block server-side.
//! - [`keys`]: hash-tag key builders so every key touched by one script lands on one slot.
//! - [`clock`]: the time source whose readings are passed to scripts as `ARGV`.

use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{Client, ConnectionAddr, ConnectionInfo, IntoConnectionInfo};
use tracing::{debug, info};

pub mod clock;
pub mod keys;

pub use clock::{Clock, ManualClock, SystemClock};
pub use keys::{hash_slot_tag, hash_tagged, KeyError};

/// Default connection string when `REDIS_URL` is unset.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Redis client with a shared connection manager.
///
/// Short round-trips (scripts, `XACK`, monitoring reads) share [`RedisPool::manager`].
/// `XREADGROUP ... BLOCK` holds its connection until the server answers, so blocking
/// readers must take a [`RedisPool::dedicated_connection`] instead.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: ConnectionManager,
    address: String,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let info: ConnectionInfo = redis_url
            .into_connection_info()
            .context("failed to parse REDIS_URL connection string")?;
        let address = address_label(&info.addr);

        let client = Client::open(info).context("failed to construct Redis client")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to initialize Redis connection manager")?;

        info!(address = %address, "Redis connection manager ready");

        Ok(Self {
            client,
            manager,
            address,
        })
    }

    /// Connect using `REDIS_URL`, falling back to [`DEFAULT_REDIS_URL`].
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());
        Self::connect(&url).await
    }

    /// Shared multiplexed connection. Cloning is cheap.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Fresh connection manager that nothing else multiplexes onto.
    pub async fn dedicated_connection(&self) -> Result<ConnectionManager> {
        let manager = ConnectionManager::new(self.client.clone())
            .await
            .context("failed to open dedicated Redis connection")?;
        debug!(address = %self.address, "Opened dedicated Redis connection");
        Ok(manager)
    }

    /// `host:port` (or socket path) of the server, without credentials.
    pub fn address(&self) -> &str {
        &self.address
    }
}

fn address_label(addr: &ConnectionAddr) -> String {
    #[allow(unreachable_patterns)]
    match addr {
        ConnectionAddr::Tcp(host, port) => format!("{}:{}", host, port),
        ConnectionAddr::TcpTls { host, port, .. } => format!("{}:{} (tls)", host, port),
        ConnectionAddr::Unix(path) => path.display().to_string(),
        _ => "redis".to_string(),
    }
}
