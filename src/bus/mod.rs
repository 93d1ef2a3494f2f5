//! Pub/sub bus contract.
//!
//! The bus carries task status/stdout/stderr outbound and gates stdin
//! inbound. Topics are broker-qualified strings; [`Topic`] parses the
//! `scheme://host:port/path` form at the interface boundary, while the bus
//! itself treats topic names as opaque.

pub mod memory;

pub use memory::MemoryBus;

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc;
use url::Url;

use crate::core::errors::{DroverError, Result};

/// An inbound byte-message stream for one topic
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next message, or `None` once the publisher side is gone
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Publish/subscribe message bus
#[async_trait]
pub trait MessageBus: Send + Sync + 'static {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// A broker-qualified topic address: protocol, host, port, and path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
}

impl Topic {
    pub fn parse(raw: &str) -> Result<Topic> {
        let url = Url::parse(raw)
            .map_err(|e| DroverError::bus(raw, format!("invalid topic address: {}", e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| DroverError::bus(raw, "topic address has no broker host"))?
            .to_string();
        Ok(Topic {
            scheme: url.scheme().to_string(),
            host,
            port: url.port(),
            path: url.path().to_string(),
        })
    }
}

impl FromStr for Topic {
    type Err = DroverError;

    fn from_str(raw: &str) -> Result<Topic> {
        Topic::parse(raw)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}{}", self.scheme, self.host, port, self.path),
            None => write!(f, "{}://{}{}", self.scheme, self.host, self.path),
        }
    }
}
