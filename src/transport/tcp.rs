//! TCP transport to the ingestion server

use crate::transport::traits::TransportConnector;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connects to the ingestion server with a bounded wait
pub struct TcpConnector {
    address: String,
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

#[async_trait]
impl TransportConnector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self) -> Result<TcpStream> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| {
                anyhow!(
                    "Connecting to {} timed out after {:?}",
                    self.address,
                    self.connect_timeout
                )
            })?
            .with_context(|| format!("connecting to {}", self.address))?;

        // Single small payload per connection; do not let Nagle hold it back
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}
