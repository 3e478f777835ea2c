//! Connection seam between the uplink and the network

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

/// Opens one fresh connection per report
///
/// The server closes every connection after a single payload, so connectors
/// hand out short-lived streams rather than keeping a session alive.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// The stream type this connector produces
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open a stream ready for the greeting, or fail within the connector's own bound
    async fn connect(&self) -> Result<Self::Stream>;

    /// Human-readable name for this transport
    fn name(&self) -> &'static str;
}
