//! One-shot report exchange with the ingestion server

use crate::config::NodeConfig;
use crate::transport::TransportConnector;
use airsense_shared::{codec, protocol, Measurements};
use anyhow::{anyhow, bail, Result};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::{debug, warn};

/// What the server said after a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Server closed without a status byte
    Closed,
    /// Server reported the payload as stored
    Accepted,
    /// Server reported the payload as malformed
    Rejected,
}

/// Sends readings to the server over a pluggable transport
pub struct Uplink<C> {
    connector: C,
    device_id: String,
    ip: String,
    settle_delay: Duration,
    response_timeout: Duration,
}

impl<C: TransportConnector> Uplink<C> {
    pub fn new(connector: C, config: &NodeConfig) -> Self {
        Self {
            connector,
            device_id: config.device_id.clone(),
            ip: config.ip.clone(),
            settle_delay: config.settle_delay,
            response_timeout: config.response_timeout,
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.connector.name()
    }

    /// Run one full exchange: connect, await greeting, settle, send, await close
    pub async fn report(&self, measurements: &Measurements) -> Result<Ack> {
        let payload = codec::encode_payload(&self.device_id, &self.ip, measurements)?;

        let mut stream = self.connector.connect().await?;

        let mut greeting = [0u8; 1];
        timeout(self.response_timeout, stream.read_exact(&mut greeting))
            .await
            .map_err(|_| anyhow!("No greeting within {:?}", self.response_timeout))??;
        if greeting[0] != protocol::GREETING {
            bail!("Unexpected greeting byte 0x{:02x}", greeting[0]);
        }

        tokio::time::sleep(self.settle_delay).await;
        stream.write_all(&payload).await?;
        stream.flush().await?;
        debug!("Sent {} byte report as {}", payload.len(), self.device_id);

        let mut reply = Vec::new();
        timeout(self.response_timeout, stream.read_to_end(&mut reply))
            .await
            .map_err(|_| anyhow!("Server did not close within {:?}", self.response_timeout))??;

        if let Err(e) = stream.shutdown().await {
            debug!("Shutdown after report failed: {}", e);
        }

        match reply.first() {
            None => Ok(Ack::Closed),
            Some(&protocol::STATUS_ACCEPTED) => Ok(Ack::Accepted),
            Some(&protocol::STATUS_REJECTED) => Ok(Ack::Rejected),
            Some(other) => {
                warn!("Unknown status byte 0x{:02x}", other);
                Ok(Ack::Closed)
            }
        }
    }
}

/// Exponential backoff between failed exchanges
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to the cap
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * 2, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpConnector;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;

    fn config() -> NodeConfig {
        NodeConfig {
            device_id: "ESP32-Sensor9".into(),
            ip: "10.0.0.9".into(),
            settle_delay: Duration::from_millis(10),
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_millis(500),
            ..NodeConfig::default()
        }
    }

    fn tcp(addr: String) -> TcpConnector {
        TcpConnector::new(addr, Duration::from_secs(1))
    }

    /// Hands out one end of an in-memory pipe; the other end plays the server
    struct PipeConnector {
        client: std::sync::Mutex<Option<DuplexStream>>,
    }

    impl PipeConnector {
        fn new() -> (Self, DuplexStream) {
            let (client, server) = duplex(1024);
            let connector = Self {
                client: std::sync::Mutex::new(Some(client)),
            };
            (connector, server)
        }
    }

    #[async_trait::async_trait]
    impl TransportConnector for PipeConnector {
        type Stream = DuplexStream;

        async fn connect(&self) -> Result<DuplexStream> {
            self.client
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| anyhow!("pipe already used"))
        }

        fn name(&self) -> &'static str {
            "pipe"
        }
    }

    fn measurements() -> Measurements {
        Measurements {
            lux: 250.0,
            nh3: 9.5,
            hs: 120.0,
            h: 70.0,
            t: 24.5,
        }
    }

    /// Minimal server: greet, read one payload, optionally answer, close
    async fn fake_server(
        greeting: u8,
        status: Option<u8>,
    ) -> (String, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(&[greeting]).await.unwrap();

            let mut buf = vec![0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            buf.truncate(n);

            if let Some(status) = status {
                socket.write_all(&[status]).await.unwrap();
            }
            buf
        });

        (addr, handle)
    }

    #[tokio::test]
    async fn test_report_sends_wire_payload() {
        let (addr, server) = fake_server(protocol::GREETING, None).await;
        let uplink = Uplink::new(tcp(addr), &config());

        let ack = uplink.report(&measurements()).await.unwrap();
        assert_eq!(ack, Ack::Closed);

        let received = server.await.unwrap();
        let reading = codec::decode(&received).unwrap();
        assert_eq!(reading.device, "ESP32-Sensor9");
        assert_eq!(reading.ip, "10.0.0.9");
        assert_eq!(reading.measurements, measurements());
    }

    #[tokio::test]
    async fn test_report_reads_status_byte() {
        let (addr, _server) =
            fake_server(protocol::GREETING, Some(protocol::STATUS_REJECTED)).await;
        let uplink = Uplink::new(tcp(addr), &config());

        assert_eq!(uplink.report(&measurements()).await.unwrap(), Ack::Rejected);
    }

    #[tokio::test]
    async fn test_wrong_greeting_fails() {
        let (addr, _server) = fake_server(b'z', None).await;
        let uplink = Uplink::new(tcp(addr), &config());

        let err = uplink.report(&measurements()).await.unwrap_err();
        assert!(err.to_string().contains("greeting"));
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _hold = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let uplink = Uplink::new(tcp(addr), &config());
        let err = uplink.report(&measurements()).await.unwrap_err();
        assert!(err.to_string().contains("No greeting"));
    }

    #[tokio::test]
    async fn test_report_reaches_ingestion_server() {
        use airsense_server::config::ProtocolConfig;
        use airsense_server::persist::{Delivery, NullSink};
        use airsense_server::{Listener, ReadingsStore, SessionContext};
        use std::sync::Arc;

        let store = Arc::new(ReadingsStore::new());
        let ctx = Arc::new(SessionContext {
            store: store.clone(),
            delivery: Delivery::new(Arc::new(NullSink), Duration::from_secs(1)),
            protocol: ProtocolConfig {
                settle_delay_ms: 5,
                receive_timeout_ms: 1_000,
                report_outcome: true,
            },
        });
        let listener = Listener::bind("127.0.0.1:0", 8, ctx).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(listener.run());

        let uplink = Uplink::new(tcp(addr), &config());
        assert_eq!(uplink.report(&measurements()).await.unwrap(), Ack::Accepted);

        let stored = store.latest("ESP32-Sensor9").await.expect("reading not stored");
        assert_eq!(stored.measurements, measurements());
    }

    #[tokio::test]
    async fn test_report_over_any_transport() {
        let (connector, mut server) = PipeConnector::new();
        let uplink = Uplink::new(connector, &config());
        assert_eq!(uplink.transport_name(), "pipe");

        let sensor = tokio::spawn(async move { uplink.report(&measurements()).await });

        server.write_all(&[protocol::GREETING]).await.unwrap();
        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        let reading = codec::decode(&buf[..n]).unwrap();
        assert_eq!(reading.device, "ESP32-Sensor9");

        server.write_all(&[protocol::STATUS_ACCEPTED]).await.unwrap();
        drop(server);

        assert_eq!(sensor.await.unwrap().unwrap(), Ack::Accepted);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
