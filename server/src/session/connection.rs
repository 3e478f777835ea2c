//! Individual sensor connection handling
//!
//! One connection carries exactly one exchange: greet, let the sensor settle,
//! receive one payload before the deadline, commit it, close. Persistence runs
//! after the socket is closed so a slow database never holds a sensor open.

use super::state::{SessionEvent, SessionState, SessionStateMachine, TransitionResult};
use crate::config::ProtocolConfig;
use crate::persist::Delivery;
use crate::store::{Commit, ReadingsStore};
use airsense_shared::{codec, protocol, Reading};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

/// Everything a handler needs besides its socket, shared by all handlers
pub struct SessionContext {
    pub store: Arc<ReadingsStore>,
    pub delivery: Delivery,
    pub protocol: ProtocolConfig,
}

/// Connection-scoped failures; none of them leave the handler task
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(#[from] codec::CodecError),

    #[error("No payload within {0:?}")]
    Timeout(Duration),

    #[error("Peer closed the connection before sending a payload")]
    Disconnected,

    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),
}

/// How a connection ended
#[derive(Debug)]
pub enum SessionOutcome {
    /// Reading stored; `persisted` tells whether the first durable write worked
    Committed {
        reading: Arc<Reading>,
        persisted: bool,
    },
    /// Same report as one already stored within the dedup window
    Duplicate(Arc<Reading>),
    /// Payload could not be decoded
    Rejected(codec::CodecError),
    /// Heartbeat-sized payload, dropped quietly
    Ignored,
    /// Nothing arrived before the deadline
    TimedOut,
    /// Peer hung up without sending anything
    Disconnected,
    /// Read or write failed mid-protocol
    TransportFailed(std::io::Error),
}

/// Active sensor session
pub struct SensorSession<S> {
    stream: S,
    peer: SocketAddr,
    accepted_at: Instant,
    deadline: Instant,
    fsm: SessionStateMachine,
}

impl<S> SensorSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session for a freshly accepted stream; the deadline starts now
    pub fn new(stream: S, peer: SocketAddr, protocol: &ProtocolConfig) -> Self {
        let accepted_at = Instant::now();

        Self {
            stream,
            peer,
            accepted_at,
            deadline: accepted_at + protocol.session_lifetime(),
            fsm: SessionStateMachine::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.fsm.state()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn advance(&mut self, event: SessionEvent) {
        match self.fsm.process_event(event) {
            TransitionResult::Success(state) => {
                trace!("[{}] {:?} -> {:?}", self.peer, event, state);
            }
            TransitionResult::Invalid { from, event } => {
                warn!("[{}] Unexpected {:?} in state {:?}", self.peer, event, from);
            }
        }
    }

    /// Run the protocol up to and including the store commit
    pub async fn exchange(
        &mut self,
        store: &ReadingsStore,
        settle_delay: Duration,
    ) -> Result<Commit, SessionError> {
        self.greet().await?;
        self.settle(settle_delay).await;

        let payload = match self.receive().await {
            Ok(payload) => payload,
            Err(e) => {
                if matches!(e, SessionError::Timeout(_)) {
                    self.advance(SessionEvent::DeadlineExpired);
                }
                return Err(e);
            }
        };

        match codec::decode(&payload) {
            Ok(reading) => {
                let commit = store.append(reading).await;
                self.advance(SessionEvent::PayloadAccepted);
                Ok(commit)
            }
            Err(e) => {
                if !e.is_noise() {
                    self.advance(SessionEvent::PayloadRejected);
                }
                Err(e.into())
            }
        }
    }

    async fn greet(&mut self) -> Result<(), SessionError> {
        self.stream.write_all(&[protocol::GREETING]).await?;
        self.stream.flush().await?;
        self.advance(SessionEvent::GreetingSent);
        Ok(())
    }

    async fn settle(&mut self, delay: Duration) {
        sleep_until(std::cmp::min(Instant::now() + delay, self.deadline)).await;
        self.advance(SessionEvent::SettleElapsed);
    }

    async fn receive(&mut self) -> Result<BytesMut, SessionError> {
        match timeout_at(self.deadline, read_payload(&mut self.stream)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::Timeout(self.deadline - self.accepted_at)),
        }
    }

    /// Write a status byte; the sensor may already be gone, so failures only log
    pub async fn respond(&mut self, status: u8) {
        let result = async {
            self.stream.write_all(&[status]).await?;
            self.stream.flush().await
        }
        .await;

        if let Err(e) = result {
            debug!("[{}] Could not send status byte: {}", self.peer, e);
        }
    }

    /// Release the connection
    pub async fn close(mut self) {
        self.advance(SessionEvent::Closed);
        if let Err(e) = self.stream.shutdown().await {
            trace!("[{}] Shutdown error: {}", self.peer, e);
        }
    }
}

/// Read until the payload is a complete JSON object, the peer stops sending,
/// or the size limit is passed
async fn read_payload<R>(reader: &mut R) -> Result<BytesMut, SessionError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        if buf.capacity() - buf.len() < 1024 {
            buf.reserve(4096);
        }

        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            if buf.is_empty() {
                return Err(SessionError::Disconnected);
            }
            break;
        }

        if !codec::is_incomplete(&buf) {
            break;
        }
    }

    Ok(buf)
}

fn status_byte(result: &Result<Commit, SessionError>) -> Option<u8> {
    match result {
        Ok(_) => Some(protocol::STATUS_ACCEPTED),
        Err(SessionError::MalformedPayload(e)) if !e.is_noise() => {
            Some(protocol::STATUS_REJECTED)
        }
        Err(_) => None,
    }
}

/// A connection whose socket is already released, with delivery still pending
#[derive(Debug)]
pub struct ClosedSession {
    peer: SocketAddr,
    result: Result<Commit, SessionError>,
}

impl ClosedSession {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Log the outcome and, for a fresh commit, attempt the durable write
    pub async fn finish(self, delivery: &Delivery) -> SessionOutcome {
        let peer = self.peer;

        match self.result {
            Ok(Commit::Appended(reading)) => {
                info!(
                    "[{}] Committed reading from {} at {}",
                    peer, reading.device, reading.received_at
                );
                let persisted = delivery.deliver(reading.clone()).await.is_ok();
                SessionOutcome::Committed { reading, persisted }
            }
            Ok(Commit::Duplicate(reading)) => {
                info!(
                    "[{}] Duplicate report from {}, already stored at {}",
                    peer, reading.device, reading.received_at
                );
                SessionOutcome::Duplicate(reading)
            }
            Err(SessionError::MalformedPayload(e)) if e.is_noise() => {
                debug!("[{}] Ignoring noise payload: {}", peer, e);
                SessionOutcome::Ignored
            }
            Err(SessionError::MalformedPayload(e)) => {
                warn!("[{}] Rejected payload: {}", peer, e);
                SessionOutcome::Rejected(e)
            }
            Err(SessionError::Timeout(waited)) => {
                debug!("[{}] No payload after {:?}, closing", peer, waited);
                SessionOutcome::TimedOut
            }
            Err(SessionError::Disconnected) => {
                debug!("[{}] Disconnected before sending a payload", peer);
                SessionOutcome::Disconnected
            }
            Err(SessionError::Transport(e)) => {
                warn!("[{}] Transport error: {}", peer, e);
                SessionOutcome::TransportFailed(e)
            }
        }
    }
}

/// Run the socket side of a connection: exchange, optional status byte, close
///
/// Returns once the stream is released. Persistence happens in
/// [`ClosedSession::finish`], which holds no connection resources.
pub async fn run_session<S>(stream: S, peer: SocketAddr, ctx: &SessionContext) -> ClosedSession
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session = SensorSession::new(stream, peer, &ctx.protocol);
    let result = session
        .exchange(&ctx.store, ctx.protocol.settle_delay())
        .await;

    if ctx.protocol.report_outcome {
        if let Some(status) = status_byte(&result) {
            session.respond(status).await;
        }
    }
    session.close().await;

    ClosedSession { peer, result }
}

/// Handle one accepted connection from start to close, then deliver
pub async fn handle_connection<S>(
    stream: S,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
) -> SessionOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    run_session(stream, peer, &ctx)
        .await
        .finish(&ctx.delivery)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::testing::RecordingSink;
    use crate::persist::ReadingSink;
    use tokio::io::{duplex, DuplexStream};

    const PAYLOAD: &str = concat!(
        r#"{"Device":"ESP32-Sensor1","IP":"192.168.1.100","#,
        r#""LUX":120.5,"NH3":8.2,"HS":90.0,"H":65.0,"T":25.3}"#
    );

    fn peer() -> SocketAddr {
        "192.168.1.100:50000".parse().unwrap()
    }

    fn protocol(report_outcome: bool) -> ProtocolConfig {
        ProtocolConfig {
            settle_delay_ms: 20,
            receive_timeout_ms: 300,
            report_outcome,
        }
    }

    fn context(sink: Arc<RecordingSink>, report_outcome: bool) -> Arc<SessionContext> {
        let sink: Arc<dyn ReadingSink> = sink;
        Arc::new(SessionContext {
            store: Arc::new(ReadingsStore::new()),
            delivery: Delivery::new(sink, Duration::from_secs(1)),
            protocol: protocol(report_outcome),
        })
    }

    /// Start a handler on one end of an in-memory pipe, returning the other end
    fn spawn_handler(
        ctx: Arc<SessionContext>,
    ) -> (DuplexStream, tokio::task::JoinHandle<SessionOutcome>) {
        let (client, server) = duplex(64 * 1024);
        let handle = tokio::spawn(handle_connection(server, peer(), ctx));
        (client, handle)
    }

    async fn read_greeting(client: &mut DuplexStream) {
        let mut greeting = [0u8; 1];
        client.read_exact(&mut greeting).await.expect("no greeting");
        assert_eq!(greeting[0], protocol::GREETING);
    }

    #[tokio::test]
    async fn test_payload_is_committed_and_persisted() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = context(sink.clone(), false);
        let (mut client, handle) = spawn_handler(ctx.clone());

        read_greeting(&mut client).await;
        client.write_all(PAYLOAD.as_bytes()).await.unwrap();

        // Server closes without a status byte
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Committed { persisted: true, .. }));

        let latest = ctx.store.latest("ESP32-Sensor1").await.expect("not stored");
        assert_eq!(latest.measurements.lux, 120.5);
        assert_eq!(sink.stored.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_socket_released_before_delivery() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = context(sink.clone(), false);
        let (mut client, server) = duplex(64 * 1024);

        let session = tokio::spawn({
            let ctx = ctx.clone();
            async move { run_session(server, peer(), &ctx).await }
        });

        read_greeting(&mut client).await;
        client.write_all(PAYLOAD.as_bytes()).await.unwrap();

        let closed = session.await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        // Committed and closed, but nothing written to the sink yet
        assert!(ctx.store.latest("ESP32-Sensor1").await.is_some());
        assert_eq!(sink.calls(), 0);

        let outcome = closed.finish(&ctx.delivery).await;
        assert!(matches!(outcome, SessionOutcome::Committed { persisted: true, .. }));
        assert_eq!(sink.calls(), 1);
    }

    #[tokio::test]
    async fn test_payload_split_across_writes() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = context(sink, false);
        let (mut client, handle) = spawn_handler(ctx.clone());

        read_greeting(&mut client).await;
        let (head, tail) = PAYLOAD.as_bytes().split_at(30);
        client.write_all(head).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        client.write_all(tail).await.unwrap();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Committed { .. }));
        assert_eq!(ctx.store.len().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_rejected_without_store_change() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = context(sink.clone(), false);
        let (mut client, handle) = spawn_handler(ctx.clone());

        read_greeting(&mut client).await;
        client
            .write_all(br#"{"Device":"ESP32-Sensor1","IP":"x","LUX":"bright"}"#)
            .await
            .unwrap();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Rejected(_)));
        assert!(ctx.store.is_empty().await);
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn test_noise_is_ignored() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = context(sink, false);
        let (mut client, handle) = spawn_handler(ctx.clone());

        read_greeting(&mut client).await;
        client.write_all(b"ok").await.unwrap();

        assert!(matches!(handle.await.unwrap(), SessionOutcome::Ignored));
        assert!(ctx.store.is_empty().await);
    }

    #[tokio::test]
    async fn test_silent_sensor_times_out() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = context(sink.clone(), false);
        let (mut client, handle) = spawn_handler(ctx.clone());

        read_greeting(&mut client).await;

        // Server closes once the deadline passes
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();

        assert!(matches!(handle.await.unwrap(), SessionOutcome::TimedOut));
        assert!(ctx.store.is_empty().await);
        assert_eq!(sink.calls(), 0);
    }

    #[tokio::test]
    async fn test_hang_up_before_payload() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = context(sink, false);
        let (mut client, handle) = spawn_handler(ctx);

        read_greeting(&mut client).await;
        drop(client);

        assert!(matches!(handle.await.unwrap(), SessionOutcome::Disconnected));
    }

    #[tokio::test]
    async fn test_failing_sink_keeps_store_commit() {
        let sink = Arc::new(RecordingSink::always_failing());
        let ctx = context(sink, false);
        let (mut client, handle) = spawn_handler(ctx.clone());

        read_greeting(&mut client).await;
        client.write_all(PAYLOAD.as_bytes()).await.unwrap();

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, SessionOutcome::Committed { persisted: false, .. }));
        assert!(ctx.store.latest("ESP32-Sensor1").await.is_some());
    }

    #[tokio::test]
    async fn test_status_bytes_when_reporting_outcome() {
        let sink = Arc::new(RecordingSink::new());
        let ctx = context(sink, true);

        let (mut client, handle) = spawn_handler(ctx.clone());
        read_greeting(&mut client).await;
        client.write_all(PAYLOAD.as_bytes()).await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![protocol::STATUS_ACCEPTED]);
        handle.await.unwrap();

        let (mut client, handle) = spawn_handler(ctx);
        read_greeting(&mut client).await;
        client.write_all(b"definitely not json").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, vec![protocol::STATUS_REJECTED]);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_greeting_to_gone_peer_fails() {
        let (client, server) = duplex(1024);
        drop(client);

        let store = ReadingsStore::new();
        let mut session = SensorSession::new(server, peer(), &protocol(false));
        assert_eq!(session.state(), SessionState::Accepted);

        // Writing the greeting to a dropped peer fails
        let result = session.exchange(&store, Duration::from_millis(1)).await;
        assert!(matches!(result, Err(SessionError::Transport(_))));

        session.close().await;
    }
}
