//! TCP accept loop
//!
//! Accepts sensor connections and hands each one to its own task. The number
//! of live handlers is capped by a semaphore: once every permit is taken the
//! loop stops accepting and new sensors wait in the kernel backlog.

use crate::session::{run_session, SessionContext};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

pub struct Listener {
    inner: TcpListener,
    permits: Arc<Semaphore>,
    ctx: Arc<SessionContext>,
}

impl Listener {
    /// Bind `addr`, allowing at most `max_connections` concurrent handlers
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        max_connections: usize,
        ctx: Arc<SessionContext>,
    ) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;

        Ok(Self {
            inner,
            permits: Arc::new(Semaphore::new(max_connections.max(1))),
            ctx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Accept forever; returns only on a fatal accept error
    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accept until `shutdown` resolves
    ///
    /// Handlers already running are left to finish on their own.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Ok(()),
                },
                _ = &mut shutdown => break,
            };

            let (socket, peer) = tokio::select! {
                accepted = self.inner.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) if is_transient(&e) => {
                        warn!("Accept failed, continuing: {}", e);
                        continue;
                    }
                    Err(e) => {
                        error!("Accept failed: {}", e);
                        return Err(e);
                    }
                },
                _ = &mut shutdown => break,
            };

            info!("[{}] Connection accepted", peer);
            if let Err(e) = socket.set_nodelay(true) {
                debug!("[{}] Could not set TCP_NODELAY: {}", peer, e);
            }

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                let closed = run_session(socket, peer, &ctx).await;
                // Slot is released with the socket, before the durable write
                drop(permit);

                let outcome = closed.finish(&ctx.delivery).await;
                debug!("[{}] Session finished: {:?}", peer, outcome);
            });
        }

        info!("Listener stopped accepting connections");
        Ok(())
    }
}

/// Accept errors caused by one misbehaving peer rather than the listener
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
