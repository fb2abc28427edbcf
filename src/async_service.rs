//! Async front end using tokio.
//!
//! Resolution itself is blocking (store reads, CPU-bound diffing), so it
//! runs on tokio's blocking pool while connections are handled on the
//! async runtime.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Semaphore;

use crate::error::{BuildSyncError, Result};
use crate::protocol::{self, read_message_async, write_message_async, Message};
use crate::request::{BuildRequest, BuildResponse};
use crate::service::BuildResolver;

/// Async wrapper around a [`BuildResolver`].
#[derive(Debug)]
pub struct AsyncBuildService<R: ?Sized> {
    idle_timeout: Option<Duration>,
    resolver: Arc<R>,
}

impl<R: ?Sized> Clone for AsyncBuildService<R> {
    fn clone(&self) -> Self {
        Self {
            idle_timeout: self.idle_timeout,
            resolver: Arc::clone(&self.resolver),
        }
    }
}

impl<R: BuildResolver + 'static> AsyncBuildService<R> {
    /// Wrap a resolver.
    #[must_use]
    pub fn new(resolver: R) -> Self {
        Self::from_arc(Arc::new(resolver))
    }
}

impl<R: BuildResolver + ?Sized + 'static> AsyncBuildService<R> {
    /// Wrap a shared resolver.
    #[must_use]
    pub fn from_arc(resolver: Arc<R>) -> Self {
        Self {
            idle_timeout: None,
            resolver,
        }
    }

    /// Close connections whose next message does not arrive in full within
    /// `timeout`. Without one, an idle peer holds its connection slot until
    /// it disconnects.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Configured idle timeout, if any.
    #[must_use]
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// The wrapped resolver.
    #[must_use]
    pub fn resolver(&self) -> &Arc<R> {
        &self.resolver
    }

    /// Resolve a request on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns the resolver's error, or `Internal` if the task panicked.
    pub async fn get_latest_build(&self, request: BuildRequest) -> Result<BuildResponse> {
        let resolver = Arc::clone(&self.resolver);
        tokio::task::spawn_blocking(move || resolver.get_latest_build(&request))
            .await
            .map_err(|e| BuildSyncError::Internal(format!("resolution task failed: {e}")))?
    }

    /// Produce the reply to one message on the blocking pool.
    pub async fn respond(&self, message: Message) -> Message {
        let resolver = Arc::clone(&self.resolver);
        tokio::task::spawn_blocking(move || protocol::respond(&*resolver, message))
            .await
            .unwrap_or_else(|e| {
                Message::from_error(&BuildSyncError::Internal(format!(
                    "resolution task failed: {e}"
                )))
            })
    }

    /// Serve messages on one connection until the peer closes it or stays
    /// silent past the idle timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or carries a malformed frame.
    pub async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let next = read_message_async(&mut stream);
            let read = match self.idle_timeout {
                Some(limit) => {
                    if let Ok(read) = tokio::time::timeout(limit, next).await {
                        read
                    } else {
                        tracing::debug!(timeout = ?limit, "closing idle connection");
                        return Ok(());
                    }
                }
                None => next.await,
            };
            let message = match read {
                Ok(message) => message,
                Err(BuildSyncError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let reply = self.respond(message).await;
            write_message_async(&mut stream, &reply).await?;
        }
    }

    /// Accept connections forever.
    ///
    /// # Errors
    ///
    /// See [`AsyncBuildService::serve_until`].
    pub async fn serve(&self, listener: TcpListener, max_connections: usize) -> Result<()> {
        self.serve_until(listener, max_connections, std::future::pending())
            .await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// At most `max_connections` connections are served at once; further
    /// peers wait in the listen backlog. Connections already accepted keep
    /// running after shutdown until their peer disconnects.
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the connection limiter is closed.
    pub async fn serve_until<F>(
        &self,
        listener: TcpListener,
        max_connections: usize,
        shutdown: F,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(max_connections.max(1)));
        tracing::info!(
            addr = ?listener.local_addr().ok(),
            max_connections,
            "serving latest-build requests"
        );

        tokio::pin!(shutdown);
        loop {
            let permit = tokio::select! {
                () = &mut shutdown => break,
                permit = Arc::clone(&permits).acquire_owned() => permit
                    .map_err(|e| BuildSyncError::Internal(e.to_string()))?,
            };
            let (stream, peer) = tokio::select! {
                () = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let service = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                tracing::debug!(%peer, "connection opened");
                match service.handle_connection(stream).await {
                    Ok(()) => tracing::debug!(%peer, "connection closed"),
                    Err(e) => tracing::warn!(%peer, error = %e, "connection failed"),
                }
            });
        }

        tracing::info!("server shut down");
        Ok(())
    }
}

/// Ask a server for the latest build over one TCP connection.
///
/// # Errors
///
/// Returns `Remote` for a server-side error, or an I/O or protocol error if
/// the exchange fails.
pub async fn fetch_latest_build<A: ToSocketAddrs>(
    addr: A,
    request: &BuildRequest,
) -> Result<BuildResponse> {
    let mut stream = TcpStream::connect(addr).await?;
    write_message_async(&mut stream, &Message::GetLatestBuild(request.clone())).await?;
    read_message_async(&mut stream).await?.into_response()
}
