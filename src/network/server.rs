//! Split Server
//!
//! Accept loop over TCP. Each connection gets its own task, bounded by a
//! connection semaphore. A shutdown signal stops accepting; connections
//! already in flight are drained before `serve` returns.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::network::http::{read_request, write_response, HttpError, Response};
use crate::network::router::Router;
use crate::DEFAULT_PORT;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Directory holding the category directories.
    pub root: PathBuf,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for a client to send its request.
    pub read_timeout: Duration,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            root: PathBuf::from("."),
            max_connections: 1024,
            read_timeout: Duration::from_secs(30),
            max_body_bytes: 1024 * 1024,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server errors.
#[derive(Debug, thiserror::Error)]
pub enum SplitServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// The split server.
pub struct SplitServer {
    /// Server configuration.
    config: ServerConfig,
    /// Request router.
    router: Arc<Router>,
    /// One permit per open connection.
    connections: Arc<Semaphore>,
    /// Total permits in `connections`.
    permits: usize,
    /// Shutdown signal.
    shutdown_tx: watch::Sender<bool>,
}

impl SplitServer {
    /// Create a new server.
    pub fn new(config: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let permits = config.max_connections.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize));

        Self {
            router: Arc::new(Router::new(config.root.clone())),
            connections: Arc::new(Semaphore::new(permits)),
            permits,
            shutdown_tx,
            config,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), SplitServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SplitServerError> {
        info!(
            "Split server v{} listening on {} (root {})",
            self.config.version,
            listener.local_addr()?,
            self.config.root.display()
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            let (stream, addr) = tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            continue;
                        }
                    }
                }
                _ = shutdown_rx.changed() => continue,
            };

            // At the limit, wait for a running connection to finish.
            let permit = self
                .connections
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| SplitServerError::Internal("connection semaphore closed".into()))?;

            debug!("New connection from {}", addr);
            self.handle_connection(stream, addr, permit);
        }

        info!("Shutdown signal received, draining connections");
        drop(listener);

        // Every permit back means every connection task has finished.
        let _ = self
            .connections
            .acquire_many(self.permits as u32)
            .await;

        info!("Split server stopped");
        Ok(())
    }

    /// Handle a new connection on its own task.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, permit: OwnedSemaphorePermit) {
        let router = self.router.clone();
        let read_timeout = self.config.read_timeout;
        let max_body_bytes = self.config.max_body_bytes;

        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = serve_connection(stream, &router, read_timeout, max_body_bytes).await {
                debug!("Connection {} dropped: {}", addr, e);
            }
        });
    }

    /// Stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Number of connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.permits - self.connections.available_permits()
    }
}

/// Read one request, route it, and write the response.
///
/// Oversized bodies get 413 and unsupported transfer codings get 501;
/// other requests that cannot be decoded are dropped without a response.
async fn serve_connection(
    stream: TcpStream,
    router: &Router,
    read_timeout: Duration,
    max_body_bytes: usize,
) -> Result<(), HttpError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let request = match timeout(read_timeout, read_request(&mut reader, max_body_bytes)).await {
        Err(_) => return Err(HttpError::Timeout),
        Ok(Err(e)) => match e.rejection() {
            Some((status, protocol)) => {
                warn!("Rejected request: {}", e);
                write_response(&mut write_half, &Response::new(status), &protocol).await?;
                write_half.shutdown().await?;
                return Ok(());
            }
            None => return Err(e),
        },
        Ok(Ok(request)) => request,
    };

    let response = router.handle(&request).await;
    debug!("{} {} -> {}", request.method, request.target, response.status);

    write_response(&mut write_half, &response, &request.protocol).await?;
    write_half.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 60000);
        assert!(config.bind_addr.ip().is_unspecified());
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.root, PathBuf::from("."));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SplitServer::new(ServerConfig::default());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_before_serve_returns() {
        let server = SplitServer::new(ServerConfig::default());
        server.shutdown();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), server.serve(listener))
            .await
            .expect("serve did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_zero_connection_limit_still_serves() {
        let config = ServerConfig {
            max_connections: 0,
            ..Default::default()
        };
        let server = SplitServer::new(config);
        server.shutdown();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.serve(listener).await.unwrap();
    }
}
