use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::dispatch::Dispatcher;
use crate::protocol::{read_frame, write_frame, ProtocolError, Request, Response};
use crate::utils::shutdown::wait_for_stop;

/// Pause after a failed `accept` so a persistent error (e.g. out of file
/// descriptors) does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Server<B: Backend> {
    listener: TcpListener,
    dispatcher: Arc<Dispatcher<B>>,
    max_frame_size: usize,
    shutdown_grace: Duration,
}

impl<B: Backend> Server<B> {
    pub async fn bind(
        addr: &str,
        dispatcher: Arc<Dispatcher<B>>,
        max_frame_size: usize,
        shutdown_grace: Duration,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            dispatcher,
            max_frame_size,
            shutdown_grace,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` turns true, then release the
    /// listener and give live connections `shutdown_grace` to wind down.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) {
        let Server {
            listener,
            dispatcher,
            max_frame_size,
            shutdown_grace,
        } = self;
        let mut connections = JoinSet::new();
        let conn_shutdown = shutdown.clone();

        loop {
            tokio::select! {
                _ = wait_for_stop(&mut shutdown) => break,
                accepted = listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        info!("New connection from {}", peer);
                        if let Err(e) = socket.set_nodelay(true) {
                            debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
                        }
                        let dispatcher = Arc::clone(&dispatcher);
                        let conn_shutdown = conn_shutdown.clone();
                        connections.spawn(async move {
                            let closed = handle_connection(
                                socket,
                                peer,
                                dispatcher,
                                max_frame_size,
                                conn_shutdown,
                            )
                            .await;
                            match closed {
                                Ok(()) => info!("Connection from {} closed", peer),
                                Err(e) => {
                                    warn!("Connection from {} closed with error: {}", peer, e)
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        error!("Connection task failed: {}", e);
                    }
                }
            }
        }

        drop(listener);
        info!("Stopped accepting, closing {} live connections", connections.len());

        let drained = tokio::time::timeout(shutdown_grace, async {
            while let Some(finished) = connections.join_next().await {
                if let Err(e) = finished {
                    error!("Connection task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "Aborting {} connections still busy after {:?}",
                connections.len(),
                shutdown_grace
            );
            connections.shutdown().await;
        }
    }
}

async fn send<S>(stream: &mut S, response: &Response) -> Result<(), ProtocolError>
where
    S: AsyncWrite + Unpin,
{
    write_frame(stream, &response.encode()?).await
}

/// Read, dispatch and answer frames in arrival order until the peer goes
/// away, a fatal protocol error occurs, or shutdown is signalled.
pub async fn handle_connection<S, B>(
    mut stream: S,
    peer: SocketAddr,
    dispatcher: Arc<Dispatcher<B>>,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    B: Backend,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = wait_for_stop(&mut shutdown) => {
                debug!("Closing connection from {} for shutdown", peer);
                return Ok(());
            }
            frame = read_frame(&mut stream, max_frame_size) => frame,
        };

        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("Client {} disconnected", peer);
                return Ok(());
            }
            Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                warn!("Rejecting frame from {}: {}", peer, e);
                send(&mut stream, &Response::error(e.to_string())).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let response = match Request::decode(&payload) {
            Ok(request) => dispatcher.dispatch(request).await,
            Err(e) if e.keeps_connection() => {
                warn!("Bad request from {}: {}", peer, e);
                Response::error(e.to_string())
            }
            Err(e) => {
                send(&mut stream, &Response::error(e.to_string())).await?;
                return Err(e);
            }
        };
        send(&mut stream, &response).await?;
    }
}
