//! TCP server: one [`ServerProtocol`] per connection

use crate::core::config::ServerConfig;
use crate::core::error::{Error, Result};
use crate::net::frame::{read_frame, write_frame, Frame, PUSH_CORRELATION};
use crate::protocol::wire::DataOutput;
use crate::protocol::{ServerProtocol, Signal};
use crate::server::{Invalidation, Repository};
use crate::system::Metrics;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Serves the repository protocol over TCP
pub struct TcpServer {
    repository: Arc<Repository>,
    config: ServerConfig,
    connections: Arc<Semaphore>,
}

impl TcpServer {
    /// Create a server for `repository`
    pub fn new(repository: Arc<Repository>, config: ServerConfig) -> Self {
        let connections = Arc::new(Semaphore::new(config.max_connections));
        Self { repository, config, connections }
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("Repository server listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Bind the configured address and serve until `shutdown` completes
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` completes
    pub async fn serve(&self, listener: TcpListener, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Repository server stopping");
                    self.connections.close();
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    self.spawn_connection(stream, peer);
                }
            }
        }
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match self.connections.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(%peer, max = self.config.max_connections, "connection limit reached, rejecting");
                return;
            }
        };
        Metrics::global().network.connections_accepted.inc();
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%peer, error = %err, "could not disable nagle");
        }

        let repository = self.repository.clone();
        let max_frame_size = self.config.max_frame_size;
        tokio::spawn(async move {
            match handle_connection(stream, peer, repository, max_frame_size).await {
                Ok(()) => debug!(%peer, "connection closed"),
                Err(err) => warn!(%peer, error = %err, "connection closed with error"),
            }
            drop(permit);
        });
    }
}

#[instrument(skip(stream, repository))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    repository: Arc<Repository>,
    max_frame_size: usize,
) -> Result<()> {
    let (mut reader, mut writer) = stream.into_split();
    let (frames, mut outgoing) = mpsc::unbounded_channel::<Frame>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if let Err(err) = write_frame(&mut writer, &frame, max_frame_size).await {
                debug!(error = %err, "write failed");
                break;
            }
            Metrics::global().network.frames_sent.inc();
        }
    });

    let protocol = Arc::new(Mutex::new(ServerProtocol::new(repository)));
    let mut forwarder: Option<JoinHandle<()>> = None;

    let outcome = loop {
        let frame = match read_frame(&mut reader, max_frame_size).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break Ok(()),
            Err(err) => break Err(err),
        };
        Metrics::global().network.frames_received.inc();

        let Frame { signal, correlation, payload } = frame;
        let worker = protocol.clone();
        let dispatched = tokio::task::spawn_blocking(move || worker.lock().dispatch(signal, payload)).await;
        let response = match dispatched {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                Metrics::global().network.protocol_errors.inc();
                break Err(err);
            }
            Err(err) => {
                error!(error = %err, "request worker failed");
                break Err(Error::internal(format!("request worker failed: {}", err)));
            }
        };

        if forwarder.is_none() {
            if let Some(invalidations) = protocol.lock().take_invalidations() {
                forwarder = Some(tokio::spawn(forward_invalidations(invalidations, frames.clone())));
            }
        }
        if frames.send(Frame::new(signal, correlation, response)).is_err() {
            break Ok(());
        }
    };

    protocol.lock().close();
    if let Some(forwarder) = forwarder {
        forwarder.abort();
    }
    drop(frames);
    let _ = writer_task.await;
    outcome
}

async fn forward_invalidations(invalidations: flume::Receiver<Invalidation>, frames: mpsc::UnboundedSender<Frame>) {
    while let Ok(event) = invalidations.recv_async().await {
        let mut output = DataOutput::new();
        output.write_invalidation(&event);
        let frame = Frame::new(Signal::Invalidation.id(), PUSH_CORRELATION, output.freeze());
        if frames.send(frame).is_err() {
            break;
        }
    }
}
