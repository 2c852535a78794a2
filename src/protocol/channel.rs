//! Request transport between a client session and the repository
//!
//! [`Channel`] carries encoded requests and responses. [`LocalChannel`]
//! serves them in-process: a worker thread bound to the session owns the
//! server end of the protocol and handles one request at a time.

use crate::core::error::{Error, Result};
use crate::protocol::indications::ServerProtocol;
use crate::protocol::signals::Signal;
use crate::server::{Invalidation, Repository};
use bytes::Bytes;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Transport of one client session
pub trait Channel: Send + Sync {
    /// Send one request and wait at most `timeout` for the raw response
    fn exchange(&self, signal: Signal, payload: Bytes, timeout: Duration) -> Result<Bytes>;

    /// Invalidations pushed by the repository, available once the session is open
    fn invalidations(&self) -> Option<Receiver<Invalidation>>;

    /// Whether the channel was closed by either side
    fn is_closed(&self) -> bool;

    /// Close the channel; the server closes the session
    fn close(&self);
}

struct Envelope {
    signal: Signal,
    payload: Bytes,
    reply: Sender<Result<Bytes>>,
}

static NEXT_WORKER: AtomicUsize = AtomicUsize::new(1);

/// In-process channel to a repository
pub struct LocalChannel {
    requests: Mutex<Option<Sender<Envelope>>>,
    invalidations: Arc<Mutex<Option<Receiver<Invalidation>>>>,
    closed: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LocalChannel {
    /// Connect to `repository`, starting the session worker
    pub fn connect(repository: Arc<Repository>) -> Result<Self> {
        let (sender, receiver) = flume::unbounded::<Envelope>();
        let invalidations = Arc::new(Mutex::new(None));
        let closed = Arc::new(AtomicBool::new(false));

        let worker = {
            let invalidations = invalidations.clone();
            let closed = closed.clone();
            std::thread::Builder::new()
                .name(format!("cdo-session-{}", NEXT_WORKER.fetch_add(1, Ordering::Relaxed)))
                .spawn(move || Self::worker_loop(ServerProtocol::new(repository), receiver, invalidations, closed))?
        };

        Ok(Self {
            requests: Mutex::new(Some(sender)),
            invalidations,
            closed,
            worker: Mutex::new(Some(worker)),
        })
    }

    fn worker_loop(
        mut protocol: ServerProtocol,
        requests: Receiver<Envelope>,
        invalidations: Arc<Mutex<Option<Receiver<Invalidation>>>>,
        closed: Arc<AtomicBool>,
    ) {
        for envelope in requests.iter() {
            match protocol.dispatch(envelope.signal.id(), envelope.payload) {
                Ok(response) => {
                    if let Some(receiver) = protocol.take_invalidations() {
                        *invalidations.lock() = Some(receiver);
                    }
                    // The client may have timed out and gone
                    let _ = envelope.reply.send(Ok(response));
                }
                Err(err) => {
                    warn!(error = %err, "session worker stopping");
                    closed.store(true, Ordering::SeqCst);
                    let _ = envelope.reply.send(Err(err));
                    break;
                }
            }
        }
        protocol.close();
        debug!("session worker finished");
    }
}

impl Channel for LocalChannel {
    fn exchange(&self, signal: Signal, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::Closed("channel".to_string()));
        }
        let sender = self
            .requests
            .lock()
            .clone()
            .ok_or_else(|| Error::Closed("channel".to_string()))?;

        let (reply, response) = flume::bounded(1);
        sender
            .send(Envelope { signal, payload, reply })
            .map_err(|_| Error::Closed("session worker".to_string()))?;

        match response.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout { millis: timeout.as_millis() as u64 }),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed("session worker".to_string())),
        }
    }

    fn invalidations(&self) -> Option<Receiver<Invalidation>> {
        self.invalidations.lock().clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.requests.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("session worker panicked");
            }
        }
    }
}

impl Drop for LocalChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LocalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalChannel").field("closed", &self.is_closed()).finish()
    }
}
