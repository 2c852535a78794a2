//! Blocking TCP client transport

use crate::core::error::{Error, Result};
use crate::net::frame::{write_frame_blocking, Frame, FrameReader, PUSH_CORRELATION};
use crate::protocol::wire::DataInput;
use crate::protocol::{Channel, Signal};
use crate::server::Invalidation;
use bytes::Bytes;
use dashmap::DashMap;
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

type Pending = DashMap<u32, Sender<Result<Bytes>>>;

/// [`Channel`] over a TCP connection to a repository server.
///
/// Requests may be issued from several threads; a reader thread routes each
/// response to its caller by correlation id and decodes pushed invalidations.
pub struct TcpChannel {
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    pending: Arc<Pending>,
    next_correlation: AtomicU32,
    invalidations: Receiver<Invalidation>,
    closed: Arc<AtomicBool>,
    max_frame_size: usize,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl TcpChannel {
    /// Connect to the server at `addr`
    pub fn connect(addr: impl ToSocketAddrs, max_frame_size: usize) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;

        let pending = Arc::new(Pending::new());
        let closed = Arc::new(AtomicBool::new(false));
        let (pushed, invalidations) = flume::unbounded();

        let reader = {
            let stream = stream.try_clone()?;
            let pending = pending.clone();
            let closed = closed.clone();
            std::thread::Builder::new()
                .name(format!("cdo-client-{}", peer))
                .spawn(move || Self::reader_loop(FrameReader::new(stream, max_frame_size), pending, pushed, closed))?
        };
        debug!(%peer, "connected");

        Ok(Self {
            writer: Mutex::new(stream.try_clone()?),
            stream,
            pending,
            next_correlation: AtomicU32::new(PUSH_CORRELATION + 1),
            invalidations,
            closed,
            max_frame_size,
            reader: Mutex::new(Some(reader)),
        })
    }

    fn reader_loop(
        mut reader: FrameReader<TcpStream>,
        pending: Arc<Pending>,
        pushed: Sender<Invalidation>,
        closed: Arc<AtomicBool>,
    ) {
        loop {
            let frame = match reader.read_next() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    if !closed.load(Ordering::SeqCst) {
                        warn!(error = %err, "connection read failed");
                    }
                    break;
                }
            };

            if frame.correlation == PUSH_CORRELATION {
                if Signal::from_u16(frame.signal) != Some(Signal::Invalidation) {
                    warn!(signal = frame.signal, "unexpected push");
                    break;
                }
                match DataInput::new(frame.payload).read_invalidation() {
                    Ok(event) => {
                        trace!(count = event.ids.len(), "invalidation received");
                        // Nobody listening is fine
                        let _ = pushed.send(event);
                    }
                    Err(err) => {
                        warn!(error = %err, "malformed invalidation");
                        break;
                    }
                }
                continue;
            }

            match pending.remove(&frame.correlation) {
                Some((_, reply)) => {
                    let _ = reply.send(Ok(frame.payload));
                }
                // The caller gave up waiting
                None => debug!(correlation = frame.correlation, "late response dropped"),
            }
        }

        closed.store(true, Ordering::SeqCst);
        let waiting: Vec<u32> = pending.iter().map(|entry| *entry.key()).collect();
        for correlation in waiting {
            if let Some((_, reply)) = pending.remove(&correlation) {
                let _ = reply.send(Err(Error::Closed("connection".to_string())));
            }
        }
        debug!("connection reader finished");
    }
}

/// Take the next request correlation id, skipping the push id on wrap-around
fn next_correlation(counter: &AtomicU32) -> u32 {
    loop {
        let correlation = counter.fetch_add(1, Ordering::Relaxed);
        if correlation != PUSH_CORRELATION {
            return correlation;
        }
    }
}

impl Channel for TcpChannel {
    fn exchange(&self, signal: Signal, payload: Bytes, timeout: Duration) -> Result<Bytes> {
        if self.is_closed() {
            return Err(Error::Closed("connection".to_string()));
        }

        let correlation = next_correlation(&self.next_correlation);
        let (reply, response) = flume::bounded(1);
        self.pending.insert(correlation, reply);
        if self.is_closed() {
            self.pending.remove(&correlation);
            return Err(Error::Closed("connection".to_string()));
        }

        let frame = Frame::new(signal.id(), correlation, payload);
        if let Err(err) = write_frame_blocking(&mut *self.writer.lock(), &frame, self.max_frame_size) {
            self.pending.remove(&correlation);
            return Err(err);
        }

        match response.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                self.pending.remove(&correlation);
                Err(Error::Timeout { millis: timeout.as_millis() as u64 })
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::Closed("connection".to_string())),
        }
    }

    fn invalidations(&self) -> Option<Receiver<Invalidation>> {
        Some(self.invalidations.clone())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Unblocks the reader thread
        let _ = self.stream.shutdown(Shutdown::Both);
        if let Some(reader) = self.reader.lock().take() {
            if reader.join().is_err() {
                warn!("connection reader panicked");
            }
        }
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("peer", &self.stream.peer_addr().ok())
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_wraps_past_the_push_id() {
        let counter = AtomicU32::new(u32::MAX - 1);
        assert_eq!(next_correlation(&counter), u32::MAX - 1);
        assert_eq!(next_correlation(&counter), u32::MAX);
        assert_eq!(next_correlation(&counter), PUSH_CORRELATION + 1);
        assert_eq!(next_correlation(&counter), PUSH_CORRELATION + 2);
    }
}
