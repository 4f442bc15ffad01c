//! Streaming trace channel
//!
//! Observers connect to an ephemeral port and receive one `Trace` frame per
//! emitted line. Each observer gets a bounded queue drained by its own writer
//! thread; a slow observer loses lines instead of stalling the traced program.

use crate::domain::AgentError;
use crate::util::lock;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use intrace_common::{encode, Message};
use log::{debug, info, warn};
use std::io::Write;
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Frames queued per observer before lines start being dropped
pub const TRACE_QUEUE_DEPTH: usize = 10_000;

type Frame = Arc<[u8]>;

struct TraceObserver {
    id: u64,
    peer: SocketAddr,
    tx: Sender<Frame>,
}

pub struct TraceServer {
    port: u16,
    queue_depth: usize,
    observers: Mutex<Vec<TraceObserver>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
    published: AtomicU64,
    shutdown: AtomicBool,
}

impl TraceServer {
    /// Bind the trace port (0 for ephemeral) and start accepting observers
    ///
    /// # Errors
    /// Returns [`AgentError::Bind`] if the port cannot be bound
    pub fn bind(port: u16) -> Result<Arc<Self>, AgentError> {
        Self::bind_with_queue_depth(port, TRACE_QUEUE_DEPTH)
    }

    /// Like [`bind`](Self::bind) with `queue_depth` frames queued per observer
    ///
    /// # Errors
    /// Returns [`AgentError::Bind`] if the port cannot be bound
    pub fn bind_with_queue_depth(port: u16, queue_depth: usize) -> Result<Arc<Self>, AgentError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| AgentError::Bind { what: "trace", port, source })?;
        let port = listener.local_addr()?.port();

        let server = Arc::new(Self {
            port,
            queue_depth,
            observers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            published: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let accept_server = server.clone();
        thread::Builder::new()
            .name("intrace-trace-accept".to_string())
            .spawn(move || accept_server.accept_loop(&listener))?;

        debug!("Trace server listening on port {port}");
        Ok(server)
    }

    fn accept_loop(&self, listener: &TcpListener) {
        for stream in listener.incoming() {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            match stream {
                Ok(stream) => {
                    if let Err(e) = self.attach(stream) {
                        warn!("Failed to attach trace observer: {e}");
                    }
                }
                Err(e) => warn!("Trace accept failed: {e}"),
            }
        }
        debug!("Trace accept loop finished");
    }

    fn attach(&self, stream: TcpStream) -> std::io::Result<()> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded::<Frame>(self.queue_depth);

        thread::Builder::new()
            .name(format!("intrace-trace-{id}"))
            .spawn(move || write_loop(stream, &rx))?;

        lock(&self.observers).push(TraceObserver { id, peer, tx });
        info!("Trace observer {id} attached from {peer}");
        Ok(())
    }

    /// Queue a line for every attached observer.
    ///
    /// Lines are dropped (and counted) when no observer is attached or an
    /// observer's queue is full.
    pub fn publish(&self, line: &str) {
        let mut observers = lock(&self.observers);
        if observers.is_empty() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let frame: Frame = match encode(&Message::Trace(line.to_string())) {
            Ok(bytes) => bytes.into(),
            Err(e) => {
                warn!("Dropping unencodable trace line: {e}");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        observers.retain(|observer| match observer.tx.try_send(frame.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                info!("Trace observer {} ({}) detached", observer.id, observer.peer);
                false
            }
        });
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.observers).len()
    }

    #[must_use]
    pub fn has_observers(&self) -> bool {
        self.observer_count() > 0
    }

    #[must_use]
    pub fn dropped_lines(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn published_lines(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Stop accepting and detach every observer
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        // Wake the blocking accept
        let _ = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port));
        lock(&self.observers).clear();
    }
}

fn write_loop(mut stream: TcpStream, rx: &Receiver<Frame>) {
    while let Ok(frame) = rx.recv() {
        if let Err(e) = stream.write_all(&frame) {
            debug!("Trace observer write failed: {e}");
            break;
        }
    }
    let _ = stream.shutdown(Shutdown::Both);
}

#[cfg(test)]
mod tests {
    use super::*;
    use intrace_common::read_frame;
    use std::time::{Duration, Instant};

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_lines_without_observers_are_dropped() {
        let server = TraceServer::bind(0).unwrap();
        server.publish("nobody listening");
        assert_eq!(server.dropped_lines(), 1);
        assert_eq!(server.published_lines(), 0);
        server.shutdown();
    }

    #[test]
    fn test_observer_receives_lines_in_order() {
        let server = TraceServer::bind(0).unwrap();
        let mut client = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
        wait_for(|| server.has_observers());

        server.publish("first");
        server.publish("second");

        assert_eq!(read_frame(&mut client).unwrap(), Message::Trace("first".into()));
        assert_eq!(read_frame(&mut client).unwrap(), Message::Trace("second".into()));
        server.shutdown();
    }

    #[test]
    fn test_stalled_observer_loses_lines_but_stays_attached() {
        let server = TraceServer::bind_with_queue_depth(0, 4).unwrap();
        let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
        wait_for(|| server.has_observers());

        // The client never reads, so socket buffers and then the queue fill up
        let line = "x".repeat(64 * 1024);
        for _ in 0..5000 {
            server.publish(&line);
            if server.dropped_lines() > 0 {
                break;
            }
        }

        assert!(server.dropped_lines() > 0);
        assert_eq!(server.observer_count(), 1);
        server.shutdown();
    }

    #[test]
    fn test_shutdown_detaches_observers() {
        let server = TraceServer::bind(0).unwrap();
        let _client = TcpStream::connect((Ipv4Addr::LOCALHOST, server.port())).unwrap();
        wait_for(|| server.has_observers());
        server.shutdown();
        assert_eq!(server.observer_count(), 0);
    }
}
