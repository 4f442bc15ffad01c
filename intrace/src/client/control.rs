//! Observer-side control channel
//!
//! Strictly half-duplex: one command out, then its reply back. Pushed frames
//! (settings snapshots, pass progress, unit counts) arrive interleaved with
//! replies, so a reader thread routes them to a [`ControlListener`] and only
//! queues text replies for [`ControlChannel::get_message`]. A command-set
//! reply (to `help`) is queued as one token per line.

use crate::domain::{ClientError, PassProgress, UnitCounts};
use crate::util::lock;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use intrace_common::{read_frame, write_frame, FrameError, Message, GET_SETTINGS};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How long a send waits for an unconsumed reply to the previous command
pub const STALE_REPLY_WAIT: Duration = Duration::from_secs(2);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connect failed or the transport dropped during a session
    DisconnectedErr,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::DisconnectedErr => "Disconnected (error)",
        };
        f.write_str(label)
    }
}

/// Receives frames the agent pushes outside the request/reply exchange
pub trait ControlListener: Send + Sync {
    fn settings(&self, settings: &BTreeMap<String, String>);
    fn progress(&self, progress: PassProgress);
    fn status(&self, counts: UnitCounts);
    /// `None` after an explicit disconnect, otherwise the transport error
    fn disconnected(&self, error: Option<String>);
}

pub struct ControlChannel {
    writer: Mutex<TcpStream>,
    control: TcpStream,
    peer: SocketAddr,
    replies: Receiver<String>,
    awaiting: AtomicBool,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ControlChannel {
    /// Connect to an agent's control port
    ///
    /// # Errors
    /// Returns [`ClientError::ConnectFailed`] if no address accepts the connection
    pub fn connect(addr: &str, listener: Arc<dyn ControlListener>) -> Result<Self, ClientError> {
        let connect_failed = |source| ClientError::ConnectFailed { addr: addr.to_string(), source };
        let mut last_error = None;
        for candidate in addr.to_socket_addrs().map_err(connect_failed)? {
            match TcpStream::connect_timeout(&candidate, CONNECT_TIMEOUT) {
                Ok(stream) => return Self::from_stream(stream, listener),
                Err(e) => last_error = Some(e),
            }
        }
        Err(connect_failed(last_error.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "address did not resolve")
        })))
    }

    /// Serve an established stream (also used for agent callbacks)
    ///
    /// # Errors
    /// Returns the I/O error if the socket cannot be configured
    pub fn from_stream(stream: TcpStream, listener: Arc<dyn ControlListener>) -> Result<Self, ClientError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let closed = Arc::new(AtomicBool::new(false));
        let (reply_tx, replies) = unbounded();

        let reader_closed = closed.clone();
        let reader = thread::Builder::new()
            .name("intrace-control-reader".to_string())
            .spawn(move || read_loop(reader, &reply_tx, listener.as_ref(), &reader_closed))?;

        Ok(Self {
            writer: Mutex::new(stream),
            control,
            peer,
            replies,
            awaiting: AtomicBool::new(false),
            closed,
            reader: Mutex::new(Some(reader)),
        })
    }

    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one command.
    ///
    /// Replies left over from the previous exchange are awaited (bounded by
    /// [`STALE_REPLY_WAIT`]) and discarded first.
    ///
    /// # Errors
    /// Returns [`ClientError::NotConnected`] after disconnect, or the
    /// transport error
    pub fn send_message(&self, command: &str) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::NotConnected);
        }
        if self.awaiting.swap(false, Ordering::AcqRel) {
            match self.replies.recv_timeout(STALE_REPLY_WAIT) {
                Ok(stale) => debug!("Discarding stale reply: {stale}"),
                Err(RecvTimeoutError::Timeout) => debug!("No reply to previous command"),
                Err(RecvTimeoutError::Disconnected) => return Err(ClientError::ChannelClosed),
            }
        }
        while let Ok(stale) = self.replies.try_recv() {
            debug!("Discarding stale reply: {stale}");
        }

        write_frame(&mut *lock(&self.writer), &Message::Text(command.to_string()))?;
        // getsettings is answered by the settings broadcast, not a text reply
        if command != GET_SETTINGS {
            self.awaiting.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Block until the reply to the most recent command arrives
    ///
    /// # Errors
    /// Returns [`ClientError::ChannelClosed`] if the transport fails first
    pub fn get_message(&self) -> Result<String, ClientError> {
        let reply = self.replies.recv().map_err(|_| ClientError::ChannelClosed)?;
        self.awaiting.store(false, Ordering::Release);
        Ok(reply)
    }

    /// Send a command and wait for its reply
    ///
    /// # Errors
    /// See [`send_message`](Self::send_message) and [`get_message`](Self::get_message)
    pub fn request(&self, command: &str) -> Result<String, ClientError> {
        self.send_message(command)?;
        self.get_message()
    }

    /// Close the transport and wait for the reader thread; safe to call
    /// more than once.
    ///
    /// The listener has seen its last callback once this returns.
    pub fn disconnect(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.control.shutdown(Shutdown::Both);
        }
        let handle = lock(&self.reader).take();
        if let Some(handle) = handle {
            // A listener callback may itself disconnect; never join our own thread
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_loop(reader: TcpStream, replies: &Sender<String>, listener: &dyn ControlListener, closed: &AtomicBool) {
    let mut reader = BufReader::new(reader);
    let error = loop {
        match read_frame(&mut reader) {
            Ok(Message::Text(text)) => {
                let _ = replies.send(text);
            }
            Ok(Message::Commands(tokens)) => {
                let _ = replies.send(tokens.join("\n"));
            }
            Ok(Message::Settings(map)) => listener.settings(&map),
            Ok(Message::Progress { processed, total, done }) => {
                listener.progress(PassProgress { processed, total, done });
            }
            Ok(Message::Status { instrumented, total }) => listener.status(UnitCounts { instrumented, total }),
            Ok(Message::Trace(line)) => debug!("Trace line on control channel: {line}"),
            Err(FrameError::Closed) => break "Connection closed by agent".to_string(),
            Err(e) => break e.to_string(),
        }
    };

    if closed.swap(true, Ordering::AcqRel) {
        listener.disconnected(None);
    } else {
        warn!("Control channel lost: {error}");
        listener.disconnected(Some(error));
    }
}
