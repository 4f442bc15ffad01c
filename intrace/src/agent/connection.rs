//! Per-observer control session
//!
//! Each connection runs a read loop on its own thread: receive one command
//! frame, dispatch it against the shared agent state, reply, repeat. Writes
//! (replies and broadcasts from other threads) serialize on the writer lock.

use super::commands::Reply;
use super::AgentShared;
use crate::util::lock;
use intrace_common::{read_frame, write_frame, Command, FrameError, Message, REPLY_OK};
use log::{debug, info, warn};
use std::io::{self, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// A stalled observer is dropped once a write blocks this long
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ControlConnection {
    id: u64,
    peer: SocketAddr,
    writer: Mutex<TcpStream>,
    // Unlocked handle so close() never waits behind a blocked write
    control: TcpStream,
}

impl ControlConnection {
    /// Register the connection for broadcasts and start its read loop
    ///
    /// # Errors
    /// Returns the I/O error if the socket cannot be configured or the
    /// thread cannot be spawned
    pub fn start(shared: Arc<AgentShared>, stream: TcpStream) -> io::Result<Arc<Self>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;

        let id = shared.registry.next_id();
        let connection = Arc::new(Self { id, peer, writer: Mutex::new(stream), control });
        shared.registry.add(connection.clone());

        eprintln!("## Connected to: {peer}");
        info!("Control connection {id} from {peer}");

        let serving = connection.clone();
        let spawned = thread::Builder::new()
            .name(format!("intrace-conn-{id}"))
            .spawn(move || serving.serve(&shared, reader));
        if let Err(e) = spawned {
            connection.close();
            return Err(e);
        }
        Ok(connection)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// # Errors
    /// Returns the transport or encoding error
    pub fn send(&self, message: &Message) -> Result<(), FrameError> {
        write_frame(&mut *lock(&self.writer), message)
    }

    /// Write an already encoded frame
    ///
    /// # Errors
    /// Returns the transport error
    pub fn send_encoded(&self, frame: &[u8]) -> io::Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_all(frame)?;
        writer.flush()
    }

    pub fn close(&self) {
        let _ = self.control.shutdown(Shutdown::Both);
    }

    fn serve(&self, shared: &Arc<AgentShared>, reader: TcpStream) {
        let mut reader = BufReader::new(reader);
        loop {
            match read_frame(&mut reader) {
                Ok(Message::Text(command)) => {
                    if let Err(e) = self.handle(shared, &command) {
                        debug!("Reply to {} failed: {e}", self.peer);
                        break;
                    }
                }
                Ok(other) => debug!("Ignoring unexpected frame from {}: {other:?}", self.peer),
                Err(FrameError::Closed) => break,
                Err(e) => {
                    warn!("Control connection {} failed: {e}", self.peer);
                    break;
                }
            }
        }

        shared.remove_connection(self.id);
        self.close();
        eprintln!("## Disconnected from: {}", self.peer);
        info!("Control connection {} closed", self.id);
    }

    fn handle(&self, shared: &AgentShared, command: &str) -> Result<(), FrameError> {
        debug!("Command from {}: {command}", self.peer);
        match shared.dispatch(Command::parse(command)) {
            // The settings broadcast already reached this connection
            Reply::Broadcast => Ok(()),
            Reply::Commands(tokens) => self.send(&Message::Commands(tokens)),
            Reply::Lines(lines) if lines.is_empty() => self.send(&Message::Text(REPLY_OK.to_string())),
            Reply::Lines(lines) => {
                for line in lines {
                    self.send(&Message::Text(line))?;
                }
                Ok(())
            }
        }
    }
}
