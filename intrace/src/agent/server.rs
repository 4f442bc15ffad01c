//! Control server and broadcast registry
//!
//! One accept thread hands each observer connection to its own
//! [`ControlConnection`] thread. The [`ConnectionRegistry`] is the broadcast
//! set: settings, progress and status frames are encoded once and written to
//! every registered connection.

use super::connection::ControlConnection;
use super::AgentShared;
use crate::domain::AgentError;
use crate::util::lock;
use intrace_common::{encode, Message};
use log::{debug, warn};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<Vec<Arc<ControlConnection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn add(&self, connection: Arc<ControlConnection>) {
        lock(&self.connections).push(connection);
    }

    /// Remove a connection from the broadcast set; returns it if it was present
    pub fn remove(&self, id: u64) -> Option<Arc<ControlConnection>> {
        let mut connections = lock(&self.connections);
        let pos = connections.iter().position(|c| c.id() == id)?;
        Some(connections.remove(pos))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.connections).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send one message to every connection except `exclude`.
    ///
    /// Connections whose transport fails are closed and dropped from the set.
    pub fn broadcast(&self, message: &Message, exclude: Option<u64>) {
        let frame = match encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode broadcast: {e}");
                return;
            }
        };

        let mut connections = lock(&self.connections);
        connections.retain(|connection| {
            if Some(connection.id()) == exclude {
                return true;
            }
            match connection.send_encoded(&frame) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Dropping connection {} after failed broadcast: {e}", connection.peer());
                    connection.close();
                    false
                }
            }
        });
    }

    pub fn close_all(&self) {
        for connection in lock(&self.connections).drain(..) {
            connection.close();
        }
    }
}

pub struct ControlServer {
    listener: TcpListener,
    port: u16,
}

impl ControlServer {
    /// Bind the control port on all interfaces (0 for ephemeral)
    ///
    /// # Errors
    /// Returns [`AgentError::Bind`] if the port is unavailable
    pub fn bind(port: u16) -> Result<Self, AgentError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| AgentError::Bind { what: "control", port, source })?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Accept one observer and start serving it.
    ///
    /// Returns `Ok(None)` for the wake-up connection made during shutdown.
    ///
    /// # Errors
    /// Returns the transport error if the accept or connection setup fails
    pub fn accept(&self, shared: &Arc<AgentShared>) -> Result<Option<Arc<ControlConnection>>, AgentError> {
        let (stream, _) = self.listener.accept()?;
        if shared.is_shutting_down() {
            return Ok(None);
        }
        Ok(Some(ControlConnection::start(shared.clone(), stream)?))
    }

    /// Run the accept loop on its own thread until the agent shuts down
    ///
    /// # Errors
    /// Returns the I/O error if the thread cannot be spawned
    pub fn spawn(self, shared: Arc<AgentShared>) -> std::io::Result<JoinHandle<()>> {
        thread::Builder::new().name("intrace-control".to_string()).spawn(move || loop {
            match self.accept(&shared) {
                Ok(Some(connection)) => debug!("Serving control connection {}", connection.id()),
                Ok(None) => break,
                Err(e) if shared.is_shutting_down() => {
                    debug!("Control accept stopped: {e}");
                    break;
                }
                Err(e) => warn!("Control accept failed: {e}"),
            }
        })
    }

    /// Connect out to an observer listening on `port` (callback mode)
    ///
    /// # Errors
    /// Returns [`AgentError::Callback`] if the observer is not listening
    pub fn connect_back(shared: &Arc<AgentShared>, port: u16) -> Result<Arc<ControlConnection>, AgentError> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
            .map_err(|source| AgentError::Callback { port, source })?;
        Ok(ControlConnection::start(shared.clone(), stream)?)
    }
}
