//! Streamed trace reader
//!
//! Reads `Trace` frames from the agent's trace port on a background thread
//! and appends each line to the [`TraceBufferFilter`]. No filtering happens
//! here; the agent decides what is emitted.

use super::control::CONNECT_TIMEOUT;
use super::filter::TraceBufferFilter;
use crate::domain::ClientError;
use intrace_common::{read_frame, FrameError, Message};
use log::{debug, info};
use std::io::BufReader;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct NetworkTraceReceiver {
    stream: TcpStream,
    closed: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NetworkTraceReceiver {
    /// Connect to the trace port and start forwarding lines
    ///
    /// # Errors
    /// Returns [`ClientError::ConnectFailed`] if the trace port refuses the
    /// connection
    pub fn start(addr: SocketAddr, filter: TraceBufferFilter) -> Result<Self, ClientError> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .map_err(|source| ClientError::ConnectFailed { addr: addr.to_string(), source })?;
        let reader = stream.try_clone()?;
        let closed = Arc::new(AtomicBool::new(false));

        let reader_closed = closed.clone();
        let handle = thread::Builder::new()
            .name("intrace-receiver".to_string())
            .spawn(move || read_loop(reader, &filter, &reader_closed))?;

        info!("Receiving trace from {addr}");
        Ok(Self { stream, closed, handle: Some(handle) })
    }

    /// Stop reading and wait for the reader thread; idempotent
    pub fn disconnect(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NetworkTraceReceiver {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_loop(reader: TcpStream, filter: &TraceBufferFilter, closed: &AtomicBool) {
    let mut reader = BufReader::new(reader);
    loop {
        match read_frame(&mut reader) {
            Ok(Message::Trace(line)) => {
                if filter.append(line).is_err() {
                    break;
                }
            }
            Ok(other) => debug!("Ignoring unexpected frame on trace channel: {other:?}"),
            Err(FrameError::Closed) => break,
            Err(e) => {
                if !closed.load(Ordering::Acquire) {
                    let _ = filter.append_system(format!("Trace connection lost: {e}"));
                }
                break;
            }
        }
    }
    debug!("Trace reader finished");
}
