//! Raw SocketCAN transport
//!
//! The socket is non-blocking. A blocking listener task polls it and feeds
//! an mpsc channel, which keeps `recv` cancel-safe. Writes run on the
//! blocking pool and retry while the kernel queue is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use socketcan::{
    CanFrame as SocketFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId,
};
use tokio::sync::mpsc;
use uir_proto::CanFrame;

use crate::config::SocketCanConfig;
use crate::transport::{CanTransport, TransportError};

/// Frames buffered between the listener and the bus task
const INBOUND_QUEUE: usize = 1024;

/// How long a write may wait for room in the kernel TX queue
const WRITE_TIMEOUT: Duration = Duration::from_millis(100);

/// Transport on a raw SocketCAN interface
pub struct SocketCanTransport {
    interface: String,
    socket: Arc<Mutex<CanSocket>>,
    inbound: mpsc::Receiver<Result<CanFrame, TransportError>>,
    running: Arc<AtomicBool>,
}

impl SocketCanTransport {
    pub fn new(config: &SocketCanConfig) -> Result<Self, TransportError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open raw CAN socket on {}: {}",
                config.interface, e
            ))
        })?;

        // Set socket to non-blocking for async operation
        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        tracing::info!(
            interface = %config.interface,
            bitrate = config.bitrate,
            "SocketCAN interface opened (bitrate is set on the link, not by the bridge)"
        );

        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let transport = Self {
            interface: config.interface.clone(),
            socket: Arc::new(Mutex::new(socket)),
            inbound,
            running: Arc::new(AtomicBool::new(true)),
        };
        transport.start_listener(inbound_tx);

        Ok(transport)
    }

    fn start_listener(&self, inbound_tx: mpsc::Sender<Result<CanFrame, TransportError>>) {
        let socket = self.socket.clone();
        let running = self.running.clone();
        let interface = self.interface.clone();

        tokio::task::spawn_blocking(move || {
            while running.load(Ordering::SeqCst) {
                let result = socket.lock().read_frame();
                match result {
                    Ok(frame) => {
                        let Some(frame) = from_socket_frame(&frame) else {
                            tracing::trace!("Skipping error or remote frame");
                            continue;
                        };
                        if inbound_tx.blocking_send(Ok(frame)).is_err() {
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        // Non-blocking socket, no data available
                        std::thread::sleep(Duration::from_millis(1));
                    }
                    Err(e) => {
                        tracing::error!(interface = %interface, error = %e, "SocketCAN read error");
                        let _ = inbound_tx
                            .blocking_send(Err(TransportError::ReceiveFailed(e.to_string())));
                        break;
                    }
                }
            }
            tracing::debug!(interface = %interface, "SocketCAN listener stopped");
        });
    }
}

#[async_trait]
impl CanTransport for SocketCanTransport {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        let frame = to_socket_frame(frame)?;
        let socket = self.socket.clone();

        tokio::task::spawn_blocking(move || write_with_retry(&socket, &frame))
            .await
            .map_err(|e| TransportError::SendFailed(format!("Task join error: {}", e)))?
    }

    async fn recv(&mut self) -> Result<CanFrame, TransportError> {
        self.inbound
            .recv()
            .await
            .unwrap_or(Err(TransportError::ConnectionClosed))
    }

    fn name(&self) -> String {
        format!("socketcan({})", self.interface)
    }
}

impl Drop for SocketCanTransport {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn write_with_retry(socket: &Mutex<CanSocket>, frame: &SocketFrame) -> Result<(), TransportError> {
    let deadline = Instant::now() + WRITE_TIMEOUT;
    loop {
        let result = socket.lock().write_frame(frame);
        match result {
            Ok(()) => return Ok(()),
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock && Instant::now() < deadline =>
            {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(TransportError::SendFailed(e.to_string())),
        }
    }
}

fn to_socket_frame(frame: &CanFrame) -> Result<SocketFrame, TransportError> {
    let id = if frame.is_extended() {
        ExtendedId::new(frame.id()).map(Id::Extended)
    } else {
        u16::try_from(frame.id())
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    }
    .ok_or_else(|| TransportError::InvalidFrame(format!("CAN ID 0x{:X} out of range", frame.id())))?;

    <SocketFrame as EmbeddedFrame>::new(id, frame.data()).ok_or_else(|| {
        TransportError::InvalidFrame(format!("{} data bytes do not fit a frame", frame.len()))
    })
}

fn from_socket_frame(frame: &SocketFrame) -> Option<CanFrame> {
    if Frame::is_error_frame(frame) || EmbeddedFrame::is_remote_frame(frame) {
        return None;
    }
    let data = EmbeddedFrame::data(frame);
    let frame = match EmbeddedFrame::id(frame) {
        Id::Extended(id) => CanFrame::new_extended(id.as_raw(), data),
        Id::Standard(id) => CanFrame::new_standard(u32::from(id.as_raw()), data),
    };
    frame.ok()
}
