//! Client side of the world protocol.
//!
//! A background task decodes [`ServerPacket`]s into a queue that
//! [`GameClient::recv`] drains. The connection state lives in a [`watch`]
//! channel so callers can await a transition instead of polling.

use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, warn};

use crate::codec::{ReadPacketError, read_packet, write_packet};
use crate::framing::{FrameConfig, FrameError};
use crate::packets::{ClientPacket, ServerPacket};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// The server closed the socket, sent a disconnect message, or the
    /// client hung up.
    Disconnected,
}

/// A live session with a world server. Created by [`GameClient::connect`].
pub struct GameClient {
    writer: Mutex<OwnedWriteHalf>,
    incoming: mpsc::UnboundedReceiver<ServerPacket>,
    state: watch::Sender<ConnectionState>,
    frame: FrameConfig,
    stop: watch::Sender<bool>,
}

impl GameClient {
    pub async fn connect(addr: SocketAddr, frame: FrameConfig) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        debug!(%addr, "Connected to world server");

        let (reader, writer) = stream.into_split();
        let (state, _) = watch::channel(ConnectionState::Connected);
        let (stop, stop_rx) = watch::channel(false);
        let (queue, incoming) = mpsc::unbounded_channel();

        tokio::spawn(read_loop(
            reader,
            queue,
            state.clone(),
            frame.clone(),
            stop_rx,
        ));

        Ok(Self {
            writer: Mutex::new(writer),
            incoming,
            state,
            frame,
            stop,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every later state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Writes one packet. A failed write marks the connection disconnected.
    pub async fn send(&self, packet: &ClientPacket) -> Result<(), FrameError> {
        let mut writer = self.writer.lock().await;
        write_packet(&mut *writer, packet, &self.frame)
            .await
            .inspect_err(|_| {
                self.state.send_replace(ConnectionState::Disconnected);
            })
    }

    /// Next packet from the server. `None` once the reader has stopped and
    /// the queue is drained.
    pub async fn recv(&mut self) -> Option<ServerPacket> {
        self.incoming.recv().await
    }

    pub fn disconnect(&self) {
        self.stop.send_replace(true);
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    queue: mpsc::UnboundedSender<ServerPacket>,
    state: watch::Sender<ConnectionState>,
    frame: FrameConfig,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let packet = tokio::select! {
            result = read_packet::<_, ServerPacket>(&mut reader, &frame) => result,
            _ = stop.wait_for(|stopped| *stopped) => return,
        };
        match packet {
            Ok(ServerPacket::DisconnectMessage { reason }) => {
                info!("Disconnected by server: {reason}");
                let _ = queue.send(ServerPacket::DisconnectMessage { reason });
                break;
            }
            Ok(packet) => {
                if queue.send(packet).is_err() {
                    break;
                }
            }
            Err(ReadPacketError::Frame(FrameError::ConnectionClosed)) => {
                debug!("Server closed the connection");
                break;
            }
            Err(e) => {
                warn!("Dropping connection after read error: {e}");
                break;
            }
        }
    }
    state.send_replace(ConnectionState::Disconnected);
}
