//! TCP server for accepting client connections and dispatching their packets.
//!
//! Each accepted socket gets a reader task and a writer task. Decoded
//! [`ClientPacket`]s are handed to the [`ConnectionHandler`] one at a time on
//! the blocking pool, so a handler may lock world state without stalling the
//! runtime and sees each connection's packets in arrival order. Replies go
//! through a [`ConnectionHandle`], which queues them for the writer task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::codec::{ReadPacketError, read_packet, write_packet};
use crate::framing::{FrameConfig, FrameError};
use crate::packets::{ClientPacket, ServerPacket};

/// Unique identifier for a TCP connection within a server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum Outgoing {
    Packet(ServerPacket),
    Close,
}

/// Cloneable handle for sending packets to one connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: SocketAddr,
    sender: mpsc::UnboundedSender<Outgoing>,
    closing: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Queues `packet`. Returns `false` once the connection's writer is gone.
    pub fn send(&self, packet: ServerPacket) -> bool {
        self.sender.send(Outgoing::Packet(packet)).is_ok()
    }

    /// Sends a disconnect message, then closes the socket.
    pub fn disconnect(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::info!("Disconnecting {:?}: {reason}", self.id);
        self.send(ServerPacket::DisconnectMessage { reason });
        self.close();
    }

    fn close(&self) {
        self.closing.store(true, Ordering::Release);
        let _ = self.sender.send(Outgoing::Close);
    }

    /// True once a disconnect was requested or the writer has stopped.
    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.sender.is_closed()
    }
}

/// Receives connection lifecycle events and decoded packets.
///
/// Called from the blocking thread pool.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn on_connect(&self, _conn: &ConnectionHandle) {}

    fn on_packet(&self, conn: &ConnectionHandle, packet: ClientPacket);

    fn on_disconnect(&self, _id: ConnectionId) {}
}

/// Error returned when the connection map is at capacity.
#[derive(Debug, thiserror::Error)]
#[error("connection limit reached")]
pub struct ConnectionLimitReached;

/// Active connections keyed by [`ConnectionId`].
#[derive(Debug)]
pub struct ConnectionMap {
    inner: DashMap<ConnectionId, ConnectionHandle>,
    max_connections: usize,
}

impl ConnectionMap {
    pub fn new(max_connections: usize) -> Self {
        Self {
            inner: DashMap::new(),
            max_connections,
        }
    }

    /// Insert a connection. Returns `Err` if the map is at capacity.
    pub fn insert(&self, handle: ConnectionHandle) -> Result<(), ConnectionLimitReached> {
        if self.inner.len() >= self.max_connections {
            return Err(ConnectionLimitReached);
        }
        self.inner.insert(handle.id, handle);
        Ok(())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Sends `packet` to every connection.
    pub fn broadcast(&self, packet: &ServerPacket) {
        for entry in self.inner.iter() {
            entry.value().send(packet.clone());
        }
    }
}

/// Configuration for [`GameServer`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:25600`.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections. Default: 64.
    pub max_connections: usize,
    pub frame: FrameConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 25600)),
            max_connections: 64,
            frame: FrameConfig::default(),
        }
    }
}

/// TCP game server that accepts connections and manages their lifecycle.
pub struct GameServer {
    config: ServerConfig,
    /// Active connection map (public for test inspection).
    pub connections: Arc<ConnectionMap>,
    handler: Arc<dyn ConnectionHandler>,
    id_gen: Arc<IdGenerator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GameServer {
    pub fn new(config: ServerConfig, handler: Arc<dyn ConnectionHandler>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            connections: Arc::new(ConnectionMap::new(config.max_connections)),
            handler,
            id_gen: Arc::new(IdGenerator::new()),
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Bind to the configured address and run the accept loop.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        tracing::info!("Server listening on {}", self.config.bind_addr);
        self.run_with_listener(listener).await
    }

    /// Run the accept loop with a pre-bound listener (useful for tests).
    pub async fn run_with_listener(&self, listener: TcpListener) -> std::io::Result<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (stream, peer) = result?;
                    stream.set_nodelay(true)?;

                    let id = self.id_gen.next_id();
                    let (reader, writer) = stream.into_split();
                    let (sender, receiver) = mpsc::unbounded_channel();
                    let handle = ConnectionHandle {
                        id,
                        peer,
                        sender,
                        closing: Arc::new(AtomicBool::new(false)),
                    };

                    let writer_task = tokio::spawn(write_loop(writer, receiver, self.config.frame.clone()));

                    if self.connections.insert(handle.clone()).is_err() {
                        tracing::warn!("Connection limit reached, rejecting {peer}");
                        handle.disconnect("server full");
                        continue;
                    }

                    tracing::info!("Accepted connection {id:?} from {peer}");

                    let connections = Arc::clone(&self.connections);
                    let handler = Arc::clone(&self.handler);
                    let frame = self.config.frame.clone();
                    let task_shutdown = self.shutdown_rx.clone();

                    tokio::spawn(async move {
                        read_loop(&handle, reader, &handler, &frame, task_shutdown).await;
                        connections.remove(id);
                        handle.close();
                        let _ = writer_task.await;
                        let _ = tokio::task::spawn_blocking(move || handler.on_disconnect(id)).await;
                        tracing::info!("Connection {id:?} closed");
                    });
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Signal the server and every connection to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Per-connection reader loop.
async fn read_loop(
    conn: &ConnectionHandle,
    mut reader: OwnedReadHalf,
    handler: &Arc<dyn ConnectionHandler>,
    frame: &FrameConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    if !dispatch(handler, conn, None).await {
        return;
    }
    loop {
        tokio::select! {
            result = read_packet::<_, ClientPacket>(&mut reader, frame) => {
                match result {
                    Ok(packet) => {
                        tracing::trace!("Connection {:?} received {packet:?}", conn.id);
                        if !dispatch(handler, conn, Some(packet)).await {
                            break;
                        }
                    }
                    Err(ReadPacketError::Frame(FrameError::ConnectionClosed)) => break,
                    Err(ReadPacketError::Frame(FrameError::Io(e))) => {
                        tracing::debug!("Connection {:?} read failed: {e}", conn.id);
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Connection {:?} sent a bad packet: {e}", conn.id);
                        conn.disconnect(format!("bad packet: {e}"));
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    conn.disconnect("server shutting down");
                    break;
                }
            }
        }
    }
}

/// Runs one handler callback on the blocking pool. `None` means connect.
async fn dispatch(
    handler: &Arc<dyn ConnectionHandler>,
    conn: &ConnectionHandle,
    packet: Option<ClientPacket>,
) -> bool {
    let handler = Arc::clone(handler);
    let task_conn = conn.clone();
    let result = tokio::task::spawn_blocking(move || match packet {
        Some(packet) => handler.on_packet(&task_conn, packet),
        None => handler.on_connect(&task_conn),
    })
    .await;
    if let Err(e) = result {
        tracing::error!("Handler for {:?} failed: {e}", conn.id);
        conn.disconnect("internal server error");
        return false;
    }
    !conn.is_closed()
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Outgoing>,
    frame: FrameConfig,
) {
    while let Some(outgoing) = receiver.recv().await {
        match outgoing {
            Outgoing::Packet(packet) => {
                if let Err(e) = write_packet(&mut writer, &packet, &frame).await {
                    tracing::debug!("Write failed: {e}");
                    break;
                }
            }
            Outgoing::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use crate::packets::Pose;

    #[derive(Default)]
    struct Recorder {
        connected: Mutex<Vec<ConnectionId>>,
        packets: Mutex<Vec<ClientPacket>>,
        disconnected: Mutex<Vec<ConnectionId>>,
    }

    impl ConnectionHandler for Recorder {
        fn on_connect(&self, conn: &ConnectionHandle) {
            self.connected.lock().unwrap().push(conn.id());
        }

        fn on_packet(&self, conn: &ConnectionHandle, packet: ClientPacket) {
            if let ClientPacket::Handshake { .. } = packet {
                conn.send(ServerPacket::RequestUserInfo);
            }
            self.packets.lock().unwrap().push(packet);
        }

        fn on_disconnect(&self, id: ConnectionId) {
            self.disconnected.lock().unwrap().push(id);
        }
    }

    /// Helper: start a server on an ephemeral port and return the bound address.
    async fn start_test_server(
        max_connections: usize,
    ) -> (SocketAddr, Arc<GameServer>, Arc<Recorder>) {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections,
            frame: FrameConfig::default(),
        };
        let recorder = Arc::new(Recorder::default());
        let server = Arc::new(GameServer::new(config, recorder.clone()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let srv = Arc::clone(&server);
        tokio::spawn(async move {
            srv.run_with_listener(listener).await.unwrap();
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        (addr, server, recorder)
    }

    async fn recv(stream: &mut TcpStream) -> ServerPacket {
        read_packet(stream, &FrameConfig::default()).await.unwrap()
    }

    async fn assert_eof(stream: &mut TcpStream) {
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(n, 0, "Client should receive EOF");
    }

    #[tokio::test]
    async fn test_server_accepts_connection() {
        let (addr, server, recorder) = start_test_server(16).await;
        let _stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connections.len(), 1);
        assert_eq!(recorder.connected.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_packets_dispatched_in_order() {
        let (addr, _server, recorder) = start_test_server(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let frame = FrameConfig::default();

        let sent = vec![
            ClientPacket::Handshake {
                client_version: "1".into(),
            },
            ClientPacket::ChunkLoadingDistanceChange { distance: 4 },
            ClientPacket::Move(Pose::default()),
        ];
        for packet in &sent {
            write_packet(&mut stream, packet, &frame).await.unwrap();
        }

        assert_eq!(recv(&mut stream).await, ServerPacket::RequestUserInfo);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*recorder.packets.lock().unwrap(), sent);
    }

    #[tokio::test]
    async fn test_bad_packet_disconnects_only_that_connection() {
        let (addr, server, recorder) = start_test_server(16).await;
        let mut good = TcpStream::connect(addr).await.unwrap();
        let mut bad = TcpStream::connect(addr).await.unwrap();

        crate::framing::write_frame(&mut bad, &[0xEE, 0x01], &FrameConfig::default())
            .await
            .unwrap();
        let reply = recv(&mut bad).await;
        assert!(matches!(reply, ServerPacket::DisconnectMessage { .. }));
        assert_eof(&mut bad).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connections.len(), 1);
        assert_eq!(recorder.disconnected.lock().unwrap().len(), 1);

        let hello = ClientPacket::Handshake {
            client_version: "1".into(),
        };
        write_packet(&mut good, &hello, &FrameConfig::default())
            .await
            .unwrap();
        assert_eq!(recv(&mut good).await, ServerPacket::RequestUserInfo);
    }

    #[tokio::test]
    async fn test_max_connections_enforced() {
        let (addr, server, _recorder) = start_test_server(2).await;

        let _c1 = TcpStream::connect(addr).await.unwrap();
        let _c2 = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.connections.len(), 2);

        let mut c3 = TcpStream::connect(addr).await.unwrap();
        assert_eq!(
            recv(&mut c3).await,
            ServerPacket::DisconnectMessage {
                reason: "server full".into()
            }
        );
        assert_eof(&mut c3).await;
        assert_eq!(server.connections.len(), 2);
    }

    #[tokio::test]
    async fn test_client_close_reports_disconnect() {
        let (addr, server, recorder) = start_test_server(16).await;
        let stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(stream);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(server.connections.is_empty());
        let connected = recorder.connected.lock().unwrap().clone();
        assert_eq!(*recorder.disconnected.lock().unwrap(), connected);
    }

    #[tokio::test]
    async fn test_graceful_shutdown_closes_connections() {
        let (addr, server, _recorder) = start_test_server(16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        assert!(matches!(
            recv(&mut stream).await,
            ServerPacket::DisconnectMessage { .. }
        ));
        assert_eof(&mut stream).await;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_connection() {
        let (addr, server, _recorder) = start_test_server(16).await;
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server
            .connections
            .broadcast(&ServerPacket::RequestRenderDistance);
        assert_eq!(recv(&mut a).await, ServerPacket::RequestRenderDistance);
        assert_eq!(recv(&mut b).await, ServerPacket::RequestRenderDistance);
    }

    #[test]
    fn test_connection_id_uniqueness() {
        let id_gen = IdGenerator::new();
        let id1 = id_gen.next_id();
        let id2 = id_gen.next_id();
        assert_ne!(id1, id2);
        assert_eq!(id1.0 + 1, id2.0);
    }
}
