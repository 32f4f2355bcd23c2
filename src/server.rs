//! TCP server: accept loop, per-connection task trio, and the dispatch
//! loop that drives registered command handlers.
//!
//! Each accepted connection gets three tasks sharing one `Arc<Connection>`:
//! a reader task (owns the read half, drains buffered frames into the
//! connection's queue, pausing reads under backpressure), a writer task
//! (owns the write half, drains an unbounded channel so sends never
//! block a handler), and the dispatch loop itself, which runs on the
//! task that accepted the connection and looks up + invokes a handler
//! for each incoming message.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use serde_json::{json, Value};
use socket2::{Domain, Protocol as SockProtocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::commands;
use crate::connection::{Connection, Incoming};
use crate::error::{ErrorPolicy, ProtocolError};
use crate::protocol::frame::{FrameCodec, OutFrame};
use crate::protocol::message;
use crate::registry::HandlerRegistry;

/// Server configuration, defaulted to the reference deployment's values.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Queue length at which the reader task stops reading from the
    /// socket.
    pub pause_threshold: usize,
    /// Queue length at or below which reading resumes.
    pub resume_threshold: usize,
    pub backlog: i32,
    pub error_policy: ErrorPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 8001,
            pause_threshold: 1,
            resume_threshold: 0,
            backlog: 1024,
            error_policy: ErrorPolicy::default(),
        }
    }
}

/// Aggregate counters across the server's whole lifetime, including
/// connections that have since closed. A plain snapshot instead of a
/// polling print loop.
#[derive(Debug, Default)]
struct StatsInner {
    accepted: AtomicU64,
    recv_direct: AtomicU64,
    recv_enqueue: AtomicU64,
    recv_dequeue: AtomicU64,
    recv_wait: AtomicU64,
    pause_count: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServerStats {
    pub active_connections: usize,
    pub accepted: u64,
    pub recv_direct: u64,
    pub recv_enqueue: u64,
    pub recv_dequeue: u64,
    pub recv_wait: u64,
    pub pause_count: u64,
}

/// Server handle. Cheaply `Clone`, so the accept loop can hand a copy
/// to each connection task.
#[derive(Clone)]
pub struct Server {
    config: Arc<ServerConfig>,
    registry: Arc<HandlerRegistry>,
    connections: Arc<Mutex<HashMap<u64, Arc<Connection>>>>,
    next_ident: Arc<AtomicU64>,
    stats: Arc<StatsInner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self::with_registry(config, commands::default_registry())
    }

    pub fn with_registry(config: ServerConfig, registry: HandlerRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_ident: Arc::new(AtomicU64::new(1)),
            stats: Arc::new(StatsInner::default()),
        }
    }

    pub async fn stats(&self) -> ServerStats {
        let active_connections = self.connections.lock().await.len();
        ServerStats {
            active_connections,
            accepted: self.stats.accepted.load(Ordering::Relaxed),
            recv_direct: self.stats.recv_direct.load(Ordering::Relaxed),
            recv_enqueue: self.stats.recv_enqueue.load(Ordering::Relaxed),
            recv_dequeue: self.stats.recv_dequeue.load(Ordering::Relaxed),
            recv_wait: self.stats.recv_wait.load(Ordering::Relaxed),
            pause_count: self.stats.pause_count.load(Ordering::Relaxed),
        }
    }

    /// Pushes a request to a specific connection's outstanding long
    /// poll, identified by the ident assigned at accept time.
    pub async fn push_poll_request(&self, ident: u64, request: Value) -> Result<(), ProtocolError> {
        let conn = self
            .connections
            .lock()
            .await
            .get(&ident)
            .cloned()
            .ok_or(ProtocolError::ConnectionLost)?;
        conn.push_poll_request(request)
    }

    /// Binds with `SO_REUSEPORT` (not exposed by `TcpListener::bind`
    /// directly) and runs the accept loop until the process is
    /// terminated.
    pub async fn run(&self) -> Result<(), ProtocolError> {
        let addr: SocketAddr = format!("{}:{}", self.config.bind_addr, self.config.port)
            .parse()
            .map_err(|e| ProtocolError::Encoding(format!("invalid bind address: {e}")))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog)?;

        let listener = TcpListener::from_std(socket.into())?;
        info!(%addr, "longerpull server listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!(%peer_addr, error = %e, "failed to set TCP_NODELAY");
                    }
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let ident = self.next_ident.fetch_add(1, Ordering::Relaxed);
        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        info!(ident, %peer_addr, "connection established");

        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            ident,
            peer_addr,
            self.config.pause_threshold,
            self.config.resume_threshold,
            write_tx,
        ));
        self.connections.lock().await.insert(ident, conn.clone());

        let writer_handle = tokio::spawn(writer_task(write_half, write_rx));
        let reader_handle = tokio::spawn(reader_task(read_half, conn.clone()));

        dispatch_loop(conn.clone(), self.registry.clone(), self.config.error_policy).await;

        reader_handle.abort();
        conn.close_writer();
        let _ = writer_handle.await;

        let removed_stats = conn.stats();
        self.stats.recv_direct.fetch_add(removed_stats.recv_direct, Ordering::Relaxed);
        self.stats.recv_enqueue.fetch_add(removed_stats.recv_enqueue, Ordering::Relaxed);
        self.stats.recv_dequeue.fetch_add(removed_stats.recv_dequeue, Ordering::Relaxed);
        self.stats.recv_wait.fetch_add(removed_stats.recv_wait, Ordering::Relaxed);
        self.stats.pause_count.fetch_add(removed_stats.pause_count, Ordering::Relaxed);

        self.connections.lock().await.remove(&ident);
        info!(ident, %peer_addr, "connection closed");
    }
}

/// Owns the read half; decodes every complete frame already buffered
/// before touching the socket again, and only reads more once the
/// connection is not paused (mirrors the original's `pause_reading`/
/// `resume_reading` transport hooks).
async fn reader_task(mut read_half: ReadHalf<TcpStream>, conn: Arc<Connection>) {
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => match message::decode(&frame.body, frame.is_compressed) {
                    Ok(value) => conn.feed_message(frame.msg_id, value),
                    Err(e) => {
                        conn.feed_exception(e);
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    conn.feed_exception(e);
                    return;
                }
            }
        }

        conn.wait_for_resume().await;

        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                conn.feed_exception(ProtocolError::ConnectionLost);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                conn.feed_exception(ProtocolError::Io(e));
                return;
            }
        }
    }
}

/// Owns the write half. Every `Connection::send_message` call is
/// fire-and-forget: it just pushes onto this channel, so a slow client
/// backs up the channel rather than blocking a handler.
async fn writer_task(mut write_half: WriteHalf<TcpStream>, mut write_rx: mpsc::UnboundedReceiver<OutFrame>) {
    let mut codec = FrameCodec::default();
    while let Some(frame) = write_rx.recv().await {
        let mut buf = BytesMut::new();
        if codec.encode(frame, &mut buf).is_err() {
            continue;
        }
        if let Err(e) = write_half.write_all(&buf).await {
            debug!(error = %e, "write failed, closing connection");
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Pulls messages off the connection's queue and invokes the matching
/// handler. An unknown command or a lost connection both end the loop;
/// a `HandlerError` is either turned into an error reply or treated as
/// fatal, per `ErrorPolicy`.
async fn dispatch_loop(conn: Arc<Connection>, registry: Arc<HandlerRegistry>, error_policy: ErrorPolicy) {
    loop {
        match conn.recv_message().await {
            Incoming::Lost(err) => {
                debug!(ident = conn.ident, error = %err, "connection lost");
                return;
            }
            Incoming::Message { msg_id, body } => {
                let command = match body.get("command").and_then(Value::as_str) {
                    Some(c) => c.to_string(),
                    None => {
                        warn!(ident = conn.ident, msg_id, "message missing command field");
                        return;
                    }
                };
                let handler = match registry.get(&command) {
                    Some(h) => h,
                    None => {
                        warn!(ident = conn.ident, %command, "unknown command, closing connection");
                        return;
                    }
                };
                let args = body.get("args").cloned().unwrap_or(Value::Null);

                match handler.run(&conn, msg_id, args).await {
                    Ok(data) => {
                        let envelope = json!({"success": true, "data": data});
                        let _ = conn.send_message(msg_id, &envelope);
                    }
                    Err(herr) => match error_policy {
                        ErrorPolicy::ReplyAndContinue => {
                            let mut envelope = json!({
                                "success": false,
                                "exception": herr.name,
                                "message": herr.message,
                            });
                            if let Value::Object(map) = &mut envelope {
                                for (k, v) in herr.extra {
                                    map.insert(k, v);
                                }
                            }
                            let _ = conn.send_message(msg_id, &envelope);
                        }
                        ErrorPolicy::Terminate => {
                            warn!(ident = conn.ident, error = %herr, "handler error, terminating connection");
                            return;
                        }
                    },
                }
            }
        }
    }
}
