//! The EventServer: accepts satellite connections, keyed by a self-reported
//! client id, and offers a reliable request/response `send` to any of them.
//!
//! Failure model: transport errors are retried per send with a fixed backoff;
//! a malformed handshake is fatal to that one connection; the server itself
//! never stops on a per-connection failure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use switchgrid_core::error::{GridError, Result};
use switchgrid_core::model::version_stamp;

/// Max attempts for one logical send.
pub const SEND_RETRY_LIMIT: usize = 5;
/// Fixed backoff between send attempts.
pub const RETRY_DELAY: Duration = Duration::from_millis(120);
/// Per-attempt reply deadline.
pub const READ_DEADLINE: Duration = Duration::from_millis(500);
/// Default interval after which a connection must re-identify.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Callback invoked after a successful handshake, before registration.
/// An error aborts the registration and closes the socket.
pub type OnConnect = Arc<dyn Fn(u32) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One registered satellite connection. The stamp records registration time
/// in nanoseconds and guards against evicting a superseding reconnect.
struct Connection {
    stamp: i64,
    stream: Mutex<BufReader<TcpStream>>,
}

type ConnMap = Arc<RwLock<HashMap<u32, Arc<Connection>>>>;

/// TCP event server for satellites.
pub struct EventServer {
    local_addr: SocketAddr,
    connections: ConnMap,
    closed: Arc<AtomicBool>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    sweep_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl EventServer {
    /// Bind and start accepting satellites.
    pub async fn bind(host: &str, port: u16, on_connect: Option<OnConnect>) -> Result<Arc<Self>> {
        Self::bind_with_sweep(host, port, SWEEP_INTERVAL, on_connect).await
    }

    /// Bind with a custom staleness sweep interval.
    pub async fn bind_with_sweep(
        host: &str,
        port: u16,
        sweep_interval: Duration,
        on_connect: Option<OnConnect>,
    ) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| GridError::Transport(format!("bind {host}:{port}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| GridError::Transport(e.to_string()))?;
        tracing::info!("📡 Event server listening on {local_addr}");

        let connections: ConnMap = Arc::new(RwLock::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let accept_task = {
            let connections = connections.clone();
            let closed = closed.clone();
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, peer)) => {
                            let connections = connections.clone();
                            let on_connect = on_connect.clone();
                            tokio::spawn(async move {
                                handle_client(connections, on_connect, stream, peer).await;
                            });
                        }
                        Err(e) => {
                            if closed.load(Ordering::SeqCst) {
                                return;
                            }
                            tracing::error!("Accept failed: {e}");
                        }
                    }
                }
            })
        };

        let sweep_task = {
            let connections = connections.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.tick().await; // first tick fires immediately, skip it
                loop {
                    ticker.tick().await;
                    sweep_stale(&connections, sweep_interval).await;
                }
            })
        };

        Ok(Arc::new(Self {
            local_addr,
            connections,
            closed,
            accept_task: std::sync::Mutex::new(Some(accept_task)),
            sweep_task: std::sync::Mutex::new(Some(sweep_task)),
        }))
    }

    /// The bound address (useful when started on port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of currently registered satellites.
    pub async fn client_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Send one trimmed, newline-terminated message to a satellite and wait
    /// for its one-line reply. Retries transport failures up to
    /// [`SEND_RETRY_LIMIT`] times; an unregistered client id fails
    /// immediately with no retry delay.
    pub async fn send(&self, client_id: u32, message: &str) -> Result<String> {
        let mut conn = match self.lookup(client_id).await {
            Some(conn) => conn,
            None => {
                return Err(GridError::NotFound(format!("unrecognized client {client_id}")));
            }
        };
        for attempt in 1..=SEND_RETRY_LIMIT {
            // A satellite may have reconnected between attempts; prefer the
            // live registration over the connection we failed on.
            if let Some(current) = self.lookup(client_id).await {
                conn = current;
            }
            match send_once(&conn, client_id, message).await {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    tracing::warn!(
                        "Send to client {client_id} failed (attempt {attempt}/{SEND_RETRY_LIMIT}): {e}"
                    );
                    self.evict_if_current(client_id, conn.stamp).await;
                    if attempt < SEND_RETRY_LIMIT {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(GridError::Unreachable(format!("device {client_id} unreachable")))
    }

    async fn lookup(&self, client_id: u32) -> Option<Arc<Connection>> {
        self.connections.read().await.get(&client_id).cloned()
    }

    /// Drop the registration for `client_id`, but only if its stamp still
    /// matches: a connection that already reconnected must not be evicted
    /// by a straggling failure.
    async fn evict_if_current(&self, client_id: u32, stamp: i64) {
        let removed = {
            let mut map = self.connections.write().await;
            match map.get(&client_id) {
                Some(current) if current.stamp == stamp => map.remove(&client_id),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            tracing::info!("Evicted connection for client {client_id}");
            close_connection(&conn).await;
        }
    }

    /// Stop accepting, close every live connection, clear the registry.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        if let Some(task) = self.sweep_task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
        let drained: Vec<Arc<Connection>> = {
            let mut map = self.connections.write().await;
            map.drain().map(|(_, conn)| conn).collect()
        };
        for conn in drained {
            close_connection(&conn).await;
        }
        tracing::info!("📡 Event server on {} closed", self.local_addr);
    }
}

/// Handshake: the first line must be a non-negative integer client id.
async fn handle_client(
    connections: ConnMap,
    on_connect: Option<OnConnect>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    match reader.read_line(&mut line).await {
        Ok(0) => {
            tracing::error!("Connection from {peer} closed before handshake");
            return;
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("Handshake read from {peer} failed: {e}");
            return;
        }
    }
    let client_id: u32 = match line.trim().parse() {
        Ok(id) => id,
        Err(_) => {
            tracing::error!("Malformed handshake {:?} from {peer}", line.trim());
            return;
        }
    };
    if let Some(callback) = &on_connect
        && let Err(e) = callback(client_id).await
    {
        tracing::error!("Connect callback for client {client_id} failed: {e}");
        return;
    }
    let conn = Arc::new(Connection {
        stamp: version_stamp(),
        stream: Mutex::new(reader),
    });
    let old = {
        let mut map = connections.write().await;
        map.insert(client_id, conn)
    };
    if let Some(old) = old {
        tracing::info!("Client {client_id} reconnected, superseding prior connection");
        close_connection(&old).await;
    }
    tracing::info!("🔌 Client {client_id} registered from {peer}");
}

async fn send_once(conn: &Connection, client_id: u32, message: &str) -> Result<String> {
    let mut stream = conn.stream.lock().await;
    let framed = format!("{}\n", message.trim());
    stream
        .get_mut()
        .write_all(framed.as_bytes())
        .await
        .map_err(|e| GridError::Transport(format!("write: {e}")))?;
    tracing::debug!("Sent {:?} to client {client_id}", message.trim());

    let mut reply = String::new();
    let n = timeout(READ_DEADLINE, stream.read_line(&mut reply))
        .await
        .map_err(|_| GridError::Transport(format!("client {client_id} reply timed out")))?
        .map_err(|e| GridError::Transport(format!("read: {e}")))?;
    if n == 0 {
        return Err(GridError::Transport(format!("client {client_id} hung up")));
    }
    let reply = reply.trim().to_string();
    tracing::debug!("Received {reply:?} from client {client_id}");
    Ok(reply)
}

/// Force connections past the sweep interval to reconnect and re-identify.
async fn sweep_stale(connections: &ConnMap, max_age: Duration) {
    let now = version_stamp();
    let stale: Vec<(u32, Arc<Connection>)> = {
        let mut map = connections.write().await;
        let ids: Vec<u32> = map
            .iter()
            .filter(|(_, conn)| now.saturating_sub(conn.stamp) > max_age.as_nanos() as i64)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| map.remove(&id).map(|conn| (id, conn)))
            .collect()
    };
    for (client_id, conn) in stale {
        tracing::warn!("Declaring stale connection for client {client_id}");
        close_connection(&conn).await;
    }
}

async fn close_connection(conn: &Connection) {
    // An in-flight send holds the stream lock; it will observe the failure
    // itself, so only shut down an idle stream.
    if let Ok(mut stream) = conn.stream.try_lock() {
        let _ = stream.get_mut().shutdown().await;
    }
}
