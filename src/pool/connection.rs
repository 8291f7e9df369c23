//! Connection and factory traits plus the built-in TCP backends
//!
//! A pool only ever sees `Box<dyn Connection>`; the factory decides what a
//! connection actually is. Two backends are built in:
//! - Key-value: RESP-style inline commands (AUTH on create, PING liveness)
//! - Relational: transport session; the query layer owns handshake and dialect

use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{BackendConfig, BackendKind};

/// Process-wide id source so log lines can follow one connection around.
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate an id for a newly created connection.
///
/// Custom factory implementations should use this too, so ids stay unique
/// across every pool in the process.
pub fn next_connection_id() -> u64 {
    NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed)
}

/// A live backend session owned by a pool or by exactly one task.
#[async_trait]
pub trait Connection: Send {
    /// Process-unique id, stable for the life of the session
    fn id(&self) -> u64;

    /// Cheapest possible liveness round-trip. Only called when the
    /// connection has sat idle for at least the pool's heartbeat interval.
    async fn ping(&mut self) -> bool;

    /// Whether the connection may go back into the pool store. A session
    /// that is mid-transaction (or mid-pipeline) must not be reused by
    /// another task and is discarded instead.
    fn is_returnable(&self) -> bool;

    /// Mark the session dirty (in-transaction). Set by the query layer on
    /// BEGIN/MULTI and cleared on COMMIT/ROLLBACK/EXEC.
    fn set_dirty(&mut self, dirty: bool);

    /// Current dirty flag
    fn is_dirty(&self) -> bool;
}

impl std::fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id()).finish()
    }
}

/// Creates raw connections for one backend.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Backend label used in log fields
    fn backend(&self) -> &str;

    /// Open a new session. Failures degrade pool capacity; they never abort
    /// pool initialization.
    async fn create(&self) -> io::Result<Box<dyn Connection>>;
}

/// Build the factory matching a backend config's kind.
pub fn factory_for(config: &BackendConfig) -> Arc<dyn ConnectionFactory> {
    match config.kind {
        BackendKind::KeyValue => Arc::new(KvFactory::new(config.clone())),
        BackendKind::Relational => Arc::new(RelationalFactory::new(config.clone())),
    }
}

/// TCP connect with timeout and keep-alive, shared by both factories.
async fn connect_tcp(address: &str, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timeout"))??;

    // Keep-alive so the OS notices half-dead sessions between heartbeats
    let socket = socket2::Socket::from(stream.into_std()?);
    socket.set_keepalive(true)?;
    let stream = TcpStream::from_std(socket.into())?;

    Ok(stream)
}

/// Key-value store session speaking RESP-style inline commands
pub struct KvConnection {
    id: u64,
    stream: TcpStream,
    io_timeout: Duration,
    dirty: bool,
}

impl KvConnection {
    async fn command(&mut self, line: &[u8]) -> io::Result<Vec<u8>> {
        self.stream.write_all(line).await?;

        let mut buf = [0u8; 64];
        let n = tokio::time::timeout(self.io_timeout, self.stream.read(&mut buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "reply timeout"))??;

        Ok(buf[..n].to_vec())
    }
}

#[async_trait]
impl Connection for KvConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> bool {
        match self.command(b"PING\r\n").await {
            Ok(reply) if !reply.is_empty() => reply.starts_with(b"+PONG"),
            Ok(_) => {
                // Empty read is EOF: the peer closed while we were pooled
                debug!(conn = self.id, "key-value peer closed the connection");
                false
            }
            Err(e) => {
                debug!(conn = self.id, error = %e, "key-value ping failed");
                false
            }
        }
    }

    fn is_returnable(&self) -> bool {
        !self.dirty
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    fn is_dirty(&self) -> bool {
        self.dirty
    }
}

/// Factory for key-value backends
pub struct KvFactory {
    config: BackendConfig,
}

impl KvFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for KvFactory {
    fn backend(&self) -> &str {
        &self.config.address
    }

    async fn create(&self) -> io::Result<Box<dyn Connection>> {
        let timeout = self.config.connect_timeout();
        let stream = connect_tcp(&self.config.address, timeout).await?;

        let mut conn = KvConnection {
            id: next_connection_id(),
            stream,
            io_timeout: timeout,
            dirty: false,
        };

        if let Some(password) = &self.config.password {
            let line = match &self.config.username {
                Some(user) => format!("AUTH {} {}\r\n", user, password),
                None => format!("AUTH {}\r\n", password),
            };
            let reply = conn.command(line.as_bytes()).await?;
            if !reply.starts_with(b"+OK") {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "backend rejected AUTH",
                ));
            }
        }

        debug!(
            conn = conn.id,
            backend = %self.config.address,
            "opened key-value connection"
        );

        Ok(Box::new(conn))
    }
}

/// Relational database session. This layer owns the transport; handshake,
/// authentication and queries belong to the query layer above the pool.
pub struct RelationalConnection {
    id: u64,
    stream: TcpStream,
    in_transaction: bool,
}

impl RelationalConnection {
    /// Hand the transport to the query layer
    pub fn stream(&mut self) -> &mut TcpStream {
        &mut self.stream
    }
}

#[async_trait]
impl Connection for RelationalConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> bool {
        // The session is quiet while pooled, so a readable byte means the
        // peer closed the stream (EOF) or the protocol is out of sync;
        // either way the connection is unusable.
        let mut buf = [0u8; 1];
        match self.stream.try_read(&mut buf) {
            Ok(0) => {
                debug!(conn = self.id, "relational peer closed the connection");
                false
            }
            Ok(_) => {
                debug!(conn = self.id, "unsolicited data on idle connection");
                false
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(e) => {
                debug!(conn = self.id, error = %e, "relational ping failed");
                false
            }
        }
    }

    fn is_returnable(&self) -> bool {
        !self.in_transaction
    }

    fn set_dirty(&mut self, dirty: bool) {
        self.in_transaction = dirty;
    }

    fn is_dirty(&self) -> bool {
        self.in_transaction
    }
}

/// Factory for relational backends
pub struct RelationalFactory {
    config: BackendConfig,
}

impl RelationalFactory {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionFactory for RelationalFactory {
    fn backend(&self) -> &str {
        &self.config.address
    }

    async fn create(&self) -> io::Result<Box<dyn Connection>> {
        let stream = connect_tcp(&self.config.address, self.config.connect_timeout()).await?;

        let conn = RelationalConnection {
            id: next_connection_id(),
            stream,
            in_transaction: false,
        };

        debug!(
            conn = conn.id,
            backend = %self.config.address,
            "opened relational connection"
        );

        Ok(Box::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn kv_config(address: String) -> BackendConfig {
        BackendConfig {
            kind: BackendKind::KeyValue,
            address,
            username: None,
            password: None,
            database: None,
            connect_timeout_secs: 1,
        }
    }

    /// Minimal key-value server that answers PING and one AUTH
    async fn spawn_kv_server(accept_password: Option<&'static str>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    loop {
                        let Ok(n) = stream.read(&mut buf).await else {
                            return;
                        };
                        if n == 0 {
                            return;
                        }
                        let reply: &[u8] = if buf[..n].starts_with(b"PING") {
                            b"+PONG\r\n"
                        } else if buf[..n].starts_with(b"AUTH") {
                            match accept_password {
                                Some(pw) if buf[..n].ends_with(format!("{}\r\n", pw).as_bytes()) => {
                                    b"+OK\r\n"
                                }
                                _ => b"-ERR invalid password\r\n",
                            }
                        } else {
                            b"-ERR unknown command\r\n"
                        };
                        if stream.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        addr
    }

    #[tokio::test]
    async fn test_kv_create_and_ping() {
        let addr = spawn_kv_server(None).await;
        let factory = KvFactory::new(kv_config(addr));

        let mut conn = factory.create().await.unwrap();
        assert!(conn.ping().await);
        assert!(conn.is_returnable());
    }

    #[tokio::test]
    async fn test_kv_auth_rejected() {
        let addr = spawn_kv_server(Some("sekrit")).await;
        let mut config = kv_config(addr);
        config.password = Some("wrong".to_string());

        let factory = KvFactory::new(config);
        let err = factory.create().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn test_kv_auth_accepted() {
        let addr = spawn_kv_server(Some("sekrit")).await;
        let mut config = kv_config(addr);
        config.password = Some("sekrit".to_string());

        let factory = KvFactory::new(config);
        let mut conn = factory.create().await.unwrap();
        assert!(conn.ping().await);
    }

    #[tokio::test]
    async fn test_relational_ping_detects_closed_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });

        let config = BackendConfig {
            kind: BackendKind::Relational,
            address: addr,
            username: None,
            password: None,
            database: None,
            connect_timeout_secs: 1,
        };
        let factory = RelationalFactory::new(config);
        let mut conn = factory.create().await.unwrap();

        let server_side = accept.await.unwrap();

        // Idle but open: probe passes without any round-trip
        assert!(conn.ping().await);

        drop(server_side);
        // Give the loopback a moment to deliver the FIN
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!conn.ping().await);
    }

    #[tokio::test]
    async fn test_dirty_connection_is_not_returnable() {
        let addr = spawn_kv_server(None).await;
        let factory = KvFactory::new(kv_config(addr));

        let mut conn = factory.create().await.unwrap();
        conn.set_dirty(true);
        assert!(!conn.is_returnable());

        conn.set_dirty(false);
        assert!(conn.is_returnable());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Port 1 is essentially never listening
        let factory = RelationalFactory::new(BackendConfig {
            kind: BackendKind::Relational,
            address: "127.0.0.1:1".to_string(),
            username: None,
            password: None,
            database: None,
            connect_timeout_secs: 1,
        });
        assert!(factory.create().await.is_err());
    }

    #[test]
    fn test_factory_for_kind() {
        let config = kv_config("127.0.0.1:6379".to_string());
        let factory = factory_for(&config);
        assert_eq!(factory.backend(), "127.0.0.1:6379");
    }
}
