//! Shared mock backend for the integration tests

use async_trait::async_trait;
use connpool::pool::connection::{next_connection_id, Connection, ConnectionFactory};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Install a subscriber once so failing tests can be re-run with RUST_LOG set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct MockStats {
    pub created: AtomicUsize,
    pub pings: AtomicUsize,
}

pub struct MockConnection {
    id: u64,
    dirty: bool,
    stats: Arc<MockStats>,
    ping_ok: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&mut self) -> bool {
        self.stats.pings.fetch_add(1, Ordering::SeqCst);
        self.ping_ok.load(Ordering::SeqCst)
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

pub struct MockFactory {
    pub stats: Arc<MockStats>,
    /// When set, create() fails with ConnectionRefused
    pub fail_creates: Arc<AtomicBool>,
    /// Ping result for every connection made by this factory
    pub ping_ok: Arc<AtomicBool>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            stats: Arc::new(MockStats::default()),
            fail_creates: Arc::new(AtomicBool::new(false)),
            ping_ok: Arc::new(AtomicBool::new(true)),
        }
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    fn backend(&self) -> &str {
        "mock"
    }

    async fn create(&self) -> io::Result<Box<dyn Connection>> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "mock create failure",
            ));
        }
        self.stats.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            id: next_connection_id(),
            dirty: false,
            stats: self.stats.clone(),
            ping_ok: self.ping_ok.clone(),
        }))
    }
}
