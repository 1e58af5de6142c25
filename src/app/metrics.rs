//! Prometheus-based metrics and per-key traffic aggregation
//!
//! Two layers live here:
//! - the Prometheus statics exported on /metrics, wrapped by the
//!   [`TcpMetrics`] sink the connection handler reports to
//! - [`MetricsMap`], the in-process aggregation of per-connection traffic
//!   tuples keyed by access key or client network

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    /// Open TCP connections being proxied
    pub static ref TCP_CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "shadowmux_tcp_connections_active",
        "Number of open TCP connections"
    ).unwrap();

    /// Closed connections by access key and terminal status
    pub static ref TCP_CONNECTIONS_CLOSED: IntCounterVec = IntCounterVec::new(
        Opts::new("shadowmux_tcp_connections_closed_total", "Closed TCP connections"),
        &["access_key", "status"]
    ).unwrap();

    /// Connection duration by terminal status
    pub static ref TCP_CONNECTION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "shadowmux_tcp_connection_duration_seconds",
            "TCP connection duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["status"]
    ).unwrap();

    /// Bytes moved per half-stream direction and access key.
    ///
    /// Directions: c>p (client to proxy), p>t (proxy to target),
    /// t>p (target to proxy), p>c (proxy to client).
    pub static ref DATA_BYTES: IntCounterVec = IntCounterVec::new(
        Opts::new("shadowmux_data_bytes_total", "Bytes transferred per direction"),
        &["dir", "access_key"]
    ).unwrap();
}

/// Initialize and register all metrics with the global registry
pub fn init_metrics() {
    REGISTRY.register(Box::new(TCP_CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(TCP_CONNECTIONS_CLOSED.clone())).ok();
    REGISTRY.register(Box::new(TCP_CONNECTION_DURATION.clone())).ok();
    REGISTRY.register(Box::new(DATA_BYTES.clone())).ok();
}

// ============================================================================
// Connection status
// ============================================================================

/// Terminal status of one proxied connection, used as a metrics label.
///
/// Exactly one status is recorded per accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Ok,
    ErrCipher,
    ErrReadAddress,
    ErrConnect,
    ErrRelay,
}

impl ConnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnStatus::Ok => "OK",
            ConnStatus::ErrCipher => "ERR_CIPHER",
            ConnStatus::ErrReadAddress => "ERR_READ_ADDRESS",
            ConnStatus::ErrConnect => "ERR_CONNECT",
            ConnStatus::ErrRelay => "ERR_RELAY",
        }
    }
}

impl std::fmt::Display for ConnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Proxy metrics tuple
// ============================================================================

/// Bytes observed on the four half-streams of one connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyMetrics {
    /// Bytes the proxy read from the client
    pub proxy_client: u64,
    /// Bytes the proxy wrote to the client
    pub client_proxy: u64,
    /// Bytes the proxy wrote to the target
    pub proxy_target: u64,
    /// Bytes the proxy read from the target
    pub target_proxy: u64,
}

impl ProxyMetrics {
    /// Fold another tuple into this one, saturating on overflow
    pub fn add(&mut self, other: &ProxyMetrics) {
        self.proxy_client = self.proxy_client.saturating_add(other.proxy_client);
        self.client_proxy = self.client_proxy.saturating_add(other.client_proxy);
        self.proxy_target = self.proxy_target.saturating_add(other.proxy_target);
        self.target_proxy = self.target_proxy.saturating_add(other.target_proxy);
    }
}

/// Live counters for a connection in flight. Snapshots into a
/// [`ProxyMetrics`] tuple at teardown.
#[derive(Debug, Clone, Default)]
pub struct ConnCounters {
    pub proxy_client: Arc<AtomicU64>,
    pub client_proxy: Arc<AtomicU64>,
    pub proxy_target: Arc<AtomicU64>,
    pub target_proxy: Arc<AtomicU64>,
}

impl ConnCounters {
    pub fn snapshot(&self) -> ProxyMetrics {
        ProxyMetrics {
            proxy_client: self.proxy_client.load(Ordering::Relaxed),
            client_proxy: self.client_proxy.load(Ordering::Relaxed),
            proxy_target: self.proxy_target.load(Ordering::Relaxed),
            target_proxy: self.target_proxy.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Metrics map
// ============================================================================

/// Thread-safe accumulation of [`ProxyMetrics`] per string key.
///
/// Keys are access keys (`"0"`, `"1"`, …, or `"INVALID"`) or client network
/// keys. Adds for one key are serialized by the lock; reads return a
/// snapshot and never allocate an entry.
#[derive(Debug, Default)]
pub struct MetricsMap {
    inner: Mutex<HashMap<String, ProxyMetrics>>,
}

impl MetricsMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a connection's tuple into the entry for `key`
    pub fn add(&self, key: &str, metrics: &ProxyMetrics) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.to_string()).or_default().add(metrics);
    }

    /// Snapshot the accumulated tuple for `key` (zero if absent)
    pub fn get(&self, key: &str) -> ProxyMetrics {
        let map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.get(key).copied().unwrap_or_default()
    }
}

// ============================================================================
// TCP metrics sink
// ============================================================================

/// Reporting surface between the connection handler and the exporter
pub trait TcpMetrics: Send + Sync {
    /// A connection was accepted
    fn add_tcp_connection(&self);

    /// A connection reached its terminal status
    fn remove_tcp_connection(&self, access_key: &str, status: ConnStatus, duration: Duration);

    /// Fold a closed connection's traffic into the exporter
    fn record_traffic(&self, access_key: &str, metrics: &ProxyMetrics);
}

/// [`TcpMetrics`] implementation backed by the Prometheus statics
#[derive(Debug, Default)]
pub struct PrometheusTcpMetrics;

impl PrometheusTcpMetrics {
    pub fn new() -> Self {
        init_metrics();
        Self
    }
}

impl TcpMetrics for PrometheusTcpMetrics {
    fn add_tcp_connection(&self) {
        TCP_CONNECTIONS_ACTIVE.inc();
    }

    fn remove_tcp_connection(&self, access_key: &str, status: ConnStatus, duration: Duration) {
        TCP_CONNECTIONS_ACTIVE.dec();
        TCP_CONNECTIONS_CLOSED
            .with_label_values(&[access_key, status.as_str()])
            .inc();
        TCP_CONNECTION_DURATION
            .with_label_values(&[status.as_str()])
            .observe(duration.as_secs_f64());
    }

    fn record_traffic(&self, access_key: &str, metrics: &ProxyMetrics) {
        DATA_BYTES
            .with_label_values(&["c>p", access_key])
            .inc_by(metrics.proxy_client);
        DATA_BYTES
            .with_label_values(&["p>t", access_key])
            .inc_by(metrics.proxy_target);
        DATA_BYTES
            .with_label_values(&["t>p", access_key])
            .inc_by(metrics.target_proxy);
        DATA_BYTES
            .with_label_values(&["p>c", access_key])
            .inc_by(metrics.client_proxy);
    }
}
