//! TCP proxy server
//!
//! The accept loop hands each connection to its own task. A connection
//! walks accept → identify → read destination → dial target → relay, and
//! every exit path runs the same teardown: record the terminal status with
//! the metrics sink and fold the traffic tuple into the access-key and
//! network maps.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::common::{relay, Address, MeteredStream};
use crate::error::Result;
use crate::shadowsocks::{identify, CipherList, ShadowWriter};

use super::metrics::{ConnCounters, ConnStatus, MetricsMap, TcpMetrics};

/// Timeout for the upstream dial
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle time before TCP keepalive probes start
const KEEPALIVE_TIME: Duration = Duration::from_secs(30);

// ============================================================================
// Server
// ============================================================================

/// Multi-key Shadowsocks TCP server
pub struct TcpServer {
    listen: SocketAddr,
    ciphers: Arc<CipherList>,
    sink: Arc<dyn TcpMetrics>,
    access_key_metrics: Arc<MetricsMap>,
    net_metrics: Arc<MetricsMap>,
}

impl TcpServer {
    pub fn new(listen: SocketAddr, ciphers: CipherList, sink: Arc<dyn TcpMetrics>) -> Self {
        Self {
            listen,
            ciphers: Arc::new(ciphers),
            sink,
            access_key_metrics: Arc::new(MetricsMap::new()),
            net_metrics: Arc::new(MetricsMap::new()),
        }
    }

    /// Traffic accumulated per access key
    pub fn access_key_metrics(&self) -> &Arc<MetricsMap> {
        &self.access_key_metrics
    }

    /// Traffic accumulated per client network
    pub fn net_metrics(&self) -> &Arc<MetricsMap> {
        &self.net_metrics
    }

    /// Bind the listen address and serve until shutdown
    pub async fn run(self: Arc<Self>, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let listener = TcpListener::bind(self.listen).await?;
        info!("listening TCP on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already-bound listener until shutdown
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("new connection from {}", peer);
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream, peer).await;
                            });
                        }
                        Err(e) => {
                            // Transient accept failures are retried.
                            warn!("failed to accept: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("TCP server shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        self.sink.add_tcp_connection();

        if let Err(e) = enable_keepalive(&stream) {
            debug!("{}: failed to enable keepalive: {}", peer, e);
        }
        if let Err(e) = stream.set_nodelay(true) {
            debug!("{}: failed to set nodelay: {}", peer, e);
        }

        let counters = ConnCounters::default();
        let mut guard = ConnGuard::new(
            self.sink.clone(),
            self.access_key_metrics.clone(),
            self.net_metrics.clone(),
            net_key(Some(peer)),
            counters.clone(),
        );

        let client = MeteredStream::with_counters(
            stream,
            counters.proxy_client.clone(),
            counters.client_proxy.clone(),
        );
        let (client_read, client_write) = tokio::io::split(client);

        let (index, mut shadow_reader) = match identify(client_read, &self.ciphers).await {
            Ok(selected) => selected,
            Err(e) => {
                warn!("{}: failed to find a valid cipher: {}", peer, e);
                guard.status = ConnStatus::ErrCipher;
                return;
            }
        };
        guard.access_key = index.to_string();

        let cipher = match self.ciphers.get(index) {
            Some(cipher) => cipher.clone(),
            None => {
                guard.status = ConnStatus::ErrCipher;
                return;
            }
        };

        let target_addr = match Address::read_from(&mut shadow_reader).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!("{}: failed to read target address: {}", peer, e);
                guard.status = ConnStatus::ErrReadAddress;
                return;
            }
        };

        let target = match timeout(DIAL_TIMEOUT, connect_target(&target_addr)).await {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => {
                warn!("{}: failed to connect to {}: {}", peer, target_addr, e);
                guard.status = ConnStatus::ErrConnect;
                return;
            }
            Err(_) => {
                warn!("{}: timed out connecting to {}", peer, target_addr);
                guard.status = ConnStatus::ErrConnect;
                return;
            }
        };

        if let Err(e) = enable_keepalive(&target) {
            debug!("{}: failed to enable keepalive on target: {}", peer, e);
        }
        if let Err(e) = target.set_nodelay(true) {
            debug!("{}: failed to set nodelay on target: {}", peer, e);
        }

        let target = MeteredStream::with_counters(
            target,
            counters.target_proxy.clone(),
            counters.proxy_target.clone(),
        );
        let (target_read, target_write) = tokio::io::split(target);
        let shadow_writer = ShadowWriter::new(client_write, cipher);

        info!("proxy {} <-> {} (key {})", peer, target_addr, guard.access_key);

        match relay(shadow_reader, shadow_writer, target_read, target_write).await {
            Ok((up, down)) => {
                debug!("{}: relay done, up {} bytes, down {} bytes", peer, up, down);
            }
            Err(e) => {
                warn!("{}: relay error: {}", peer, e);
                guard.status = ConnStatus::ErrRelay;
            }
        }
    }
}

// ============================================================================
// Teardown guard
// ============================================================================

/// Records a connection's outcome on drop.
///
/// Living on the handler's stack, the guard runs on every exit path —
/// early returns and panics included — so exactly one terminal status is
/// recorded per accepted connection.
struct ConnGuard {
    sink: Arc<dyn TcpMetrics>,
    access_key_metrics: Arc<MetricsMap>,
    net_metrics: Arc<MetricsMap>,
    access_key: String,
    net_key: String,
    status: ConnStatus,
    start: Instant,
    counters: ConnCounters,
}

impl ConnGuard {
    fn new(
        sink: Arc<dyn TcpMetrics>,
        access_key_metrics: Arc<MetricsMap>,
        net_metrics: Arc<MetricsMap>,
        net_key: String,
        counters: ConnCounters,
    ) -> Self {
        Self {
            sink,
            access_key_metrics,
            net_metrics,
            access_key: "INVALID".to_string(),
            net_key,
            status: ConnStatus::Ok,
            start: Instant::now(),
            counters,
        }
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        let traffic = self.counters.snapshot();

        self.sink
            .remove_tcp_connection(&self.access_key, self.status, duration);
        self.sink.record_traffic(&self.access_key, &traffic);
        self.access_key_metrics.add(&self.access_key, &traffic);
        self.net_metrics.add(&self.net_key, &traffic);

        debug!(
            "done with status {}, key {}, duration {:?}",
            self.status, self.access_key, duration
        );
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn connect_target(addr: &Address) -> std::io::Result<TcpStream> {
    match addr {
        Address::Socket(socket_addr) => TcpStream::connect(socket_addr).await,
        Address::Domain(domain, port) => TcpStream::connect((domain.as_str(), *port)).await,
    }
}

fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Coarse metrics grouping for a client address: the source IP masked to
/// /24 (IPv4) or /112 (IPv6). Unavailable peers collapse to `"INVALID"`.
fn net_key(peer: Option<SocketAddr>) -> String {
    let Some(addr) = peer else {
        return "INVALID".to_string();
    };
    match addr.ip() {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.0/24", o[0], o[1], o[2])
        }
        IpAddr::V6(v6) => {
            let mut segments = v6.segments();
            segments[7] = 0;
            format!("{}/112", Ipv6Addr::from(segments))
        }
    }
}
