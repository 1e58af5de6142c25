//! Application layer
//!
//! Wires the protocol pieces into a running server: the accept loop and
//! connection handler, the metrics sink and aggregation maps, and the
//! Prometheus scrape endpoint.

pub mod metrics;
pub mod server;
pub mod stats_api;

pub use metrics::{
    ConnStatus, MetricsMap, PrometheusTcpMetrics, ProxyMetrics, TcpMetrics,
};
pub use server::TcpServer;
pub use stats_api::start_api_server;
