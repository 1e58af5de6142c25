//! Shadowmux - a multi-key Shadowsocks TCP proxy server
//!
//! One listening endpoint serves many access keys. There is no user
//! identifier on the wire: a new connection is attributed to a key by
//! attempting to authenticate its first AEAD length frame against each
//! configured cipher in order, buffering the consumed bytes so the
//! selected cipher decrypts the stream from byte zero.
//!
//! # Connection Flow
//!
//! ```text
//! accept
//! → meter client stream
//! → trial-identify cipher          (shadowsocks::identify)
//! → decrypt stream                 (shadowsocks::ShadowReader/Writer)
//! → read destination address       (common::Address)
//! → dial target, meter it
//! → bidirectional relay            (common::relay)
//! → teardown: status + traffic into metrics maps
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Address, MeteredStream, relay
//! ├── crypto/          # AEAD ciphers, key schedule
//! ├── shadowsocks/     # Framing streams, trial identification
//! └── app/             # Server, metrics, Prometheus endpoint
//! ```

// Core types
pub mod common;
pub mod error;

// Protocol layers
pub mod crypto;
pub mod shadowsocks;

// Application
pub mod app;
pub mod config;

// Re-exports for convenience
pub use app::{ConnStatus, MetricsMap, PrometheusTcpMetrics, ProxyMetrics, TcpMetrics, TcpServer};
pub use common::{Address, MeteredStream};
pub use config::Config;
pub use error::{Error, Result};
pub use shadowsocks::{identify, Cipher, CipherList, ShadowReader, ShadowWriter};
