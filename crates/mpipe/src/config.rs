//! Relay configuration
//!
//! Decoder limits and upload tuning, read once per request through a
//! [`RelayConfigProvider`].
//!
//! # Example
//! ```
//! use std::sync::Arc;
//! use mpipe::config::{RelayConfig, RelayConfigProvider, HotReloadConfigProvider};
//!
//! let provider = Arc::new(HotReloadConfigProvider::default());
//! assert_eq!(provider.snapshot().max_form_parts, 1000);
//!
//! let mut config = RelayConfig::default();
//! config.max_form_parts = 10;
//! provider.update(Arc::new(config));
//! assert_eq!(provider.snapshot().max_form_parts, 10);
//! ```

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

/// Source of [`RelayConfig`] snapshots.
///
/// Built-in providers:
/// - [`StaticConfigProvider`] - Immutable configuration (default if not set)
/// - [`HotReloadConfigProvider`] - Runtime-updatable configuration
pub trait RelayConfigProvider: Send + Sync + 'static {
    /// Returns a snapshot of the current configuration.
    ///
    /// A request keeps the snapshot it started with even if the provider is
    /// updated while it runs.
    fn snapshot(&self) -> Arc<RelayConfig>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct RelayConfig {
    /// Maximum size of a single non-file form field in bytes.
    ///
    /// Default: 1 MB (1024 * 1024)
    pub max_form_field_size: usize,

    /// Maximum total size of all non-file form fields in bytes.
    ///
    /// Default: 20 MB (20 * 1024 * 1024)
    pub max_form_fields_size: usize,

    /// Maximum number of parts in one request.
    ///
    /// Default: 1000
    pub max_form_parts: usize,

    /// Maximum size of the header block of one part in bytes.
    ///
    /// Default: 16 KB (16 * 1024)
    pub max_header_size: usize,

    /// Number of body chunks buffered between the decoder and a part consumer.
    ///
    /// Default: 16
    pub part_channel_capacity: usize,

    /// Per-upload deadline in seconds. An upload that does not settle in time
    /// fails the request.
    ///
    /// Default: none
    pub upload_timeout_secs: Option<u64>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_form_field_size: 1024 * 1024,       // 1 MB
            max_form_fields_size: 20 * 1024 * 1024, // 20 MB
            max_form_parts: 1000,
            max_header_size: 16 * 1024, // 16 KB
            part_channel_capacity: 16,
            upload_timeout_secs: None,
        }
    }
}

impl RelayConfig {
    #[must_use]
    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug)]
pub struct StaticConfigProvider {
    inner: Arc<RelayConfig>,
}

impl StaticConfigProvider {
    #[must_use]
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self { inner: config }
    }
}

impl Default for StaticConfigProvider {
    fn default() -> Self {
        Self::new(Arc::new(RelayConfig::default()))
    }
}

impl RelayConfigProvider for StaticConfigProvider {
    fn snapshot(&self) -> Arc<RelayConfig> {
        Arc::clone(&self.inner)
    }
}

/// Runtime-updatable configuration, backed by `ArcSwap` for lock-free reads.
#[derive(Debug)]
pub struct HotReloadConfigProvider {
    inner: ArcSwap<RelayConfig>,
}

impl HotReloadConfigProvider {
    #[must_use]
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self {
            inner: ArcSwap::from(config),
        }
    }

    /// Replaces the configuration atomically.
    pub fn update(&self, config: Arc<RelayConfig>) {
        self.inner.store(config);
    }
}

impl Default for HotReloadConfigProvider {
    fn default() -> Self {
        Self::new(Arc::new(RelayConfig::default()))
    }
}

impl RelayConfigProvider for HotReloadConfigProvider {
    fn snapshot(&self) -> Arc<RelayConfig> {
        self.inner.load_full()
    }
}
