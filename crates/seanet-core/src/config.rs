//! Client configuration.
//!
//! Programmatic only — file formats and CLI flags belong to the embedding
//! application. `ClientConfig::new` fills in the defaults; fields are public
//! so callers can override them directly.

use crate::error::ClientError;
use sn_protocol::{BroadcastOptions, MaritimeId, PositionTime};
use std::sync::Arc;
use std::time::Duration;

/// Supplies the client's current position when the engine needs one (the
/// handshake `Hello`, the periodic report). An `Err` means "no fix right
/// now"; the engine falls back to the last known position.
pub type PositionSupplier = dyn Fn() -> Result<PositionTime, String> + Send + Sync;

/// A position stamped with the current wall-clock time.
pub fn position_now(latitude: f64, longitude: f64) -> PositionTime {
    PositionTime::new(latitude, longitude, chrono::Utc::now().timestamp_millis())
}

/// Reconnect back-off: exponential from `initial` up to `max`, with a
/// multiplicative jitter of `1 ± jitter`, retried until `close()` unless
/// `max_attempts` is set.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    /// Fraction in `0.0..=1.0`; `0.25` spreads delays over `0.75x..1.25x`.
    pub jitter: f64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy {
            initial: Duration::from_millis(250),
            max: Duration::from_secs(30),
            jitter: 0.25,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (0-based).
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(32) as i32);
        let base = (self.initial.as_secs_f64() * exp).min(self.max.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + 2.0 * jitter * rand::random::<f64>();
        Duration::from_secs_f64((base * factor).min(self.max.as_secs_f64()))
    }
}

/// Everything the engine needs to run one logical session.
#[derive(Clone)]
pub struct ClientConfig {
    /// Stable identity announced in `Hello`.
    pub local_id: MaritimeId,
    /// `host`, `host:port`, or a full `ws://` / `wss://` URL.
    pub host: String,
    pub(crate) position_supplier: Arc<PositionSupplier>,
    /// Options applied by [`crate::client::MaritimeClient::broadcast`].
    pub default_broadcast_options: BroadcastOptions,
    pub reconnect: ReconnectPolicy,
    /// Idle interval after which a one-way keep-alive frame is sent.
    pub keep_alive_interval: Duration,
    /// Period of the position report task.
    pub position_interval: Duration,
    /// Bound on transport open plus handshake, per attempt.
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(
        local_id: MaritimeId,
        host: impl Into<String>,
        position_supplier: impl Fn() -> Result<PositionTime, String> + Send + Sync + 'static,
    ) -> Self {
        ClientConfig {
            local_id,
            host: host.into(),
            position_supplier: Arc::new(position_supplier),
            default_broadcast_options: BroadcastOptions::default(),
            reconnect: ReconnectPolicy::default(),
            keep_alive_interval: Duration::from_secs(30),
            position_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// A supplier that always reports the same fix. Useful for shore
    /// stations and tests.
    pub fn fixed_position(position: PositionTime) -> impl Fn() -> Result<PositionTime, String> {
        move || Ok(position)
    }

    pub(crate) fn validate(&self) -> Result<(), ClientError> {
        if self.host.is_empty() {
            return Err(ClientError::ConnectFailed("host must not be empty".to_owned()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("local_id", &self.local_id)
            .field("host", &self.host)
            .field("default_broadcast_options", &self.default_broadcast_options)
            .field("reconnect", &self.reconnect)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .field("position_interval", &self.position_interval)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}
