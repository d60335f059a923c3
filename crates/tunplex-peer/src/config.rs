use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tunplex_frame::{CipherConfig, CipherSpec, FrameConfig, DEFAULT_MAX_PAYLOAD};

use crate::error::{PeerError, Result};
use crate::imux::{ImuxPlan, DEFAULT_IMUX_DEADLINE};
use crate::pool::PoolConfig;
use crate::session::{SessionConfig, DEFAULT_REQUEST_TIMEOUT};

fn default_cipher() -> Vec<String> {
    vec!["aes".to_string()]
}

/// Tunnel settings shared by client and server, loaded from JSON.
///
/// Every field has a default, so `{}` is a valid (plain-text, no key)
/// configuration once `cipher` is emptied.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Passphrase the cipher keys are derived from.
    pub key: String,
    /// Connection-level stages, applied to every frame.
    pub cipher: Vec<String>,
    /// Channel-level stages, applied to every channel's messages.
    pub channel_cipher: Vec<String>,

    pub pool_min_free: usize,
    pub pool_max: usize,
    pub pool_max_free: usize,
    pub pool_concurrency: usize,
    pub pool_prefer_connected: bool,
    pub connect_delay_ms: u64,
    pub connect_delay_multiplier: f64,
    pub connect_delay_max_ms: u64,

    pub imux_ws: u16,
    pub imux_http: u16,
    pub imux_wsso: u16,
    pub imux_delay_ms: u64,
    pub imux_deadline_ms: u64,

    pub request_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub max_frame_payload: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            key: String::new(),
            cipher: default_cipher(),
            channel_cipher: Vec::new(),
            pool_min_free: pool.min_free,
            pool_max: pool.max,
            pool_max_free: pool.max_free,
            pool_concurrency: pool.concurrency,
            pool_prefer_connected: pool.prefer_connected,
            connect_delay_ms: pool.connect_delay.as_millis() as u64,
            connect_delay_multiplier: pool.connect_delay_multiplier,
            connect_delay_max_ms: pool.connect_delay_max.as_millis() as u64,
            imux_ws: 0,
            imux_http: 0,
            imux_wsso: 0,
            imux_delay_ms: 0,
            imux_deadline_ms: DEFAULT_IMUX_DEADLINE.as_millis() as u64,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            dial_timeout_ms: 10_000,
            max_frame_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

impl fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("key", &format_args!("<redacted:{} bytes>", self.key.len()))
            .field("cipher", &self.cipher)
            .field("channel_cipher", &self.channel_cipher)
            .field("pool_min_free", &self.pool_min_free)
            .field("pool_max", &self.pool_max)
            .field("pool_max_free", &self.pool_max_free)
            .field("pool_concurrency", &self.pool_concurrency)
            .field("pool_prefer_connected", &self.pool_prefer_connected)
            .field("connect_delay_ms", &self.connect_delay_ms)
            .field("connect_delay_multiplier", &self.connect_delay_multiplier)
            .field("connect_delay_max_ms", &self.connect_delay_max_ms)
            .field("imux_ws", &self.imux_ws)
            .field("imux_http", &self.imux_http)
            .field("imux_wsso", &self.imux_wsso)
            .field("imux_delay_ms", &self.imux_delay_ms)
            .field("imux_deadline_ms", &self.imux_deadline_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("dial_timeout_ms", &self.dial_timeout_ms)
            .field("max_frame_payload", &self.max_frame_payload)
            .finish()
    }
}

impl TunnelConfig {
    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| PeerError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let stream = CipherSpec::parse(&self.cipher)?;
        let channel = CipherSpec::parse(&self.channel_cipher)?;
        if self.key.is_empty() && !(stream.is_empty() && channel.is_empty()) {
            return Err(PeerError::Config(
                "a key is required when a cipher is configured".to_string(),
            ));
        }
        self.frame_config()?.validate()?;
        self.pool_config().validate()?;
        let plan = self.imux_plan();
        if plan.is_enabled() {
            plan.validate()?;
        }
        Ok(())
    }

    fn cipher_config(&self, names: &[String]) -> Result<Option<CipherConfig>> {
        let spec = CipherSpec::parse(names)?;
        if spec.is_empty() {
            return Ok(None);
        }
        Ok(Some(CipherConfig::new(spec, &self.key)?))
    }

    pub fn frame_config(&self) -> Result<FrameConfig> {
        let frame = FrameConfig::default().with_max_payload(self.max_frame_payload);
        Ok(match self.cipher_config(&self.cipher)? {
            Some(cipher) => frame.with_cipher(cipher),
            None => frame,
        })
    }

    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            channel_cipher: self.cipher_config(&self.channel_cipher)?,
            request_timeout: self.request_timeout(),
        })
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_free: self.pool_min_free,
            max: self.pool_max,
            max_free: self.pool_max_free,
            concurrency: self.pool_concurrency,
            prefer_connected: self.pool_prefer_connected,
            connect_delay: Duration::from_millis(self.connect_delay_ms),
            connect_delay_multiplier: self.connect_delay_multiplier,
            connect_delay_max: Duration::from_millis(self.connect_delay_max_ms),
            ..PoolConfig::default()
        }
    }

    pub fn imux_plan(&self) -> ImuxPlan {
        ImuxPlan::new(self.imux_ws, self.imux_wsso, self.imux_http)
            .with_delay(Duration::from_millis(self.imux_delay_ms))
    }

    pub fn imux_deadline(&self) -> Duration {
        Duration::from_millis(self.imux_deadline_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}
