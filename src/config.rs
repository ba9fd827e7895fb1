//! Session configuration
//!
//! [`SessionConfig`] is plain serde data with defaults for every tuning knob, so
//! a host can load it from YAML or build it in code:
//!
//! ```rust
//! use avatar_sync::SessionConfig;
//!
//! let config = SessionConfig::builder("https://api.example.test", "avatar-7")
//!     .credentials("app", "secret")
//!     .fps(30)
//!     .idle_clip("idle01", 24)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.fps, 30);
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::decode::{DecodePoolConfig, DeviceClass};
use crate::error::{Result, SessionError};
use crate::protocol::ClientConfig;
use crate::resource::AssetCacheConfig;
use crate::retry::RetryPolicy;

/// A clip played while the session is offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdleClip {
    /// Segment name, resolved against the resource pack
    pub name: String,
    /// Frames in the clip
    pub frames: u32,
}

impl IdleClip {
    pub fn new(name: impl Into<String>, frames: u32) -> Self {
        Self { name: name.into(), frames }
    }
}

/// Retry policies for the two recovery layers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Transport reconnects inside one session
    pub transport: RetryPolicy,
    /// Full session restarts
    pub session: RetryPolicy,
}

/// Configuration for one [`AvatarSession`](crate::AvatarSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session service endpoint
    pub base_url: String,
    pub app_id: String,
    #[serde(skip_serializing)]
    pub app_secret: String,
    pub avatar_id: String,

    /// Render frame rate
    pub fps: u32,
    pub device_class: DeviceClass,

    pub decode: DecodePoolConfig,
    pub cache: AssetCacheConfig,
    pub retry: RetrySettings,

    pub inactivity_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    /// Bound on session start plus handshake
    pub handshake_timeout_ms: u64,
    /// Offline idle-clip cadence
    pub offline_tick_ms: u64,
    /// Quiet period that coalesces restart triggers
    pub restart_debounce_ms: u64,

    /// Fallback clips, preloaded at session start
    pub idle_clips: Vec<IdleClip>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            app_id: String::new(),
            app_secret: String::new(),
            avatar_id: String::new(),
            fps: 25,
            device_class: DeviceClass::default(),
            decode: DecodePoolConfig::default(),
            cache: AssetCacheConfig::default(),
            retry: RetrySettings::default(),
            inactivity_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 15_000,
            offline_tick_ms: 300,
            restart_debounce_ms: 100,
            idle_clips: Vec::new(),
        }
    }
}

impl SessionConfig {
    pub fn builder(
        base_url: impl Into<String>,
        avatar_id: impl Into<String>,
    ) -> SessionConfigBuilder {
        SessionConfigBuilder {
            config: SessionConfig {
                base_url: base_url.into(),
                avatar_id: avatar_id.into(),
                ..SessionConfig::default()
            },
        }
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_yaml_ng::from_str(yaml).map_err(|e| SessionError::invalid_config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<()> {
        if self.base_url.trim().is_empty() {
            return Err(SessionError::invalid_config("base_url is empty"));
        }
        if self.avatar_id.trim().is_empty() {
            return Err(SessionError::invalid_config("avatar_id is empty"));
        }
        if !(1..=120).contains(&self.fps) {
            return Err(SessionError::invalid_config(format!("fps {} outside 1..=120", self.fps)));
        }
        if self.decode.max_parallel == 0 {
            return Err(SessionError::invalid_config("decode.max_parallel must be at least 1"));
        }
        let policies = [("transport", &self.retry.transport), ("session", &self.retry.session)];
        for (name, policy) in policies {
            if policy.max_rounds == 0 || policy.max_attempts_per_round == 0 {
                return Err(SessionError::invalid_config(format!(
                    "retry.{} needs at least one round and one attempt",
                    name
                )));
            }
        }
        if self.offline_tick_ms == 0 {
            return Err(SessionError::invalid_config("offline_tick_ms must be positive"));
        }
        if let Some(clip) = self.idle_clips.iter().find(|c| c.name.is_empty() || c.frames == 0) {
            return Err(SessionError::invalid_config(format!(
                "idle clip '{}' needs a name and at least one frame",
                clip.name
            )));
        }
        Ok(())
    }

    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn offline_tick(&self) -> Duration {
        Duration::from_millis(self.offline_tick_ms)
    }

    pub fn restart_debounce(&self) -> Duration {
        Duration::from_millis(self.restart_debounce_ms)
    }

    /// Protocol client tuning derived from this config.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            fps: self.fps,
            inactivity_timeout: self.inactivity_timeout(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            retry: self.retry.transport,
        }
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn credentials(mut self, app_id: impl Into<String>, app_secret: impl Into<String>) -> Self {
        self.config.app_id = app_id.into();
        self.config.app_secret = app_secret.into();
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.config.fps = fps;
        self
    }

    pub fn device_class(mut self, device_class: DeviceClass) -> Self {
        self.config.device_class = device_class;
        self
    }

    pub fn decode(mut self, decode: DecodePoolConfig) -> Self {
        self.config.decode = decode;
        self
    }

    pub fn cache(mut self, cache: AssetCacheConfig) -> Self {
        self.config.cache = cache;
        self
    }

    pub fn transport_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry.transport = policy;
        self
    }

    pub fn session_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry.session = policy;
        self
    }

    pub fn inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.config.inactivity_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn idle_clip(mut self, name: impl Into<String>, frames: u32) -> Self {
        self.config.idle_clips.push(IdleClip::new(name, frames));
        self
    }

    /// Validate and finish.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
