//! Protocol Configuration Module
//!
//! Loads the runtime configuration from defaults, an optional TOML file and
//! `TETHER_*` environment variables. The resulting value is never mutated
//! after loading; components receive it as `Arc<ProtocolConfig>`.

use crate::protocol::{serializers, DEFAULT_DAEMON_PORT, DEFAULT_HOST, DEFAULT_NS_PORT, ENV_PREFIX};
use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Daemon request loop flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// One task per client connection
    #[default]
    Threaded,
    /// One task polling every connection, with a bounded worker pool
    Multiplexed,
}

/// Immutable runtime configuration shared by daemons, proxies and codecs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Default bind host for daemons
    pub host: String,
    /// Default daemon port (0 = ephemeral)
    pub port: u16,
    /// Name server host used when a URI carries no location
    pub ns_host: String,
    /// Name server port
    pub ns_port: u16,
    /// Seconds before a connect or call fails (0 = wait forever)
    pub comm_timeout: f64,
    /// Wake interval of the multiplexed loop and housekeeping, in seconds
    pub poll_timeout: f64,
    /// Reconnect attempts a proxy makes when autoreconnect is enabled
    pub max_retries: u32,
    /// Largest accepted message body in bytes (0 = unlimited)
    pub max_message_size: usize,
    pub server_type: ServerType,
    /// Worker pool bound for oneway calls and stream production
    pub threadpool_size: usize,
    /// Serializer used by proxies for outgoing calls
    pub serializer: String,
    /// Serializers a daemon is willing to decode
    pub serializers_accepted: Vec<String>,
    /// Shared secret for message HMACs
    pub hmac_key: Option<String>,
    /// Run oneway calls on a separate worker
    pub oneway_threaded: bool,
    /// Allow methods to return item streams
    pub iter_streaming: bool,
    /// Maximum stream age in seconds (0 = unlimited)
    pub iter_stream_lifetime: f64,
    /// Seconds a stream survives its owning connection (0 = dropped at once)
    pub iter_stream_linger: f64,
    /// Include per-frame descriptions in remote tracebacks
    pub detailed_traceback: bool,
    /// Trace-log every frame in hex
    pub log_wire: bool,
    /// Exchange object metadata during the handshake
    pub metadata: bool,
    /// Rewrite references to registered objects in replies into URIs
    pub autoproxy: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_DAEMON_PORT,
            ns_host: DEFAULT_HOST.to_string(),
            ns_port: DEFAULT_NS_PORT,
            comm_timeout: 0.0,
            poll_timeout: 2.0,
            max_retries: 0,
            max_message_size: 0,
            server_type: ServerType::Threaded,
            threadpool_size: 40,
            serializer: serializers::JSON.to_string(),
            serializers_accepted: serializers::ALL.iter().map(|s| s.to_string()).collect(),
            hmac_key: None,
            oneway_threaded: true,
            iter_streaming: true,
            iter_stream_lifetime: 0.0,
            iter_stream_linger: 30.0,
            detailed_traceback: false,
            log_wire: false,
            metadata: true,
            autoproxy: true,
        }
    }
}

impl ProtocolConfig {
    /// Load configuration from an optional TOML file with environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!("Loading protocol config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        // Override with environment variables (TETHER_ prefix)
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("serializers_accepted"),
        );

        let config: ProtocolConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        debug!(?config.server_type, comm_timeout = config.comm_timeout, "Protocol config loaded");
        Ok(config)
    }

    /// Check option ranges and cross-field consistency
    pub fn validate(&self) -> Result<()> {
        if self.comm_timeout < 0.0 {
            bail!("comm_timeout must not be negative");
        }
        if self.poll_timeout <= 0.0 {
            bail!("poll_timeout must be positive");
        }
        if self.iter_stream_lifetime < 0.0 || self.iter_stream_linger < 0.0 {
            bail!("stream lifetime and linger must not be negative");
        }
        if self.threadpool_size == 0 {
            bail!("threadpool_size must be at least 1");
        }
        if self.ns_port == 0 {
            bail!("ns_port must be non-zero");
        }
        if self.serializers_accepted.is_empty() {
            bail!("serializers_accepted must name at least one serializer");
        }
        for name in &self.serializers_accepted {
            if !serializers::ALL.contains(&name.as_str()) {
                bail!("unknown serializer '{}' in serializers_accepted", name);
            }
        }
        if !serializers::ALL.contains(&self.serializer.as_str()) {
            bail!("unknown serializer '{}'", self.serializer);
        }
        if matches!(&self.hmac_key, Some(key) if key.is_empty()) {
            bail!("hmac_key must not be empty when set");
        }
        Ok(())
    }

    /// Serialize the effective configuration, e.g. for diagnostics
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    pub fn comm_timeout_duration(&self) -> Option<Duration> {
        seconds(self.comm_timeout)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.poll_timeout)
    }

    pub fn stream_lifetime(&self) -> Option<Duration> {
        seconds(self.iter_stream_lifetime)
    }

    pub fn stream_linger(&self) -> Option<Duration> {
        seconds(self.iter_stream_linger)
    }

    pub fn hmac_key_bytes(&self) -> Option<&[u8]> {
        self.hmac_key.as_deref().map(str::as_bytes)
    }

    /// Whether a daemon decodes bodies written with this serializer
    pub fn accepts_serializer(&self, name: &str) -> bool {
        self.serializers_accepted.iter().any(|s| s == name)
    }

    pub fn with_comm_timeout(mut self, seconds: f64) -> Self {
        self.comm_timeout = seconds;
        self
    }

    pub fn with_poll_timeout(mut self, seconds: f64) -> Self {
        self.poll_timeout = seconds;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_server_type(mut self, server_type: ServerType) -> Self {
        self.server_type = server_type;
        self
    }

    pub fn with_threadpool_size(mut self, size: usize) -> Self {
        self.threadpool_size = size;
        self
    }

    pub fn with_serializer(mut self, name: impl Into<String>) -> Self {
        self.serializer = name.into();
        self
    }

    pub fn with_serializers_accepted<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.serializers_accepted = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hmac_key(mut self, key: impl Into<String>) -> Self {
        self.hmac_key = Some(key.into());
        self
    }

    pub fn with_name_server(mut self, host: impl Into<String>, port: u16) -> Self {
        self.ns_host = host.into();
        self.ns_port = port;
        self
    }

    pub fn with_stream_limits(mut self, lifetime: f64, linger: f64) -> Self {
        self.iter_stream_lifetime = lifetime;
        self.iter_stream_linger = linger;
        self
    }

    pub fn with_iter_streaming(mut self, enabled: bool) -> Self {
        self.iter_streaming = enabled;
        self
    }

    pub fn with_detailed_traceback(mut self, enabled: bool) -> Self {
        self.detailed_traceback = enabled;
        self
    }

    pub fn with_autoproxy(mut self, enabled: bool) -> Self {
        self.autoproxy = enabled;
        self
    }
}

fn seconds(value: f64) -> Option<Duration> {
    (value > 0.0).then(|| Duration::from_secs_f64(value))
}

/// Load and validate the configuration, falling back to defaults without a file
pub fn load_config(path: Option<&Path>) -> Result<ProtocolConfig> {
    ProtocolConfig::load(path)
}
