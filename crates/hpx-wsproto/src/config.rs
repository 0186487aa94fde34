//! Connection configuration.
//!
//! A [`Config`] is built once through [`Config::builder`], validated eagerly, and
//! never changes afterwards. Servers usually share one `Config` across all
//! connections and adjust individual connections with [`ConnectionOverrides`].

use std::time::Duration;

use flate2::Compression;

use crate::{Result, WebSocketError};

/// What happens when a send cannot proceed immediately.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendPolicy {
    /// Wait for earlier sends; no limit on waiting senders.
    #[default]
    Unbounded,
    /// At most `n` sends may be queued or in flight; further sends fail with
    /// [`WebSocketError::SendQueueFull`].
    Bounded(usize),
    /// Fail with [`WebSocketError::SendQueueFull`] if another send is in progress.
    FailFast,
}

/// How a server reacts to a `permessage-deflate` offer it cannot satisfy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NegotiationMode {
    /// Fail the handshake with [`WebSocketError::NegotiationMismatch`].
    #[default]
    Strict,
    /// Decline the extension and continue uncompressed.
    Permissive,
}

/// `permessage-deflate` settings.
///
/// ```rust
/// use hpx_wsproto::DeflateConfig;
///
/// let deflate = DeflateConfig {
///     server_no_context_takeover: true,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct DeflateConfig {
    /// Largest window (log2) the client may compress with. Range 8..=15, default 15.
    pub client_max_window_bits: u8,
    /// Largest window (log2) the server may compress with. Range 8..=15, default 15.
    pub server_max_window_bits: u8,
    /// Smallest window a peer may request. Range 8..=15, default 8.
    pub min_window_bits: u8,
    /// Reset the client's compression context after every message.
    pub client_no_context_takeover: bool,
    /// Reset the server's compression context after every message.
    pub server_no_context_takeover: bool,
    /// Messages shorter than this are sent uncompressed. Default 1024 bytes.
    pub compression_threshold: usize,
    /// Reaction to an unsatisfiable offer. Default [`NegotiationMode::Strict`].
    pub negotiation_mode: NegotiationMode,
    /// DEFLATE level, trading CPU for ratio. Default [`Compression::fast`].
    pub level: Compression,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            client_max_window_bits: 15,
            server_max_window_bits: 15,
            min_window_bits: 8,
            client_no_context_takeover: false,
            server_no_context_takeover: false,
            compression_threshold: 1024,
            negotiation_mode: NegotiationMode::Strict,
            level: Compression::fast(),
        }
    }
}

impl DeflateConfig {
    /// Fast level, small windows and no context takeover: the least memory per
    /// connection.
    pub fn low_latency() -> Self {
        Self {
            level: Compression::fast(),
            client_max_window_bits: 10,
            server_max_window_bits: 10,
            client_no_context_takeover: true,
            server_no_context_takeover: true,
            ..Default::default()
        }
    }

    /// Best level with full windows and context takeover.
    pub fn high_compression() -> Self {
        Self {
            level: Compression::best(),
            compression_threshold: 256,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<()> {
        for (name, bits) in [
            ("client_max_window_bits", self.client_max_window_bits),
            ("server_max_window_bits", self.server_max_window_bits),
            ("min_window_bits", self.min_window_bits),
        ] {
            if !(8..=15).contains(&bits) {
                return Err(invalid(format!("{name} must be in 8..=15, got {bits}")));
            }
        }
        if self.min_window_bits > self.client_max_window_bits
            || self.min_window_bits > self.server_max_window_bits
        {
            return Err(invalid(
                "min_window_bits cannot exceed client_max_window_bits or server_max_window_bits",
            ));
        }
        if self.level.level() > 9 {
            return Err(invalid(format!(
                "compression level must be in 0..=9, got {}",
                self.level.level()
            )));
        }
        Ok(())
    }
}

/// Validated, immutable connection configuration.
#[derive(Clone, Debug)]
pub struct Config {
    permessage_deflate: Option<DeflateConfig>,
    max_frame_size: usize,
    max_message_size: usize,
    close_timeout: Duration,
    auto_respond_to_ping: bool,
    fragment_size: Option<usize>,
    send_policy: SendPolicy,
}

impl Default for Config {
    fn default() -> Self {
        ConfigBuilder::default().into_config()
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Compression settings, `None` when the extension is disabled.
    pub fn permessage_deflate(&self) -> Option<&DeflateConfig> {
        self.permessage_deflate.as_ref()
    }

    /// Largest frame payload accepted or produced.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Largest message accepted, measured after reassembly and inflation.
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Time allowed for the peer to answer a close frame.
    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    pub fn auto_respond_to_ping(&self) -> bool {
        self.auto_respond_to_ping
    }

    /// Payload size outgoing messages are split at, if set.
    pub fn fragment_size(&self) -> Option<usize> {
        self.fragment_size
    }

    pub fn send_policy(&self) -> SendPolicy {
        self.send_policy
    }

    /// Applies per-connection overrides on top of this configuration.
    pub fn with_overrides(&self, overrides: &ConnectionOverrides) -> Config {
        let mut config = self.clone();
        if let Some(deflate) = config.permessage_deflate.as_mut() {
            if let Some(threshold) = overrides.compression_threshold {
                deflate.compression_threshold = threshold;
            }
            if let Some(mode) = overrides.negotiation_mode {
                deflate.negotiation_mode = mode;
            }
        }
        config
    }
}

/// Builder for [`Config`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    permessage_deflate: Option<DeflateConfig>,
    max_frame_size: usize,
    max_message_size: usize,
    close_timeout: Duration,
    auto_respond_to_ping: bool,
    fragment_size: Option<usize>,
    send_policy: SendPolicy,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            permessage_deflate: None,
            max_frame_size: 16 << 20,
            max_message_size: 64 << 20,
            close_timeout: Duration::from_secs(5),
            auto_respond_to_ping: true,
            fragment_size: None,
            send_policy: SendPolicy::Unbounded,
        }
    }
}

impl ConfigBuilder {
    /// Enables `permessage-deflate` with the given settings.
    #[must_use]
    pub fn permessage_deflate(mut self, deflate: DeflateConfig) -> Self {
        self.permessage_deflate = Some(deflate);
        self
    }

    #[must_use]
    pub fn without_compression(mut self) -> Self {
        self.permessage_deflate = None;
        self
    }

    /// Default 16 MiB.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Default 64 MiB.
    #[must_use]
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Default 5 seconds.
    #[must_use]
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Default `true`.
    #[must_use]
    pub fn auto_respond_to_ping(mut self, enabled: bool) -> Self {
        self.auto_respond_to_ping = enabled;
        self
    }

    #[must_use]
    pub fn fragment_size(mut self, size: usize) -> Self {
        self.fragment_size = Some(size);
        self
    }

    #[must_use]
    pub fn send_policy(mut self, policy: SendPolicy) -> Self {
        self.send_policy = policy;
        self
    }

    /// Validates every field and freezes the configuration.
    pub fn build(self) -> Result<Config> {
        if self.max_frame_size == 0 {
            return Err(invalid("max_frame_size must be > 0"));
        }
        if self.max_message_size == 0 {
            return Err(invalid("max_message_size must be > 0"));
        }
        if self.close_timeout.is_zero() {
            return Err(invalid("close_timeout must be > 0"));
        }
        if self.fragment_size == Some(0) {
            return Err(invalid("fragment_size must be > 0"));
        }
        if self.send_policy == SendPolicy::Bounded(0) {
            return Err(invalid("send queue bound must be > 0"));
        }
        if let Some(deflate) = &self.permessage_deflate {
            deflate.validate()?;
        }
        Ok(self.into_config())
    }

    fn into_config(self) -> Config {
        Config {
            permessage_deflate: self.permessage_deflate,
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
            close_timeout: self.close_timeout,
            auto_respond_to_ping: self.auto_respond_to_ping,
            fragment_size: self.fragment_size,
            send_policy: self.send_policy,
        }
    }
}

/// Per-connection values that replace the shared configuration's.
///
/// Fields left as `None` keep the shared value.
#[derive(Clone, Debug, Default)]
pub struct ConnectionOverrides {
    pub compression_threshold: Option<usize>,
    pub negotiation_mode: Option<NegotiationMode>,
}

fn invalid(reason: impl Into<String>) -> WebSocketError {
    WebSocketError::InvalidConfig(reason.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::builder().build().unwrap();
        assert!(config.permessage_deflate().is_none());
        assert_eq!(config.max_frame_size(), 16 << 20);
        assert_eq!(config.close_timeout(), Duration::from_secs(5));
        assert!(config.auto_respond_to_ping());
        assert_eq!(config.send_policy(), SendPolicy::Unbounded);

        let deflate = DeflateConfig::default();
        assert_eq!(deflate.client_max_window_bits, 15);
        assert_eq!(deflate.server_max_window_bits, 15);
        assert_eq!(deflate.negotiation_mode, NegotiationMode::Strict);
    }

    #[test]
    fn test_window_bits_rejected_eagerly() {
        for bits in [0u8, 7, 16, 255] {
            let deflate = DeflateConfig {
                client_max_window_bits: bits,
                ..Default::default()
            };
            let result = Config::builder().permessage_deflate(deflate).build();
            assert!(matches!(result, Err(WebSocketError::InvalidConfig(_))), "{bits}");
        }

        let deflate = DeflateConfig {
            server_max_window_bits: 8,
            min_window_bits: 8,
            ..Default::default()
        };
        assert!(Config::builder().permessage_deflate(deflate).build().is_ok());
    }

    #[test]
    fn test_min_window_cannot_exceed_maximum() {
        let deflate = DeflateConfig {
            server_max_window_bits: 10,
            min_window_bits: 11,
            ..Default::default()
        };
        assert!(Config::builder().permessage_deflate(deflate).build().is_err());
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(Config::builder().max_frame_size(0).build().is_err());
        assert!(Config::builder().max_message_size(0).build().is_err());
        assert!(Config::builder().close_timeout(Duration::ZERO).build().is_err());
        assert!(Config::builder().fragment_size(0).build().is_err());
        assert!(
            Config::builder()
                .send_policy(SendPolicy::Bounded(0))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_overrides_default_to_shared_values() {
        let shared = Config::builder()
            .permessage_deflate(DeflateConfig::default())
            .build()
            .unwrap();

        let same = shared.with_overrides(&ConnectionOverrides::default());
        let deflate = same.permessage_deflate().unwrap();
        assert_eq!(deflate.compression_threshold, 1024);
        assert_eq!(deflate.negotiation_mode, NegotiationMode::Strict);

        let overridden = shared.with_overrides(&ConnectionOverrides {
            compression_threshold: Some(0),
            negotiation_mode: Some(NegotiationMode::Permissive),
        });
        let deflate = overridden.permessage_deflate().unwrap();
        assert_eq!(deflate.compression_threshold, 0);
        assert_eq!(deflate.negotiation_mode, NegotiationMode::Permissive);

        // the shared configuration is untouched
        assert_eq!(
            shared.permessage_deflate().unwrap().compression_threshold,
            1024
        );
    }
}
