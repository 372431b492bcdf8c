//! Session configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Response modality options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseModality {
    Text,
    Audio,
}

impl ResponseModality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Audio => "AUDIO",
        }
    }
}

/// Media resolution options for video input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaResolution {
    Low,
    Medium,
    High,
}

impl MediaResolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "MEDIA_RESOLUTION_LOW",
            Self::Medium => "MEDIA_RESOLUTION_MEDIUM",
            Self::High => "MEDIA_RESOLUTION_HIGH",
        }
    }
}

/// Reconnection policy applied after error-triggered closures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; doubles on every consecutive failure.
    pub base_delay: Duration,
    /// Consecutive failures tolerated before the session is reported as failed.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for a retry scheduled after `attempt` previous consecutive failures:
    /// `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor)
    }

    /// Whether another retry may be scheduled after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Per-call timeouts for capability handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolTimeouts {
    /// Local queries against the rendered page.
    pub fast: Duration,
    /// File I/O, code execution and other slow operations.
    pub slow: Duration,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            fast: Duration::from_secs(10),
            slow: Duration::from_secs(30),
        }
    }
}

/// Configuration for a live voice session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub url: String,
    #[serde(skip_serializing, default)]
    pub api_key: String,
    pub model: String,
    pub response_modality: ResponseModality,
    pub system_instruction: Option<String>,
    pub temperature: Option<f32>,
    pub voice_name: Option<String>,
    pub media_resolution: Option<MediaResolution>,
    pub reconnect: ReconnectPolicy,
    /// Timeout for the `setupComplete` handshake.
    pub setup_timeout: Duration,
    /// Samples per outbound microphone frame (320 = 20 ms at 16 kHz).
    pub capture_block_samples: usize,
    /// Capacity of the outbound transport queue; frames beyond it are dropped.
    pub outbound_capacity: usize,
    pub video_interval: Duration,
    pub video_max_width: u32,
    pub video_jpeg_quality: u8,
    /// How often the host samples the playback level meter.
    pub meter_interval: Duration,
    pub tool_timeouts: ToolTimeouts,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: LIVE_ENDPOINT.to_string(),
            api_key: String::new(),
            model: "models/gemini-2.0-flash-live-001".to_string(),
            response_modality: ResponseModality::Audio,
            system_instruction: None,
            temperature: Some(0.7),
            voice_name: None,
            media_resolution: Some(MediaResolution::Medium),
            reconnect: ReconnectPolicy::default(),
            setup_timeout: Duration::from_secs(10),
            capture_block_samples: 320,
            outbound_capacity: 64,
            video_interval: Duration::from_secs(1),
            video_max_width: 640,
            video_jpeg_quality: 75,
            meter_interval: Duration::from_millis(50),
            tool_timeouts: ToolTimeouts::default(),
        }
    }
}

impl SessionConfig {
    /// Create a configuration from an API key and optional base configuration.
    pub fn from_api_key(api_key: &str, config: Option<SessionConfig>) -> Self {
        let mut config = config.unwrap_or_default();
        config.api_key = api_key.to_string();
        config
    }

    /// Build a configuration from the environment.
    ///
    /// `GEMINI_API_KEY` is required; `PAGELIVE_MODEL`, `PAGELIVE_VOICE` and
    /// `PAGELIVE_SYSTEM_PROMPT` override the defaults when set.
    pub fn from_env() -> Result<Self, std::env::VarError> {
        let api_key = std::env::var("GEMINI_API_KEY")?;
        let mut config = Self::from_api_key(&api_key, None);
        if let Ok(model) = std::env::var("PAGELIVE_MODEL") {
            config.model = model;
        }
        if let Ok(voice) = std::env::var("PAGELIVE_VOICE") {
            config.voice_name = Some(voice);
        }
        if let Ok(prompt) = std::env::var("PAGELIVE_SYSTEM_PROMPT") {
            config.system_instruction = Some(prompt);
        }
        Ok(config)
    }

    /// Full websocket URL including the key query parameter.
    pub fn endpoint(&self) -> String {
        if self.api_key.is_empty() {
            self.url.clone()
        } else {
            format!("{}?key={}", self.url, self.api_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delays_double() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert!(policy.allows(4));
        assert!(!policy.allows(5));
    }

    #[test]
    fn test_endpoint_includes_key() {
        let config = SessionConfig::from_api_key("abc", None);
        assert!(config.endpoint().ends_with("BidiGenerateContent?key=abc"));
        assert_eq!(SessionConfig::default().endpoint(), LIVE_ENDPOINT);
    }

    #[test]
    fn test_api_key_not_serialized() {
        let config = SessionConfig::from_api_key("secret", None);
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn test_enum_as_str() {
        assert_eq!(ResponseModality::Text.as_str(), "TEXT");
        assert_eq!(ResponseModality::Audio.as_str(), "AUDIO");
        assert_eq!(MediaResolution::Low.as_str(), "MEDIA_RESOLUTION_LOW");
        assert_eq!(MediaResolution::High.as_str(), "MEDIA_RESOLUTION_HIGH");
    }
}
