//! Configuration management for the shot coach.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for a coaching session.
#[derive(Debug, Clone, Deserialize)]
pub struct CoachConfig {
    /// Frame capture and worker pool configuration
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Shot detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Frame quality selection configuration
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Analysis service credentials and authentication mode
    #[serde(default)]
    pub service: ServiceConfig,

    /// Streaming session configuration
    #[serde(default)]
    pub live: LiveConfig,

    /// Stateless fallback configuration
    #[serde(default)]
    pub fallback: FallbackConfig,

    /// Ephemeral credential issuance configuration
    #[serde(default)]
    pub credentials: CredentialConfig,

    /// Coaching feedback configuration
    #[serde(default)]
    pub feedback: FeedbackConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Frame capture configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    /// Frame width delivered by the camera
    #[serde(default = "default_capture_width")]
    pub width: u32,

    /// Frame height delivered by the camera
    #[serde(default = "default_capture_height")]
    pub height: u32,

    /// Number of recent frames kept for shot events (~1s at 30 fps)
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Maximum frames queued for detection
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Number of blocking workers for detection and selection
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Whether to drop frames when the detection queue is full
    #[serde(default = "default_true")]
    pub drop_on_backpressure: bool,
}

/// Trajectory shot detector configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Minimum points a trajectory needs before it is analysed
    #[serde(default = "default_min_points")]
    pub min_points: usize,

    /// Minimum normalised path length; shorter paths are treated as noise
    #[serde(default = "default_min_path_length")]
    pub min_path_length: f32,

    /// Cooldown after a detection in milliseconds
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Distance of the release frame from the end of the buffer window
    #[serde(default = "default_release_offset")]
    pub release_offset: usize,

    /// Frame-difference motion estimator settings
    #[serde(default)]
    pub motion: MotionConfig,
}

/// Frame-difference motion estimator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    /// Grid step in pixels used when diffing frames
    #[serde(default = "default_motion_sample_step")]
    pub sample_step: u32,

    /// Luminance delta (0-255) above which a cell counts as changed
    #[serde(default = "default_diff_threshold")]
    pub diff_threshold: u8,

    /// Minimum changed cells for a frame to contribute a track point
    #[serde(default = "default_min_changed_cells")]
    pub min_changed_cells: usize,

    /// Maximum points kept in the rolling track
    #[serde(default = "default_trajectory_length")]
    pub trajectory_length: usize,

    /// Motionless frames tolerated before the track is dropped
    #[serde(default = "default_max_gap_frames")]
    pub max_gap_frames: u32,
}

/// Frame quality selection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SelectionConfig {
    /// Minimum accepted frame width
    #[serde(default = "default_min_width")]
    pub min_width: u32,

    /// Minimum accepted frame height
    #[serde(default = "default_min_height")]
    pub min_height: u32,

    /// Lower bound of the accepted mean luminance (0.0 - 1.0, exclusive)
    #[serde(default = "default_min_brightness")]
    pub min_brightness: f32,

    /// Upper bound of the accepted mean luminance (0.0 - 1.0, exclusive)
    #[serde(default = "default_max_brightness")]
    pub max_brightness: f32,

    /// Sample every Nth pixel in each direction when measuring brightness
    #[serde(default = "default_selection_sample_step")]
    pub sample_step: u32,
}

/// How credentials are attached to outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// `?key=` / `?access_token=` query parameters
    #[default]
    Query,
    /// `x-goog-api-key` / `Authorization: Token` headers
    Header,
}

/// Analysis service configuration shared by both channels.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    /// Long-lived developer key; enables fallback-only mode without a token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Authentication strategy
    #[serde(default)]
    pub auth_mode: AuthMode,
}

/// Streaming session configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    /// WebSocket endpoint of the bidirectional session
    #[serde(default = "default_live_url")]
    pub url: String,

    /// Model requested in the setup message
    #[serde(default = "default_live_model")]
    pub model: String,

    /// Seconds to wait for the connection to open and the setup to be acknowledged
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Seconds between setup resends while the handshake stalls
    #[serde(default = "default_setup_retry_secs")]
    pub setup_retry_secs: u64,

    /// Base delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// Maximum delay between reconnection attempts in milliseconds
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// Maximum consecutive reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_reconnect_attempts: u32,

    /// Seconds to wait for a streamed answer before using the fallback (0 = wait for close)
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per answer
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

/// Stateless fallback configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackConfig {
    /// Base URL of the generate-content REST API
    #[serde(default = "default_fallback_base_url")]
    pub base_url: String,

    /// Model used for stateless requests
    #[serde(default = "default_fallback_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per answer
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

/// Ephemeral credential issuance configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CredentialConfig {
    /// Base URL of the token issuance service; unset disables token fetching
    #[serde(default)]
    pub token_service_url: Option<String>,

    /// Device identifier sent with token requests
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// User identifier sent with token requests
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Request timeout in seconds
    #[serde(default = "default_credential_timeout")]
    pub request_timeout_secs: u64,
}

/// Coaching feedback configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedbackConfig {
    /// Path to a coaching tips JSON file
    #[serde(default)]
    pub tips_path: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_capture_width() -> u32 {
    1280
}
fn default_capture_height() -> u32 {
    720
}
fn default_buffer_capacity() -> usize {
    30
}
fn default_queue_size() -> usize {
    8
}
fn default_num_workers() -> usize {
    2
}
fn default_min_points() -> usize {
    5
}
fn default_min_path_length() -> f32 {
    0.3
}
fn default_cooldown_ms() -> u64 {
    2000
}
fn default_release_offset() -> usize {
    5
}
fn default_motion_sample_step() -> u32 {
    8
}
fn default_diff_threshold() -> u8 {
    40
}
fn default_min_changed_cells() -> usize {
    4
}
fn default_trajectory_length() -> usize {
    10
}
fn default_max_gap_frames() -> u32 {
    3
}
fn default_min_width() -> u32 {
    640
}
fn default_min_height() -> u32 {
    480
}
fn default_min_brightness() -> f32 {
    0.1
}
fn default_max_brightness() -> f32 {
    0.9
}
fn default_selection_sample_step() -> u32 {
    10
}
fn default_live_url() -> String {
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string()
}
fn default_live_model() -> String {
    "models/gemini-2.0-flash-001".to_string()
}
fn default_connection_timeout() -> u64 {
    10
}
fn default_setup_retry_secs() -> u64 {
    2
}
fn default_reconnect_base_delay_ms() -> u64 {
    3000
}
fn default_reconnect_max_delay_ms() -> u64 {
    30000
}
fn default_response_timeout() -> u64 {
    20
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_output_tokens() -> u32 {
    200
}
fn default_fallback_base_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_fallback_model() -> String {
    "gemini-1.5-flash".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
fn default_user_id() -> String {
    "anonymous".to_string()
}
fn default_credential_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: default_capture_width(),
            height: default_capture_height(),
            buffer_capacity: default_buffer_capacity(),
            queue_size: default_queue_size(),
            num_workers: default_num_workers(),
            drop_on_backpressure: true,
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_points: default_min_points(),
            min_path_length: default_min_path_length(),
            cooldown_ms: default_cooldown_ms(),
            release_offset: default_release_offset(),
            motion: MotionConfig::default(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            sample_step: default_motion_sample_step(),
            diff_threshold: default_diff_threshold(),
            min_changed_cells: default_min_changed_cells(),
            trajectory_length: default_trajectory_length(),
            max_gap_frames: default_max_gap_frames(),
        }
    }
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            min_width: default_min_width(),
            min_height: default_min_height(),
            min_brightness: default_min_brightness(),
            max_brightness: default_max_brightness(),
            sample_step: default_selection_sample_step(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: default_live_url(),
            model: default_live_model(),
            connection_timeout_secs: default_connection_timeout(),
            setup_retry_secs: default_setup_retry_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: 0,
            response_timeout_secs: default_response_timeout(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            base_url: default_fallback_base_url(),
            model: default_fallback_model(),
            request_timeout_secs: default_request_timeout(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

impl Default for CredentialConfig {
    fn default() -> Self {
        Self {
            token_service_url: None,
            device_id: default_device_id(),
            user_id: default_user_id(),
            request_timeout_secs: default_credential_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl Default for CoachConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            detector: DetectorConfig::default(),
            selection: SelectionConfig::default(),
            service: ServiceConfig::default(),
            live: LiveConfig::default(),
            fallback: FallbackConfig::default(),
            credentials: CredentialConfig::default(),
            feedback: FeedbackConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl CoachConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with COACH_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Override with environment variables (e.g., COACH_SERVICE__API_KEY)
            .add_source(
                Environment::with_prefix("COACH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("COACH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.width/height".to_string(),
                message: "Dimensions must be greater than 0".to_string(),
            });
        }

        if self.capture.num_workers == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "capture.num_workers".to_string(),
                message: "At least one worker is required".to_string(),
            });
        }

        if self.detector.release_offset == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "detector.release_offset".to_string(),
                message: "Release frame must precede the impact frame".to_string(),
            });
        }

        let band = self.selection.min_brightness..=self.selection.max_brightness;
        if !(0.0..=1.0).contains(band.start())
            || !(0.0..=1.0).contains(band.end())
            || band.start() >= band.end()
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "selection.min_brightness/max_brightness".to_string(),
                message: "Brightness band must satisfy 0 <= min < max <= 1".to_string(),
            });
        }

        if !self.live.url.starts_with("wss://") && !self.live.url.starts_with("ws://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "live.url".to_string(),
                message: "URL must start with ws:// or wss://".to_string(),
            });
        }

        if !is_http_url(&self.fallback.base_url) {
            return Err(ConfigValidationError::InvalidValue {
                field: "fallback.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if let Some(url) = &self.credentials.token_service_url {
            if !is_http_url(url) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "credentials.token_service_url".to_string(),
                    message: "URL must start with http:// or https://".to_string(),
                });
            }
        }

        if self.credentials.device_id.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "credentials.device_id".to_string(),
            ));
        }

        Ok(())
    }

    /// Developer key, ignoring blank values.
    pub fn api_key(&self) -> Option<&str> {
        self.service
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

impl DetectorConfig {
    /// Get cooldown as Duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl LiveConfig {
    /// Get connection timeout as Duration.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Get setup resend interval as Duration.
    pub fn setup_retry(&self) -> Duration {
        Duration::from_secs(self.setup_retry_secs.max(1))
    }

    /// Get base reconnection delay as Duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Get maximum reconnection delay as Duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Get response timeout, if any.
    pub fn response_timeout(&self) -> Option<Duration> {
        (self.response_timeout_secs > 0).then(|| Duration::from_secs(self.response_timeout_secs))
    }
}

impl FallbackConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl CredentialConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
