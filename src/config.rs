//! Configuration and settings management
//!
//! Loads settings from config files and environment variables and derives the
//! timing and retry views consumed by the engine.

use crate::delivery::DeliveryTimings;
use crate::retry::RetryPolicy;
use crate::session::webdriver::WebDriverConfig;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of delivery attempts per recipient
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default pause between two failed attempts, in seconds
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 3;
/// Default pause after each sent message, in seconds
pub const DEFAULT_DELAY_BETWEEN_MESSAGES_SECS: u64 = 30;
/// Default ceiling for an attachment upload, in seconds
pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 60;
/// Default ceiling for a conversation to load, in seconds
pub const DEFAULT_CHAT_LOAD_TIMEOUT_SECS: u64 = 30;
/// Default ceiling for send confirmation, in seconds
pub const DEFAULT_MESSAGE_SEND_TIMEOUT_SECS: u64 = 20;
/// Default ceiling for reusing a stored login, in seconds
pub const DEFAULT_LOGIN_TIMEOUT_SECS: u64 = 120;
/// Default extra time for a QR code scan, in seconds
pub const DEFAULT_QR_SCAN_TIMEOUT_SECS: u64 = 120;
/// Default maximum attachment size (16 MiB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 16 * 1024 * 1024;
/// Default element polling interval, in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Application settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Attempts per recipient, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between failed attempts
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: u64,
    /// Seconds to pause after every sent message
    #[serde(default = "default_delay_between_messages")]
    pub delay_between_messages: u64,
    /// Seconds allowed for an attachment upload
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout: u64,
    /// Seconds allowed for a conversation to load
    #[serde(default = "default_chat_load_timeout")]
    pub chat_load_timeout: u64,
    /// Seconds to watch for send confirmation
    #[serde(default = "default_message_send_timeout")]
    pub message_send_timeout: u64,
    /// Seconds to wait for a stored login
    #[serde(default = "default_login_timeout")]
    pub login_timeout: u64,
    /// Seconds to wait for a QR code scan
    #[serde(default = "default_qr_scan_timeout")]
    pub qr_scan_timeout: u64,
    /// Maximum attachment size in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Element polling interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// chromedriver endpoint
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,
    /// Messaging surface base URL
    #[serde(default = "default_web_url")]
    pub web_url: String,

    /// Chrome user data directory
    pub user_data_dir: Option<PathBuf>,
    /// Chrome profile name
    #[serde(default = "default_profile_name")]
    pub profile_name: String,

    /// Append logs to this file instead of stderr
    pub log_file: Option<PathBuf>,
}

const fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

const fn default_retry_backoff() -> u64 {
    DEFAULT_RETRY_BACKOFF_SECS
}

const fn default_delay_between_messages() -> u64 {
    DEFAULT_DELAY_BETWEEN_MESSAGES_SECS
}

const fn default_upload_timeout() -> u64 {
    DEFAULT_UPLOAD_TIMEOUT_SECS
}

const fn default_chat_load_timeout() -> u64 {
    DEFAULT_CHAT_LOAD_TIMEOUT_SECS
}

const fn default_message_send_timeout() -> u64 {
    DEFAULT_MESSAGE_SEND_TIMEOUT_SECS
}

const fn default_login_timeout() -> u64 {
    DEFAULT_LOGIN_TIMEOUT_SECS
}

const fn default_qr_scan_timeout() -> u64 {
    DEFAULT_QR_SCAN_TIMEOUT_SECS
}

const fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

const fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_webdriver_url() -> String {
    "http://localhost:9515".to_string()
}

fn default_web_url() -> String {
    "https://web.whatsapp.com".to_string()
}

fn default_profile_name() -> String {
    "Default".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF_SECS,
            delay_between_messages: DEFAULT_DELAY_BETWEEN_MESSAGES_SECS,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT_SECS,
            chat_load_timeout: DEFAULT_CHAT_LOAD_TIMEOUT_SECS,
            message_send_timeout: DEFAULT_MESSAGE_SEND_TIMEOUT_SECS,
            login_timeout: DEFAULT_LOGIN_TIMEOUT_SECS,
            qr_scan_timeout: DEFAULT_QR_SCAN_TIMEOUT_SECS,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            webdriver_url: default_webdriver_url(),
            web_url: default_web_url(),
            user_data_dir: None,
            profile_name: default_profile_name(),
            log_file: None,
        }
    }
}

impl Settings {
    /// Create new settings by loading from config files and environment
    ///
    /// Sources, lowest priority first: built-in defaults, `config/default`,
    /// `config/{RUN_MODE}`, `config/local`, then `COURIER_*` variables.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use bulk_courier::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading or validation fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // Not checked into git
            .add_source(File::with_name("config/local").required(false))
            // `COURIER_MAX_RETRIES=5` sets `max_retries`
            .add_source(
                Environment::with_prefix("COURIER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .ignore_empty(true),
            )
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Chrome profile variables are shared with other tooling and carry no prefix
        if settings.user_data_dir.is_none() {
            if let Ok(val) = std::env::var("CHROME_USER_DATA_DIR") {
                if !val.is_empty() {
                    settings.user_data_dir = Some(PathBuf::from(val));
                }
            }
        }
        if let Ok(val) = std::env::var("CHROME_PROFILE_NAME") {
            if !val.is_empty() && settings.profile_name == default_profile_name() {
                settings.profile_name = val;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the engine cannot run with
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Message` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Message(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a Chrome profile directory is configured for login reuse
    #[must_use]
    pub fn has_persistent_profile(&self) -> bool {
        self.user_data_dir
            .as_ref()
            .is_some_and(|dir| !dir.as_os_str().is_empty())
    }

    /// Ceiling for the login handshake
    #[must_use]
    pub const fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout)
    }

    /// Waits and pauses used by a single delivery attempt
    #[must_use]
    pub const fn delivery_timings(&self) -> DeliveryTimings {
        DeliveryTimings {
            chat_load: Duration::from_secs(self.chat_load_timeout),
            upload: Duration::from_secs(self.upload_timeout),
            send_confirmation: Duration::from_secs(self.message_send_timeout),
            inter_message: Duration::from_secs(self.delay_between_messages),
        }
    }

    /// Retry policy applied to every recipient
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_secs(self.retry_backoff),
        }
    }

    /// Connection parameters for the WebDriver adapter
    #[must_use]
    pub fn webdriver_config(&self) -> WebDriverConfig {
        WebDriverConfig {
            webdriver_url: self.webdriver_url.clone(),
            web_url: self.web_url.clone(),
            user_data_dir: self.user_data_dir.clone(),
            profile_name: self.profile_name.clone(),
            qr_scan_timeout: Duration::from_secs(self.qr_scan_timeout),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    // Single test touching the environment to avoid races between tests
    #[test]
    fn test_config_env_loading() -> Result<(), Box<dyn std::error::Error>> {
        // 1. Defaults
        let settings = Settings::new()?;
        assert_eq!(settings.max_retries, 3);
        assert_eq!(settings.delay_between_messages, 30);
        assert_eq!(settings.max_file_size, 16 * 1024 * 1024);

        // 2. Prefixed override
        env::set_var("COURIER_MAX_RETRIES", "5");
        env::set_var("COURIER_CHAT_LOAD_TIMEOUT", "12");
        let settings = Settings::new()?;
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.delivery_timings().chat_load, Duration::from_secs(12));
        env::remove_var("COURIER_MAX_RETRIES");
        env::remove_var("COURIER_CHAT_LOAD_TIMEOUT");

        // 3. Unprefixed Chrome profile fallback, empty means unset
        env::set_var("CHROME_USER_DATA_DIR", "");
        let settings = Settings::new()?;
        assert_eq!(settings.user_data_dir, None);

        env::set_var("CHROME_USER_DATA_DIR", "/tmp/chrome-data");
        env::set_var("CHROME_PROFILE_NAME", "Profile 2");
        let settings = Settings::new()?;
        assert_eq!(settings.user_data_dir, Some(PathBuf::from("/tmp/chrome-data")));
        assert_eq!(settings.profile_name, "Profile 2");
        env::remove_var("CHROME_USER_DATA_DIR");
        env::remove_var("CHROME_PROFILE_NAME");

        // 4. Validation
        env::set_var("COURIER_MAX_RETRIES", "0");
        assert!(Settings::new().is_err());
        env::remove_var("COURIER_MAX_RETRIES");
        Ok(())
    }

    #[test]
    fn test_derived_views() {
        let settings = Settings {
            max_retries: 2,
            retry_backoff: 7,
            upload_timeout: 45,
            ..Settings::default()
        };

        let policy = settings.retry_policy();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.backoff, Duration::from_secs(7));

        let timings = settings.delivery_timings();
        assert_eq!(timings.upload, Duration::from_secs(45));
        assert_eq!(timings.send_confirmation, Duration::from_secs(20));
        assert_eq!(timings.inter_message, Duration::from_secs(30));

        let driver = settings.webdriver_config();
        assert_eq!(driver.poll_interval, Duration::from_millis(500));
        assert_eq!(driver.web_url, "https://web.whatsapp.com");
    }

    #[test]
    fn test_persistent_profile_detection() {
        assert!(!Settings::default().has_persistent_profile());
        let settings = Settings {
            user_data_dir: Some(PathBuf::from("/home/me/.config/chrome-courier")),
            ..Settings::default()
        };
        assert!(settings.has_persistent_profile());
    }

    #[test]
    fn test_validate_rejects_zero_poll_interval() {
        let settings = Settings {
            poll_interval_ms: 0,
            ..Settings::default()
        };
        assert!(settings.validate().is_err());
    }
}
