// src/config.rs
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::filters::FieldKind;

pub const ENV_CONFIG_PATH: &str = "LISTING_NOTIFIER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config/notifier.toml";

/// Upper bound for `backdate_hours` and `listing_retention_hours` (ten years).
pub const MAX_WINDOW_HOURS: u64 = 24 * 365 * 10;

/// Process-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Lookback window for new searches and for polls with nothing stored yet.
    pub backdate_hours: u64,
    /// How long polled listings stay in the in-memory store; never shorter
    /// than the backdate window.
    pub listing_retention_hours: u64,
    /// Default notify interval for new subscribers.
    pub notification_frequency_seconds: u64,
    pub disable_search_polling: bool,
    pub poll_fetch_limit: Option<usize>,
    pub state_path: PathBuf,
    pub metrics_addr: Option<String>,
    pub feeds: Vec<FeedConfig>,
    pub smtp: Option<SmtpConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backdate_hours: 6,
            listing_retention_hours: 48,
            notification_frequency_seconds: 60,
            disable_search_polling: false,
            poll_fetch_limit: None,
            state_path: PathBuf::from("state/notifier.json"),
            metrics_addr: None,
            feeds: Vec::new(),
            smtp: None,
        }
    }
}

/// One JSON-feed source plugin instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedConfig {
    pub path: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Per-request HTTP timeout.
    #[serde(default = "default_feed_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldKind>,
}

fn default_poll_interval() -> u64 {
    600
}

fn default_feed_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub user: String,
    pub pass: String,
    pub from: String,
}

impl Settings {
    pub fn backdate(&self) -> chrono::Duration {
        hours_window(self.backdate_hours)
    }

    pub fn listing_retention(&self) -> chrono::Duration {
        hours_window(self.listing_retention_hours.max(self.backdate_hours))
    }

    /// Parse settings from TOML text; env overrides are not applied.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(s).context("parsing settings TOML")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from an explicit path, then apply environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        let mut settings = Self::from_toml_str(&content)?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    /// Load using env var + fallbacks:
    /// 1) $LISTING_NOTIFIER_CONFIG
    /// 2) config/notifier.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            return Self::load_from(&pb);
        }
        let default_p = PathBuf::from(DEFAULT_CONFIG_PATH);
        if default_p.exists() {
            return Self::load_from(&default_p);
        }
        let mut settings = Self::default();
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_parse::<u64>("NOTIFIER_BACKDATE_HOURS")? {
            self.backdate_hours = v;
        }
        if let Some(v) = env_parse::<u64>("NOTIFIER_LISTING_RETENTION_HOURS")? {
            self.listing_retention_hours = v;
        }
        if let Some(v) = env_parse::<u64>("NOTIFICATION_FREQUENCY_SECONDS")? {
            self.notification_frequency_seconds = v;
        }
        if let Some(v) = env_parse::<bool>("DISABLE_SEARCH_POLLING")? {
            self.disable_search_polling = v;
        }
        if let Ok(p) = std::env::var("NOTIFIER_STATE_PATH") {
            if !p.trim().is_empty() {
                self.state_path = PathBuf::from(p);
            }
        }
        if let Ok(addr) = std::env::var("METRICS_ADDR") {
            self.metrics_addr = Some(addr).filter(|a| !a.trim().is_empty());
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.notification_frequency_seconds == 0 {
            return Err(anyhow!("notification_frequency_seconds must be positive"));
        }
        for (key, hours) in [
            ("backdate_hours", self.backdate_hours),
            ("listing_retention_hours", self.listing_retention_hours),
        ] {
            if hours > MAX_WINDOW_HOURS {
                return Err(anyhow!("{key} = {hours} exceeds the maximum of {MAX_WINDOW_HOURS}"));
            }
        }
        if let Some(smtp) = &self.smtp {
            for (key, value) in [("host", &smtp.host), ("from", &smtp.from)] {
                if value.trim().is_empty() {
                    return Err(anyhow!("smtp.{key} must not be empty"));
                }
            }
            smtp.from
                .parse::<lettre::message::Mailbox>()
                .with_context(|| format!("smtp.from {:?} is not a valid address", smtp.from))?;
        }
        for feed in &self.feeds {
            if feed.poll_interval_seconds == 0 {
                return Err(anyhow!("feed {:?}: poll_interval_seconds must be positive", feed.path));
            }
            if feed.timeout_seconds == 0 {
                return Err(anyhow!("feed {:?}: timeout_seconds must be positive", feed.path));
            }
        }
        Ok(())
    }
}

/// Clamped so `Utc::now() - window` can never overflow.
fn hours_window(hours: u64) -> chrono::Duration {
    chrono::Duration::hours(hours.min(MAX_WINDOW_HOURS) as i64)
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow!("{key}={raw:?}: {e}")),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    const OVERRIDES: [&str; 6] = [
        "NOTIFIER_BACKDATE_HOURS",
        "NOTIFIER_LISTING_RETENTION_HOURS",
        "NOTIFICATION_FREQUENCY_SECONDS",
        "DISABLE_SEARCH_POLLING",
        "NOTIFIER_STATE_PATH",
        "METRICS_ADDR",
    ];

    fn clear_env() {
        env::remove_var(ENV_CONFIG_PATH);
        for k in OVERRIDES {
            env::remove_var(k);
        }
    }

    #[test]
    fn parses_feeds_and_defaults() {
        let s = Settings::from_toml_str(
            r#"
            backdate_hours = 12

            [[feeds]]
            path = "feeds.bikes"
            url = "https://example.org/bikes.json"
            fields = { title = "string", price = "numeric" }
            "#,
        )
        .unwrap();
        assert_eq!(s.backdate_hours, 12);
        assert_eq!(s.notification_frequency_seconds, 60);
        assert_eq!(s.feeds[0].poll_interval_seconds, 600);
        assert_eq!(s.feeds[0].timeout_seconds, 10);
        assert_eq!(s.feeds[0].fields["price"], FieldKind::Numeric);
        assert!(s.smtp.is_none());
    }

    #[test]
    fn zero_frequency_is_rejected() {
        assert!(Settings::from_toml_str("notification_frequency_seconds = 0").is_err());
    }

    #[test]
    fn oversized_windows_are_rejected() {
        let err = Settings::from_toml_str("backdate_hours = 10000000000").unwrap_err();
        assert!(err.to_string().contains("backdate_hours"), "{err:#}");
        assert!(Settings::from_toml_str("listing_retention_hours = 10000000000").is_err());
        assert!(Settings::from_toml_str(&format!("backdate_hours = {MAX_WINDOW_HOURS}")).is_ok());

        // unvalidated values are clamped rather than overflowing
        let s = Settings {
            backdate_hours: u64::MAX,
            ..Settings::default()
        };
        let floor = chrono::Utc::now() - s.backdate();
        assert!(floor < chrono::Utc::now());
        assert_eq!(s.listing_retention(), s.backdate());
    }

    #[test]
    fn retention_never_undercuts_backdate() {
        let s = Settings::from_toml_str("backdate_hours = 72\nlisting_retention_hours = 24").unwrap();
        assert_eq!(s.listing_retention(), chrono::Duration::hours(72));
        assert_eq!(Settings::default().listing_retention(), chrono::Duration::hours(48));
    }

    #[test]
    fn smtp_section_is_checked() {
        let ok = Settings::from_toml_str(
            "[smtp]\nhost = \"smtp.example.org\"\nuser = \"u\"\npass = \"p\"\nfrom = \"Listings <bot@example.org>\"",
        );
        assert!(ok.is_ok(), "{ok:?}");
        assert!(Settings::from_toml_str(
            "[smtp]\nhost = \"\"\nuser = \"u\"\npass = \"p\"\nfrom = \"bot@example.org\"",
        )
        .is_err());
        assert!(Settings::from_toml_str(
            "[smtp]\nhost = \"smtp.example.org\"\nuser = \"u\"\npass = \"p\"\nfrom = \"not an address\"",
        )
        .is_err());
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        clear_env();

        // no file anywhere: built-in defaults
        assert_eq!(Settings::load_default().unwrap(), Settings::default());

        // config/notifier.toml in cwd
        fs::create_dir_all("config").unwrap();
        fs::write(DEFAULT_CONFIG_PATH, "backdate_hours = 2").unwrap();
        assert_eq!(Settings::load_default().unwrap().backdate_hours, 2);

        // env path wins
        let p = tmp.path().join("other.toml");
        fs::write(&p, "backdate_hours = 9").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        assert_eq!(Settings::load_default().unwrap().backdate_hours, 9);

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(Settings::load_default().is_err());

        clear_env();
        env::set_current_dir(&old).unwrap();
    }

    #[serial_test::serial]
    #[test]
    fn env_overrides_apply_and_validate() {
        clear_env();
        env::set_var("NOTIFIER_BACKDATE_HOURS", "24");
        env::set_var("DISABLE_SEARCH_POLLING", "true");
        env::set_var("METRICS_ADDR", "127.0.0.1:9100");
        let mut s = Settings::default();
        s.apply_env_overrides().unwrap();
        assert_eq!(s.backdate(), chrono::Duration::hours(24));
        assert!(s.disable_search_polling);
        assert_eq!(s.metrics_addr.as_deref(), Some("127.0.0.1:9100"));

        env::set_var("NOTIFICATION_FREQUENCY_SECONDS", "soon");
        assert!(Settings::default().apply_env_overrides().is_err());
        clear_env();
    }
}
