use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::http::RetryPolicy;

const CONFIG_FILE: &str = "pollsink";
const ENV_PREFIX: &str = "POLLSINK";

/// Runtime settings: `pollsink.toml` (optional), then `POLLSINK_*` env vars.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub state_dir: PathBuf,
    pub runlog_dir: PathBuf,

    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub request_delay_ms: u64,
    pub request_timeout_secs: u64,

    pub detail_fetch_limit: usize,
    pub default_top_n: usize,
    pub max_keywords: usize,
    pub message_max_chars: usize,
    pub slack_limit: usize,

    pub summary_hours: u32,
    pub summary_max_chars: usize,
    pub summary_max_messages: usize,
    pub openai_model: String,

    pub ws_ranking: String,
    pub ws_products: String,
    pub ws_keywords: String,
    pub ws_asin_list: String,
    pub ws_messages: String,

    pub slack_bot_token: Option<String>,
    pub slack_channel_id: Option<String>,
    pub line_channel_access_token: Option<String>,
    pub line_to_user_id: Option<String>,
    pub openai_api_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/pollsink.sqlite"),
            state_dir: PathBuf::from("data/state"),
            runlog_dir: PathBuf::from("data/runlogs"),
            max_attempts: 4,
            base_backoff_ms: 1000,
            request_delay_ms: 1200,
            request_timeout_secs: 15,
            detail_fetch_limit: 8,
            default_top_n: 10,
            max_keywords: 3,
            message_max_chars: 1000,
            slack_limit: 50,
            summary_hours: 12,
            summary_max_chars: 500,
            summary_max_messages: 1000,
            openai_model: "gpt-3.5-turbo".into(),
            ws_ranking: "RANKING_SNAPSHOTS".into(),
            ws_products: "PRODUCTS_HISTORY".into(),
            ws_keywords: "KEYWORDS".into(),
            ws_asin_list: "ASIN_LIST".into(),
            ws_messages: "MESSAGES".into(),
            slack_bot_token: None,
            slack_channel_id: None,
            line_channel_access_token: None,
            line_to_user_id: None,
            openai_api_key: None,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let cfg = Config::builder()
            .add_source(File::with_name(CONFIG_FILE).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .context("failed to read settings")?;
        Self::from_config(cfg)
    }

    fn from_config(cfg: Config) -> Result<Self> {
        cfg.try_deserialize().context("invalid settings")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// For API calls (Slack, LINE, OpenAI): no politeness delay.
    pub fn api_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_millis(self.base_backoff_ms))
    }

    /// For page scraping: waits `request_delay_ms` before each request.
    pub fn scrape_policy(&self) -> RetryPolicy {
        self.api_policy()
            .with_request_delay(Duration::from_millis(self.request_delay_ms))
    }
}

/// Value of a secret, or an error naming the env var to set.
pub fn require<'a>(value: &'a Option<String>, key: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .with_context(|| format!("{} is not set (use {}_{})", key, ENV_PREFIX, key.to_uppercase()))
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    #[test]
    fn defaults_when_nothing_is_configured() {
        let s = Settings::from_config(Config::builder().build().unwrap()).unwrap();
        assert_eq!(s.max_attempts, 4);
        assert_eq!(s.message_max_chars, 1000);
        assert_eq!(s.ws_ranking, "RANKING_SNAPSHOTS");
        assert_eq!(s.state_dir, PathBuf::from("data/state"));
        assert!(s.slack_bot_token.is_none());
        assert_eq!(s.summary_hours, 12);
        assert_eq!(s.openai_model, "gpt-3.5-turbo");
    }

    #[test]
    fn file_values_override_defaults() {
        let toml = r#"
            max_attempts = 2
            request_delay_ms = 0
            ws_ranking = "RANKING_TEST"
            slack_channel_id = "C0123"
            summary_hours = 24
        "#;
        let cfg = Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()
            .unwrap();
        let s = Settings::from_config(cfg).unwrap();
        assert_eq!(s.max_attempts, 2);
        assert_eq!(s.ws_ranking, "RANKING_TEST");
        assert_eq!(s.slack_channel_id.as_deref(), Some("C0123"));
        assert_eq!(s.summary_hours, 24);
        assert!(s.scrape_policy().request_delay.is_zero());
        // Untouched keys keep their defaults
        assert_eq!(s.detail_fetch_limit, 8);
    }

    #[test]
    fn require_reports_the_env_var() {
        let missing: Option<String> = None;
        let err = require(&missing, "slack_bot_token").unwrap_err();
        assert!(err.to_string().contains("POLLSINK_SLACK_BOT_TOKEN"));

        let blank = Some("  ".to_string());
        assert!(require(&blank, "line_to_user_id").is_err());

        let set = Some("xoxb-1".to_string());
        assert_eq!(require(&set, "slack_bot_token").unwrap(), "xoxb-1");
    }
}
