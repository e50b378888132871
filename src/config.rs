//! Daemon configuration: command-line flags with environment fallbacks,
//! validated into a [`DaemonConfig`] before anything connects.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use reqwest::Url;
use tracing_subscriber::filter::LevelFilter;

use crate::error::ConfigError;
use crate::gateway::normalize_base_url;
use crate::logging::{parse_level, LogFormat};
use crate::relay::LoopSettings;

pub const DEFAULT_BIND: &str = "127.0.0.1:9876";
pub const DEFAULT_CONTROL_URL: &str = "http://127.0.0.1:9876";
const STATE_DIR_NAME: &str = ".mmrelay";

#[derive(Args, Debug, Clone)]
pub struct DaemonArgs {
    /// Mattermost server URL (https is assumed when no scheme is given)
    #[arg(long, env = "MATTERMOST_URL")]
    pub url: Option<String>,

    /// Bot access token
    #[arg(long, env = "MATTERMOST_BOT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Team the session channel belongs to
    #[arg(long, env = "MATTERMOST_TEAM_NAME")]
    pub team: Option<String>,

    /// Channel that receives one thread per session
    #[arg(long, env = "MATTERMOST_CHANNEL_NAME")]
    pub channel: Option<String>,

    /// Idle hours before an active session times out
    #[arg(long, env = "SESSION_TIMEOUT_HOURS", default_value_t = 24)]
    pub session_timeout_hours: u64,

    /// trace, debug, info, warn or error
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "MMRELAY_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Directory for the session database, verdict files and inbox
    #[arg(long, env = "MMRELAY_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Control-plane listen address
    #[arg(long, env = "MMRELAY_BIND", default_value = DEFAULT_BIND)]
    pub bind: String,

    #[arg(long, env = "MMRELAY_POLL_INTERVAL_SECS", default_value_t = 2)]
    pub poll_interval_secs: u64,

    #[arg(long, env = "MMRELAY_ERROR_BACKOFF_SECS", default_value_t = 5)]
    pub error_backoff_secs: u64,

    #[arg(long, env = "MMRELAY_CLEANUP_INTERVAL_SECS", default_value_t = 3600)]
    pub cleanup_interval_secs: u64,

    /// Per-request timeout for chat service calls
    #[arg(long, env = "MMRELAY_GATEWAY_TIMEOUT_SECS", default_value_t = 5)]
    pub gateway_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub url: String,
    pub token: String,
    pub team: String,
    pub channel: String,
    pub log_level: LevelFilter,
    pub log_format: LogFormat,
    pub state: StatePaths,
    pub bind: SocketAddr,
    pub gateway_timeout: Duration,
    pub settings: LoopSettings,
}

/// Files and directories under the state dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    pub root: PathBuf,
}

impl StatePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `--state-dir` if given, else `~/.mmrelay`.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        match explicit {
            Some(dir) => Self::new(dir),
            None => Self::new(
                dirs::home_dir()
                    .map(|home| home.join(STATE_DIR_NAME))
                    .unwrap_or_else(|| PathBuf::from(STATE_DIR_NAME)),
            ),
        }
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("sessions.db")
    }

    pub fn responses(&self) -> PathBuf {
        self.root.join("responses")
    }

    pub fn inbox(&self) -> PathBuf {
        self.root.join("inbox")
    }
}

impl DaemonArgs {
    pub fn validate(&self) -> Result<DaemonConfig, ConfigError> {
        let mut missing = Vec::new();
        let url = required(&self.url, "MATTERMOST_URL", &mut missing);
        let token = required(&self.token, "MATTERMOST_BOT_TOKEN", &mut missing);
        let team = required(&self.team, "MATTERMOST_TEAM_NAME", &mut missing);
        let channel = required(&self.channel, "MATTERMOST_CHANNEL_NAME", &mut missing);
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        let url = normalize_base_url(&url);
        let parsed = Url::parse(&url).map_err(|err| ConfigError::Invalid {
            key: "MATTERMOST_URL",
            reason: err.to_string(),
        })?;
        if parsed.host_str().is_none() {
            return Err(ConfigError::Invalid {
                key: "MATTERMOST_URL",
                reason: "no host".to_string(),
            });
        }

        let log_level = parse_level(&self.log_level).map_err(|reason| ConfigError::Invalid {
            key: "LOG_LEVEL",
            reason,
        })?;

        let bind: SocketAddr = self.bind.trim().parse().map_err(|_| ConfigError::Invalid {
            key: "MMRELAY_BIND",
            reason: format!("'{}' is not a socket address", self.bind),
        })?;

        let settings = LoopSettings {
            poll_interval: positive_secs(self.poll_interval_secs, "MMRELAY_POLL_INTERVAL_SECS")?,
            error_backoff: positive_secs(self.error_backoff_secs, "MMRELAY_ERROR_BACKOFF_SECS")?,
            cleanup_interval: positive_secs(
                self.cleanup_interval_secs,
                "MMRELAY_CLEANUP_INTERVAL_SECS",
            )?,
            session_timeout: positive_secs(
                self.session_timeout_hours.saturating_mul(60 * 60),
                "SESSION_TIMEOUT_HOURS",
            )?,
        };

        Ok(DaemonConfig {
            url,
            token,
            team,
            channel,
            log_level,
            log_format: self.log_format,
            state: StatePaths::resolve(self.state_dir.as_deref()),
            bind,
            gateway_timeout: positive_secs(self.gateway_timeout_secs, "MMRELAY_GATEWAY_TIMEOUT_SECS")?,
            settings,
        })
    }
}

fn required(value: &Option<String>, key: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            missing.push(key);
            String::new()
        }
    }
}

fn positive_secs(secs: u64, key: &'static str) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        args: DaemonArgs,
    }

    fn parse(extra: &[&str]) -> DaemonArgs {
        let mut argv = vec![
            "mmrelay",
            "--url",
            "chat.example.com",
            "--token",
            "secret",
            "--team",
            "eng",
            "--channel",
            "bots",
        ];
        argv.extend_from_slice(extra);
        TestCli::try_parse_from(argv).unwrap().args
    }

    fn bare() -> DaemonArgs {
        DaemonArgs {
            url: None,
            token: None,
            team: None,
            channel: None,
            session_timeout_hours: 24,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            state_dir: None,
            bind: DEFAULT_BIND.to_string(),
            poll_interval_secs: 2,
            error_backoff_secs: 5,
            cleanup_interval_secs: 3600,
            gateway_timeout_secs: 5,
        }
    }

    // ==================== Unit Tests ====================

    #[test]
    fn test_defaults() {
        let config = parse(&["--state-dir", "/tmp/relay"]).validate().unwrap();

        assert_eq!(config.url, "https://chat.example.com");
        assert_eq!(config.settings, LoopSettings::default());
        assert_eq!(config.bind, DEFAULT_BIND.parse().unwrap());
        assert_eq!(config.log_level, LevelFilter::INFO);
        assert_eq!(config.gateway_timeout, Duration::from_secs(5));
        assert_eq!(config.state.database(), PathBuf::from("/tmp/relay/sessions.db"));
        assert_eq!(config.state.responses(), PathBuf::from("/tmp/relay/responses"));
        assert_eq!(config.state.inbox(), PathBuf::from("/tmp/relay/inbox"));
    }

    #[test]
    fn test_explicit_scheme_kept() {
        let mut args = parse(&[]);
        args.url = Some("http://localhost:8065/".to_string());
        assert_eq!(args.validate().unwrap().url, "http://localhost:8065");
    }

    #[test]
    fn test_missing_values_reported_together() {
        let mut args = bare();
        args.token = Some("secret".to_string());
        args.team = Some("   ".to_string());

        match args.validate() {
            Err(ConfigError::Missing(keys)) => assert_eq!(
                keys,
                vec!["MATTERMOST_URL", "MATTERMOST_TEAM_NAME", "MATTERMOST_CHANNEL_NAME"]
            ),
            other => panic!("expected missing config, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        let args = parse(&["--poll-interval-secs", "0"]);
        assert!(matches!(
            args.validate(),
            Err(ConfigError::Invalid {
                key: "MMRELAY_POLL_INTERVAL_SECS",
                ..
            })
        ));
    }

    #[test]
    fn test_bad_bind_rejected() {
        let args = parse(&["--bind", "localhost"]);
        assert!(matches!(
            args.validate(),
            Err(ConfigError::Invalid { key: "MMRELAY_BIND", .. })
        ));
    }

    #[test]
    fn test_bad_log_level_rejected() {
        let args = parse(&["--log-level", "chatty"]);
        assert!(matches!(
            args.validate(),
            Err(ConfigError::Invalid { key: "LOG_LEVEL", .. })
        ));
    }

    #[test]
    fn test_session_timeout_hours() {
        let config = parse(&["--session-timeout-hours", "2"]).validate().unwrap();
        assert_eq!(config.settings.session_timeout, Duration::from_secs(2 * 60 * 60));
    }

    #[test]
    fn test_json_log_format() {
        let config = parse(&["--log-format", "json"]).validate().unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_state_dir_defaults_under_home() {
        let state = StatePaths::resolve(None);
        assert!(state.root.ends_with(STATE_DIR_NAME));
    }
}
