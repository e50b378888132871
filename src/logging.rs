use std::fmt;
use std::str::FromStr;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Parses `LOG_LEVEL`-style values. Unknown values are rejected rather than
/// silently falling back.
pub fn parse_level(raw: &str) -> Result<LevelFilter, String> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("warning") {
        return Ok(LevelFilter::WARN);
    }
    LevelFilter::from_str(raw).map_err(|_| {
        format!(
            "unknown log level '{}' (expected trace, debug, info, warn, error or off)",
            raw
        )
    })
}

/// Installs the global subscriber. `RUST_LOG`, when set, overrides `level`.
/// Output goes to stderr so stdout stays free for command output.
pub fn init_tracing(level: LevelFilter, format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = match format {
        LogFormat::Text => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
