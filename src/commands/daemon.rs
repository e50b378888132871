use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{info, warn};

use mmrelay::approval::ApprovalTracker;
use mmrelay::config::DaemonArgs;
use mmrelay::control;
use mmrelay::db::Database;
use mmrelay::gateway::{ChatGateway, MattermostClient};
use mmrelay::hook::ControlClient;
use mmrelay::logging::init_tracing;
use mmrelay::relay::Relay;
use mmrelay::sink::{FileSinks, InboxDir};

/// Runs the relay in the foreground until SIGINT or SIGTERM.
pub fn run(args: &DaemonArgs) -> Result<()> {
    let config = args.validate()?;
    init_tracing(config.log_level, config.log_format);

    let client = MattermostClient::new(&config.url, &config.token, config.gateway_timeout)
        .context("Failed to build chat client")?;
    let identity = client
        .login()
        .with_context(|| format!("Failed to authenticate with {}", config.url))?;
    let team_id = client
        .resolve_team(&config.team)
        .with_context(|| format!("Failed to resolve team '{}'", config.team))?;
    let channel_id = client
        .resolve_channel(&team_id, &config.channel)
        .with_context(|| format!("Failed to resolve channel '{}'", config.channel))?;
    client.bind_channel(&channel_id);
    info!(bot = %identity.username, channel = %config.channel, "connected to chat");

    let store = Arc::new(
        Database::open(&config.state.database()).context("Failed to open session database")?,
    );
    let sinks = Arc::new(FileSinks::new(config.state.responses()));
    let tracker = ApprovalTracker::restore(Arc::clone(&store), &*sinks)
        .context("Failed to restore pending approvals")?;
    let inbox = Arc::new(InboxDir::new(config.state.inbox()));

    let relay = Arc::new(Relay::new(
        store,
        tracker,
        Arc::new(client),
        sinks,
        inbox,
        identity,
        channel_id,
        config.settings,
    ));

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&stop))?;

    let listener = TcpListener::bind(config.bind)
        .with_context(|| format!("Failed to bind control plane on {}", config.bind))?;
    let control = control::spawn(listener, Arc::clone(&relay), Arc::clone(&stop))?;

    if let Err(err) = relay.sweep() {
        warn!(error = %err, "startup expiry sweep failed");
    }
    relay.run(&stop);

    if control.join().is_err() {
        bail!("Control plane thread panicked");
    }
    info!("relay stopped");
    Ok(())
}

/// Checks the control plane. Returns a non-zero exit code when nothing answers.
pub fn status(client: &ControlClient) -> Result<u8> {
    match client.health() {
        Ok(health) => {
            println!("Relay running at {} as {}", client.base_url(), health.bot);
            println!("Active sessions: {}", health.active_sessions);
            println!("Pending approvals: {}", health.pending_approvals);
            Ok(0)
        }
        Err(err) if err.is_unreachable() => {
            println!("Relay not running at {}", client.base_url());
            Ok(1)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;
    use serde_json::json;

    #[test]
    fn test_status_running() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/health");
            then.status(200).json_body(json!({
                "status": "ok",
                "bot": "relay-bot",
                "active_sessions": 1,
                "pending_approvals": 0
            }));
        });

        let client = ControlClient::new(&server.base_url()).unwrap();
        assert_eq!(status(&client).unwrap(), 0);
    }

    #[test]
    fn test_status_not_running() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let client = ControlClient::new(&format!("http://127.0.0.1:{}", port)).unwrap();
        assert_eq!(status(&client).unwrap(), 1);
    }

    #[test]
    fn test_run_rejects_missing_config() {
        let args = DaemonArgs {
            url: None,
            token: None,
            team: None,
            channel: None,
            session_timeout_hours: 24,
            log_level: "info".to_string(),
            log_format: mmrelay::logging::LogFormat::Text,
            state_dir: None,
            bind: mmrelay::config::DEFAULT_BIND.to_string(),
            poll_interval_secs: 2,
            error_backoff_secs: 5,
            cleanup_interval_secs: 3600,
            gateway_timeout_secs: 5,
        };
        let err = run(&args).unwrap_err();
        assert!(err.to_string().contains("MATTERMOST_URL"));
    }
}
