//! Assistant-side hooks. These must never wedge the assistant: when the relay
//! is not running they report it on stderr and carry on.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;

use mmrelay::hook::{wait_for_verdict, ControlClient, HookError};
use mmrelay::models::Verdict;

pub const EXIT_OK: u8 = 0;
pub const EXIT_DENIED: u8 = 2;

const VERDICT_POLL: Duration = Duration::from_millis(500);

pub fn start(client: &ControlClient, session_id: &str, project_path: &str) -> Result<u8> {
    if let Some(started) = tolerate_unreachable(client, client.start(session_id, project_path))? {
        println!("{}", started.thread_id);
    }
    Ok(EXIT_OK)
}

/// Prints the response handle, or with `wait` the verdict itself. Exits
/// `EXIT_DENIED` on deny or timeout. An unreachable relay counts as approval.
pub fn request_approval(
    client: &ControlClient,
    session_id: &str,
    tool_name: &str,
    command: &str,
    description: &str,
    wait: Option<Duration>,
) -> Result<u8> {
    let handle = match tolerate_unreachable(
        client,
        client.request_approval(session_id, tool_name, command, description),
    )? {
        Some(handle) => handle,
        None => {
            if wait.is_some() {
                println!("{}", Verdict::Approved);
            }
            return Ok(EXIT_OK);
        }
    };

    let Some(timeout) = wait else {
        println!("{}", handle);
        return Ok(EXIT_OK);
    };

    match wait_for_verdict(Path::new(&handle), timeout, VERDICT_POLL)? {
        Some(Verdict::Approved) => {
            println!("{}", Verdict::Approved);
            Ok(EXIT_OK)
        }
        Some(Verdict::Denied) => {
            println!("{}", Verdict::Denied);
            Ok(EXIT_DENIED)
        }
        None => {
            eprintln!("No verdict after {}s; treating as denied.", timeout.as_secs());
            println!("timeout");
            Ok(EXIT_DENIED)
        }
    }
}

pub fn notify(client: &ControlClient, session_id: &str, message: &str) -> Result<u8> {
    tolerate_unreachable(client, client.notify(session_id, message))?;
    Ok(EXIT_OK)
}

pub fn respond(client: &ControlClient, session_id: &str, response: &str) -> Result<u8> {
    tolerate_unreachable(client, client.respond(session_id, response))?;
    Ok(EXIT_OK)
}

pub fn end(client: &ControlClient, session_id: &str) -> Result<u8> {
    tolerate_unreachable(client, client.end(session_id))?;
    Ok(EXIT_OK)
}

fn tolerate_unreachable<T>(
    client: &ControlClient,
    result: std::result::Result<T, HookError>,
) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(err) if err.is_unreachable() => {
            eprintln!(
                "mmrelay: relay not reachable at {}; continuing without it",
                client.base_url()
            );
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;
    use std::fs;
    use tempfile::tempdir;

    fn unreachable_client() -> ControlClient {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        ControlClient::new(&format!("http://127.0.0.1:{}", port)).unwrap()
    }

    fn approval_server(response_file: &Path) -> MockServer {
        let server = MockServer::start();
        let file = response_file.to_string_lossy().into_owned();
        server.mock(move |when, then| {
            when.method(POST).path("/request_approval");
            then.status(200).json_body(json!({ "response_file": file }));
        });
        server
    }

    // ==================== Unit Tests ====================

    #[test]
    fn test_unreachable_relay_is_implicit_approval() {
        let client = unreachable_client();
        let code = request_approval(
            &client,
            "s1",
            "bash",
            "ls",
            "",
            Some(Duration::from_secs(1)),
        )
        .unwrap();
        assert_eq!(code, EXIT_OK);
    }

    #[test]
    fn test_unreachable_relay_does_not_fail_other_hooks() {
        let client = unreachable_client();
        assert_eq!(start(&client, "s1", "/a").unwrap(), EXIT_OK);
        assert_eq!(notify(&client, "s1", "hi").unwrap(), EXIT_OK);
        assert_eq!(respond(&client, "s1", "done").unwrap(), EXIT_OK);
        assert_eq!(end(&client, "s1").unwrap(), EXIT_OK);
    }

    #[test]
    fn test_slow_relay_is_not_implicit_approval() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/request_approval");
            then.status(200)
                .delay(Duration::from_secs(2))
                .json_body(json!({ "response_file": "/tmp/never.txt" }));
        });
        let client =
            ControlClient::with_timeout(&server.base_url(), Duration::from_millis(200)).unwrap();

        let result = request_approval(
            &client,
            "s1",
            "bash",
            "rm -rf build",
            "",
            Some(Duration::from_secs(1)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejection_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/notification");
            then.status(404).json_body(json!({ "error": "session s1 not found" }));
        });
        let client = ControlClient::new(&server.base_url()).unwrap();

        let err = notify(&client, "s1", "hi").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_wait_for_approval() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("s1-a.txt");
        fs::write(&file, "approved").unwrap();
        let server = approval_server(&file);
        let client = ControlClient::new(&server.base_url()).unwrap();

        let code = request_approval(
            &client,
            "s1",
            "bash",
            "ls",
            "list",
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(code, EXIT_OK);
        assert!(!file.exists());
    }

    #[test]
    fn test_wait_for_denial() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("s1-b.txt");
        fs::write(&file, "denied\n").unwrap();
        let server = approval_server(&file);
        let client = ControlClient::new(&server.base_url()).unwrap();

        let code = request_approval(
            &client,
            "s1",
            "bash",
            "rm -rf /",
            "",
            Some(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(code, EXIT_DENIED);
    }

    #[test]
    fn test_wait_timeout_is_denial() {
        let dir = tempdir().unwrap();
        let server = approval_server(&dir.path().join("never.txt"));
        let client = ControlClient::new(&server.base_url()).unwrap();

        let code = request_approval(
            &client,
            "s1",
            "bash",
            "ls",
            "",
            Some(Duration::from_millis(50)),
        )
        .unwrap();
        assert_eq!(code, EXIT_DENIED);
    }

    #[test]
    fn test_no_wait_prints_handle() {
        let dir = tempdir().unwrap();
        let server = approval_server(&dir.path().join("pending.txt"));
        let client = ControlClient::new(&server.base_url()).unwrap();

        let code = request_approval(&client, "s1", "bash", "ls", "", None).unwrap();
        assert_eq!(code, EXIT_OK);
    }
}
