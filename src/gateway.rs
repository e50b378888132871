//! Chat service access.
//!
//! [`ChatGateway`] is the capability the core consumes; [`MattermostClient`]
//! implements it over the Mattermost REST API (v4) with a blocking client and a
//! per-request timeout.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::GatewayError;
use crate::models::{Identity, Post};

pub type Result<T> = std::result::Result<T, GatewayError>;

/// Longest message the chat service accepts in a single post.
pub const MAX_POST_CHARS: usize = 16_383;

pub trait ChatGateway: Send + Sync {
    fn login(&self) -> Result<Identity>;

    fn resolve_team(&self, name: &str) -> Result<String>;

    fn resolve_channel(&self, team_id: &str, name: &str) -> Result<String>;

    /// Posts a root message in the bound channel; the post id is the thread id.
    fn create_thread(&self, text: &str) -> Result<String>;

    fn post_to_thread(&self, thread_id: &str, text: &str) -> Result<()>;

    /// Newest reply in the thread not authored by `self_id`, if any.
    fn latest_reply_excluding(&self, thread_id: &str, self_id: &str) -> Result<Option<Post>>;

    fn edit_post(&self, post_id: &str, text: &str) -> Result<()>;
}

/// Splits text into post-sized pieces on character boundaries.
pub fn split_for_posts(text: &str) -> Vec<String> {
    if text.chars().count() <= MAX_POST_CHARS {
        return vec![text.to_string()];
    }
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(MAX_POST_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ThreadResponse {
    #[serde(default)]
    posts: std::collections::HashMap<String, Post>,
}

pub struct MattermostClient {
    api_base: String,
    token: String,
    http: Client,
    channel_id: OnceLock<String>,
}

impl MattermostClient {
    /// `base_url` without a scheme is treated as https.
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_base: format!("{}/api/v4", normalize_base_url(base_url)),
            token: token.to_string(),
            http,
            channel_id: OnceLock::new(),
        })
    }

    /// Points thread creation and replies at a channel. Only the first call wins.
    pub fn bind_channel(&self, channel_id: &str) {
        if self.channel_id.set(channel_id.to_string()).is_err() {
            debug!("chat client already bound to a channel");
        }
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel_id.get().map(String::as_str)
    }

    fn bound_channel(&self) -> Result<&str> {
        self.channel_id().ok_or(GatewayError::Unbound)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn get(&self, path: &str) -> Result<Response> {
        let response = self.http.get(self.url(path)).bearer_auth(&self.token).send()?;
        Ok(response)
    }

    fn lookup(&self, path: &str, kind: &'static str, name: &str) -> Result<String> {
        let response = self.get(path)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        let body: IdResponse = check_status(response)?.json()?;
        Ok(body.id)
    }

    fn create_post(&self, text: &str, root_id: Option<&str>) -> Result<String> {
        let channel_id = self.bound_channel()?;
        let mut body = json!({ "channel_id": channel_id, "message": text });
        if let Some(root_id) = root_id {
            body["root_id"] = json!(root_id);
        }
        let response = self
            .http
            .post(self.url("/posts"))
            .bearer_auth(&self.token)
            .json(&body)
            .send()?;
        let created: IdResponse = check_status(response)?.json()?;
        Ok(created.id)
    }
}

impl ChatGateway for MattermostClient {
    fn login(&self) -> Result<Identity> {
        let user: UserResponse = check_status(self.get("/users/me")?)?.json()?;
        info!(username = %user.username, user_id = %user.id, "logged in to chat service");
        Ok(Identity {
            id: user.id,
            username: user.username,
        })
    }

    fn resolve_team(&self, name: &str) -> Result<String> {
        self.lookup(&format!("/teams/name/{}", name), "team", name)
    }

    fn resolve_channel(&self, team_id: &str, name: &str) -> Result<String> {
        self.lookup(
            &format!("/teams/{}/channels/name/{}", team_id, name),
            "channel",
            name,
        )
    }

    fn create_thread(&self, text: &str) -> Result<String> {
        let id = self.create_post(text, None)?;
        debug!(thread_id = %id, "created thread");
        Ok(id)
    }

    fn post_to_thread(&self, thread_id: &str, text: &str) -> Result<()> {
        self.create_post(text, Some(thread_id))?;
        Ok(())
    }

    fn latest_reply_excluding(&self, thread_id: &str, self_id: &str) -> Result<Option<Post>> {
        let response = self.get(&format!("/posts/{}/thread", thread_id))?;
        let thread: ThreadResponse = check_status(response)?.json()?;
        Ok(latest_reply(thread.posts.into_values(), thread_id, self_id))
    }

    fn edit_post(&self, post_id: &str, text: &str) -> Result<()> {
        let response = self
            .http
            .put(self.url(&format!("/posts/{}/patch", post_id)))
            .bearer_auth(&self.token)
            .json(&json!({ "message": text }))
            .send()?;
        check_status(response)?;
        Ok(())
    }
}

fn latest_reply(
    posts: impl IntoIterator<Item = Post>,
    thread_id: &str,
    self_id: &str,
) -> Option<Post> {
    posts
        .into_iter()
        .filter(|post| post.id != thread_id && post.user_id != self_id)
        .max_by(|a, b| a.create_at.cmp(&b.create_at).then_with(|| a.id.cmp(&b.id)))
}

fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    Err(GatewayError::Status {
        status: status.as_u16(),
        body: body.chars().take(240).collect(),
    })
}

pub(crate) fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST, PUT};
    use httpmock::MockServer;

    fn client(server: &MockServer) -> MattermostClient {
        MattermostClient::new(&server.base_url(), "secret-token", Duration::from_secs(5)).unwrap()
    }

    fn post(id: &str, user: &str, create_at: i64) -> Post {
        Post {
            id: id.to_string(),
            user_id: user.to_string(),
            root_id: "root".to_string(),
            message: format!("msg {}", id),
            create_at,
        }
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(normalize_base_url("chat.example.com"), "https://chat.example.com");
        assert_eq!(normalize_base_url("http://localhost:8065/"), "http://localhost:8065");
        assert_eq!(normalize_base_url("https://chat.example.com"), "https://chat.example.com");
    }

    #[test]
    fn test_split_for_posts() {
        assert_eq!(split_for_posts("short"), vec!["short".to_string()]);

        let long: String = "\u{00e9}".repeat(MAX_POST_CHARS + 10);
        let parts = split_for_posts(&long);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].chars().count(), MAX_POST_CHARS);
        assert_eq!(parts[1].chars().count(), 10);
    }

    #[test]
    fn test_latest_reply_skips_root_and_bot() {
        let posts = vec![
            post("root", "human", 1),
            post("a", "human", 2),
            post("b", "bot", 5),
            post("c", "human", 4),
        ];
        let latest = latest_reply(posts, "root", "bot").unwrap();
        assert_eq!(latest.id, "c");

        assert!(latest_reply(vec![post("root", "human", 1)], "root", "bot").is_none());
    }

    #[test]
    fn test_login() {
        let server = MockServer::start();
        let me = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v4/users/me")
                .header("authorization", "Bearer secret-token");
            then.status(200)
                .json_body_obj(&json!({ "id": "bot-1", "username": "relay" }));
        });

        let identity = client(&server).login().unwrap();
        me.assert();
        assert_eq!(identity.id, "bot-1");
        assert_eq!(identity.username, "relay");
    }

    #[test]
    fn test_login_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v4/users/me");
            then.status(401).body("bad token");
        });

        let err = client(&server).login().unwrap_err();
        assert!(matches!(err, GatewayError::Status { status: 401, .. }));
    }

    #[test]
    fn test_resolve_team_and_channel() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v4/teams/name/eng");
            then.status(200).json_body_obj(&json!({ "id": "team-1", "name": "eng" }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v4/teams/team-1/channels/name/bots");
            then.status(200).json_body_obj(&json!({ "id": "chan-1", "name": "bots" }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/api/v4/teams/name/missing");
            then.status(404).json_body_obj(&json!({ "message": "not found" }));
        });

        let client = client(&server);
        assert_eq!(client.resolve_team("eng").unwrap(), "team-1");
        assert_eq!(client.resolve_channel("team-1", "bots").unwrap(), "chan-1");
        assert!(matches!(
            client.resolve_team("missing"),
            Err(GatewayError::NotFound { kind: "team", .. })
        ));
    }

    #[test]
    fn test_posting_requires_bound_channel() {
        let server = MockServer::start();
        let client = client(&server);
        assert!(matches!(client.create_thread("hi"), Err(GatewayError::Unbound)));
    }

    #[test]
    fn test_create_thread_and_reply() {
        let server = MockServer::start();
        let root = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v4/posts")
                .json_body_obj(&json!({ "channel_id": "chan-1", "message": "hello" }));
            then.status(201).json_body_obj(&json!({ "id": "post-1" }));
        });
        let reply = server.mock(|when, then| {
            when.method(POST).path("/api/v4/posts").json_body_obj(&json!({
                "channel_id": "chan-1",
                "message": "follow-up",
                "root_id": "post-1"
            }));
            then.status(201).json_body_obj(&json!({ "id": "post-2" }));
        });

        let client = client(&server);
        client.bind_channel("chan-1");
        assert_eq!(client.create_thread("hello").unwrap(), "post-1");
        client.post_to_thread("post-1", "follow-up").unwrap();
        root.assert();
        reply.assert();
    }

    #[test]
    fn test_latest_reply_excluding_over_http() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/api/v4/posts/root/thread");
            then.status(200).json_body_obj(&json!({
                "order": ["root", "p1", "p2", "p3"],
                "posts": {
                    "root": { "id": "root", "user_id": "bot-1", "root_id": "", "message": "session", "create_at": 1 },
                    "p1": { "id": "p1", "user_id": "human", "root_id": "root", "message": "first", "create_at": 2 },
                    "p2": { "id": "p2", "user_id": "human", "root_id": "root", "message": "second", "create_at": 3 },
                    "p3": { "id": "p3", "user_id": "bot-1", "root_id": "root", "message": "ack", "create_at": 4 }
                }
            }));
        });

        let latest = client(&server)
            .latest_reply_excluding("root", "bot-1")
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, "p2");
        assert_eq!(latest.message, "second");
    }

    #[test]
    fn test_edit_post() {
        let server = MockServer::start();
        let patch = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/v4/posts/post-1/patch")
                .json_body_obj(&json!({ "message": "edited" }));
            then.status(200).json_body_obj(&json!({ "id": "post-1" }));
        });

        client(&server).edit_post("post-1", "edited").unwrap();
        patch.assert();
    }
}
