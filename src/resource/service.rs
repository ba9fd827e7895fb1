//! Session start/stop calls

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

use super::{ResourceFetcher, Signer};
use crate::types::{StartRequest, StartResponse, StopReason, StopRequest};
use crate::{Result, SessionError};

/// Signed client for the session service.
pub struct SessionService {
    fetcher: Arc<dyn ResourceFetcher>,
    signer: Signer,
    base_url: String,
}

impl SessionService {
    pub fn new(
        fetcher: Arc<dyn ResourceFetcher>,
        signer: Signer,
        base_url: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { fetcher, signer, base_url }
    }

    /// Open a session.
    pub async fn start(&self, request: &StartRequest) -> Result<StartResponse> {
        let body = serde_json::to_value(request)?;
        let response = self.post("session/start", body).await?;
        let started: StartResponse = serde_json::from_value(response)?;
        if started.session_id.is_empty() || started.transport_url.is_empty() {
            return Err(SessionError::session_start_failed(
                "response is missing session_id or transport_url",
            ));
        }
        info!(session_id = %started.session_id, "Session started");
        Ok(started)
    }

    /// Close a session server-side.
    pub async fn stop(&self, session_id: &str, stop_reason: StopReason) -> Result<()> {
        let request = StopRequest { session_id: session_id.to_string(), stop_reason };
        let body = serde_json::to_value(&request)?;
        self.post("session/stop", body).await?;
        debug!(session_id, ?stop_reason, "Session stopped");
        Ok(())
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let headers = self.signer.sign(&body, unix_millis())?.into_headers();
        let url = format!("{}/{}", self.base_url, path);
        self.fetcher.post_json(&url, body, &headers).await
    }
}

fn unix_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockFetcher;
    use serde_json::json;

    fn start_body() -> serde_json::Value {
        json!({
            "session_id": "s-1",
            "room": "room-1",
            "token": "tok",
            "transport_url": "wss://example.test/ws",
        })
    }

    #[tokio::test]
    async fn start_posts_signed_request() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_json("https://api.example.test/session/start", start_body());
        let signer = Signer::new("app", "secret");
        let service = SessionService::new(fetcher.clone(), signer, "https://api.example.test/");

        let request = StartRequest { avatar_id: "a1".into(), previous_session_id: None };
        let response = service.start(&request).await.unwrap();
        assert_eq!(response.session_id, "s-1");

        let posts = fetcher.posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].url, "https://api.example.test/session/start");
        assert_eq!(posts[0].body["avatar_id"], "a1");
        assert!(posts[0].headers.iter().any(|(k, v)| k == "x-signature" && v.len() == 64));
    }

    #[tokio::test]
    async fn start_rejects_incomplete_response() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_json(
            "https://api.example.test/session/start",
            json!({ "session_id": "", "room": "r", "token": "t", "transport_url": "" }),
        );
        let signer = Signer::new("app", "secret");
        let service = SessionService::new(fetcher, signer, "https://api.example.test");

        let request = StartRequest { avatar_id: "a1".into(), previous_session_id: None };
        let err = service.start(&request).await.unwrap_err();
        assert!(matches!(err, SessionError::SessionStart { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn stop_sends_reason() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.respond_json("https://api.example.test/session/stop", json!({}));
        let signer = Signer::new("app", "secret");
        let service = SessionService::new(fetcher.clone(), signer, "https://api.example.test");

        service.stop("s-1", StopReason::Inactivity).await.unwrap();
        assert_eq!(fetcher.posts()[0].body["stop_reason"], "inactivity");
    }
}
