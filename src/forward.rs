//! Fire-and-forget forwarding of extracted matches.
//!
//! Each match is POSTed as JSON from its own task. The outcome is logged and,
//! when a notice channel is attached, published once per match. Nothing here
//! reports back into the receive loop.

use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct ForwardBody<'a> {
    #[serde(rename = "match")]
    value: &'a str,
    captured_at: String,
}

/// Outcome of one forwarding attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardNotice {
    Delivered { value: String, status: u16 },
    Failed { value: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    url: String,
    notices: Option<UnboundedSender<ForwardNotice>>,
}

impl Forwarder {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            notices: None,
        })
    }

    /// Publish one [`ForwardNotice`] per forwarded match on `tx`.
    pub fn with_notices(mut self, tx: UnboundedSender<ForwardNotice>) -> Self {
        self.notices = Some(tx);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Spawn the request and return immediately. Must be called from within
    /// a tokio runtime.
    pub fn forward(&self, value: String) {
        let client = self.client.clone();
        let url = self.url.clone();
        let notices = self.notices.clone();

        tokio::spawn(async move {
            let notice = match send(&client, &url, &value).await {
                Ok(status) => {
                    log::info!("Forwarded {} to {} ({})", value, url, status);
                    ForwardNotice::Delivered { value, status }
                }
                Err(e) => {
                    log::warn!("Failed to forward {} to {}: {}", value, url, e);
                    ForwardNotice::Failed {
                        value,
                        reason: e.to_string(),
                    }
                }
            };
            if let Some(tx) = notices {
                let _ = tx.send(notice);
            }
        });
    }
}

/// POST one match. Non-2xx responses are errors.
pub async fn send(client: &reqwest::Client, url: &str, value: &str) -> Result<u16> {
    let body = ForwardBody {
        value,
        captured_at: Local::now().to_rfc3339(),
    };
    let response = client
        .post(url)
        .json(&body)
        .send()
        .await?
        .error_for_status()?;
    Ok(response.status().as_u16())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::sync::mpsc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_send_posts_match_as_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/matches"))
            .and(body_partial_json(serde_json::json!({ "match": "GZ00ab1GZ00" })))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let status = send(&client, &format!("{}/matches", server.uri()), "GZ00ab1GZ00")
            .await
            .unwrap();
        assert_eq!(status, 201);
    }

    #[tokio::test]
    async fn test_send_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = reqwest::Client::new();
        let result = send(&client, &server.uri(), "x").await;
        assert!(matches!(result, Err(Error::Forward(_))));
    }

    #[tokio::test]
    async fn test_forward_publishes_one_notice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let forwarder = Forwarder::new(server.uri()).unwrap().with_notices(tx);
        assert_eq!(forwarder.url(), server.uri());
        forwarder.forward("GZ00q1GZ00".to_string());

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            notice,
            ForwardNotice::Delivered {
                value: "GZ00q1GZ00".to_string(),
                status: 200
            }
        );
    }

    #[tokio::test]
    async fn test_forward_failure_is_notice_not_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        // Nothing listens on the discard port.
        let forwarder = Forwarder::new("http://127.0.0.1:9/").unwrap().with_notices(tx);
        forwarder.forward("lost".to_string());

        let notice = tokio::time::timeout(Duration::from_secs(15), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(notice, ForwardNotice::Failed { ref value, .. } if value == "lost"));
    }
}
