use crate::state::HttpClient;
use crate::util::now_ms;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hyper::header::CONTENT_TYPE;
use hyper::{Body, Method, Request};
use std::time::Duration;

/// Repeat alerts for the same (upstream, model, status) are suppressed for
/// this long.
const DEDUP_WINDOW_MS: u64 = 5 * 60 * 1000;

const DELIVERY_ATTEMPTS: u32 = 2;
const DELIVERY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Asynchronous webhook alert dispatcher. Delivery runs detached from the
/// request that triggered it.
pub struct Notifier {
    client: HttpClient,
    /// (upstream, model, status) -> last-sent epoch ms.
    records: DashMap<(String, String, u16), u64>,
}

impl Notifier {
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            records: DashMap::new(),
        }
    }

    /// Enqueue an alert unless one for the same (upstream, model, status) was
    /// sent within the dedup window. No-op without a webhook. Returns whether
    /// a delivery task was spawned.
    pub fn notify(
        &self,
        webhook: Option<&str>,
        upstream: &str,
        model: &str,
        status: u16,
        message: String,
    ) -> bool {
        let Some(webhook) = webhook else {
            return false;
        };

        if !self.should_send(upstream, model, status, now_ms()) {
            tracing::debug!(upstream, model, status, "alert suppressed inside dedup window");
            return false;
        }

        let client = self.client.clone();
        let webhook = webhook.to_string();
        tokio::spawn(async move {
            deliver(client, webhook, message).await;
        });
        true
    }

    /// The record is written before the delivery attempt: concurrent callers
    /// inside the window are suppressed while the first delivery is still in
    /// flight.
    fn should_send(&self, upstream: &str, model: &str, status: u16, now_ms: u64) -> bool {
        let key = (upstream.to_string(), model.to_string(), status);
        match self.records.entry(key) {
            Entry::Occupied(mut e) => {
                if now_ms.saturating_sub(*e.get()) < DEDUP_WINDOW_MS {
                    return false;
                }
                e.insert(now_ms);
                true
            }
            Entry::Vacant(v) => {
                v.insert(now_ms);
                true
            }
        }
    }
}

async fn deliver(client: HttpClient, webhook: String, message: String) {
    // Both `content` and `text` so text-style and Slack-style receivers
    // accept the same payload.
    let payload = serde_json::json!({
        "msg_type": "text",
        "content": message,
        "text": message,
    })
    .to_string();

    for attempt in 1..=DELIVERY_ATTEMPTS {
        let req = Request::builder()
            .method(Method::POST)
            .uri(&webhook)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(payload.clone()));
        let req = match req {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "webhook request build failed");
                return;
            }
        };

        match client.request(req).await {
            Ok(resp) if resp.status().as_u16() < 400 => {
                tracing::info!("webhook alert delivered");
                return;
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), attempt, "webhook returned error");
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "webhook send failed");
            }
        }
        if attempt < DELIVERY_ATTEMPTS {
            tokio::time::sleep(DELIVERY_RETRY_DELAY).await;
        }
    }
    tracing::error!(attempts = DELIVERY_ATTEMPTS, "webhook delivery exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::Client;
    use hyper_rustls::HttpsConnectorBuilder;

    fn test_notifier() -> Notifier {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();
        Notifier::new(Client::builder().build::<_, Body>(https))
    }

    #[test]
    fn second_alert_inside_window_is_suppressed() {
        let n = test_notifier();
        let t0 = 1_000_000;
        assert!(n.should_send("a", "gpt-x", 429, t0));
        assert!(!n.should_send("a", "gpt-x", 429, t0 + 1_000));
        assert!(!n.should_send("a", "gpt-x", 429, t0 + DEDUP_WINDOW_MS - 1));
    }

    #[test]
    fn alert_allowed_again_after_window() {
        let n = test_notifier();
        let t0 = 1_000_000;
        assert!(n.should_send("a", "gpt-x", 429, t0));
        assert!(n.should_send("a", "gpt-x", 429, t0 + DEDUP_WINDOW_MS));
    }

    #[test]
    fn distinct_tuples_do_not_share_a_window() {
        let n = test_notifier();
        let t0 = 1_000_000;
        assert!(n.should_send("a", "gpt-x", 429, t0));
        assert!(n.should_send("a", "gpt-x", 500, t0));
        assert!(n.should_send("b", "gpt-x", 429, t0));
        assert!(n.should_send("a", "gpt-y", 429, t0));
    }

    #[tokio::test]
    async fn no_webhook_is_a_noop() {
        let n = test_notifier();
        assert!(!n.notify(None, "a", "gpt-x", 429, "msg".to_string()));
        // The record map is untouched, so a later configured webhook still fires.
        assert!(n.should_send("a", "gpt-x", 429, now_ms()));
    }

    #[tokio::test]
    async fn duplicate_notify_enqueues_once() {
        let n = test_notifier();
        let hook = Some("http://127.0.0.1:9/hook");
        assert!(n.notify(hook, "a", "gpt-x", 429, "first".to_string()));
        assert!(!n.notify(hook, "a", "gpt-x", 429, "second".to_string()));
    }
}
