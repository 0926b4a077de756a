// Outbound webhook transport
//
// A delivery is a single HTTP POST of the JSON payload. The outcome is
// reported, never raised: non-2xx responses and network errors are both
// data for the delivery record and the delinquency tracker.

use std::time::Duration;

use async_trait::async_trait;
use eventline_core::{Delivery, DeliveryOutcome, Webhook, WebhookPayload};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tracing::{debug, warn};

use crate::error::WorkerError;

pub const EVENT_HEADER: &str = "X-Eventline-Event";
pub const DELIVERY_HEADER: &str = "X-Eventline-Delivery";

#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn deliver(
        &self,
        webhook: &Webhook,
        delivery: &Delivery,
        payload: &WebhookPayload,
    ) -> DeliveryOutcome;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, WorkerError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("eventline-webhooks/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| WorkerError::Transport(e.to_string()))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn deliver(
        &self,
        webhook: &Webhook,
        delivery: &Delivery,
        payload: &WebhookPayload,
    ) -> DeliveryOutcome {
        let result = self
            .client
            .post(&webhook.url)
            .header(EVENT_HEADER, payload.action.as_str())
            .header(DELIVERY_HEADER, delivery.id.to_string())
            .json(payload)
            .send()
            .await;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                debug!(webhook_id = %webhook.id, status, "webhook responded");
                DeliveryOutcome::Responded { status }
            }
            Err(e) => {
                let reason = if e.is_timeout() {
                    "request timed out".to_string()
                } else if e.is_connect() {
                    "failed to connect".to_string()
                } else {
                    e.to_string()
                };
                warn!(webhook_id = %webhook.id, error = %e, "webhook request failed");
                DeliveryOutcome::Errored(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventline_core::{Event, EventableRef, Particulars};
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fixture(url: String) -> (Webhook, Delivery, WebhookPayload) {
        let webhook = Webhook::new(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "CI",
            url,
            ["card_closed"],
        )
        .unwrap();
        let event = Event::new(
            webhook.account_id,
            webhook.board_id,
            Uuid::now_v7(),
            EventableRef::card(Uuid::now_v7()),
            "card_closed",
            Particulars::new(),
        );
        let delivery = Delivery::new(webhook.id, event.id);
        let payload = WebhookPayload::new(&event, None, None);
        (webhook, delivery, payload)
    }

    #[tokio::test]
    async fn test_posts_json_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("content-type", "application/json"))
            .and(header(EVENT_HEADER, "card_closed"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (webhook, delivery, payload) = fixture(format!("{}/hook", server.uri()));
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let outcome = transport.deliver(&webhook, &delivery, &payload).await;
        assert_eq!(outcome, DeliveryOutcome::Responded { status: 200 });
    }

    #[tokio::test]
    async fn test_reports_server_errors_as_responses() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let (webhook, delivery, payload) = fixture(format!("{}/hook", server.uri()));
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();

        let outcome = transport.deliver(&webhook, &delivery, &payload).await;
        assert_eq!(outcome, DeliveryOutcome::Responded { status: 503 });
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_timeout_is_an_error_outcome() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let (webhook, delivery, payload) = fixture(format!("{}/hook", server.uri()));
        let transport = HttpTransport::new(Duration::from_millis(50)).unwrap();

        let outcome = transport.deliver(&webhook, &delivery, &payload).await;
        assert!(matches!(outcome, DeliveryOutcome::Errored(_)));
    }
}
