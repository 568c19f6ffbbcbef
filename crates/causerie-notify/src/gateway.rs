use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use causerie_shared::constants::{PUSH_TTL_SECS, VAPID_TOKEN_VALIDITY_SECS};
use causerie_shared::push::NotificationPayload;
use causerie_shared::records::PushSubscription;
use causerie_shared::VapidKeys;
use reqwest::{StatusCode, Url};

use crate::error::PushError;

/// Transport that hands a payload to one push endpoint.  The dispatcher
/// only cares about the three-way outcome: delivered, gone, or worth
/// retrying.
#[async_trait]
pub trait PushGateway: Send + Sync + 'static {
    async fn push(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> Result<(), PushError>;
}

/// Web Push over HTTP with VAPID authorization (RFC 8292).
pub struct HttpPushGateway {
    client: reqwest::Client,
    keys: Arc<VapidKeys>,
    subject: String,
}

impl HttpPushGateway {
    pub fn new(keys: Arc<VapidKeys>, subject: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            keys,
            subject: subject.into(),
        }
    }

    /// Mint the `Authorization` header for `endpoint`.  The JWT audience
    /// is the endpoint's origin, so one token cannot be replayed against
    /// a different provider.
    fn authorization(&self, endpoint: &Url) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"typ":"JWT","alg":"ES256"}"#);
        let claims = serde_json::json!({
            "aud": endpoint.origin().ascii_serialization(),
            "exp": chrono::Utc::now().timestamp() + VAPID_TOKEN_VALIDITY_SECS as i64,
            "sub": self.subject,
        });
        let claims = URL_SAFE_NO_PAD.encode(claims.to_string());
        let signing_input = format!("{header}.{claims}");
        let signature = URL_SAFE_NO_PAD.encode(self.keys.sign(signing_input.as_bytes()));
        format!(
            "vapid t={signing_input}.{signature}, k={}",
            self.keys.public_key_b64()
        )
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn push(
        &self,
        subscription: &PushSubscription,
        payload: &NotificationPayload,
    ) -> Result<(), PushError> {
        // An endpoint that does not even parse can never be delivered to.
        let endpoint = Url::parse(&subscription.endpoint).map_err(|_| PushError::Gone)?;
        let authorization = self.authorization(&endpoint);

        let response = self
            .client
            .post(endpoint)
            .header("Authorization", authorization)
            .header("TTL", PUSH_TTL_SECS)
            .json(payload)
            .send()
            .await
            .map_err(|e| PushError::Transient(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => Err(PushError::Gone),
            status => Err(PushError::Transient(format!(
                "push endpoint returned {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causerie_shared::records::SubscriptionKeys;
    use causerie_shared::Alias;

    fn gateway() -> HttpPushGateway {
        HttpPushGateway::new(Arc::new(VapidKeys::generate()), "mailto:test@example.org")
    }

    #[test]
    fn test_authorization_header_shape() {
        let gw = gateway();
        let endpoint = Url::parse("https://push.example.net/send/abc123").unwrap();
        let header = gw.authorization(&endpoint);

        let token = header
            .strip_prefix("vapid t=")
            .and_then(|rest| rest.split_once(", k="))
            .expect("header layout");
        assert_eq!(token.1, gw.keys.public_key_b64());

        let segments: Vec<&str> = token.0.split('.').collect();
        assert_eq!(segments.len(), 3);

        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(segments[1]).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://push.example.net");
        assert_eq!(claims["sub"], "mailto:test@example.org");
        assert!(claims["exp"].as_i64().unwrap() > chrono::Utc::now().timestamp());
    }

    #[test]
    fn test_audience_drops_path_and_keeps_port() {
        let gw = gateway();
        let endpoint = Url::parse("https://push.example.net:8443/send/abc").unwrap();
        let header = gw.authorization(&endpoint);
        assert!(header.contains("vapid t="));

        let token = header.strip_prefix("vapid t=").unwrap();
        let claims_b64 = token.split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims_b64).unwrap()).unwrap();
        assert_eq!(claims["aud"], "https://push.example.net:8443");
    }

    #[tokio::test]
    async fn test_unparseable_endpoint_is_gone() {
        let gw = gateway();
        let subscription = PushSubscription {
            endpoint: "not a url".to_string(),
            keys: SubscriptionKeys {
                p256dh: None,
                auth: None,
            },
        };
        let payload = NotificationPayload::chat(&Alias::from("ada"), "hi".to_string());
        assert!(matches!(
            gw.push(&subscription, &payload).await,
            Err(PushError::Gone)
        ));
    }
}
