//! HTTP exchange with the rendezvous broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{ProxyError, Result};
use crate::transport::BrokerTransport;
use crate::types::{NatType, SessionId};

/// Successful outcome of `register_and_fetch_offer`: the broker matched us
/// with a waiting client.
#[derive(Debug, Clone)]
pub struct OfferResult {
    pub offer_sdp: String,
    pub client_nat: NatType,
    pub relay_url: Option<String>,
}

/// Normalises a configured broker URL: `localhost` addresses get a plain
/// `http://` prefix (for local broker development), anything else gets
/// `https://` unless it already names a scheme, and the result always ends
/// in `/`.
pub fn normalize_broker_url(raw: &str) -> String {
    let with_scheme = if raw.starts_with("localhost") {
        format!("http://{raw}")
    } else if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };
    if with_scheme.ends_with('/') {
        with_scheme
    } else {
        format!("{with_scheme}/")
    }
}

/// One logical request/response exchange with the broker per scheduler
/// poll. Holds no session state of its own.
pub struct BrokerClient {
    transport: Arc<dyn BrokerTransport>,
    base_url: String,
    proxy_type: String,
    allowed_relay_pattern: String,
}

impl BrokerClient {
    pub fn new(
        transport: Arc<dyn BrokerTransport>,
        broker_url: &str,
        proxy_type: impl Into<String>,
        allowed_relay_pattern: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            base_url: normalize_broker_url(broker_url),
            proxy_type: proxy_type.into(),
            allowed_relay_pattern: allowed_relay_pattern.into(),
        }
    }

    /// `POST {brokerUrl}proxy` — registers this proxy instance and, on a
    /// match, returns the client's SDP offer.
    pub async fn register_and_fetch_offer(
        &self,
        sid: SessionId,
        our_nat: NatType,
        live_session_count: usize,
    ) -> Result<OfferResult> {
        let quantised_clients = (live_session_count / 8) * 8;
        let body = json!({
            "Version": "1.3",
            "Sid": sid.to_string(),
            "Type": self.proxy_type,
            "NAT": our_nat.as_wire_str(),
            "Clients": quantised_clients,
            "AcceptedRelayPattern": self.allowed_relay_pattern,
        });

        let url = format!("{}proxy", self.base_url);
        let (status, response) = self
            .transport
            .post_json(&url, body)
            .await
            .map_err(|e| ProxyError::BrokerTransport(e.to_string()))?;

        if status != 200 {
            return Err(ProxyError::BrokerUnexpected {
                path: "proxy".to_string(),
                reason: format!("HTTP {status}"),
            });
        }

        let status_field = response
            .get("Status")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        match status_field {
            "client match" => {
                let offer_sdp = response
                    .get("Offer")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ProxyError::BrokerUnexpected {
                        path: "proxy".to_string(),
                        reason: "client match without an Offer".to_string(),
                    })?
                    .to_string();
                let client_nat = response
                    .get("NAT")
                    .and_then(|v| v.as_str())
                    .map(NatType::from_wire_str)
                    .unwrap_or(NatType::Unknown);
                let relay_url = response
                    .get("RelayURL")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                Ok(OfferResult {
                    offer_sdp,
                    client_nat,
                    relay_url,
                })
            }
            "no match" => Err(ProxyError::BrokerNoMatch),
            other => Err(ProxyError::BrokerUnexpected {
                path: "proxy".to_string(),
                reason: format!("unexpected status {other:?}"),
            }),
        }
    }

    /// `POST {brokerUrl}answer` — submits the locally generated SDP answer.
    /// Failures here are logged and discarded, never propagated to the
    /// session or scheduler.
    pub async fn submit_answer(&self, sid: SessionId, answer_sdp: &str) {
        let body = json!({
            "Version": "1.0",
            "Sid": sid.to_string(),
            "Answer": answer_sdp,
        });
        let url = format!("{}answer", self.base_url);
        match self.transport.post_json(&url, body).await {
            Ok((200, _)) => {
                tracing::debug!(sid = %sid, "answer accepted by broker");
            }
            Ok((status, _)) => {
                tracing::warn!(sid = %sid, status, "broker rejected answer submission");
            }
            Err(e) => {
                tracing::warn!(sid = %sid, error = %e, "answer submission failed");
            }
        }
    }
}

/// Production [`BrokerTransport`] backed by `reqwest`.
pub struct ReqwestBrokerTransport {
    client: reqwest::Client,
}

impl ReqwestBrokerTransport {
    /// `timeout` bounds an individual POST, including the offer-poll
    /// request: in a single-threaded scheduler an unbounded HTTP call would
    /// wedge the poll loop indefinitely on a hung broker (see DESIGN.md).
    pub fn new(timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BrokerTransport for ReqwestBrokerTransport {
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<(u16, serde_json::Value)> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProxyError::BrokerTransport(e.to_string()))?;
        let status = response.status().as_u16();
        let json = response
            .json::<serde_json::Value>()
            .await
            .unwrap_or(serde_json::Value::Null);
        Ok((status, json))
    }
}
