use crate::domain::notification::PaymentNotification;
use crate::domain::ports::{PaymentGateway, Snapshot, SnapshotRequest, StatusReport};
use crate::error::GatewayError;
use async_trait::async_trait;
use reqwest::{Client, Response};
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SnapConfig {
    /// Base URL of the snapshot API, e.g. `https://app.sandbox.midtrans.com`.
    pub snap_url: String,
    /// Base URL of the core API used for status polls.
    pub api_url: String,
    pub server_key: String,
    /// Transport-level timeout. The breaker applies its own, shorter, deadline.
    pub request_timeout: Duration,
}

#[derive(Deserialize)]
struct SnapResponse {
    token: String,
    redirect_url: String,
}

/// HTTP client for a Snap-style payment gateway.
#[derive(Clone)]
pub struct SnapGateway {
    http: Client,
    config: SnapConfig,
}

impl SnapGateway {
    pub fn new(config: SnapConfig) -> Result<Self, GatewayError> {
        let http = Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { http, config })
    }

    fn url(base: &str, path: &str) -> String {
        format!("{}{}", base.trim_end_matches('/'), path)
    }

    async fn checked(response: Response) -> Result<Value, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<Value>().await?)
    }
}

#[async_trait]
impl PaymentGateway for SnapGateway {
    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<Snapshot, GatewayError> {
        // The gateway takes whole currency units.
        let gross_amount = request
            .gross_amount
            .value()
            .round()
            .to_i64()
            .ok_or_else(|| GatewayError::Decode(format!("amount {} out of range", request.gross_amount)))?;
        let body = json!({
            "transaction_details": {
                "order_id": request.order_id,
                "gross_amount": gross_amount,
            },
            "customer_details": {
                "email": request.email,
            },
        });

        let response = self
            .http
            .post(Self::url(&self.config.snap_url, "/snap/v1/transactions"))
            .basic_auth(&self.config.server_key, Some(""))
            .json(&body)
            .send()
            .await?;
        let value = Self::checked(response).await?;
        let snapshot: SnapResponse =
            serde_json::from_value(value).map_err(|e| GatewayError::Decode(e.to_string()))?;
        debug!(order_id = %request.order_id, "snapshot token issued");

        Ok(Snapshot {
            token: snapshot.token,
            redirect_url: snapshot.redirect_url,
        })
    }

    async fn check_status(&self, order_id: &str) -> Result<StatusReport, GatewayError> {
        let response = self
            .http
            .get(Self::url(&self.config.api_url, &format!("/v2/{order_id}/status")))
            .basic_auth(&self.config.server_key, Some(""))
            .send()
            .await?;
        let raw = Self::checked(response).await?;

        // Unknown orders come back as a successful HTTP response carrying a 404 body.
        if raw.get("status_code").and_then(Value::as_str) == Some("404") {
            return Err(GatewayError::UnknownOrder(order_id.to_string()));
        }
        let notification: PaymentNotification =
            serde_json::from_value(raw.clone()).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(StatusReport { notification, raw })
    }

    fn server_key(&self) -> &str {
        &self.config.server_key
    }
}
