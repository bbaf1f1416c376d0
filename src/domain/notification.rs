use crate::domain::status::GatewayStatus;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use uuid::Uuid;

const GATEWAY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Payment status notification, delivered by webhook or returned by a status poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotification {
    pub order_id: String,
    pub transaction_status: String,
    pub status_code: String,
    pub gross_amount: String,
    pub signature_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settlement_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_type: Option<String>,
    /// The gateway's own reference, distinct from our order id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<String>,
}

/// hex(SHA-512(order_id + status_code + gross_amount + server_key))
pub fn signature(order_id: &str, status_code: &str, gross_amount: &str, server_key: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

impl PaymentNotification {
    /// Builds a notification signed with `server_key`.
    pub fn signed(
        order_id: impl Into<String>,
        status: &GatewayStatus,
        gross_amount: impl Into<String>,
        settlement_time: Option<String>,
        server_key: &str,
    ) -> Self {
        let order_id = order_id.into();
        let gross_amount = gross_amount.into();
        let status_code = status.status_code().to_string();
        let signature_key = signature(&order_id, &status_code, &gross_amount, server_key);
        Self {
            order_id,
            transaction_status: status.as_str().to_string(),
            status_code,
            gross_amount,
            signature_key,
            settlement_time,
            payment_type: None,
            transaction_id: None,
        }
    }

    pub fn verify(&self, server_key: &str) -> bool {
        let expected = signature(&self.order_id, &self.status_code, &self.gross_amount, server_key);
        expected.eq_ignore_ascii_case(self.signature_key.trim())
    }

    pub fn gateway_status(&self) -> GatewayStatus {
        self.transaction_status
            .parse()
            .unwrap_or_else(|never| match never {})
    }

    pub fn transaction_uuid(&self) -> Option<Uuid> {
        Uuid::parse_str(self.order_id.trim()).ok()
    }

    /// Settlement time as reported, read as RFC 3339 or as gateway-local time.
    pub fn settled_at(&self, gateway_offset: FixedOffset) -> Option<DateTime<Utc>> {
        self.settlement_time
            .as_deref()
            .and_then(|raw| parse_gateway_time(raw, gateway_offset))
    }
}

pub fn parse_gateway_time(raw: &str, gateway_offset: FixedOffset) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(time) = DateTime::parse_from_rfc3339(raw) {
        return Some(time.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(raw, GATEWAY_TIME_FORMAT).ok()?;
    gateway_offset
        .from_local_datetime(&naive)
        .single()
        .map(|time| time.with_timezone(&Utc))
}

pub fn format_gateway_time(time: DateTime<Utc>, gateway_offset: FixedOffset) -> String {
    time.with_timezone(&gateway_offset)
        .format(GATEWAY_TIME_FORMAT)
        .to_string()
}
