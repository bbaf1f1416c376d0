use crate::domain::money::format_gross_amount;
use crate::domain::notification::{PaymentNotification, format_gateway_time};
use crate::domain::ports::{PaymentGateway, Snapshot, SnapshotRequest, StatusReport};
use crate::domain::status::GatewayStatus;
use crate::error::GatewayError;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// In-process gateway with deterministic tokens and scriptable failures.
///
/// Statuses registered with [`SandboxGateway::set_status`] are signed with the
/// sandbox's server key, exactly like the real gateway's answers.
pub struct SandboxGateway {
    server_key: String,
    offset: FixedOffset,
    snapshot_failures: AtomicU32,
    status_failures: AtomicU32,
    hang: AtomicBool,
    snapshot_calls: AtomicUsize,
    statuses: Mutex<HashMap<String, PaymentNotification>>,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SandboxGateway {
    pub fn new(server_key: impl Into<String>) -> Self {
        Self {
            server_key: server_key.into(),
            offset: FixedOffset::east_opt(7 * 3600).unwrap_or_else(|| Utc.fix()),
            snapshot_failures: AtomicU32::new(0),
            status_failures: AtomicU32::new(0),
            hang: AtomicBool::new(false),
            snapshot_calls: AtomicUsize::new(0),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Local offset used to render settlement times.
    pub fn with_offset(mut self, offset: FixedOffset) -> Self {
        self.offset = offset;
        self
    }

    /// Fails the next `count` snapshot calls with a transport error.
    pub fn fail_next(&self, count: u32) {
        self.snapshot_failures.store(count, Ordering::SeqCst);
    }

    /// Fails the next `count` status polls with a transport error.
    pub fn fail_status_next(&self, count: u32) {
        self.status_failures.store(count, Ordering::SeqCst);
    }

    /// While set, snapshot calls never complete.
    pub fn hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn token_for(order_id: &str) -> String {
        format!("sandbox-token-{order_id}")
    }

    /// Records the authoritative status; settled statuses get the current time
    /// as settlement time.
    pub fn set_status(&self, order_id: &str, status: GatewayStatus, gross_amount: Decimal) -> PaymentNotification {
        let settled_at = status.is_settled().then(Utc::now);
        self.set_status_at(order_id, status, gross_amount, settled_at)
    }

    pub fn set_status_at(
        &self,
        order_id: &str,
        status: GatewayStatus,
        gross_amount: Decimal,
        settled_at: Option<DateTime<Utc>>,
    ) -> PaymentNotification {
        let notification = self.notification(order_id, &status, gross_amount, settled_at);
        self.statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(order_id.to_string(), notification.clone());
        notification
    }

    /// A notification as the gateway would sign and send it.
    pub fn notification(
        &self,
        order_id: &str,
        status: &GatewayStatus,
        gross_amount: Decimal,
        settled_at: Option<DateTime<Utc>>,
    ) -> PaymentNotification {
        let mut notification = PaymentNotification::signed(
            order_id,
            status,
            format_gross_amount(gross_amount),
            settled_at.map(|at| format_gateway_time(at, self.offset)),
            &self.server_key,
        );
        notification.payment_type = Some("bank_transfer".to_string());
        notification
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_snapshot(&self, request: &SnapshotRequest) -> Result<Snapshot, GatewayError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if take_one(&self.snapshot_failures) {
            debug!(order_id = %request.order_id, "sandbox snapshot outage");
            return Err(GatewayError::Transport("sandbox outage".to_string()));
        }
        let token = Self::token_for(&request.order_id);
        Ok(Snapshot {
            redirect_url: format!("https://sandbox.invalid/pay/{token}"),
            token,
        })
    }

    async fn check_status(&self, order_id: &str) -> Result<StatusReport, GatewayError> {
        if take_one(&self.status_failures) {
            return Err(GatewayError::Transport("sandbox outage".to_string()));
        }
        let notification = self
            .statuses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(order_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownOrder(order_id.to_string()))?;
        let raw = serde_json::to_value(&notification).map_err(|e| GatewayError::Decode(e.to_string()))?;
        Ok(StatusReport { notification, raw })
    }

    fn server_key(&self) -> &str {
        &self.server_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use rust_decimal_macros::dec;

    fn request() -> SnapshotRequest {
        SnapshotRequest {
            order_id: "order-1".to_string(),
            gross_amount: Amount::new(dec!(10)).unwrap(),
            email: "buyer@example.com".to_string(),
        }
    }

    #[tokio::test]
    async fn test_scripted_failures_are_consumed() {
        let gateway = SandboxGateway::new("key");
        gateway.fail_next(1);

        assert!(gateway.create_snapshot(&request()).await.is_err());
        let snapshot = gateway.create_snapshot(&request()).await.unwrap();
        assert_eq!(snapshot.token, "sandbox-token-order-1");
        assert_eq!(gateway.snapshot_calls(), 2);
    }

    #[tokio::test]
    async fn test_status_reports_are_signed() {
        let gateway = SandboxGateway::new("key");
        assert!(matches!(
            gateway.check_status("order-1").await,
            Err(GatewayError::UnknownOrder(_))
        ));

        gateway.set_status("order-1", GatewayStatus::Settlement, dec!(10));
        let report = gateway.check_status("order-1").await.unwrap();
        assert!(report.notification.verify("key"));
        assert_eq!(report.notification.gross_amount, "10.00");
        assert!(report.notification.settlement_time.is_some());
        assert_eq!(report.raw["transaction_status"], "settlement");
    }
}
