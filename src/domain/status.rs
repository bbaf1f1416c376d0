use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse status shown to the buyer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Expired,
    /// Placeholder; nothing transitions into it.
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained lifecycle state tracked only by this service.
///
/// The buyer-facing [`PaymentStatus`] is derived from it, so the two can never
/// disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InternalStatus {
    Pending,
    TokenReady,
    Settled,
    Failed,
    CancelledByUser,
    CancelledBySystem,
    Expired,
    ExpiredCheckedValid,
    ExpiredCheckedInvalid,
    LateSettlement,
}

impl InternalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::TokenReady => "TOKEN_READY",
            Self::Settled => "SETTLED",
            Self::Failed => "FAILED",
            Self::CancelledByUser => "CANCELLED_BY_USER",
            Self::CancelledBySystem => "CANCELLED_BY_SYSTEM",
            Self::Expired => "EXPIRED",
            Self::ExpiredCheckedValid => "EXPIRED_CHECKED_VALID",
            Self::ExpiredCheckedInvalid => "EXPIRED_CHECKED_INVALID",
            Self::LateSettlement => "LATE_SETTLEMENT",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::TokenReady | Self::Expired)
    }

    /// Still waiting for the buyer to pay.
    pub fn is_awaiting_payment(self) -> bool {
        matches!(self, Self::Pending | Self::TokenReady)
    }

    pub fn payment_status(self) -> PaymentStatus {
        match self {
            Self::Pending | Self::TokenReady => PaymentStatus::Pending,
            Self::Settled | Self::ExpiredCheckedValid => PaymentStatus::Success,
            Self::Failed => PaymentStatus::Failed,
            Self::CancelledByUser | Self::CancelledBySystem => PaymentStatus::Cancelled,
            Self::Expired | Self::ExpiredCheckedInvalid | Self::LateSettlement => {
                PaymentStatus::Expired
            }
        }
    }

    /// The lifecycle graph. Every status write goes through this check.
    pub fn can_transition_to(self, next: InternalStatus) -> bool {
        use InternalStatus::*;

        match self {
            Pending | TokenReady => matches!(
                next,
                Pending
                    | TokenReady
                    | Settled
                    | Failed
                    | CancelledByUser
                    | CancelledBySystem
                    | Expired
                    | ExpiredCheckedInvalid
            ),
            Expired => matches!(
                next,
                ExpiredCheckedValid | ExpiredCheckedInvalid | LateSettlement
            ),
            Settled | Failed | CancelledByUser | CancelledBySystem | ExpiredCheckedValid
            | ExpiredCheckedInvalid | LateSettlement => false,
        }
    }
}

impl fmt::Display for InternalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `transaction_status` as reported by the payment gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Capture,
    Settlement,
    Pending,
    Deny,
    Cancel,
    Expire,
    Failure,
    Other(String),
}

impl GatewayStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Capture => "capture",
            Self::Settlement => "settlement",
            Self::Pending => "pending",
            Self::Deny => "deny",
            Self::Cancel => "cancel",
            Self::Expire => "expire",
            Self::Failure => "failure",
            Self::Other(status) => status,
        }
    }

    /// Funds were received.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Capture | Self::Settlement)
    }

    /// Status code the gateway pairs with this status.
    pub fn status_code(&self) -> &'static str {
        match self {
            Self::Capture | Self::Settlement => "200",
            Self::Pending => "201",
            Self::Deny | Self::Cancel | Self::Expire | Self::Failure => "202",
            Self::Other(_) => "200",
        }
    }
}

impl FromStr for GatewayStatus {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(match value.trim().to_ascii_lowercase().as_str() {
            "capture" => Self::Capture,
            "settlement" => Self::Settlement,
            "pending" => Self::Pending,
            "deny" => Self::Deny,
            "cancel" => Self::Cancel,
            "expire" => Self::Expire,
            "failure" => Self::Failure,
            other => Self::Other(other.to_string()),
        })
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [InternalStatus; 10] = [
        InternalStatus::Pending,
        InternalStatus::TokenReady,
        InternalStatus::Settled,
        InternalStatus::Failed,
        InternalStatus::CancelledByUser,
        InternalStatus::CancelledBySystem,
        InternalStatus::Expired,
        InternalStatus::ExpiredCheckedValid,
        InternalStatus::ExpiredCheckedInvalid,
        InternalStatus::LateSettlement,
    ];

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in ALL.iter().copied().filter(|status| status.is_terminal()) {
            for to in ALL {
                assert!(
                    !from.can_transition_to(to),
                    "{from} must not transition to {to}"
                );
            }
        }
    }

    #[test]
    fn test_only_three_states_are_open() {
        let open: Vec<_> = ALL.iter().filter(|status| !status.is_terminal()).collect();
        assert_eq!(
            open,
            vec![
                &InternalStatus::Pending,
                &InternalStatus::TokenReady,
                &InternalStatus::Expired
            ]
        );
    }

    #[test]
    fn test_expired_only_resolves_through_checks() {
        let from = InternalStatus::Expired;
        assert!(from.can_transition_to(InternalStatus::ExpiredCheckedValid));
        assert!(from.can_transition_to(InternalStatus::ExpiredCheckedInvalid));
        assert!(from.can_transition_to(InternalStatus::LateSettlement));
        assert!(!from.can_transition_to(InternalStatus::Settled));
        assert!(!from.can_transition_to(InternalStatus::TokenReady));
        assert!(!from.can_transition_to(InternalStatus::Expired));
    }

    #[test]
    fn test_pending_cannot_skip_into_expiry_checks() {
        assert!(!InternalStatus::Pending.can_transition_to(InternalStatus::ExpiredCheckedValid));
        assert!(!InternalStatus::TokenReady.can_transition_to(InternalStatus::LateSettlement));
    }

    #[test]
    fn test_buyer_status_mapping() {
        assert_eq!(InternalStatus::TokenReady.payment_status(), PaymentStatus::Pending);
        assert_eq!(InternalStatus::ExpiredCheckedValid.payment_status(), PaymentStatus::Success);
        assert_eq!(InternalStatus::LateSettlement.payment_status(), PaymentStatus::Expired);
        assert_eq!(InternalStatus::CancelledBySystem.payment_status(), PaymentStatus::Cancelled);
        assert_eq!(InternalStatus::Failed.payment_status(), PaymentStatus::Failed);
    }

    #[test]
    fn test_gateway_status_parsing() {
        assert_eq!("settlement".parse::<GatewayStatus>().unwrap(), GatewayStatus::Settlement);
        assert_eq!(" Capture ".parse::<GatewayStatus>().unwrap(), GatewayStatus::Capture);
        assert!("capture".parse::<GatewayStatus>().unwrap().is_settled());
        assert!(!"pending".parse::<GatewayStatus>().unwrap().is_settled());
        assert_eq!(
            "refund".parse::<GatewayStatus>().unwrap(),
            GatewayStatus::Other("refund".to_string())
        );
    }

    #[test]
    fn test_status_serde_uses_screaming_case() {
        let json = serde_json::to_string(&InternalStatus::ExpiredCheckedValid).unwrap();
        assert_eq!(json, "\"EXPIRED_CHECKED_VALID\"");
        let status: PaymentStatus = serde_json::from_str("\"CANCELLED\"").unwrap();
        assert_eq!(status, PaymentStatus::Cancelled);
    }
}
