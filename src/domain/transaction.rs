use crate::domain::money::Amount;
use crate::domain::status::{InternalStatus, PaymentStatus};
use crate::error::{Result, SettlementError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

/// A buyer's checkout of one or more photos.
///
/// The status pair is private: it only changes through [`Transaction::transition`],
/// which validates the move against the lifecycle graph and keeps the buyer-facing
/// status derived from the internal one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: Uuid,
    pub user_id: Uuid,
    status: PaymentStatus,
    internal_status: InternalStatus,
    pub photo_ids: Vec<Uuid>,
    pub amount: Decimal,
    pub pay_token: Option<String>,
    /// Last `transaction_status` reported by the gateway.
    pub gateway_status: Option<String>,
    /// Raw body of the last gateway callback or poll.
    pub callback_payload: Option<serde_json::Value>,
    pub checkout_at: DateTime<Utc>,
    pub payment_at: Option<DateTime<Utc>>,
    pub settlement_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A status change decided by the state machine, applied with [`Transaction::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub to: InternalStatus,
    pub payment_at: Option<DateTime<Utc>>,
    pub settlement_at: Option<DateTime<Utc>>,
    pub clear_token: bool,
}

impl Transition {
    pub fn to(status: InternalStatus) -> Self {
        Self {
            to: status,
            payment_at: None,
            settlement_at: None,
            clear_token: false,
        }
    }

    pub fn clearing_token(mut self) -> Self {
        self.clear_token = true;
        self
    }

    pub fn paid_at(mut self, at: DateTime<Utc>) -> Self {
        self.payment_at = Some(at);
        self
    }

    pub fn settled_at(mut self, at: DateTime<Utc>) -> Self {
        self.settlement_at = Some(at);
        self
    }
}

impl Transaction {
    pub fn new(id: Uuid, user_id: Uuid, photo_ids: Vec<Uuid>, amount: Amount, at: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            status: PaymentStatus::Pending,
            internal_status: InternalStatus::Pending,
            photo_ids,
            amount: amount.value(),
            pay_token: None,
            gateway_status: None,
            callback_payload: None,
            checkout_at: at,
            payment_at: None,
            settlement_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn internal_status(&self) -> InternalStatus {
        self.internal_status
    }

    pub fn order_id(&self) -> String {
        self.id.to_string()
    }

    pub fn transition(&mut self, to: InternalStatus, at: DateTime<Utc>) -> Result<()> {
        let from = self.internal_status;
        if !from.can_transition_to(to) {
            return Err(SettlementError::InvalidTransition { from, to });
        }
        self.internal_status = to;
        self.status = to.payment_status();
        self.updated_at = at;
        Ok(())
    }

    pub fn apply(&mut self, transition: &Transition, at: DateTime<Utc>) -> Result<()> {
        self.transition(transition.to, at)?;
        if let Some(paid) = transition.payment_at {
            self.payment_at = Some(paid);
        }
        if let Some(settled) = transition.settlement_at {
            self.settlement_at = Some(settled);
        }
        if transition.clear_token {
            self.pay_token = None;
        }
        Ok(())
    }

    pub fn attach_token(&mut self, token: impl Into<String>, at: DateTime<Utc>) -> Result<()> {
        self.transition(InternalStatus::TokenReady, at)?;
        self.pay_token = Some(token.into());
        Ok(())
    }

    pub fn record_callback(&mut self, gateway_status: &str, payload: serde_json::Value) {
        self.gateway_status = Some(gateway_status.to_string());
        self.callback_payload = Some(payload);
    }
}

/// One creator's share of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetail {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub creator_id: Uuid,
    pub subtotal: Decimal,
    pub discount_id: Option<Uuid>,
    pub reviewed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionItem {
    pub id: Uuid,
    pub detail_id: Uuid,
    pub photo_id: Uuid,
    pub price: Decimal,
    pub discount: Decimal,
    pub final_price: Decimal,
}

/// A photo as priced by the photo service for a given buyer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricedPhoto {
    pub photo_id: Uuid,
    pub creator_id: Uuid,
    pub price: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    pub final_price: Decimal,
    #[serde(default)]
    pub discount_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    pub items: Vec<PricedPhoto>,
    pub total: Decimal,
}

/// Transaction, details and items; always written together.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionAggregate {
    pub transaction: Transaction,
    pub details: Vec<TransactionDetail>,
    pub items: Vec<TransactionItem>,
}

impl TransactionAggregate {
    /// Splits a priced checkout into one detail per creator.
    ///
    /// The stored amount is the sum of final prices; a quote total that disagrees
    /// is logged and ignored.
    pub fn from_quote(user_id: Uuid, quote: &PriceQuote, at: DateTime<Utc>) -> Result<Self> {
        if quote.items.is_empty() {
            return Err(SettlementError::Validation(
                "no purchasable photos in checkout".to_string(),
            ));
        }
        Amount::new(quote.total)?;

        let transaction_id = Uuid::new_v4();
        let mut by_creator: BTreeMap<Uuid, Vec<&PricedPhoto>> = BTreeMap::new();
        for photo in &quote.items {
            by_creator.entry(photo.creator_id).or_default().push(photo);
        }

        let mut details = Vec::with_capacity(by_creator.len());
        let mut items = Vec::with_capacity(quote.items.len());
        for (creator_id, photos) in by_creator {
            let detail_id = Uuid::new_v4();
            let subtotal: Decimal = photos.iter().map(|photo| photo.final_price).sum();
            let discount_id = photos.iter().find_map(|photo| photo.discount_id);

            items.extend(photos.iter().map(|photo| TransactionItem {
                id: Uuid::new_v4(),
                detail_id,
                photo_id: photo.photo_id,
                price: photo.price,
                discount: photo.discount,
                final_price: photo.final_price,
            }));
            details.push(TransactionDetail {
                id: detail_id,
                transaction_id,
                creator_id,
                subtotal,
                discount_id,
                reviewed: false,
            });
        }

        let amount: Decimal = details.iter().map(|detail| detail.subtotal).sum();
        if amount != quote.total {
            warn!(
                quote_total = %quote.total,
                computed_total = %amount,
                "price quote total disagrees with item prices, using item prices"
            );
        }

        let photo_ids = quote.items.iter().map(|photo| photo.photo_id).collect();
        let transaction = Transaction::new(transaction_id, user_id, photo_ids, Amount::new(amount)?, at);

        Ok(Self {
            transaction,
            details,
            items,
        })
    }
}
