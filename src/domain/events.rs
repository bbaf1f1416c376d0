use crate::domain::transaction::Transaction;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events published to the photo service after a transaction reaches an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionEvent {
    /// Ownership of the photos moves to the buyer.
    Settled {
        transaction_id: Uuid,
        user_id: Uuid,
        photo_ids: Vec<Uuid>,
    },
    /// The reservation on the photos is released.
    Canceled {
        transaction_id: Uuid,
        user_id: Uuid,
        photo_ids: Vec<Uuid>,
    },
}

impl TransactionEvent {
    pub fn settled(transaction: &Transaction) -> Self {
        Self::Settled {
            transaction_id: transaction.id,
            user_id: transaction.user_id,
            photo_ids: transaction.photo_ids.clone(),
        }
    }

    pub fn canceled(transaction: &Transaction) -> Self {
        Self::Canceled {
            transaction_id: transaction.id,
            user_id: transaction.user_id,
            photo_ids: transaction.photo_ids.clone(),
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            Self::Settled { .. } => "transaction.settled",
            Self::Canceled { .. } => "transaction.canceled",
        }
    }

    pub fn transaction_id(&self) -> Uuid {
        match self {
            Self::Settled { transaction_id, .. } | Self::Canceled { transaction_id, .. } => {
                *transaction_id
            }
        }
    }
}
