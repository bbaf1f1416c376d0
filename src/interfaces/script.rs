//! JSON-lines command script driving the engine.
//!
//! Each non-empty line is one command tagged by `op`. A checkout may carry a
//! script-local `ref`; later commands can target it with `ref` instead of a
//! `transaction_id`. Lines starting with `#` are comments.

use crate::application::cancellation::CancellationOutcome;
use crate::application::checkout::CheckoutRequest;
use crate::application::reconciliation::ReconcileOutcome;
use crate::application::runtime::SettlementEngine;
use crate::application::scheduler::CycleReport;
use crate::domain::money::format_gross_amount;
use crate::domain::notification::{PaymentNotification, format_gateway_time, parse_gateway_time};
use crate::domain::ports::TransactionRepositoryRef;
use crate::domain::status::GatewayStatus;
use crate::error::{Result, SettlementError};
use crate::infrastructure::gateway::sandbox::SandboxGateway;
use chrono::{FixedOffset, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptCommand {
    Checkout {
        #[serde(rename = "ref", default)]
        reference: Option<String>,
        user_id: Uuid,
        #[serde(default)]
        creator_id: Option<Uuid>,
        photo_ids: Vec<Uuid>,
        #[serde(default)]
        email: Option<String>,
    },
    /// A gateway notification, signed with the configured server key unless
    /// `signature_key` overrides it.
    Webhook {
        #[serde(rename = "ref", default)]
        reference: Option<String>,
        #[serde(default)]
        transaction_id: Option<Uuid>,
        status: String,
        #[serde(default)]
        gross_amount: Option<Decimal>,
        #[serde(default)]
        settlement_time: Option<String>,
        #[serde(default)]
        signature_key: Option<String>,
    },
    /// A webhook body exactly as delivered.
    Payload { body: Value },
    Cancel {
        #[serde(rename = "ref", default)]
        reference: Option<String>,
        #[serde(default)]
        transaction_id: Option<Uuid>,
        /// Defaults to the buyer of the transaction.
        #[serde(default)]
        user_id: Option<Uuid>,
    },
    Expire {
        #[serde(rename = "ref", default)]
        reference: Option<String>,
        #[serde(default)]
        transaction_id: Option<Uuid>,
    },
    /// One reconciliation scheduler cycle, run immediately.
    Reconcile,
    /// Sets the sandbox gateway's authoritative status for an order.
    GatewayStatus {
        #[serde(rename = "ref", default)]
        reference: Option<String>,
        #[serde(default)]
        transaction_id: Option<Uuid>,
        status: String,
        #[serde(default)]
        settlement_time: Option<String>,
    },
    /// Fails the next `failures` sandbox snapshot calls.
    Outage { failures: u32 },
    Wait { ms: u64 },
}

impl ScriptCommand {
    /// Parses one script line; blank lines and `#` comments yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        serde_json::from_str(line)
            .map(Some)
            .map_err(|e| SettlementError::Validation(format!("invalid script line: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    CheckedOut {
        transaction_id: Uuid,
        pay_token: Option<String>,
    },
    Reconciled(ReconcileOutcome),
    Closed(CancellationOutcome),
    Cycle(CycleReport),
    Configured,
    Waited,
}

/// Executes script commands against a running engine.
pub struct ScriptRunner<'a> {
    engine: &'a SettlementEngine,
    transactions: TransactionRepositoryRef,
    sandbox: Option<Arc<SandboxGateway>>,
    server_key: String,
    gateway_offset: FixedOffset,
    refs: HashMap<String, Uuid>,
}

impl<'a> ScriptRunner<'a> {
    pub fn new(
        engine: &'a SettlementEngine,
        transactions: TransactionRepositoryRef,
        server_key: impl Into<String>,
        gateway_offset: FixedOffset,
    ) -> Self {
        Self {
            engine,
            transactions,
            sandbox: None,
            server_key: server_key.into(),
            gateway_offset,
            refs: HashMap::new(),
        }
    }

    /// Enables the sandbox-only commands.
    pub fn with_sandbox(mut self, sandbox: Arc<SandboxGateway>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Runs every line, logging and skipping the ones that fail.
    pub async fn run_lines<I, S>(&mut self, lines: I) -> Vec<Result<StepOutcome>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut results = Vec::new();
        for (number, line) in lines.into_iter().enumerate() {
            let result = match ScriptCommand::parse_line(line.as_ref()) {
                Ok(Some(command)) => self.execute(command).await,
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                warn!(line = number + 1, error = %e, "script command failed");
            }
            results.push(result);
        }
        results
    }

    pub async fn execute(&mut self, command: ScriptCommand) -> Result<StepOutcome> {
        match command {
            ScriptCommand::Checkout {
                reference,
                user_id,
                creator_id,
                photo_ids,
                email,
            } => {
                let checkout = self
                    .engine
                    .checkout()
                    .create_transaction(CheckoutRequest {
                        user_id,
                        creator_id: creator_id.unwrap_or_default(),
                        photo_ids,
                        email: email.unwrap_or_else(|| format!("{user_id}@buyers.invalid")),
                    })
                    .await?;
                let transaction_id = checkout.transaction.id;
                if let Some(reference) = reference {
                    self.refs.insert(reference, transaction_id);
                }
                info!(transaction_id = %transaction_id, amount = %checkout.transaction.amount, "checkout");
                Ok(StepOutcome::CheckedOut {
                    transaction_id,
                    pay_token: checkout.transaction.pay_token,
                })
            }
            ScriptCommand::Webhook {
                reference,
                transaction_id,
                status,
                gross_amount,
                settlement_time,
                signature_key,
            } => {
                let id = self.resolve(reference, transaction_id)?;
                let status: GatewayStatus = status.parse().unwrap_or_else(|never| match never {});
                let gross_amount = match gross_amount {
                    Some(amount) => amount,
                    None => self.amount_of(id).await?,
                };
                let settlement_time = settlement_time.or_else(|| {
                    status
                        .is_settled()
                        .then(|| format_gateway_time(Utc::now(), self.gateway_offset))
                });
                let mut notification = PaymentNotification::signed(
                    id.to_string(),
                    &status,
                    format_gross_amount(gross_amount),
                    settlement_time,
                    &self.server_key,
                );
                if let Some(signature_key) = signature_key {
                    notification.signature_key = signature_key;
                }
                let raw = serde_json::to_value(&notification)?;
                let outcome = self.engine.reconciliation().handle(notification, raw).await?;
                Ok(StepOutcome::Reconciled(outcome))
            }
            ScriptCommand::Payload { body } => {
                let outcome = self.engine.reconciliation().handle_payload(body).await?;
                Ok(StepOutcome::Reconciled(outcome))
            }
            ScriptCommand::Cancel {
                reference,
                transaction_id,
                user_id,
            } => {
                let id = self.resolve(reference, transaction_id)?;
                let user_id = match user_id {
                    Some(user_id) => user_id,
                    None => self.buyer_of(id).await?,
                };
                let outcome = self.engine.cancellation().cancel(user_id, id).await?;
                Ok(StepOutcome::Closed(outcome))
            }
            ScriptCommand::Expire {
                reference,
                transaction_id,
            } => {
                let id = self.resolve(reference, transaction_id)?;
                let outcome = self.engine.cancellation().expire(id).await?;
                Ok(StepOutcome::Closed(outcome))
            }
            ScriptCommand::Reconcile => {
                let report = self.engine.scheduler().run_cycle().await?;
                info!(
                    polled = report.polled,
                    applied = report.applied,
                    ignored = report.ignored,
                    failed = report.failed,
                    "reconciliation cycle"
                );
                Ok(StepOutcome::Cycle(report))
            }
            ScriptCommand::GatewayStatus {
                reference,
                transaction_id,
                status,
                settlement_time,
            } => {
                let sandbox = self.sandbox()?;
                let id = self.resolve(reference, transaction_id)?;
                let status: GatewayStatus = status.parse().unwrap_or_else(|never| match never {});
                let amount = self.amount_of(id).await?;
                let settled_at = match settlement_time {
                    Some(raw) => Some(parse_gateway_time(&raw, self.gateway_offset).ok_or_else(
                        || SettlementError::Validation(format!("invalid settlement time '{raw}'")),
                    )?),
                    None => status.is_settled().then(Utc::now),
                };
                sandbox.set_status_at(&id.to_string(), status, amount, settled_at);
                Ok(StepOutcome::Configured)
            }
            ScriptCommand::Outage { failures } => {
                self.sandbox()?.fail_next(failures);
                Ok(StepOutcome::Configured)
            }
            ScriptCommand::Wait { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(StepOutcome::Waited)
            }
        }
    }

    fn sandbox(&self) -> Result<&SandboxGateway> {
        self.sandbox
            .as_deref()
            .ok_or_else(|| SettlementError::Validation("command needs the sandbox gateway".to_string()))
    }

    fn resolve(&self, reference: Option<String>, transaction_id: Option<Uuid>) -> Result<Uuid> {
        match (reference, transaction_id) {
            (_, Some(id)) => Ok(id),
            (Some(reference), None) => self
                .refs
                .get(&reference)
                .copied()
                .ok_or_else(|| SettlementError::NotFound(format!("script reference '{reference}'"))),
            (None, None) => Err(SettlementError::Validation(
                "command needs a ref or a transaction_id".to_string(),
            )),
        }
    }

    async fn amount_of(&self, id: Uuid) -> Result<Decimal> {
        self.transactions
            .get(id)
            .await?
            .map(|transaction| transaction.amount)
            .ok_or_else(|| SettlementError::NotFound(format!("transaction {id}")))
    }

    async fn buyer_of(&self, id: Uuid) -> Result<Uuid> {
        self.transactions
            .get(id)
            .await?
            .map(|transaction| transaction.user_id)
            .ok_or_else(|| SettlementError::NotFound(format!("transaction {id}")))
    }
}
