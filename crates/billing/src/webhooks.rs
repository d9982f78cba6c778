//! Processor webhook intake.
//!
//! Deliveries are at-least-once and unordered, so every event runs through
//! the idempotency ledger before any state changes: verify the signature,
//! atomically claim the (processor, event id) pair, dispatch, then mark the
//! ledger row processed. A crash between claim and mark leaves the row
//! re-claimable for a bounded number of redeliveries.

use std::sync::Arc;

use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use uuid::Uuid;

use crate::dunning::PaymentFailureHandler;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::model::{
    AccountStatus, FailureReason, MembershipUpdate, ProcessedWebhookEvent, ProcessorType,
    Transaction, TransactionStatus,
};
use crate::processor::{PaymentProcessor, ProcessorError, ProcessorEvent, WebhookAction};
use crate::store::{BillingStore, WebhookClaim};

/// Fallback evidence window when a dispute event carries no deadline.
const DEFAULT_EVIDENCE_WINDOW: time::Duration = time::Duration::days(7);

/// What the handler did with a delivery. Everything here answers 2xx at the
/// HTTP layer; real errors surface as `BillingError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookDisposition {
    /// First delivery, dispatched successfully.
    Processed { action: WebhookAction },
    /// Ledger short-circuit: already processed, or redelivery budget spent.
    Duplicate,
    /// Verified but not an event type this engine acts on.
    Unhandled { event_type: String },
    /// Dispatch failed; the failure is recorded on the ledger row so
    /// redelivery will not loop.
    DispatchFailed { error: String },
}

pub struct WebhookHandler {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn BillingStore>,
    failures: PaymentFailureHandler,
    event_logger: BillingEventLogger,
}

impl WebhookHandler {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        failures: PaymentFailureHandler,
    ) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            processor,
            store,
            failures,
            event_logger,
        }
    }

    /// Which provider's deliveries this handler verifies.
    pub fn processor_type(&self) -> ProcessorType {
        self.processor.processor_type()
    }

    /// Drop processed ledger rows older than `cutoff`. Providers do not
    /// redeliver events that old, so the rows no longer guard anything.
    pub async fn prune_ledger(&self, cutoff: time::OffsetDateTime) -> BillingResult<u64> {
        self.store.prune_webhook_events(cutoff).await
    }

    /// Verify, claim, dispatch, mark. The idempotency claim happens before
    /// any business state changes; signature failures happen before even
    /// that, so a forged payload touches nothing.
    pub async fn handle_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> BillingResult<WebhookDisposition> {
        let event = self
            .processor
            .construct_webhook_event(payload, signature)
            .await
            .map_err(|error| match error {
                ProcessorError::InvalidSignature => BillingError::SignatureInvalid,
                ProcessorError::MalformedEvent(detail) => BillingError::Validation(detail),
                other => BillingError::Processor(other),
            })?;

        let record = ProcessedWebhookEvent::new(
            self.processor.processor_type(),
            &event.event_id,
            &event.event_type,
        );
        match self.store.claim_webhook_event(&record).await? {
            WebhookClaim::Claimed => {}
            WebhookClaim::RetryClaimed { retry_count } => {
                tracing::warn!(
                    event_id = %event.event_id,
                    retry_count,
                    "Reprocessing webhook event that was claimed but never finished"
                );
            }
            WebhookClaim::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    "Duplicate webhook delivery ignored"
                );
                return Ok(WebhookDisposition::Duplicate);
            }
            WebhookClaim::Exhausted => {
                tracing::warn!(
                    event_id = %event.event_id,
                    "Webhook redelivery budget exhausted; ignoring"
                );
                return Ok(WebhookDisposition::Duplicate);
            }
        }

        let action = self.processor.interpret_event(&event);
        let dispatch_result = self.dispatch(&event, &action).await;
        let dispatch_error = dispatch_result.as_ref().err().map(ToString::to_string);

        // The bookkeeping write must land even under transient storage
        // trouble; otherwise the provider redelivers a processed event.
        let processor_type = self.processor.processor_type();
        Retry::spawn(FixedInterval::from_millis(200).take(2), || {
            self.store.mark_webhook_event_processed(
                processor_type,
                &event.event_id,
                dispatch_error.as_deref(),
            )
        })
        .await?;

        match dispatch_result {
            Ok(()) => match action {
                WebhookAction::Unhandled { event_type } => {
                    Ok(WebhookDisposition::Unhandled { event_type })
                }
                action => Ok(WebhookDisposition::Processed { action }),
            },
            Err(error) => {
                tracing::error!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %error,
                    "Webhook dispatch failed; recorded on ledger"
                );
                self.log_event(
                    BillingEventBuilder::new(Uuid::nil(), BillingEventType::WebhookDispatchFailed)
                        .actor_type(ActorType::Processor)
                        .processor_event(&event.event_id)
                        .data(serde_json::json!({
                            "eventType": event.event_type,
                            "error": error.to_string(),
                        })),
                )
                .await;
                Ok(WebhookDisposition::DispatchFailed {
                    error: error.to_string(),
                })
            }
        }
    }

    async fn dispatch(&self, event: &ProcessorEvent, action: &WebhookAction) -> BillingResult<()> {
        match action {
            WebhookAction::PaymentSucceeded {
                processor_transaction_id,
            } => {
                self.payment_succeeded(event, processor_transaction_id)
                    .await
            }
            WebhookAction::PaymentFailed {
                processor_transaction_id,
                code,
                message,
            } => {
                self.payment_failed(processor_transaction_id, code, message)
                    .await
            }
            WebhookAction::DisputeOpened {
                processor_transaction_id,
                dispute_type,
                amount_cents,
                evidence_due_by,
            } => {
                let Some(transaction) = self
                    .store
                    .get_transaction_by_processor_id(processor_transaction_id)
                    .await?
                else {
                    tracing::info!(
                        processor_transaction_id = %processor_transaction_id,
                        "Dispute event references an unknown transaction; ignoring"
                    );
                    return Ok(());
                };
                let amount = if *amount_cents > 0 {
                    *amount_cents
                } else {
                    transaction.amount_cents
                };
                self.failures
                    .create_dispute_case(
                        transaction.transaction_id,
                        *dispute_type,
                        amount,
                        vec![],
                        evidence_due_by.unwrap_or(event.created_at + DEFAULT_EVIDENCE_WINDOW),
                    )
                    .await?;
                Ok(())
            }
            WebhookAction::Unhandled { event_type } => {
                tracing::info!(
                    event_id = %event.event_id,
                    event_type = %event_type,
                    "Webhook event type not handled"
                );
                Ok(())
            }
        }
    }

    /// Out-of-band payment confirmation. If the charge was already settled
    /// by the renewal or retry sweep this is a no-op; otherwise the pending
    /// transaction completes and a past_due account recovers.
    async fn payment_succeeded(
        &self,
        event: &ProcessorEvent,
        processor_transaction_id: &str,
    ) -> BillingResult<()> {
        let Some(mut transaction) = self
            .store
            .get_transaction_by_processor_id(processor_transaction_id)
            .await?
        else {
            tracing::info!(
                processor_transaction_id = %processor_transaction_id,
                "Payment event references an unknown transaction; ignoring"
            );
            return Ok(());
        };

        if transaction.status != TransactionStatus::Pending {
            // Already settled locally; the delivery confirms known state.
            return Ok(());
        }

        transaction.status = TransactionStatus::Completed;
        transaction.updated_at = time::OffsetDateTime::now_utc();
        self.store.update_transaction(&transaction).await?;

        self.reactivate_if_past_due(&transaction).await?;
        self.failures
            .resolve_open_failure(transaction.billing_account_id)
            .await?;

        self.log_event(
            BillingEventBuilder::new(transaction.user_id, BillingEventType::PaymentRecovered)
                .billing_account(transaction.billing_account_id)
                .actor_type(ActorType::Processor)
                .processor_event(&event.event_id)
                .data(serde_json::json!({
                    "transactionId": transaction.transaction_id,
                    "amountCents": transaction.amount_cents,
                })),
        )
        .await;

        tracing::info!(
            transaction_id = %transaction.transaction_id,
            processor_transaction_id = %processor_transaction_id,
            "Pending transaction settled by webhook"
        );
        Ok(())
    }

    async fn reactivate_if_past_due(&self, transaction: &Transaction) -> BillingResult<()> {
        let Some(account) = self
            .store
            .get_billing_account(transaction.billing_account_id)
            .await?
        else {
            return Ok(());
        };
        if account.status != AccountStatus::PastDue {
            return Ok(());
        }

        let now = time::OffsetDateTime::now_utc();
        let mut recovered = account.clone();
        recovered.status = AccountStatus::Active;
        recovered.next_billing_date = account.next_billing_date + account.billing_cycle.period();
        recovered.payment_history.push(transaction.transaction_id);
        recovered.updated_at = now;
        if !self
            .store
            .update_billing_account_if_status(&recovered, AccountStatus::PastDue)
            .await?
        {
            // Another writer (the retry sweep, usually) got there first.
            tracing::info!(
                billing_id = %account.billing_id,
                "Account left past_due concurrently; skipping reactivation"
            );
            return Ok(());
        }

        if let Some(profile) = self.store.get_user_profile(account.user_id).await? {
            self.store
                .update_user_membership(
                    account.user_id,
                    &MembershipUpdate {
                        membership_tier: profile.membership_tier,
                        premium_expires_at: Some(recovered.next_billing_date),
                    },
                )
                .await?;
        }
        Ok(())
    }

    async fn payment_failed(
        &self,
        processor_transaction_id: &str,
        code: &str,
        message: &str,
    ) -> BillingResult<()> {
        let Some(mut transaction) = self
            .store
            .get_transaction_by_processor_id(processor_transaction_id)
            .await?
        else {
            tracing::info!(
                processor_transaction_id = %processor_transaction_id,
                "Failure event references an unknown transaction; ignoring"
            );
            return Ok(());
        };

        match transaction.status {
            TransactionStatus::Pending => {
                transaction.status = TransactionStatus::Failed;
                transaction.updated_at = time::OffsetDateTime::now_utc();
                self.store.update_transaction(&transaction).await?;
            }
            TransactionStatus::Failed => {
                // Already recorded locally; opening the thread below is
                // idempotent per account.
            }
            TransactionStatus::Completed | TransactionStatus::Refunded => {
                // Stale delivery for a charge that has since settled.
                tracing::info!(
                    transaction_id = %transaction.transaction_id,
                    status = %transaction.status,
                    "Failure event for a settled transaction; ignoring"
                );
                return Ok(());
            }
        }

        self.failures
            .handle_payment_failure(
                transaction.transaction_id,
                transaction.billing_account_id,
                FailureReason::from_processor_code(code),
                message,
            )
            .await?;
        Ok(())
    }

    async fn log_event(&self, builder: BillingEventBuilder) {
        if let Err(error) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %error, "Failed to record billing audit event");
        }
    }
}
