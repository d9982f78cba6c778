//! Billing storage capability.
//!
//! The platform's persistence engine, seen through the narrow surface the
//! billing engine needs. The store is the single source of truth for billing
//! state; the payment processor is authoritative only for payment outcomes.
//!
//! Two adapters ship with the crate: [`crate::memory::MemoryBillingStore`]
//! (tests, local development) and [`crate::postgres::PgBillingStore`].

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::events::BillingEvent;
use crate::model::{
    AccountStatus, BillingAccount, DisputeCase, MembershipUpdate, PaymentFailure,
    ProcessedWebhookEvent, ProcessorType, Transaction, UserProfile,
};

/// Result of attempting to claim a webhook event id for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    /// First delivery; the caller owns dispatch.
    Claimed,
    /// The event was already fully processed; short-circuit.
    AlreadyProcessed,
    /// A prior delivery claimed the event but never finished (crash between
    /// claim and mark). The caller owns this redelivery attempt.
    RetryClaimed { retry_count: u32 },
    /// Unfinished, but the redelivery budget is spent; short-circuit.
    Exhausted,
}

/// Persistent storage consumed by the billing engine.
///
/// Writes must be atomic per call. `update_billing_account_if_status` and
/// `claim_webhook_event` are the two concurrency-bearing operations:
/// implementations must make the check-and-write atomic (conditional UPDATE,
/// INSERT .. ON CONFLICT), not read-then-write.
#[async_trait]
pub trait BillingStore: Send + Sync {
    // ---- Billing accounts ----

    async fn create_billing_account(&self, account: &BillingAccount) -> BillingResult<()>;

    async fn get_billing_account(&self, billing_id: Uuid)
        -> BillingResult<Option<BillingAccount>>;

    async fn get_billing_account_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<BillingAccount>>;

    async fn get_billing_account_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingAccount>>;

    /// Unconditional write of every mutable account field.
    async fn update_billing_account(&self, account: &BillingAccount) -> BillingResult<()>;

    /// Conditional write: applies `account` only if the persisted status
    /// still equals `expected`. Returns false when another writer got there
    /// first. This is the lost-update guard for concurrent webhook + sweep
    /// processing of the same account.
    async fn update_billing_account_if_status(
        &self,
        account: &BillingAccount,
        expected: AccountStatus,
    ) -> BillingResult<bool>;

    /// Accounts with `next_billing_date <= now` and status not canceled.
    async fn accounts_due_for_renewal(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<BillingAccount>>;

    // ---- Transactions ----

    async fn create_transaction(&self, transaction: &Transaction) -> BillingResult<()>;

    async fn get_transaction(&self, transaction_id: Uuid) -> BillingResult<Option<Transaction>>;

    async fn get_transaction_by_processor_id(
        &self,
        processor_transaction_id: &str,
    ) -> BillingResult<Option<Transaction>>;

    async fn update_transaction(&self, transaction: &Transaction) -> BillingResult<()>;

    // ---- Payment failures (dunning threads) ----

    async fn create_payment_failure(&self, failure: &PaymentFailure) -> BillingResult<()>;

    async fn get_payment_failure(
        &self,
        failure_id: Uuid,
    ) -> BillingResult<Option<PaymentFailure>>;

    /// The unresolved thread for an account, if one is open. At most one
    /// exists at a time; the handler never forks a second.
    async fn get_open_payment_failure_for_account(
        &self,
        billing_account_id: Uuid,
    ) -> BillingResult<Option<PaymentFailure>>;

    async fn update_payment_failure(&self, failure: &PaymentFailure) -> BillingResult<()>;

    /// Unresolved failures whose `next_retry_at` has come due. Exhausted
    /// threads carry no `next_retry_at` and therefore never match.
    async fn failures_due_for_retry(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentFailure>>;

    // ---- Dispute cases ----

    async fn create_dispute_case(&self, case: &DisputeCase) -> BillingResult<()>;

    async fn get_dispute_case(&self, dispute_id: Uuid) -> BillingResult<Option<DisputeCase>>;

    // ---- Webhook idempotency ledger ----

    /// Atomically claim `(processor, event id)` for processing.
    async fn claim_webhook_event(
        &self,
        record: &ProcessedWebhookEvent,
    ) -> BillingResult<WebhookClaim>;

    /// Mark a claimed event processed, recording dispatch failure details
    /// when there were any. Idempotent.
    async fn mark_webhook_event_processed(
        &self,
        processor_type: ProcessorType,
        event_id: &str,
        error: Option<&str>,
    ) -> BillingResult<()>;

    async fn get_processed_webhook_event(
        &self,
        processor_type: ProcessorType,
        event_id: &str,
    ) -> BillingResult<Option<ProcessedWebhookEvent>>;

    /// Drop processed ledger rows older than `older_than`. Returns rows
    /// removed. Unprocessed rows are kept regardless of age.
    async fn prune_webhook_events(&self, older_than: OffsetDateTime) -> BillingResult<u64>;

    // ---- User profiles ----

    async fn get_user_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>>;

    async fn update_user_membership(
        &self,
        user_id: Uuid,
        update: &MembershipUpdate,
    ) -> BillingResult<()>;

    // ---- Audit trail ----

    async fn record_billing_event(&self, event: &BillingEvent) -> BillingResult<()>;
}
