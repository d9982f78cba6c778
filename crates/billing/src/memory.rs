//! In-memory [`BillingStore`] adapter.
//!
//! Backs the test suite and local development (`DATABASE_URL` unset). State
//! lives in process; claim/conditional-write semantics match the Postgres
//! adapter so behavior tests exercise the real concurrency contract.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;
use crate::model::{
    AccountStatus, BillingAccount, DisputeCase, MembershipUpdate, PaymentFailure,
    ProcessedWebhookEvent, ProcessorType, Transaction, UserProfile,
};
use crate::store::{BillingStore, WebhookClaim};

#[derive(Default)]
struct Inner {
    accounts: HashMap<Uuid, BillingAccount>,
    transactions: HashMap<Uuid, Transaction>,
    failures: HashMap<Uuid, PaymentFailure>,
    disputes: HashMap<Uuid, DisputeCase>,
    webhook_events: HashMap<(ProcessorType, String), ProcessedWebhookEvent>,
    users: HashMap<Uuid, UserProfile>,
    billing_events: Vec<BillingEvent>,
}

#[derive(Default)]
pub struct MemoryBillingStore {
    inner: RwLock<Inner>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user profile (chainable, for test setup).
    pub fn with_user(self, profile: UserProfile) -> Self {
        self.write().users.insert(profile.user_id, profile);
        self
    }

    pub fn insert_user_profile(&self, profile: UserProfile) {
        self.write().users.insert(profile.user_id, profile);
    }

    /// Snapshot of the audit trail, oldest first.
    pub fn billing_events(&self) -> Vec<BillingEvent> {
        self.read().billing_events.clone()
    }

    /// Snapshot of every transaction, oldest first.
    pub fn transactions(&self) -> Vec<Transaction> {
        let mut transactions: Vec<Transaction> =
            self.read().transactions.values().cloned().collect();
        transactions.sort_by_key(|t| t.created_at);
        transactions
    }

    /// Snapshot of every dunning thread, oldest first.
    pub fn payment_failures(&self) -> Vec<PaymentFailure> {
        let mut failures: Vec<PaymentFailure> = self.read().failures.values().cloned().collect();
        failures.sort_by_key(|f| f.created_at);
        failures
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn create_billing_account(&self, account: &BillingAccount) -> BillingResult<()> {
        let mut inner = self.write();
        if inner.accounts.contains_key(&account.billing_id) {
            return Err(BillingError::Storage(format!(
                "billing account {} already exists",
                account.billing_id
            )));
        }
        // Same backstop as the Postgres partial unique index.
        let duplicate = inner.accounts.values().any(|existing| {
            existing.user_id == account.user_id && existing.status != AccountStatus::Canceled
        });
        if duplicate && account.status != AccountStatus::Canceled {
            return Err(BillingError::Storage(format!(
                "user {} already has a non-canceled billing account",
                account.user_id
            )));
        }
        inner.accounts.insert(account.billing_id, account.clone());
        Ok(())
    }

    async fn get_billing_account(
        &self,
        billing_id: Uuid,
    ) -> BillingResult<Option<BillingAccount>> {
        Ok(self.read().accounts.get(&billing_id).cloned())
    }

    async fn get_billing_account_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<BillingAccount>> {
        // Prefer the live account; fall back to the latest canceled one.
        let inner = self.read();
        let live = inner
            .accounts
            .values()
            .find(|a| a.user_id == user_id && a.status != AccountStatus::Canceled);
        if let Some(account) = live {
            return Ok(Some(account.clone()));
        }
        Ok(inner
            .accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn get_billing_account_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingAccount>> {
        Ok(self
            .read()
            .accounts
            .values()
            .find(|a| a.subscription_id == subscription_id)
            .cloned())
    }

    async fn update_billing_account(&self, account: &BillingAccount) -> BillingResult<()> {
        let mut inner = self.write();
        if !inner.accounts.contains_key(&account.billing_id) {
            return Err(BillingError::BillingAccountNotFound(
                account.billing_id.to_string(),
            ));
        }
        inner.accounts.insert(account.billing_id, account.clone());
        Ok(())
    }

    async fn update_billing_account_if_status(
        &self,
        account: &BillingAccount,
        expected: AccountStatus,
    ) -> BillingResult<bool> {
        let mut inner = self.write();
        match inner.accounts.get(&account.billing_id) {
            Some(current) if current.status == expected => {
                inner.accounts.insert(account.billing_id, account.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn accounts_due_for_renewal(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<BillingAccount>> {
        let mut due: Vec<BillingAccount> = self
            .read()
            .accounts
            .values()
            .filter(|a| a.status != AccountStatus::Canceled && a.next_billing_date <= now)
            .cloned()
            .collect();
        due.sort_by_key(|a| a.next_billing_date);
        Ok(due)
    }

    async fn create_transaction(&self, transaction: &Transaction) -> BillingResult<()> {
        self.write()
            .transactions
            .insert(transaction.transaction_id, transaction.clone());
        Ok(())
    }

    async fn get_transaction(&self, transaction_id: Uuid) -> BillingResult<Option<Transaction>> {
        Ok(self.read().transactions.get(&transaction_id).cloned())
    }

    async fn get_transaction_by_processor_id(
        &self,
        processor_transaction_id: &str,
    ) -> BillingResult<Option<Transaction>> {
        Ok(self
            .read()
            .transactions
            .values()
            .find(|t| t.processor_transaction_id.as_deref() == Some(processor_transaction_id))
            .cloned())
    }

    async fn update_transaction(&self, transaction: &Transaction) -> BillingResult<()> {
        let mut inner = self.write();
        if !inner.transactions.contains_key(&transaction.transaction_id) {
            return Err(BillingError::TransactionNotFound(
                transaction.transaction_id.to_string(),
            ));
        }
        inner
            .transactions
            .insert(transaction.transaction_id, transaction.clone());
        Ok(())
    }

    async fn create_payment_failure(&self, failure: &PaymentFailure) -> BillingResult<()> {
        self.write()
            .failures
            .insert(failure.failure_id, failure.clone());
        Ok(())
    }

    async fn get_payment_failure(
        &self,
        failure_id: Uuid,
    ) -> BillingResult<Option<PaymentFailure>> {
        Ok(self.read().failures.get(&failure_id).cloned())
    }

    async fn get_open_payment_failure_for_account(
        &self,
        billing_account_id: Uuid,
    ) -> BillingResult<Option<PaymentFailure>> {
        Ok(self
            .read()
            .failures
            .values()
            .find(|f| f.billing_account_id == billing_account_id && !f.resolved)
            .cloned())
    }

    async fn update_payment_failure(&self, failure: &PaymentFailure) -> BillingResult<()> {
        let mut inner = self.write();
        if !inner.failures.contains_key(&failure.failure_id) {
            return Err(BillingError::Storage(format!(
                "payment failure {} not found",
                failure.failure_id
            )));
        }
        inner.failures.insert(failure.failure_id, failure.clone());
        Ok(())
    }

    async fn failures_due_for_retry(
        &self,
        now: OffsetDateTime,
    ) -> BillingResult<Vec<PaymentFailure>> {
        let mut due: Vec<PaymentFailure> = self
            .read()
            .failures
            .values()
            .filter(|f| !f.resolved && f.next_retry_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|f| f.next_retry_at);
        Ok(due)
    }

    async fn create_dispute_case(&self, case: &DisputeCase) -> BillingResult<()> {
        self.write().disputes.insert(case.dispute_id, case.clone());
        Ok(())
    }

    async fn get_dispute_case(&self, dispute_id: Uuid) -> BillingResult<Option<DisputeCase>> {
        Ok(self.read().disputes.get(&dispute_id).cloned())
    }

    async fn claim_webhook_event(
        &self,
        record: &ProcessedWebhookEvent,
    ) -> BillingResult<WebhookClaim> {
        let mut inner = self.write();
        let key = (record.processor_type, record.event_id.clone());
        match inner.webhook_events.get_mut(&key) {
            None => {
                inner.webhook_events.insert(key, record.clone());
                Ok(WebhookClaim::Claimed)
            }
            Some(existing) if existing.processed => Ok(WebhookClaim::AlreadyProcessed),
            Some(existing) if existing.retry_count >= existing.max_retries => {
                Ok(WebhookClaim::Exhausted)
            }
            Some(existing) => {
                existing.retry_count += 1;
                Ok(WebhookClaim::RetryClaimed {
                    retry_count: existing.retry_count,
                })
            }
        }
    }

    async fn mark_webhook_event_processed(
        &self,
        processor_type: ProcessorType,
        event_id: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        let mut inner = self.write();
        let key = (processor_type, event_id.to_string());
        match inner.webhook_events.get_mut(&key) {
            Some(record) => {
                record.processed = true;
                record.processed_at = Some(OffsetDateTime::now_utc());
                record.last_error = error.map(str::to_string);
                Ok(())
            }
            None => Err(BillingError::Storage(format!(
                "webhook event {processor_type}:{event_id} was never claimed"
            ))),
        }
    }

    async fn get_processed_webhook_event(
        &self,
        processor_type: ProcessorType,
        event_id: &str,
    ) -> BillingResult<Option<ProcessedWebhookEvent>> {
        Ok(self
            .read()
            .webhook_events
            .get(&(processor_type, event_id.to_string()))
            .cloned())
    }

    async fn prune_webhook_events(&self, older_than: OffsetDateTime) -> BillingResult<u64> {
        let mut inner = self.write();
        let before = inner.webhook_events.len();
        inner
            .webhook_events
            .retain(|_, record| !record.processed || record.created_at >= older_than);
        Ok((before - inner.webhook_events.len()) as u64)
    }

    async fn get_user_profile(&self, user_id: Uuid) -> BillingResult<Option<UserProfile>> {
        Ok(self.read().users.get(&user_id).cloned())
    }

    async fn update_user_membership(
        &self,
        user_id: Uuid,
        update: &MembershipUpdate,
    ) -> BillingResult<()> {
        let mut inner = self.write();
        match inner.users.get_mut(&user_id) {
            Some(profile) => {
                profile.membership_tier = update.membership_tier;
                profile.premium_expires_at = update.premium_expires_at;
                Ok(())
            }
            None => Err(BillingError::UserNotFound(user_id.to_string())),
        }
    }

    async fn record_billing_event(&self, event: &BillingEvent) -> BillingResult<()> {
        self.write().billing_events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BillingCycle, FailureReason, MembershipTier, TransactionStatus, TransactionType};

    fn account(user_id: Uuid, status: AccountStatus, due_in_days: i64) -> BillingAccount {
        let now = OffsetDateTime::now_utc();
        BillingAccount {
            billing_id: Uuid::new_v4(),
            user_id,
            customer_id: "cus_mem".into(),
            payment_method_id: "pm_mem".into(),
            plan_id: "premium_individual".into(),
            amount_cents: 2999,
            currency: "usd".into(),
            status,
            subscription_id: format!("sub_{}", Uuid::new_v4()),
            billing_cycle: BillingCycle::Monthly,
            next_billing_date: now + time::Duration::days(due_in_days),
            trial_ends_at: None,
            canceled_at: None,
            payment_history: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn conditional_update_rejects_stale_status() {
        let store = MemoryBillingStore::new();
        let mut acct = account(Uuid::new_v4(), AccountStatus::Active, 5);
        store.create_billing_account(&acct).await.unwrap();

        // Another writer flips the account to past_due underneath us.
        let mut concurrent = acct.clone();
        concurrent.status = AccountStatus::PastDue;
        store.update_billing_account(&concurrent).await.unwrap();

        acct.status = AccountStatus::Canceled;
        let applied = store
            .update_billing_account_if_status(&acct, AccountStatus::Active)
            .await
            .unwrap();
        assert!(!applied, "stale expectation must not overwrite");

        let stored = store
            .get_billing_account(acct.billing_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, AccountStatus::PastDue);
    }

    #[tokio::test]
    async fn renewal_query_skips_canceled_and_future_accounts() {
        let store = MemoryBillingStore::new();
        let due = account(Uuid::new_v4(), AccountStatus::Active, -1);
        let future = account(Uuid::new_v4(), AccountStatus::Active, 10);
        let canceled = account(Uuid::new_v4(), AccountStatus::Canceled, -5);
        for a in [&due, &future, &canceled] {
            store.create_billing_account(a).await.unwrap();
        }

        let found = store
            .accounts_due_for_renewal(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].billing_id, due.billing_id);
    }

    #[tokio::test]
    async fn duplicate_live_account_per_user_is_rejected() {
        let store = MemoryBillingStore::new();
        let user_id = Uuid::new_v4();
        store
            .create_billing_account(&account(user_id, AccountStatus::Active, 5))
            .await
            .unwrap();

        let err = store
            .create_billing_account(&account(user_id, AccountStatus::Trialing, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Storage(_)));
    }

    #[tokio::test]
    async fn webhook_claim_lifecycle() {
        let store = MemoryBillingStore::new();
        let record = ProcessedWebhookEvent::new(ProcessorType::Sandbox, "evt_1", "payment_intent.succeeded");

        assert_eq!(
            store.claim_webhook_event(&record).await.unwrap(),
            WebhookClaim::Claimed
        );

        // Unfinished claim: redelivery re-claims until the budget runs out.
        for expected_retry in 1..=record.max_retries {
            assert_eq!(
                store.claim_webhook_event(&record).await.unwrap(),
                WebhookClaim::RetryClaimed {
                    retry_count: expected_retry
                }
            );
        }
        assert_eq!(
            store.claim_webhook_event(&record).await.unwrap(),
            WebhookClaim::Exhausted
        );

        // Once marked processed, redelivery short-circuits.
        store
            .mark_webhook_event_processed(ProcessorType::Sandbox, "evt_1", None)
            .await
            .unwrap();
        assert_eq!(
            store.claim_webhook_event(&record).await.unwrap(),
            WebhookClaim::AlreadyProcessed
        );
    }

    #[tokio::test]
    async fn prune_keeps_unprocessed_rows() {
        let store = MemoryBillingStore::new();
        let old_processed = ProcessedWebhookEvent {
            created_at: OffsetDateTime::now_utc() - time::Duration::days(30),
            ..ProcessedWebhookEvent::new(ProcessorType::Sandbox, "evt_old", "x")
        };
        let old_unprocessed = ProcessedWebhookEvent {
            created_at: OffsetDateTime::now_utc() - time::Duration::days(30),
            ..ProcessedWebhookEvent::new(ProcessorType::Sandbox, "evt_stuck", "x")
        };
        store.claim_webhook_event(&old_processed).await.unwrap();
        store.claim_webhook_event(&old_unprocessed).await.unwrap();
        store
            .mark_webhook_event_processed(ProcessorType::Sandbox, "evt_old", None)
            .await
            .unwrap();

        let removed = store
            .prune_webhook_events(OffsetDateTime::now_utc() - time::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store
            .get_processed_webhook_event(ProcessorType::Sandbox, "evt_stuck")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn retry_query_ignores_resolved_and_unscheduled() {
        let store = MemoryBillingStore::new();
        let now = OffsetDateTime::now_utc();
        let base = PaymentFailure {
            failure_id: Uuid::new_v4(),
            transaction_id: Uuid::new_v4(),
            billing_account_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount_cents: 2999,
            currency: "usd".into(),
            reason: FailureReason::CardDeclined,
            message: "declined".into(),
            attempt_number: 1,
            max_attempts: 3,
            next_retry_at: Some(now - time::Duration::hours(1)),
            grace_period_ends: now + time::Duration::days(14),
            resolved: false,
            created_at: now,
            updated_at: now,
        };

        let due = base.clone();
        let resolved = PaymentFailure {
            failure_id: Uuid::new_v4(),
            resolved: true,
            ..base.clone()
        };
        let exhausted = PaymentFailure {
            failure_id: Uuid::new_v4(),
            next_retry_at: None,
            ..base.clone()
        };
        for f in [&due, &resolved, &exhausted] {
            store.create_payment_failure(f).await.unwrap();
        }

        let found = store.failures_due_for_retry(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].failure_id, due.failure_id);
    }

    #[tokio::test]
    async fn membership_update_requires_user() {
        let store = MemoryBillingStore::new();
        let update = MembershipUpdate {
            membership_tier: MembershipTier::PremiumIndividual,
            premium_expires_at: None,
        };
        let err = store
            .update_user_membership(Uuid::new_v4(), &update)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::UserNotFound(_)));
    }

    #[tokio::test]
    async fn transactions_resolve_by_processor_id() {
        let store = MemoryBillingStore::new();
        let now = OffsetDateTime::now_utc();
        let tx = Transaction {
            transaction_id: Uuid::new_v4(),
            billing_account_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            transaction_type: TransactionType::SubscriptionRenewal,
            amount_cents: 2999,
            currency: "usd".into(),
            status: TransactionStatus::Pending,
            processor_transaction_id: Some("ch_42".into()),
            fee_cents: 0,
            net_cents: 2999,
            description: "renewal".into(),
            created_at: now,
            updated_at: now,
        };
        store.create_transaction(&tx).await.unwrap();

        let found = store
            .get_transaction_by_processor_id("ch_42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.transaction_id, tx.transaction_id);
        assert!(store
            .get_transaction_by_processor_id("ch_missing")
            .await
            .unwrap()
            .is_none());
    }
}
