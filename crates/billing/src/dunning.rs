//! Failed-payment recovery (dunning).
//!
//! A declined renewal opens one [`PaymentFailure`] thread per account; the
//! retry sweep re-charges due threads on a backing-off schedule. Recovery
//! restores the account to `active`; running out of attempts clears the
//! schedule and leaves the thread unresolved for ops escalation, it never
//! auto-cancels.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::model::{
    AccountStatus, BillingAccount, DisputeCase, DisputeStatus, DisputeType, FailureReason,
    MembershipUpdate, PaymentFailure, Transaction, TransactionStatus, TransactionType,
};
use crate::processor::{
    call_with_timeout, ChargeOutcome, ChargeRequest, PaymentProcessor, PROCESSOR_CALL_TIMEOUT,
};
use crate::store::BillingStore;

/// Retry schedule knobs.
#[derive(Debug, Clone)]
pub struct DunningConfig {
    /// Total payment attempts per thread, counting the original failed
    /// charge.
    pub max_attempts: u32,
    /// Days until the next retry, indexed by attempts made so far. Threads
    /// past the end of the table reuse the last entry.
    pub backoff_days: Vec<i64>,
    /// How long a past_due account keeps service while recovery runs.
    pub grace_period_days: i64,
}

impl Default for DunningConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_days: vec![1, 3, 7],
            grace_period_days: 14,
        }
    }
}

impl DunningConfig {
    /// When the next retry should run, given `attempts` made so far.
    /// `None` once the attempt budget is spent.
    pub fn delay_after_attempt(&self, attempts: u32) -> Option<time::Duration> {
        if attempts == 0 || attempts >= self.max_attempts || self.backoff_days.is_empty() {
            return None;
        }
        let index = ((attempts - 1) as usize).min(self.backoff_days.len() - 1);
        Some(time::Duration::days(self.backoff_days[index]))
    }

    pub fn grace_period(&self) -> time::Duration {
        time::Duration::days(self.grace_period_days)
    }
}

/// Counters reported by one retry sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySweepSummary {
    /// Threads whose retry was due.
    pub processed: usize,
    /// Charges that went through; thread resolved, account reactivated.
    pub recovered: usize,
    /// Declined again with attempts left; next retry scheduled.
    pub rescheduled: usize,
    /// Declined on the final attempt; schedule cleared, thread left open.
    pub exhausted: usize,
    /// Per-thread errors (timeouts, storage); retried next sweep.
    pub errors: usize,
}

enum RetryOutcome {
    Recovered,
    Rescheduled,
    Exhausted,
    Abandoned,
}

/// Drives [`PaymentFailure`] threads from open to resolved or exhausted.
#[derive(Clone)]
pub struct PaymentFailureHandler {
    processor: Arc<dyn PaymentProcessor>,
    store: Arc<dyn BillingStore>,
    config: DunningConfig,
    event_logger: BillingEventLogger,
}

impl PaymentFailureHandler {
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        store: Arc<dyn BillingStore>,
        config: DunningConfig,
    ) -> Self {
        let event_logger = BillingEventLogger::new(store.clone());
        Self {
            processor,
            store,
            config,
            event_logger,
        }
    }

    pub fn config(&self) -> &DunningConfig {
        &self.config
    }

    /// Open a recovery thread for a failed charge.
    ///
    /// Idempotent per account: if a thread is already open, it is returned
    /// unchanged instead of forking a second schedule. The account moves to
    /// `past_due` here; a canceled account keeps its status and the thread
    /// is recorded for the ledger only.
    pub async fn handle_payment_failure(
        &self,
        transaction_id: Uuid,
        billing_account_id: Uuid,
        reason: FailureReason,
        message: &str,
    ) -> BillingResult<PaymentFailure> {
        if let Some(existing) = self
            .store
            .get_open_payment_failure_for_account(billing_account_id)
            .await?
        {
            tracing::info!(
                failure_id = %existing.failure_id,
                billing_id = %billing_account_id,
                attempt = existing.attempt_number,
                "Recovery thread already open for account"
            );
            return Ok(existing);
        }

        let account = self
            .store
            .get_billing_account(billing_account_id)
            .await?
            .ok_or_else(|| BillingError::BillingAccountNotFound(billing_account_id.to_string()))?;

        let now = OffsetDateTime::now_utc();
        let failure = PaymentFailure {
            failure_id: Uuid::new_v4(),
            transaction_id,
            billing_account_id,
            user_id: account.user_id,
            amount_cents: account.amount_cents,
            currency: account.currency.clone(),
            reason,
            message: message.to_string(),
            // The failed charge that opened the thread counts as attempt 1.
            attempt_number: 1,
            max_attempts: self.config.max_attempts,
            next_retry_at: self.config.delay_after_attempt(1).map(|d| now + d),
            grace_period_ends: now + self.config.grace_period(),
            resolved: false,
            created_at: now,
            updated_at: now,
        };
        self.store.create_payment_failure(&failure).await?;

        if account.status.can_transition_to(AccountStatus::PastDue) {
            let expected = account.status;
            let mut past_due = account.clone();
            past_due.status = AccountStatus::PastDue;
            past_due.updated_at = now;
            if !self
                .store
                .update_billing_account_if_status(&past_due, expected)
                .await?
            {
                tracing::warn!(
                    billing_id = %billing_account_id,
                    "Account status changed while opening recovery thread"
                );
            }
        } else {
            tracing::warn!(
                billing_id = %billing_account_id,
                status = %account.status,
                "Recovery thread opened for account that cannot go past_due"
            );
        }

        self.log_event(
            BillingEventBuilder::new(account.user_id, BillingEventType::DunningStarted)
                .billing_account(billing_account_id)
                .data(serde_json::json!({
                    "failureId": failure.failure_id,
                    "transactionId": transaction_id,
                    "reason": reason.as_str(),
                    "nextRetryAt": failure.next_retry_at.map(|t| t.unix_timestamp()),
                    "gracePeriodEnds": failure.grace_period_ends.unix_timestamp(),
                })),
        )
        .await;

        tracing::warn!(
            failure_id = %failure.failure_id,
            billing_id = %billing_account_id,
            reason = %reason,
            "Payment failure recorded; recovery thread opened"
        );

        Ok(failure)
    }

    /// Close the open thread for an account, if any. Used when a renewal or
    /// webhook reports payment success outside the retry sweep.
    pub async fn resolve_open_failure(&self, billing_account_id: Uuid) -> BillingResult<bool> {
        let Some(mut failure) = self
            .store
            .get_open_payment_failure_for_account(billing_account_id)
            .await?
        else {
            return Ok(false);
        };

        failure.resolved = true;
        failure.next_retry_at = None;
        failure.updated_at = OffsetDateTime::now_utc();
        self.store.update_payment_failure(&failure).await?;

        tracing::info!(
            failure_id = %failure.failure_id,
            billing_id = %billing_account_id,
            "Recovery thread resolved by out-of-band payment"
        );
        Ok(true)
    }

    /// Retry sweep: re-charge every thread whose `next_retry_at` has come
    /// due. Threads are processed independently; an error on one is logged
    /// and counted, never fatal to the sweep.
    pub async fn process_retry_attempts(&self) -> BillingResult<RetrySweepSummary> {
        let now = OffsetDateTime::now_utc();
        let due = self.store.failures_due_for_retry(now).await?;

        let mut summary = RetrySweepSummary {
            processed: due.len(),
            ..RetrySweepSummary::default()
        };
        for failure in due {
            let failure_id = failure.failure_id;
            match self.retry_failure(failure, now).await {
                Ok(RetryOutcome::Recovered) => summary.recovered += 1,
                Ok(RetryOutcome::Rescheduled) => summary.rescheduled += 1,
                Ok(RetryOutcome::Exhausted) => summary.exhausted += 1,
                Ok(RetryOutcome::Abandoned) => {}
                Err(error) => {
                    summary.errors += 1;
                    tracing::error!(
                        failure_id = %failure_id,
                        error = %error,
                        "Retry attempt failed; will retry next sweep"
                    );
                }
            }
        }

        tracing::info!(
            processed = summary.processed,
            recovered = summary.recovered,
            rescheduled = summary.rescheduled,
            exhausted = summary.exhausted,
            errors = summary.errors,
            "Retry sweep complete"
        );
        Ok(summary)
    }

    async fn retry_failure(
        &self,
        mut failure: PaymentFailure,
        now: OffsetDateTime,
    ) -> BillingResult<RetryOutcome> {
        let account = self
            .store
            .get_billing_account(failure.billing_account_id)
            .await?;
        let account = match account {
            Some(account) if account.status != AccountStatus::Canceled => account,
            _ => {
                // The account is gone or canceled; stop charging but keep
                // the thread on the ledger for ops.
                failure.next_retry_at = None;
                failure.updated_at = now;
                self.store.update_payment_failure(&failure).await?;
                tracing::warn!(
                    failure_id = %failure.failure_id,
                    billing_id = %failure.billing_account_id,
                    "Abandoning recovery thread for canceled account"
                );
                return Ok(RetryOutcome::Abandoned);
            }
        };

        let mut transaction = Transaction {
            transaction_id: Uuid::new_v4(),
            billing_account_id: account.billing_id,
            user_id: account.user_id,
            transaction_type: TransactionType::Payment,
            amount_cents: failure.amount_cents,
            currency: failure.currency.clone(),
            status: TransactionStatus::Pending,
            processor_transaction_id: None,
            fee_cents: 0,
            net_cents: failure.amount_cents,
            description: format!(
                "Recovery attempt {} for plan {}",
                failure.attempt_number + 1,
                account.plan_id
            ),
            created_at: now,
            updated_at: now,
        };
        self.store.create_transaction(&transaction).await?;

        let request = ChargeRequest::for_subscription(
            failure.amount_cents,
            &failure.currency,
            &account.payment_method_id,
            "dunning_retry",
            &account.subscription_id,
        );
        // A timeout or API error consumes no attempt: the schedule is left
        // in place and the next sweep picks the thread up again.
        let outcome = call_with_timeout(
            PROCESSOR_CALL_TIMEOUT,
            self.processor.process_payment(&request),
        )
        .await?;

        // The charge executed, so the attempt counts either way.
        failure.attempt_number += 1;
        failure.updated_at = now;

        match outcome {
            ChargeOutcome::Succeeded {
                processor_transaction_id,
                fee_cents,
            } => {
                transaction.status = TransactionStatus::Completed;
                transaction.processor_transaction_id = Some(processor_transaction_id);
                transaction.fee_cents = fee_cents;
                transaction.net_cents = transaction.amount_cents - fee_cents;
                transaction.updated_at = now;
                self.store.update_transaction(&transaction).await?;

                failure.resolved = true;
                failure.next_retry_at = None;
                self.store.update_payment_failure(&failure).await?;

                let expected = account.status;
                let mut recovered = account.clone();
                recovered.status = AccountStatus::Active;
                recovered.next_billing_date =
                    account.next_billing_date + account.billing_cycle.period();
                recovered.payment_history.push(transaction.transaction_id);
                recovered.updated_at = now;
                if !self
                    .store
                    .update_billing_account_if_status(&recovered, expected)
                    .await?
                {
                    return Err(BillingError::ConcurrentModification(format!(
                        "billing account {} changed during recovery",
                        account.billing_id
                    )));
                }

                // Recovery extends the paid-for window; the tier itself is
                // whatever the profile already carries.
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

                self.log_event(
                    BillingEventBuilder::new(account.user_id, BillingEventType::PaymentRecovered)
                        .billing_account(account.billing_id)
                        .data(serde_json::json!({
                            "failureId": failure.failure_id,
                            "transactionId": transaction.transaction_id,
                            "attempt": failure.attempt_number,
                            "amountCents": transaction.amount_cents,
                        })),
                )
                .await;

                tracing::info!(
                    failure_id = %failure.failure_id,
                    billing_id = %account.billing_id,
                    attempt = failure.attempt_number,
                    "Payment recovered"
                );
                Ok(RetryOutcome::Recovered)
            }
            ChargeOutcome::Failed {
                processor_transaction_id,
                code,
                message,
            } => {
                transaction.status = TransactionStatus::Failed;
                transaction.processor_transaction_id = Some(processor_transaction_id);
                transaction.updated_at = now;
                self.store.update_transaction(&transaction).await?;

                failure.reason = FailureReason::from_processor_code(&code);
                failure.message = message;

                match self.config.delay_after_attempt(failure.attempt_number) {
                    Some(delay) => {
                        failure.next_retry_at = Some(now + delay);
                        self.store.update_payment_failure(&failure).await?;
                        tracing::warn!(
                            failure_id = %failure.failure_id,
                            attempt = failure.attempt_number,
                            code = %code,
                            "Retry declined; next attempt scheduled"
                        );
                        Ok(RetryOutcome::Rescheduled)
                    }
                    None => {
                        failure.next_retry_at = None;
                        self.store.update_payment_failure(&failure).await?;

                        self.log_event(
                            BillingEventBuilder::new(
                                account.user_id,
                                BillingEventType::DunningExhausted,
                            )
                            .billing_account(account.billing_id)
                            .data(serde_json::json!({
                                "failureId": failure.failure_id,
                                "attempts": failure.attempt_number,
                                "gracePeriodEnds": failure.grace_period_ends.unix_timestamp(),
                            })),
                        )
                        .await;

                        tracing::warn!(
                            failure_id = %failure.failure_id,
                            billing_id = %account.billing_id,
                            attempts = failure.attempt_number,
                            "Recovery attempts exhausted; awaiting escalation"
                        );
                        Ok(RetryOutcome::Exhausted)
                    }
                }
            }
        }
    }

    /// Open a dispute case against a settled transaction. The case is
    /// progressed externally; this only records it and leaves evidence tags
    /// for ops.
    pub async fn create_dispute_case(
        &self,
        transaction_id: Uuid,
        dispute_type: DisputeType,
        dispute_amount_cents: i64,
        evidence: Vec<String>,
        evidence_due_by: OffsetDateTime,
    ) -> BillingResult<DisputeCase> {
        let transaction = self
            .store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| BillingError::TransactionNotFound(transaction_id.to_string()))?;

        let case = DisputeCase {
            dispute_id: Uuid::new_v4(),
            transaction_id,
            dispute_type,
            dispute_amount_cents,
            currency: transaction.currency.clone(),
            evidence,
            evidence_due_by,
            status: DisputeStatus::NeedsResponse,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.create_dispute_case(&case).await?;

        self.log_event(
            BillingEventBuilder::new(transaction.user_id, BillingEventType::DisputeOpened)
                .billing_account(transaction.billing_account_id)
                .actor_type(ActorType::Processor)
                .data(serde_json::json!({
                    "disputeId": case.dispute_id,
                    "transactionId": transaction_id,
                    "disputeType": dispute_type.as_str(),
                    "amountCents": dispute_amount_cents,
                    "evidenceDueBy": evidence_due_by.unix_timestamp(),
                })),
        )
        .await;

        tracing::warn!(
            dispute_id = %case.dispute_id,
            transaction_id = %transaction_id,
            dispute_type = %dispute_type.as_str(),
            "Dispute case opened"
        );

        Ok(case)
    }

    async fn log_event(&self, builder: BillingEventBuilder) {
        if let Err(error) = self.event_logger.log_event(builder).await {
            tracing::warn!(error = %error, "Failed to record billing audit event");
        }
    }
}
