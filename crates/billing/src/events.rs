//! Billing audit trail.
//!
//! Every lifecycle transition leaves an append-only event row behind.
//! Logging is best-effort: a failed audit write is a `warn`, never a failed
//! business operation.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::BillingStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    SubscriptionCreated,
    PlanChanged,
    SubscriptionCanceled,
    RenewalSucceeded,
    RenewalFailed,
    PaymentRecovered,
    DunningStarted,
    DunningExhausted,
    DisputeOpened,
    RefundIssued,
    WebhookDispatchFailed,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::PlanChanged => "plan_changed",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::RenewalSucceeded => "renewal_succeeded",
            BillingEventType::RenewalFailed => "renewal_failed",
            BillingEventType::PaymentRecovered => "payment_recovered",
            BillingEventType::DunningStarted => "dunning_started",
            BillingEventType::DunningExhausted => "dunning_exhausted",
            BillingEventType::DisputeOpened => "dispute_opened",
            BillingEventType::RefundIssued => "refund_issued",
            BillingEventType::WebhookDispatchFailed => "webhook_dispatch_failed",
        }
    }
}

/// Who triggered the transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
    Processor,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::System => "system",
            ActorType::Processor => "processor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub billing_account_id: Option<Uuid>,
    pub event_type: BillingEventType,
    pub actor_type: ActorType,
    pub data: serde_json::Value,
    /// Originating processor event id, when the transition came off a webhook.
    pub processor_event_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Builder used at every audit call site.
#[derive(Debug)]
pub struct BillingEventBuilder {
    event: BillingEvent,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            event: BillingEvent {
                id: Uuid::new_v4(),
                user_id,
                billing_account_id: None,
                event_type,
                actor_type: ActorType::System,
                data: serde_json::Value::Null,
                processor_event_id: None,
                created_at: OffsetDateTime::now_utc(),
            },
        }
    }

    pub fn billing_account(mut self, billing_account_id: Uuid) -> Self {
        self.event.billing_account_id = Some(billing_account_id);
        self
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event.data = data;
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.event.actor_type = actor_type;
        self
    }

    pub fn processor_event(mut self, event_id: &str) -> Self {
        self.event.processor_event_id = Some(event_id.to_string());
        self
    }

    pub fn build(self) -> BillingEvent {
        self.event
    }
}

/// Store-backed audit writer shared by the lifecycle components.
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn BillingStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<()> {
        self.store.record_billing_event(&builder.build()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_event() {
        let user_id = Uuid::new_v4();
        let account_id = Uuid::new_v4();
        let event = BillingEventBuilder::new(user_id, BillingEventType::RenewalFailed)
            .billing_account(account_id)
            .actor_type(ActorType::Processor)
            .processor_event("evt_123")
            .data(serde_json::json!({ "attempt": 1 }))
            .build();

        assert_eq!(event.user_id, user_id);
        assert_eq!(event.billing_account_id, Some(account_id));
        assert_eq!(event.event_type, BillingEventType::RenewalFailed);
        assert_eq!(event.actor_type, ActorType::Processor);
        assert_eq!(event.processor_event_id.as_deref(), Some("evt_123"));
        assert_eq!(event.data["attempt"], 1);
    }
}
