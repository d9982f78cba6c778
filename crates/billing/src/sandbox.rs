//! Sandbox payment provider.
//!
//! A fully local [`PaymentProcessor`] implementation: charges settle in
//! process, webhooks are signed with the same `t=<unix>,v1=<hex hmac>`
//! scheme real providers use. It backs local development (no gateway
//! credentials) and the behavioral test suite, where per-payment-method
//! scripting simulates declines, API errors, and slow calls.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::model::{DisputeType, ProcessorType};
use crate::processor::{
    ChargeOutcome, ChargeRequest, CustomerHandle, NewSubscription, PaymentMethodDetails,
    PaymentMethodHandle, PaymentProcessor, ProcessorError, ProcessorEvent, ProcessorSubscription,
    ProcessorSubscriptionStatus, SubscriptionPatch, WebhookAction,
};

type HmacSha256 = Hmac<Sha256>;

/// Reject webhook timestamps further than this from now (seconds).
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Sandbox processing fee: 2.9% + 30¢, the usual card-network shape.
fn sandbox_fee_cents(amount_cents: i64) -> i64 {
    amount_cents * 29 / 1000 + 30
}

/// Scripted behavior for charges against one payment method.
#[derive(Debug, Clone)]
enum ChargeScript {
    Decline { code: String, message: String },
    Error(ProcessorError),
}

/// Call record kept for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxCall {
    CreateCustomer {
        email: String,
    },
    CreatePaymentMethod {
        customer_id: String,
    },
    CreateSubscription {
        customer_id: String,
        price_ref: String,
    },
    UpdateSubscription {
        subscription_id: String,
        price_ref: Option<String>,
        cancel_at_period_end: Option<bool>,
    },
    CancelSubscription {
        subscription_id: String,
    },
    ProcessPayment {
        payment_method_id: String,
        amount_cents: i64,
    },
    ProcessRefund {
        processor_transaction_id: String,
        amount_cents: i64,
    },
}

#[derive(Default)]
struct SandboxState {
    seq: u64,
    charge_scripts: HashMap<String, ChargeScript>,
    next_subscription_error: Option<ProcessorError>,
    call_delay: Option<Duration>,
    calls: Vec<SandboxCall>,
}

impl SandboxState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.seq += 1;
        format!("{}_sandbox_{}", prefix, self.seq)
    }
}

pub struct SandboxProcessor {
    webhook_secret: String,
    state: Mutex<SandboxState>,
}

impl SandboxProcessor {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            state: Mutex::new(SandboxState::default()),
        }
    }

    /// Every future charge against `payment_method_id` is declined.
    pub fn decline_payments_for(&self, payment_method_id: &str, code: &str, message: &str) {
        self.state().charge_scripts.insert(
            payment_method_id.to_string(),
            ChargeScript::Decline {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Every future charge against `payment_method_id` errors out.
    pub fn error_payments_for(&self, payment_method_id: &str, error: ProcessorError) {
        self.state()
            .charge_scripts
            .insert(payment_method_id.to_string(), ChargeScript::Error(error));
    }

    /// Clear a charge script, restoring default success behavior.
    pub fn restore_payments_for(&self, payment_method_id: &str) {
        self.state().charge_scripts.remove(payment_method_id);
    }

    /// The next `create_subscription` call fails with `error` (one-shot).
    pub fn fail_next_subscription_create(&self, error: ProcessorError) {
        self.state().next_subscription_error = Some(error);
    }

    /// Every call sleeps this long first; pair with a short timeout bound
    /// to exercise the timeout-is-failure path.
    pub fn set_call_delay(&self, delay: Duration) {
        self.state().call_delay = Some(delay);
    }

    pub fn recorded_calls(&self) -> Vec<SandboxCall> {
        self.state().calls.clone()
    }

    /// Signature header for `payload` as the sandbox provider would send it.
    pub fn sign_payload(&self, payload: &[u8], timestamp: i64) -> Result<String, ProcessorError> {
        let mut mac = self.mac()?;
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("t={timestamp},v1={signature}"))
    }

    /// Build a signed webhook delivery: `(payload, signature header)`.
    pub fn signed_event(
        &self,
        event_id: &str,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<(Vec<u8>, String), ProcessorError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let payload = serde_json::json!({
            "id": event_id,
            "type": event_type,
            "created": now,
            "data": data,
        });
        let body = serde_json::to_vec(&payload)
            .map_err(|e| ProcessorError::Api(format!("event serialization failed: {e}")))?;
        let signature = self.sign_payload(&body, now)?;
        Ok((body, signature))
    }

    fn mac(&self) -> Result<HmacSha256, ProcessorError> {
        HmacSha256::new_from_slice(self.webhook_secret.as_bytes())
            .map_err(|_| ProcessorError::Api("invalid webhook secret".to_string()))
    }

    fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<(), ProcessorError> {
        // Header shape: t=<unix seconds>,v1=<hex hmac>
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;
        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }
        let timestamp = timestamp.ok_or(ProcessorError::InvalidSignature)?;
        let v1_signature = v1_signature.ok_or(ProcessorError::InvalidSignature)?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp,
                drift = (now - timestamp).abs(),
                "Webhook timestamp outside tolerance"
            );
            return Err(ProcessorError::InvalidSignature);
        }

        let mut mac = self.mac()?;
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        let computed = hex::encode(mac.finalize().into_bytes());
        if computed != v1_signature {
            return Err(ProcessorError::InvalidSignature);
        }
        Ok(())
    }

    fn state(&self) -> MutexGuard<'_, SandboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn apply_delay(&self) {
        let delay = self.state().call_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl PaymentProcessor for SandboxProcessor {
    fn processor_type(&self) -> ProcessorType {
        ProcessorType::Sandbox
    }

    async fn create_customer(
        &self,
        email: &str,
        _name: &str,
    ) -> Result<CustomerHandle, ProcessorError> {
        self.apply_delay().await;
        let mut state = self.state();
        state.calls.push(SandboxCall::CreateCustomer {
            email: email.to_string(),
        });
        Ok(CustomerHandle {
            customer_id: state.next_id("cus"),
        })
    }

    async fn create_payment_method(
        &self,
        customer_id: &str,
        _details: &PaymentMethodDetails,
    ) -> Result<PaymentMethodHandle, ProcessorError> {
        self.apply_delay().await;
        let mut state = self.state();
        state.calls.push(SandboxCall::CreatePaymentMethod {
            customer_id: customer_id.to_string(),
        });
        Ok(PaymentMethodHandle {
            payment_method_id: state.next_id("pm"),
        })
    }

    async fn create_subscription(
        &self,
        request: &NewSubscription,
    ) -> Result<ProcessorSubscription, ProcessorError> {
        self.apply_delay().await;
        let mut state = self.state();
        state.calls.push(SandboxCall::CreateSubscription {
            customer_id: request.customer_id.clone(),
            price_ref: request.price_ref.clone(),
        });
        if let Some(error) = state.next_subscription_error.take() {
            return Err(error);
        }
        let subscription_id = state.next_id("sub");
        let (status, trial_end) = match request.trial_days {
            Some(days) if days > 0 => (
                ProcessorSubscriptionStatus::Trialing,
                Some(OffsetDateTime::now_utc() + time::Duration::days(i64::from(days))),
            ),
            _ => (ProcessorSubscriptionStatus::Active, None),
        };
        Ok(ProcessorSubscription {
            subscription_id,
            status,
            trial_end,
        })
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        patch: &SubscriptionPatch,
    ) -> Result<(), ProcessorError> {
        self.apply_delay().await;
        self.state().calls.push(SandboxCall::UpdateSubscription {
            subscription_id: subscription_id.to_string(),
            price_ref: patch.price_ref.clone(),
            cancel_at_period_end: patch.cancel_at_period_end,
        });
        Ok(())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<(), ProcessorError> {
        self.apply_delay().await;
        self.state().calls.push(SandboxCall::CancelSubscription {
            subscription_id: subscription_id.to_string(),
        });
        Ok(())
    }

    async fn process_payment(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeOutcome, ProcessorError> {
        self.apply_delay().await;
        let mut state = self.state();
        state.calls.push(SandboxCall::ProcessPayment {
            payment_method_id: request.payment_method_id.clone(),
            amount_cents: request.amount_cents,
        });
        let script = state.charge_scripts.get(&request.payment_method_id).cloned();
        match script {
            Some(ChargeScript::Error(error)) => Err(error),
            Some(ChargeScript::Decline { code, message }) => Ok(ChargeOutcome::Failed {
                processor_transaction_id: state.next_id("ch"),
                code,
                message,
            }),
            None => Ok(ChargeOutcome::Succeeded {
                processor_transaction_id: state.next_id("ch"),
                fee_cents: sandbox_fee_cents(request.amount_cents),
            }),
        }
    }

    async fn process_refund(
        &self,
        processor_transaction_id: &str,
        amount_cents: i64,
        _reason: &str,
    ) -> Result<(), ProcessorError> {
        self.apply_delay().await;
        self.state().calls.push(SandboxCall::ProcessRefund {
            processor_transaction_id: processor_transaction_id.to_string(),
            amount_cents,
        });
        Ok(())
    }

    async fn construct_webhook_event(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<ProcessorEvent, ProcessorError> {
        self.verify_signature(payload, signature)?;

        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| ProcessorError::MalformedEvent(e.to_string()))?;
        let event_id = value["id"]
            .as_str()
            .ok_or_else(|| ProcessorError::MalformedEvent("missing event id".to_string()))?
            .to_string();
        let event_type = value["type"]
            .as_str()
            .ok_or_else(|| ProcessorError::MalformedEvent("missing event type".to_string()))?
            .to_string();
        let created_at = value["created"]
            .as_i64()
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);

        Ok(ProcessorEvent {
            event_id,
            event_type,
            data: value["data"].clone(),
            created_at,
        })
    }

    fn interpret_event(&self, event: &ProcessorEvent) -> WebhookAction {
        let transaction_id = event.data["transactionId"].as_str();
        match (event.event_type.as_str(), transaction_id) {
            ("payment_intent.succeeded", Some(id)) => WebhookAction::PaymentSucceeded {
                processor_transaction_id: id.to_string(),
            },
            ("payment_intent.payment_failed", Some(id)) => WebhookAction::PaymentFailed {
                processor_transaction_id: id.to_string(),
                code: event.data["failureCode"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                message: event.data["failureMessage"]
                    .as_str()
                    .unwrap_or("Payment failed")
                    .to_string(),
            },
            ("charge.dispute.created", Some(id)) => WebhookAction::DisputeOpened {
                processor_transaction_id: id.to_string(),
                dispute_type: event.data["disputeType"]
                    .as_str()
                    .and_then(DisputeType::from_str)
                    .unwrap_or(DisputeType::Chargeback),
                amount_cents: event.data["amountCents"].as_i64().unwrap_or(0),
                evidence_due_by: event.data["evidenceDueBy"]
                    .as_i64()
                    .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            },
            // Recognized types missing their transaction reference fall
            // through as unhandled rather than guessing.
            (event_type, _) => WebhookAction::Unhandled {
                event_type: event_type.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signed_events_verify_and_parse() {
        let sandbox = SandboxProcessor::new("whsec_sandbox_test");
        let (payload, signature) = sandbox
            .signed_event(
                "evt_1",
                "payment_intent.succeeded",
                serde_json::json!({ "transactionId": "ch_sandbox_9" }),
            )
            .unwrap();

        let event = sandbox
            .construct_webhook_event(&payload, &signature)
            .await
            .unwrap();
        assert_eq!(event.event_id, "evt_1");
        assert_eq!(
            sandbox.interpret_event(&event),
            WebhookAction::PaymentSucceeded {
                processor_transaction_id: "ch_sandbox_9".to_string()
            }
        );
    }

    #[tokio::test]
    async fn tampered_payload_is_rejected() {
        let sandbox = SandboxProcessor::new("whsec_sandbox_test");
        let (mut payload, signature) = sandbox
            .signed_event("evt_2", "payment_intent.succeeded", serde_json::json!({}))
            .unwrap();
        payload[0] ^= 0x01;

        let err = sandbox
            .construct_webhook_event(&payload, &signature)
            .await
            .unwrap_err();
        assert_eq!(err, ProcessorError::InvalidSignature);
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let signer = SandboxProcessor::new("whsec_a");
        let verifier = SandboxProcessor::new("whsec_b");
        let (payload, signature) = signer
            .signed_event("evt_3", "payment_intent.succeeded", serde_json::json!({}))
            .unwrap();

        let err = verifier
            .construct_webhook_event(&payload, &signature)
            .await
            .unwrap_err();
        assert_eq!(err, ProcessorError::InvalidSignature);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let sandbox = SandboxProcessor::new("whsec_sandbox_test");
        let payload = b"{\"id\":\"evt_4\",\"type\":\"x\",\"data\":{}}";
        let stale = OffsetDateTime::now_utc().unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 60;
        let signature = sandbox.sign_payload(payload, stale).unwrap();

        let err = sandbox
            .construct_webhook_event(payload, &signature)
            .await
            .unwrap_err();
        assert_eq!(err, ProcessorError::InvalidSignature);
    }

    #[tokio::test]
    async fn charge_scripts_control_outcomes() {
        let sandbox = SandboxProcessor::new("whsec_sandbox_test");
        sandbox.decline_payments_for("pm_bad", "insufficient_funds", "Not enough funds");

        let declined = sandbox
            .process_payment(&ChargeRequest::for_subscription(
                2999,
                "usd",
                "pm_bad",
                "subscription_renewal",
                "sub_1",
            ))
            .await
            .unwrap();
        assert!(matches!(
            declined,
            ChargeOutcome::Failed { ref code, .. } if code == "insufficient_funds"
        ));

        let ok = sandbox
            .process_payment(&ChargeRequest::for_subscription(
                2999,
                "usd",
                "pm_good",
                "subscription_renewal",
                "sub_1",
            ))
            .await
            .unwrap();
        match ok {
            ChargeOutcome::Succeeded { fee_cents, .. } => {
                assert_eq!(fee_cents, sandbox_fee_cents(2999));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispute_events_carry_case_details() {
        let sandbox = SandboxProcessor::new("whsec_sandbox_test");
        let due_by = OffsetDateTime::now_utc().unix_timestamp() + 86_400;
        let (payload, signature) = sandbox
            .signed_event(
                "evt_5",
                "charge.dispute.created",
                serde_json::json!({
                    "transactionId": "ch_7",
                    "disputeType": "fraud",
                    "amountCents": 9999,
                    "evidenceDueBy": due_by,
                }),
            )
            .unwrap();
        let event = sandbox
            .construct_webhook_event(&payload, &signature)
            .await
            .unwrap();

        match sandbox.interpret_event(&event) {
            WebhookAction::DisputeOpened {
                processor_transaction_id,
                dispute_type,
                amount_cents,
                evidence_due_by,
            } => {
                assert_eq!(processor_transaction_id, "ch_7");
                assert_eq!(dispute_type, DisputeType::Fraud);
                assert_eq!(amount_cents, 9999);
                assert!(evidence_due_by.is_some());
            }
            other => panic!("expected dispute action, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_event_types_are_unhandled() {
        let sandbox = SandboxProcessor::new("whsec_sandbox_test");
        let (payload, signature) = sandbox
            .signed_event("evt_6", "customer.updated", serde_json::json!({}))
            .unwrap();
        let event = sandbox
            .construct_webhook_event(&payload, &signature)
            .await
            .unwrap();
        assert_eq!(
            sandbox.interpret_event(&event),
            WebhookAction::Unhandled {
                event_type: "customer.updated".to_string()
            }
        );
    }
}
