use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ticket_triage_core::{
    ClassificationBatch, ClassificationClient, ClassificationError, ClassificationResponse,
};
use tracing::{error, warn};

pub const MAX_RETRIES_LIMIT: u32 = 5;
pub const RETRY_DELAY_LIMIT_MS: u64 = 10_000;

/// Caller-side retry of classification requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one, for transport failures only.
    pub max_retries: u32,
    /// Base delay; attempt `n` waits `n * retry_delay_ms`.
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 0, retry_delay_ms: 500 }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_retries: max_retries.min(MAX_RETRIES_LIMIT),
            retry_delay_ms: retry_delay_ms.min(RETRY_DELAY_LIMIT_MS),
        }
    }

    fn delay_before(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_delay_ms.saturating_mul(u64::from(attempt)))
    }

    /// Call `client` until it succeeds, fails with a non-transient error, or
    /// the retry budget is spent.
    ///
    /// # Errors
    /// Returns the last [`ClassificationError`] observed.
    pub fn classify<C: ClassificationClient + ?Sized>(
        &self,
        client: &C,
        messages: &[String],
    ) -> Result<ClassificationResponse, ClassificationError> {
        let mut attempt = 0;
        loop {
            match client.classify(messages) {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        attempt,
                        max_retries = self.max_retries,
                        error = %err,
                        "retrying classification"
                    );
                    std::thread::sleep(self.delay_before(attempt));
                }
                result => return result,
            }
        }
    }

    /// Send `batch` through [`RetryPolicy::classify`]. A panicking client is
    /// turned into [`ClassificationError::Panicked`] so the batch can still be
    /// completed and the page does not stay busy.
    ///
    /// # Errors
    /// Returns the last [`ClassificationError`] observed.
    pub fn run_batch<C: ClassificationClient + ?Sized>(
        &self,
        client: &C,
        batch: &ClassificationBatch,
    ) -> Result<ClassificationResponse, ClassificationError> {
        let messages = batch.messages();
        panic::catch_unwind(AssertUnwindSafe(|| self.classify(client, &messages))).unwrap_or_else(
            |payload| {
                let reason = panic_reason(payload.as_ref());
                error!(batch_id = %batch.batch_id(), %reason, "classification client panicked");
                Err(ClassificationError::Panicked(reason))
            },
        )
    }
}

fn panic_reason(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|reason| (*reason).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use super::*;
    use ticket_triage_core::{
        ClassificationOutcome, EnginePhase, NoPersistence, PageScope, Prediction, TriageEngine,
        TriageError, Urgency,
    };

    struct FlakyClient {
        script: RefCell<VecDeque<Result<ClassificationResponse, ClassificationError>>>,
        calls: Cell<usize>,
    }

    impl FlakyClient {
        fn new(script: Vec<Result<ClassificationResponse, ClassificationError>>) -> Self {
            Self {
                script: RefCell::new(script.into()),
                calls: Cell::new(0),
            }
        }
    }

    impl ClassificationClient for FlakyClient {
        fn classify(
            &self,
            messages: &[String],
        ) -> Result<ClassificationResponse, ClassificationError> {
            self.calls.set(self.calls.get() + 1);
            self.script.borrow_mut().pop_front().unwrap_or_else(|| {
                Ok(ClassificationResponse::new(vec![Prediction::UNKNOWN; messages.len()]))
            })
        }
    }

    fn high(len: usize) -> ClassificationResponse {
        let prediction = Prediction::from_service(Some("High"), Some(0.9));
        ClassificationResponse::new(vec![prediction; len])
    }

    struct PanickingClient;

    impl ClassificationClient for PanickingClient {
        fn classify(
            &self,
            _messages: &[String],
        ) -> Result<ClassificationResponse, ClassificationError> {
            panic!("model crashed");
        }
    }

    fn classify_engine<C: ClassificationClient + ?Sized>(
        engine: &mut TriageEngine<NoPersistence>,
        client: &C,
        policy: &RetryPolicy,
    ) -> Result<ClassificationOutcome, TriageError> {
        let batch = engine.begin_classification()?;
        let result = policy.run_batch(client, &batch);
        engine.complete_classification(&batch, result)
    }

    fn seeded_engine() -> Result<TriageEngine<NoPersistence>, TriageError> {
        let mut engine = TriageEngine::new(PageScope::Customers, NoPersistence);
        engine.add_ticket("Acme", "vpn down")?;
        engine.add_ticket("Globex", "invoice")?;
        engine.select_all();
        Ok(engine)
    }

    // Test IDs: TRTY-001
    #[test]
    fn transport_failures_are_retried_within_budget() -> Result<(), TriageError> {
        let mut engine = seeded_engine()?;
        let client = FlakyClient::new(vec![
            Err(ClassificationError::Transport("connection reset".to_string())),
            Ok(high(2)),
        ]);

        let outcome = classify_engine(&mut engine, &client, &RetryPolicy::new(2, 0))?;

        assert_eq!(client.calls.get(), 2);
        assert_eq!(outcome.applied, 2);
        assert!(engine.snapshot().iter().all(|record| record.urgency == Urgency::High));
        assert_eq!(engine.phase(), EnginePhase::Idle);
        Ok(())
    }

    // Test IDs: TRTY-002
    #[test]
    fn service_errors_are_not_retried() -> Result<(), TriageError> {
        let mut engine = seeded_engine()?;
        let client = FlakyClient::new(vec![Err(ClassificationError::Service { status: 503 })]);

        let result = classify_engine(&mut engine, &client, &RetryPolicy::new(3, 0));

        assert_eq!(
            result,
            Err(TriageError::Classification(ClassificationError::Service { status: 503 }))
        );
        assert_eq!(client.calls.get(), 1);
        assert!(engine.snapshot().iter().all(|record| record.urgency == Urgency::Unclassified));
        assert!(!engine.is_busy());
        Ok(())
    }

    // Test IDs: TRTY-003
    #[test]
    fn exhausted_budget_returns_last_transport_error() -> Result<(), TriageError> {
        let mut engine = seeded_engine()?;
        let client = FlakyClient::new(vec![
            Err(ClassificationError::Transport("refused".to_string())),
            Err(ClassificationError::Transport("refused again".to_string())),
        ]);

        let result = classify_engine(&mut engine, &client, &RetryPolicy::new(1, 0));

        assert_eq!(
            result,
            Err(TriageError::Classification(ClassificationError::Transport(
                "refused again".to_string()
            )))
        );
        assert_eq!(client.calls.get(), 2);
        assert!(!engine.is_busy());
        Ok(())
    }

    // Test IDs: TRTY-004
    #[test]
    fn busy_engine_rejects_without_calling_client() -> Result<(), TriageError> {
        let mut engine = seeded_engine()?;
        let batch = engine.begin_classification()?;
        let client = FlakyClient::new(vec![Ok(high(2))]);

        assert_eq!(
            classify_engine(&mut engine, &client, &RetryPolicy::default()),
            Err(TriageError::Busy)
        );
        assert_eq!(client.calls.get(), 0);
        assert!(engine.is_busy());

        let outcome = engine.complete_classification(&batch, Ok(high(2)))?;
        assert_eq!(outcome.requested, 2);
        Ok(())
    }

    // Test IDs: TRTY-006
    #[test]
    fn panicking_client_completes_batch_with_failure() -> Result<(), TriageError> {
        let mut engine = seeded_engine()?;

        let result = classify_engine(&mut engine, &PanickingClient, &RetryPolicy::new(2, 0));

        assert_eq!(
            result,
            Err(TriageError::Classification(ClassificationError::Panicked(
                "model crashed".to_string()
            )))
        );
        assert_eq!(engine.phase(), EnginePhase::Idle);
        assert!(engine.snapshot().iter().all(|record| record.urgency == Urgency::Unclassified));

        let client = FlakyClient::new(vec![Ok(high(2))]);
        let outcome = classify_engine(&mut engine, &client, &RetryPolicy::default())?;
        assert_eq!(outcome.applied, 2);
        Ok(())
    }

    // Test IDs: TRTY-005
    #[test]
    fn policy_limits_are_clamped() {
        assert_eq!(RetryPolicy::new(9, 60_000), RetryPolicy::new(5, 10_000));
        assert_eq!(RetryPolicy::new(1, 200).delay_before(2), Duration::from_millis(400));
    }
}
