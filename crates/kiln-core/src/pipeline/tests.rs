#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::pipeline::backend::{BackendRegistry, GenerationBackend};
    use crate::pipeline::dispatch::{Dispatcher, DispatcherConfig, KindPolicies, RetryPolicy};
    use crate::pipeline::job::Job;
    use crate::pipeline::ledger::{Ledger, MemoryLedger};
    use crate::pipeline::pricing::PriceTable;
    use crate::pipeline::queue::{JobQueues, TrackingQueue};
    use crate::pipeline::reconcile::Reconciler;
    use crate::pipeline::status::{StatusService, StatusView};
    use crate::pipeline::store::{JobStore, MemoryJobStore};
    use crate::pipeline::submit::SubmissionService;
    use crate::pipeline::types::{
        GenerateError, JobId, JobKind, JobSpec, JobState, PipelineError,
    };

    // ── Fake backends ─────────────────────────────────────────────────────────

    /// Backend that fails a scripted number of times, then succeeds.
    struct ScriptedBackend {
        artifact: String,
        remaining_failures: AtomicU32,
        calls: AtomicU32,
    }

    impl ScriptedBackend {
        fn succeeding(artifact: &str) -> Arc<Self> {
            Self::failing_then(0, artifact)
        }

        fn failing_then(failures: u32, artifact: &str) -> Arc<Self> {
            Arc::new(Self {
                artifact: artifact.to_owned(),
                remaining_failures: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            })
        }

        fn always_failing() -> Arc<Self> {
            Self::failing_then(u32::MAX, "unreachable")
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(&self, _spec: &JobSpec) -> Result<String, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != u32::MAX {
                    self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(GenerateError::Transient("upstream unavailable".to_owned()));
            }
            Ok(self.artifact.clone())
        }
    }

    /// Backend whose refusal is permanent (e.g. a content policy hit).
    struct RejectingBackend {
        calls: AtomicU32,
    }

    impl RejectingBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl GenerationBackend for RejectingBackend {
        async fn generate(&self, _spec: &JobSpec) -> Result<String, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(GenerateError::Rejected("content policy violation".to_owned()))
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Harness {
        store: Arc<MemoryJobStore>,
        ledger: Arc<MemoryLedger>,
        queues: JobQueues,
        tracking: TrackingQueue,
        submission: SubmissionService,
        status: StatusService,
        #[allow(dead_code)]
        dispatcher: Dispatcher,
    }

    /// Millisecond-scale backoff so retry scenarios finish quickly.
    fn fast_policies() -> KindPolicies {
        KindPolicies::uniform(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            generate_timeout: Duration::from_secs(2),
        })
    }

    /// A registry with every kind backed by a stock succeeding fake, with
    /// `kind` overridden by the backend under test.
    fn registry_with(kind: JobKind, backend: Arc<dyn GenerationBackend>) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        for k in [JobKind::Text, JobKind::Image, JobKind::Voice, JobKind::Video] {
            registry.register(k, ScriptedBackend::succeeding("https://cdn.example/unused"));
        }
        registry.register(kind, backend);
        registry
    }

    fn harness(backends: BackendRegistry) -> Harness {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let (queues, receivers) = JobQueues::new(16);
        let tracking = TrackingQueue::new();

        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers_per_kind: 2,
                policies: fast_policies(),
            },
            store.clone(),
            ledger.clone(),
            queues.clone(),
            receivers,
            backends,
            tracking.clone(),
        )
        .expect("dispatcher should start");

        let submission = SubmissionService::new(
            store.clone(),
            ledger.clone(),
            queues.clone(),
            tracking.clone(),
            PriceTable::standard(),
        );
        let status = StatusService::new(store.clone());

        Harness {
            store,
            ledger,
            queues,
            tracking,
            submission,
            status,
            dispatcher,
        }
    }

    /// Poll until the job is terminal AND its reservation is resolved, so
    /// that balance assertions never race the settlement step.
    async fn wait_settled(h: &Harness, job_id: JobId) -> StatusView {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(job)) = h.store.get(job_id).await {
                    if job.is_terminal() && job.settled {
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job should reach a settled terminal state");
        h.status.status(job_id).await.expect("status should be readable")
    }

    // ── Scenarios ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn text_job_succeeds_and_debits_once() {
        let backend = ScriptedBackend::succeeding("https://cdn.example/text/42.txt");
        let h = harness(registry_with(JobKind::Text, backend.clone()));
        h.ledger.credit("ada", 10).await;

        let handle = h
            .submission
            .submit("ada", JobKind::Text, JobSpec::prompt("write a haiku"))
            .await
            .expect("submission should be accepted");
        assert_eq!(handle.status_handle, format!("/jobs/{}/status", handle.job_id));

        let view = wait_settled(&h, handle.job_id).await;
        assert_eq!(view.state, JobState::Succeeded);
        assert_eq!(view.result.as_deref(), Some("https://cdn.example/text/42.txt"));
        assert_eq!(view.attempt, 1);
        assert_eq!(view.progress, 100);
        assert!(view.failure_reason.is_none());

        assert_eq!(backend.calls(), 1);
        assert_eq!(h.ledger.balance("ada").await.unwrap(), 9);

        // The terminal event is published just after the settled flag is
        // written, so give it a moment.
        let event = tokio::time::timeout(
            Duration::from_secs(1),
            h.tracking.subscribe().recv_async(),
        )
        .await
        .expect("terminal event published promptly")
        .expect("tracking stream open");
        assert_eq!(event.job_id, handle.job_id);
        assert_eq!(event.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn video_succeeds_after_transient_failures() {
        let backend = ScriptedBackend::failing_then(2, "https://cdn.example/video/launch.mp4");
        let h = harness(registry_with(JobKind::Video, backend.clone()));
        h.ledger.credit("ada", 100).await;

        let spec = JobSpec::prompt("launch teaser").with_variant("social_media");
        let handle = h
            .submission
            .submit("ada", JobKind::Video, spec)
            .await
            .expect("submission should be accepted");

        let view = wait_settled(&h, handle.job_id).await;
        assert_eq!(view.state, JobState::Succeeded);
        assert_eq!(view.attempt, 3, "two retries plus the final success");
        assert_eq!(backend.calls(), 3);
        // Committed exactly once: the social media tariff, nothing more.
        assert_eq!(h.ledger.balance("ada").await.unwrap(), 80);
    }

    #[tokio::test]
    async fn insufficient_credits_leaves_no_job_behind() {
        let h = harness(registry_with(
            JobKind::Image,
            ScriptedBackend::succeeding("https://cdn.example/img.png"),
        ));
        h.ledger.credit("ada", 3).await;

        let err = h
            .submission
            .submit("ada", JobKind::Image, JobSpec::prompt("a lighthouse"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InsufficientCredits { .. }));

        // No job record, no outstanding reservation.
        assert!(h.store.list_for_owner("ada").await.unwrap().is_empty());
        assert_eq!(h.ledger.balance("ada").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn voice_failure_releases_credits_after_exhausted_retries() {
        let backend = ScriptedBackend::always_failing();
        let h = harness(registry_with(JobKind::Voice, backend.clone()));
        h.ledger.credit("ada", 10).await;

        let handle = h
            .submission
            .submit("ada", JobKind::Voice, JobSpec::prompt("narrate this"))
            .await
            .expect("submission should be accepted");

        let view = wait_settled(&h, handle.job_id).await;
        assert_eq!(view.state, JobState::Failed);
        assert_eq!(view.attempt, 3, "attempts never exceed the budget");
        assert_eq!(backend.calls(), 3);
        let reason = view.failure_reason.expect("failed jobs carry a reason");
        assert!(!reason.is_empty());
        assert!(view.result.is_none());

        // Reserved credits returned in full.
        assert_eq!(h.ledger.balance("ada").await.unwrap(), 10);
    }

    #[tokio::test]
    async fn rejection_fails_without_retry() {
        let backend = RejectingBackend::new();
        let h = harness(registry_with(JobKind::Text, backend.clone()));
        h.ledger.credit("ada", 5).await;

        let handle = h
            .submission
            .submit("ada", JobKind::Text, JobSpec::prompt("something disallowed"))
            .await
            .expect("submission should be accepted");

        let view = wait_settled(&h, handle.job_id).await;
        assert_eq!(view.state, JobState::Failed);
        assert_eq!(view.attempt, 1, "permanent failures are not retried");
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.ledger.balance("ada").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn redelivered_reference_for_terminal_job_is_a_noop() {
        let backend = ScriptedBackend::succeeding("https://cdn.example/text/1.txt");
        let h = harness(registry_with(JobKind::Text, backend.clone()));
        h.ledger.credit("ada", 10).await;

        let handle = h
            .submission
            .submit("ada", JobKind::Text, JobSpec::prompt("hello"))
            .await
            .unwrap();
        let first = wait_settled(&h, handle.job_id).await;

        // Simulate the queue redelivering the same reference after a crash.
        let job = h.store.get(handle.job_id).await.unwrap().unwrap();
        h.queues.push(job.job_ref()).await.expect("push should succeed");
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = h.status.status(handle.job_id).await.unwrap();
        assert_eq!(backend.calls(), 1, "no duplicate backend invocation");
        assert_eq!(second.state, first.state);
        assert_eq!(second.result, first.result);
        assert_eq!(second.attempt, first.attempt);
        assert_eq!(h.ledger.balance("ada").await.unwrap(), 9, "no double billing");
    }

    #[tokio::test]
    async fn status_reads_are_idempotent_and_order_is_per_job() {
        let h = harness(registry_with(
            JobKind::Text,
            ScriptedBackend::succeeding("https://cdn.example/t.txt"),
        ));
        h.ledger.credit("ada", 10).await;

        let first = h
            .submission
            .submit("ada", JobKind::Text, JobSpec::prompt("one"))
            .await
            .unwrap();
        let second = h
            .submission
            .submit("ada", JobKind::Text, JobSpec::prompt("two"))
            .await
            .unwrap();

        wait_settled(&h, first.job_id).await;
        wait_settled(&h, second.job_id).await;

        let a = h.status.status(first.job_id).await.unwrap();
        let b = h.status.status(first.job_id).await.unwrap();
        assert_eq!(a.state, b.state);
        assert_eq!(a.result, b.result);
        assert_eq!(a.attempt, b.attempt);

        let listed = h.status.list_for_owner("ada").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].created_at >= listed[1].created_at, "newest first");
    }

    #[tokio::test]
    async fn unknown_job_id_reports_not_found() {
        let h = harness(registry_with(
            JobKind::Text,
            ScriptedBackend::succeeding("https://cdn.example/t.txt"),
        ));
        let missing = uuid::Uuid::new_v4();
        assert!(matches!(
            h.status.status(missing).await,
            Err(PipelineError::JobNotFound { .. })
        ));
    }

    // ── Crash recovery and reconciliation ─────────────────────────────────────

    #[tokio::test]
    async fn reconciler_commits_after_crash_mid_settlement() {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        ledger.credit("ada", 10).await;

        // Reproduce a worker that crashed between writing Succeeded and
        // calling the ledger: terminal state recorded, reservation intact.
        let reservation_id = ledger.reserve("ada", 5).await.unwrap();
        let job = Job::new(
            JobKind::Image,
            "ada",
            JobSpec::prompt("a lighthouse"),
            5,
            reservation_id,
        );
        store.insert(&job).await.unwrap();
        store.claim(job.id).await.unwrap();
        assert!(store.complete(job.id, "https://cdn.example/img.png").await.unwrap());

        let reconciler =
            Reconciler::new(store.clone(), ledger.clone(), Duration::from_secs(3600));

        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(ledger.balance("ada").await.unwrap(), 5, "committed exactly once");

        // A second pass finds nothing; the credits cannot move again.
        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.resolved, 0);
        assert!(matches!(
            ledger.release(reservation_id).await,
            Err(PipelineError::UnknownReservation { .. })
        ));
        assert_eq!(ledger.balance("ada").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn reconciler_releases_for_crashed_failed_job() {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        ledger.credit("ada", 10).await;

        let reservation_id = ledger.reserve("ada", 2).await.unwrap();
        let job = Job::new(
            JobKind::Voice,
            "ada",
            JobSpec::prompt("narrate"),
            2,
            reservation_id,
        );
        store.insert(&job).await.unwrap();
        store.claim(job.id).await.unwrap();
        assert!(store.fail(job.id, "upstream unavailable").await.unwrap());

        let reconciler =
            Reconciler::new(store.clone(), ledger.clone(), Duration::from_secs(3600));
        let report = reconciler.run_once().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(ledger.balance("ada").await.unwrap(), 10, "released exactly once");
    }

    #[tokio::test]
    async fn startup_recovery_reenqueues_interrupted_jobs() {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        ledger.credit("ada", 10).await;

        let reservation_id = ledger.reserve("ada", 1).await.unwrap();
        let job = Job::new(
            JobKind::Text,
            "ada",
            JobSpec::prompt("interrupted"),
            1,
            reservation_id,
        );
        store.insert(&job).await.unwrap();
        // The previous process died while this job was running.
        store.claim(job.id).await.unwrap();

        let (queues, receivers) = JobQueues::new(4);
        let recovered = Dispatcher::recover(store.as_ref(), &queues).await.unwrap();
        assert_eq!(recovered, 1);

        let delivered = receivers
            .receiver(JobKind::Text)
            .recv_async()
            .await
            .expect("recovered reference is delivered");
        assert_eq!(delivered.job_id, job.id);

        let stored = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(stored.state, JobState::Queued);
        assert_eq!(stored.attempt, 1, "recovery preserves the attempt count");
    }

    #[tokio::test]
    async fn enqueue_failure_rolls_back_reservation() {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let (queues, receivers) = JobQueues::new(4);
        // No consumer side at all: every push fails.
        drop(receivers);

        let tracking = TrackingQueue::new();
        let submission = SubmissionService::new(
            store.clone(),
            ledger.clone(),
            queues,
            tracking.clone(),
            PriceTable::standard(),
        );
        ledger.credit("ada", 10).await;

        let err = submission
            .submit("ada", JobKind::Text, JobSpec::prompt("hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::EnqueueFailed { .. }));

        // The reservation was undone and the stranded record is terminal.
        assert_eq!(ledger.balance("ada").await.unwrap(), 10);
        let jobs = store.list_for_owner("ada").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state, JobState::Failed);
        assert_eq!(jobs[0].failure_reason.as_deref(), Some("enqueue failed"));
        assert!(jobs[0].settled);

        let event = tracking.subscribe().try_recv().expect("rollback is audited");
        assert_eq!(event.state, JobState::Failed);
    }

    #[tokio::test]
    async fn invalid_spec_reserves_nothing() {
        let h = harness(registry_with(
            JobKind::Video,
            ScriptedBackend::succeeding("https://cdn.example/v.mp4"),
        ));
        h.ledger.credit("ada", 100).await;

        let blank = h
            .submission
            .submit("ada", JobKind::Video, JobSpec::prompt("  "))
            .await
            .unwrap_err();
        assert!(matches!(blank, PipelineError::InvalidSpec { .. }));

        let bad_variant = h
            .submission
            .submit(
                "ada",
                JobKind::Video,
                JobSpec::prompt("teaser").with_variant("imax"),
            )
            .await
            .unwrap_err();
        assert!(matches!(bad_variant, PipelineError::InvalidSpec { .. }));

        assert_eq!(h.ledger.balance("ada").await.unwrap(), 100);
        assert!(h.store.list_for_owner("ada").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dispatcher_refuses_incomplete_registry() {
        let store = Arc::new(MemoryJobStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let (queues, receivers) = JobQueues::new(4);

        let mut backends = BackendRegistry::new();
        backends.register(
            JobKind::Text,
            ScriptedBackend::succeeding("https://cdn.example/t.txt"),
        );

        let err = Dispatcher::start(
            DispatcherConfig::default(),
            store,
            ledger,
            queues,
            receivers,
            backends,
            TrackingQueue::new(),
        )
        .err()
        .expect("incomplete registry must fail fast");
        assert!(matches!(err, PipelineError::BackendMissing { .. }));
    }
}
