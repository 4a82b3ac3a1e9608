//! Session execution tests

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rollout::deploy::executor::create_session;
use rollout::models::catalogue::Category;
use rollout::models::report::Stream;
use rollout::models::session::{HaltReason, SessionStatus};
use rollout::models::step::{Disposition, FailureKind, StepStatus};
use rollout::workers::log_writer::read_entries;

use crate::support::{manager, new_session, step, store, CountingReporter, Reply, ScriptedChannel};

const INSTALL: &str = "apt-get install -y app";
const FIX: &str = "apt-get -f install -y";

#[tokio::test]
async fn test_remediation_then_retry_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script(
        INSTALL,
        vec![Reply::output(
            "E: Unmet dependencies. Try 'apt --fix-broken install'",
            100,
        )],
    );
    let reporter = CountingReporter::new();

    let snapshot = manager(&store, channel.clone(), reporter.clone(), CancellationToken::new())
        .start(new_session(
            "scenario-a",
            vec![step("install-package", INSTALL, true, 3)],
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    let install = &snapshot.steps[0];
    assert_eq!(install.status, StepStatus::Succeeded);
    assert_eq!(install.attempt_count, 2);
    assert_eq!(install.recovery_attempts.len(), 1);

    let attempt = &install.recovery_attempts[0];
    assert_eq!(attempt.failure, FailureKind::Classified);
    assert_eq!(attempt.exit_code, Some(100));
    assert_eq!(
        attempt.classification.as_ref().map(|c| c.category),
        Some(Category::DependencyConflict)
    );
    assert!(matches!(
        &attempt.disposition,
        Some(Disposition::RetryWithRemediation(action)) if action.id == "fix-deps"
    ));
    assert!(install.pending_remediation.is_none());

    assert_eq!(channel.calls(), vec![INSTALL, FIX, INSTALL]);
    assert_eq!(reporter.count(), 0);
    assert_eq!(channel.closed(), 1);
}

#[tokio::test]
async fn test_unmatched_failures_halt_critical_step() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script(
        "systemctl start app",
        vec![Reply::fail(1), Reply::fail(1), Reply::fail(1)],
    );
    let reporter = CountingReporter::new();

    let snapshot = manager(&store, channel.clone(), reporter.clone(), CancellationToken::new())
        .start(new_session(
            "scenario-b",
            vec![
                step("start-service", "systemctl start app", true, 3),
                step("smoke-test", "curl -fsS localhost", true, 3),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::FailedHalted);
    assert_eq!(snapshot.session.current_step, 0);
    let halt = snapshot.session.halt.as_ref().unwrap();
    assert_eq!(halt.reason, HaltReason::CriticalStepAborted);
    assert_eq!(halt.step.as_deref(), Some("start-service"));

    let service = &snapshot.steps[0];
    assert_eq!(service.status, StepStatus::Aborted);
    assert_eq!(service.attempt_count, 3);
    assert_eq!(service.recovery_attempts.len(), 3);
    assert!(service
        .recovery_attempts
        .iter()
        .all(|a| a.failure == FailureKind::Unclassified));
    assert_eq!(
        service.recovery_attempts[2].disposition,
        Some(Disposition::Abort)
    );
    assert_eq!(snapshot.steps[1].status, StepStatus::Pending);
    assert_eq!(channel.calls_of("curl -fsS localhost"), 0);

    assert_eq!(reporter.count(), 1);
    let report = reporter.reports.lock().unwrap()[0].clone();
    assert_eq!(report.step, "start-service");
    assert_eq!(report.attempts.len(), 3);
    assert_eq!(report.exit_code, Some(1));
    assert_eq!(
        snapshot.session.escalation.as_ref().unwrap().reference.as_deref(),
        Some("TRK-1")
    );
    assert_eq!(snapshot.session.last_failure, Some(report));
}

#[tokio::test]
async fn test_non_critical_step_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script("rm -rf /tmp/build", vec![Reply::fail(1), Reply::fail(1)]);
    let reporter = CountingReporter::new();

    let snapshot = manager(&store, channel.clone(), reporter.clone(), CancellationToken::new())
        .start(new_session(
            "scenario-d",
            vec![
                step("cleanup-temp-files", "rm -rf /tmp/build", false, 2),
                step("restart", "systemctl restart app", true, 3),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    assert_eq!(snapshot.steps[0].status, StepStatus::Skipped);
    assert_eq!(snapshot.steps[0].attempt_count, 2);
    assert_eq!(
        snapshot.steps[0].recovery_attempts[1].disposition,
        Some(Disposition::Skip)
    );
    assert_eq!(snapshot.steps[1].status, StepStatus::Succeeded);
    assert_eq!(channel.calls_of("systemctl restart app"), 1);
    assert_eq!(reporter.count(), 0);
}

#[tokio::test]
async fn test_match_fails_attempt_despite_zero_exit() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script(
        "install -d /opt/app",
        vec![Reply::output("install: cannot create /opt/app: Permission denied", 0)],
    );

    let snapshot = manager(&store, channel.clone(), CountingReporter::new(), CancellationToken::new())
        .start(new_session(
            "masked-exit",
            vec![step("prepare", "install -d /opt/app", true, 2)],
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    let attempt = &snapshot.steps[0].recovery_attempts[0];
    assert_eq!(attempt.failure, FailureKind::Classified);
    assert_eq!(attempt.exit_code, Some(0));
    assert_eq!(
        attempt.classification.as_ref().map(|c| c.category),
        Some(Category::Permission)
    );
    // inline recovery action from the catalogue
    assert_eq!(
        channel.calls(),
        vec!["install -d /opt/app", "ls -ld /opt/app", "install -d /opt/app"]
    );
}

#[tokio::test]
async fn test_first_matching_line_decides_the_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    // the later line matches a pattern that would win on priority alone
    channel.script(
        INSTALL,
        vec![Reply::lines(
            &[
                "dpkg: error: /var/lib/dpkg/lock: Permission denied",
                "The following packages have unmet dependencies:",
            ],
            100,
        )],
    );

    let snapshot = manager(&store, channel.clone(), CountingReporter::new(), CancellationToken::new())
        .start(new_session(
            "two-matches",
            vec![step("install-package", INSTALL, true, 3)],
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    let attempt = &snapshot.steps[0].recovery_attempts[0];
    assert_eq!(
        attempt.classification.as_ref().map(|c| c.category),
        Some(Category::Permission)
    );
    assert!(attempt.line.as_deref().unwrap().contains("Permission denied"));
    assert_eq!(channel.calls(), vec![INSTALL, "ls -ld /opt/app", INSTALL]);
}

#[tokio::test]
async fn test_oversized_timeout_is_rejected_before_running() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();

    let mut endless = step("wait-forever", "./wait.sh", true, 1);
    endless.timeout_secs = u64::MAX;
    let err = manager(&store, channel.clone(), CountingReporter::new(), CancellationToken::new())
        .start(new_session("endless", vec![endless]))
        .await
        .unwrap_err();

    assert_eq!(err.exit_code(), 2);
    assert!(channel.calls().is_empty());
    assert!(store.load("endless").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stored_timeout_beyond_clock_range_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let mut snapshot = create_session(
        &store,
        new_session("legacy", vec![step("migrate", "./migrate.sh", true, 1)]),
    )
    .await
    .unwrap();
    snapshot.steps[0].timeout_secs = u64::MAX;
    store.save(&mut snapshot).await.unwrap();

    let channel = ScriptedChannel::new();
    let snapshot = manager(&store, channel.clone(), CountingReporter::new(), CancellationToken::new())
        .resume("legacy", None)
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    assert_eq!(snapshot.steps[0].attempt_count, 1);
    assert_eq!(channel.calls(), vec!["./migrate.sh"]);
}

#[tokio::test]
async fn test_failed_remediation_consumes_an_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script(
        INSTALL,
        vec![Reply::output("The following packages have unmet dependencies:", 100)],
    );
    channel.script(FIX, vec![Reply::fail(2)]);

    let snapshot = manager(&store, channel.clone(), CountingReporter::new(), CancellationToken::new())
        .start(new_session(
            "remediation-fails",
            vec![step("install-package", INSTALL, true, 3)],
        ))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    let install = &snapshot.steps[0];
    assert_eq!(install.attempt_count, 3);
    assert_eq!(install.recovery_attempts[1].failure, FailureKind::RemediationFailed);
    assert_eq!(install.recovery_attempts[1].exit_code, Some(2));
    assert_eq!(install.recovery_attempts[1].disposition, Some(Disposition::Retry));
    assert_eq!(channel.calls(), vec![INSTALL, FIX, INSTALL]);
}

#[tokio::test]
async fn test_connection_loss_is_retried_without_classification() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script("uname -a", vec![Reply::ConnectionLost]);

    let snapshot = manager(&store, channel.clone(), CountingReporter::new(), CancellationToken::new())
        .start(new_session("flaky-link", vec![step("probe", "uname -a", true, 3)]))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    let attempt = &snapshot.steps[0].recovery_attempts[0];
    assert_eq!(attempt.failure, FailureKind::Connectivity);
    assert!(attempt.classification.is_none());
    assert!(attempt.detail.as_deref().unwrap().contains("Connection refused"));
    assert_eq!(snapshot.steps[0].attempt_count, 2);
}

#[tokio::test]
async fn test_deadline_expiry_fails_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script("sleep 600", vec![Reply::Hang]);

    let mut slow = step("wait-for-app", "sleep 600", true, 2);
    slow.timeout_secs = 1;
    let snapshot = manager(&store, channel.clone(), CountingReporter::new(), CancellationToken::new())
        .start(new_session("slow-step", vec![slow]))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    let attempt = &snapshot.steps[0].recovery_attempts[0];
    assert_eq!(attempt.failure, FailureKind::Timeout);
    assert_eq!(attempt.exit_code, Some(124));
}

#[tokio::test]
async fn test_cancellation_halts_without_escalation() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script("./migrate.sh", vec![Reply::Hang]);
    let cancel = CancellationToken::new();
    channel.cancel_on("./migrate.sh", cancel.clone());
    let reporter = CountingReporter::new();

    let steps = vec![
        step("fetch", "git pull", true, 3),
        step("migrate", "./migrate.sh", true, 3),
        step("restart", "systemctl restart app", true, 3),
    ];
    let snapshot = manager(&store, channel.clone(), reporter.clone(), cancel)
        .start(new_session("cancelled", steps))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::FailedHalted);
    let halt = snapshot.session.halt.as_ref().unwrap();
    assert_eq!(halt.reason, HaltReason::Cancelled);
    assert_eq!(halt.step.as_deref(), Some("migrate"));
    assert_eq!(snapshot.steps[0].status, StepStatus::Succeeded);

    let migrate = &snapshot.steps[1];
    assert_eq!(migrate.status, StepStatus::Failed);
    assert_eq!(migrate.recovery_attempts[0].failure, FailureKind::Cancelled);
    assert_eq!(migrate.recovery_attempts[0].exit_code, Some(130));
    assert!(migrate.recovery_attempts[0].disposition.is_none());
    assert_eq!(channel.calls_of("systemctl restart app"), 0);
    assert_eq!(reporter.count(), 0);
    assert!(snapshot.session.escalation.is_none());

    // a fresh engine picks the session up where it stopped
    let resumed = manager(&store, channel.clone(), reporter.clone(), CancellationToken::new())
        .resume("cancelled", None)
        .await
        .unwrap();
    assert_eq!(resumed.session.status, SessionStatus::Succeeded);
    assert!(resumed.session.halt.is_none());
    assert_eq!(resumed.steps[1].attempt_count, 2);
    assert_eq!(channel.calls_of("git pull"), 1);
}

#[tokio::test]
async fn test_output_lands_in_execution_log() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script(INSTALL, vec![Reply::output("Setting up app (1.2.3) ...", 0)]);

    manager(&store, channel, CountingReporter::new(), CancellationToken::new())
        .start(new_session(
            "logged",
            vec![step("install-package", INSTALL, true, 1)],
        ))
        .await
        .unwrap();

    let log = store.layout().execution_log_file("logged");
    let entries = read_entries(log.path()).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].step, "install-package");
    assert_eq!(entries[0].attempt, 1);
    assert_eq!(entries[0].stream, Stream::Error);
    assert_eq!(entries[0].line, "Setting up app (1.2.3) ...");
}

#[tokio::test]
async fn test_duplicate_session_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    let manager = manager(&store, channel.clone(), CountingReporter::new(), CancellationToken::new());

    manager
        .start(new_session("dup", vec![step("a", "true", true, 1)]))
        .await
        .unwrap();
    let err = manager
        .start(new_session("dup", vec![step("a", "true", true, 1)]))
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), 2);
    assert_eq!(channel.calls().len(), 1);
}

#[tokio::test]
async fn test_escalation_failure_is_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script("make deploy", vec![Reply::fail(2)]);
    let reporter = CountingReporter::failing();

    let snapshot = manager(&store, channel, reporter.clone(), CancellationToken::new())
        .start(new_session("no-tracker", vec![step("deploy", "make deploy", true, 1)]))
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::FailedHalted);
    assert_eq!(reporter.count(), 1);
    let escalation = snapshot.session.escalation.as_ref().unwrap();
    assert!(escalation.reference.is_none());
    assert!(escalation.error.as_deref().unwrap().contains("tracker unavailable"));

    let stored = store.load("no-tracker").await.unwrap().unwrap();
    assert_eq!(stored.session.escalation, snapshot.session.escalation);
}

#[tokio::test]
async fn test_backoff_wait_is_cancellable() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let channel = ScriptedChannel::new();
    channel.script("deploy.sh", vec![Reply::fail(1)]);
    let cancel = CancellationToken::new();

    let manager = rollout::deploy::executor::SessionManager::new(
        store.clone(),
        channel.clone(),
        rollout::deploy::recovery::RecoveryEngine::new(
            std::sync::Arc::new(
                rollout::deploy::matcher::Matcher::from_json(crate::support::CATALOGUE).unwrap(),
            ),
            rollout::utils::CooldownOptions {
                base_delay: Duration::from_secs(3600),
                max_delay: Duration::from_secs(3600),
                multiplier: 1.0,
            },
        ),
        CountingReporter::new(),
        Default::default(),
        cancel.clone(),
    );

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let snapshot = tokio::time::timeout(
        Duration::from_secs(30),
        manager.start(new_session("backoff", vec![step("deploy", "deploy.sh", true, 3)])),
    )
    .await
    .expect("cancel interrupts the backoff")
    .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::FailedHalted);
    assert_eq!(
        snapshot.session.halt.as_ref().unwrap().reason,
        HaltReason::Cancelled
    );
    assert_eq!(snapshot.steps[0].attempt_count, 1);
    assert_eq!(channel.calls_of("deploy.sh"), 1);
}
