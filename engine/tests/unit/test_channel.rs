//! Local channel tests against a real shell

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use rollout::deploy::channel::{CancelReason, Channel, ChannelOptions};
use rollout::deploy::executor::{ManagerOptions, NewSession, SessionManager};
use rollout::deploy::local::LocalChannel;
use rollout::deploy::matcher::Matcher;
use rollout::deploy::recovery::RecoveryEngine;
use rollout::models::session::{SessionStatus, Target, Transport};
use rollout::models::step::{FailureKind, StepSpec};
use rollout::utils::CooldownOptions;

use crate::support::{store, CountingReporter};

fn channel() -> LocalChannel {
    LocalChannel::new(ChannelOptions {
        kill_grace: Duration::from_millis(300),
        drain_timeout: Duration::from_secs(2),
        ..Default::default()
    })
}

/// Whether `pid` is gone or only a zombie waiting to be reaped
#[cfg(target_os = "linux")]
fn is_dead(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .map(|rest| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => true,
    }
}

#[tokio::test]
async fn test_timeout_kills_process_group() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("child.pid");
    let command = format!(
        "echo started; sleep 60 & echo $! > {}; wait",
        pid_file.display()
    );

    let mut lines = Vec::new();
    let began = Instant::now();
    let outcome = channel()
        .run(
            &command,
            Duration::from_millis(500),
            &CancellationToken::new(),
            &mut lines,
        )
        .await
        .unwrap();

    assert!(began.elapsed() < Duration::from_secs(10));
    assert!(outcome.cancelled);
    assert_eq!(outcome.cancel_reason, Some(CancelReason::Timeout));
    assert_eq!(outcome.exit_code, 124);
    assert_eq!(lines[0].line, "started");

    #[cfg(target_os = "linux")]
    {
        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut dead = false;
        for _ in 0..30 {
            if is_dead(pid) {
                dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(dead, "background child {} survived the timeout", pid);
    }
}

#[tokio::test]
async fn test_cancel_stops_command() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let mut lines = Vec::new();
    let outcome = channel()
        .run("sleep 60", Duration::from_secs(60), &cancel, &mut lines)
        .await
        .unwrap();

    assert_eq!(outcome.cancel_reason, Some(CancelReason::Aborted));
    assert_eq!(outcome.exit_code, 130);
    assert!(!outcome.success());
}

#[tokio::test]
async fn test_session_recovers_on_local_shell() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("fixed");
    let catalogue = format!(
        r#"{{
            "recovery_actions": [
                {{"id": "repair", "commands": ["touch {marker}"]}}
            ],
            "patterns": [
                {{"name": "unmet", "regex": "Unmet dependencies", "category": "dependency-conflict",
                  "severity": "high", "priority": 10, "recovery": "repair"}}
            ]
        }}"#,
        marker = marker.display()
    );
    let matcher = Arc::new(Matcher::from_json(&catalogue).unwrap());

    let state = tempfile::tempdir().unwrap();
    let store = store(state.path());
    let manager = SessionManager::new(
        store.clone(),
        Arc::new(channel()),
        RecoveryEngine::new(matcher, CooldownOptions::none()),
        CountingReporter::new(),
        ManagerOptions {
            reported_by: "test-host".to_string(),
            ..Default::default()
        },
        CancellationToken::new(),
    );

    let install = format!(
        "test -f {} || {{ echo 'E: Unmet dependencies. Try apt --fix-broken install' >&2; exit 100; }}",
        marker.display()
    );
    let snapshot = manager
        .start(NewSession {
            id: Some("local-e2e".to_string()),
            target: Target::parse("localhost").unwrap(),
            transport: Transport::Local,
            patterns_file: None,
            steps: vec![
                StepSpec {
                    name: "install-package".to_string(),
                    commands: vec![install],
                    critical: true,
                    timeout_secs: 30,
                    max_attempts: 3,
                },
                StepSpec {
                    name: "verify".to_string(),
                    commands: vec!["echo ok".to_string()],
                    critical: true,
                    timeout_secs: 30,
                    max_attempts: 1,
                },
            ],
        })
        .await
        .unwrap();

    assert_eq!(snapshot.session.status, SessionStatus::Succeeded);
    assert!(marker.exists());
    let install = &snapshot.steps[0];
    assert_eq!(install.attempt_count, 2);
    assert_eq!(install.recovery_attempts[0].failure, FailureKind::Classified);
    assert_eq!(install.recovery_attempts[0].exit_code, Some(100));
}
