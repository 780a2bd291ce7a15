#![cfg(unix)]

use std::time::Duration;

use anyhow::Result;
use assert_matches::assert_matches;
use core_test_support::DATASET;
use core_test_support::ECHO_WORKER;
use core_test_support::SILENT_WORKER;
use core_test_support::STUBBORN_WORKER;
use core_test_support::WorkerFixture;
use core_test_support::next_event;
use core_test_support::wait_for;
use kernelhub_core::SessionEventKind;
use kernelhub_core::SessionId;
use kernelhub_core::SessionStatus;
use kernelhub_core::Supervisor;
use kernelhub_core::SupervisorError;
use kernelhub_protocol::StopInfo;
use kernelhub_protocol::StopReason;
use pretty_assertions::assert_eq;

const SIGKILL: i32 = 9;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_and_graceful_stop() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let supervisor = Supervisor::new(fixture.config_for(ECHO_WORKER)?);
    let session_id = SessionId::new("lifecycle");
    let mut events = supervisor.subscribe_session(&session_id);

    let started = supervisor.start(Some(session_id.clone()), DATASET).await?;
    assert_eq!(started, session_id);
    assert_eq!(supervisor.status(&session_id), SessionStatus::Ready);
    let sessions = supervisor.list_sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].dataset, fixture.upload_dir().join(DATASET));
    assert!(sessions[0].pid.is_some());

    wait_for(&mut events, |kind| *kind == SessionEventKind::Ready).await?;

    supervisor.stop(&session_id, false);
    supervisor.stop(&session_id, false);
    let stopped = wait_for(&mut events, |kind| {
        matches!(kind, SessionEventKind::Stopped(_))
    })
    .await?;
    assert_eq!(
        stopped,
        SessionEventKind::Stopped(StopInfo {
            code: Some(0),
            signal: None,
            reason: StopReason::Requested,
        })
    );
    assert_eq!(supervisor.status(&session_id), SessionStatus::Stopped);
    assert!(supervisor.list_sessions().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_dataset_is_rejected() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let supervisor = Supervisor::new(fixture.config_for(ECHO_WORKER)?);

    let result = supervisor.start(None, "../../etc/passwd").await;

    assert_matches!(result, Err(SupervisorError::ResourceNotFound { .. }));
    assert!(supervisor.list_sessions().is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dataset_names_are_sanitized() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    fixture.write_dataset("q3_results__final_.csv", "a\n1\n")?;
    let supervisor = Supervisor::new(fixture.config_for(ECHO_WORKER)?);

    let session_id = supervisor
        .start(None, "reports/q3 results (final).csv")
        .await?;

    let sessions = supervisor.list_sessions();
    assert_eq!(
        sessions[0].dataset,
        fixture.upload_dir().join("q3_results__final_.csv")
    );
    supervisor.stop(&session_id, true);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_worker_times_out() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let mut config = fixture.config_for(SILENT_WORKER)?;
    config.startup_timeout_ms = 200;
    let supervisor = Supervisor::new(config);
    let session_id = SessionId::new("silent");
    let mut events = supervisor.subscribe_session(&session_id);

    let result = supervisor.start(Some(session_id.clone()), DATASET).await;

    assert_matches!(
        result,
        Err(SupervisorError::StartupTimeout { timeout, .. }) if timeout == Duration::from_millis(200)
    );
    assert_eq!(supervisor.status(&session_id), SessionStatus::Stopped);
    assert_matches!(next_event(&mut events).await?, SessionEventKind::Error(_));
    assert_matches!(
        next_event(&mut events).await?,
        SessionEventKind::Stopped(StopInfo {
            reason: StopReason::StartupTimeout,
            ..
        })
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stubborn_worker_is_killed_after_grace() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let supervisor = Supervisor::new(fixture.config_for(STUBBORN_WORKER)?);
    let session_id = supervisor.start(None, DATASET).await?;
    let mut events = supervisor.subscribe_session(&session_id);

    supervisor.stop(&session_id, false);
    assert_eq!(supervisor.status(&session_id), SessionStatus::Stopping);

    let stopped = wait_for(&mut events, |kind| {
        matches!(kind, SessionEventKind::Stopped(_))
    })
    .await?;
    assert_eq!(
        stopped,
        SessionEventKind::Stopped(StopInfo {
            code: None,
            signal: Some(SIGKILL),
            reason: StopReason::Requested,
        })
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_stops_every_session() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let supervisor = Supervisor::new(fixture.config_for(ECHO_WORKER)?);
    let first = supervisor.start(None, DATASET).await?;
    let second = supervisor.start(None, DATASET).await?;
    let mut events = supervisor.subscribe();

    supervisor.shutdown();

    let mut stopped = Vec::new();
    while stopped.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("event bus closed"))?;
        if let SessionEventKind::Stopped(info) = event.kind {
            assert_eq!(info.reason, StopReason::SupervisorShutdown);
            stopped.push(event.session_id);
        }
    }
    stopped.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(stopped, expected);
    Ok(())
}
