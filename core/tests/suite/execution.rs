#![cfg(unix)]

use anyhow::Result;
use assert_matches::assert_matches;
use core_test_support::CRASHING_WORKER;
use core_test_support::DATASET;
use core_test_support::ECHO_WORKER;
use core_test_support::WorkerFixture;
use core_test_support::next_event;
use kernelhub_core::NotReadyReason;
use kernelhub_core::SessionEventKind;
use kernelhub_core::SessionStatus;
use kernelhub_core::Supervisor;
use kernelhub_core::SupervisorError;
use kernelhub_protocol::ErrorDetail;
use kernelhub_protocol::ExecutionOutcome;
use kernelhub_protocol::OutputChunk;
use kernelhub_protocol::StopInfo;
use kernelhub_protocol::StopReason;
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prepare_run_and_complete() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let supervisor = Supervisor::new(fixture.config_for(ECHO_WORKER)?);
    let session_id = supervisor.start(None, DATASET).await?;
    let mut events = supervisor.subscribe_session(&session_id);

    assert_matches!(
        supervisor.run(&session_id),
        Err(SupervisorError::NotReady {
            reason: NotReadyReason::NothingPrepared,
            ..
        })
    );
    supervisor.prepare(&session_id, "df.describe()")?;
    supervisor.run(&session_id)?;
    assert_matches!(
        supervisor.run(&session_id),
        Err(SupervisorError::NotReady {
            reason: NotReadyReason::Status(SessionStatus::Busy),
            ..
        })
    );

    assert_eq!(
        next_event(&mut events).await?,
        SessionEventKind::Output(OutputChunk::Stdout {
            content: format!("dataset={DATASET}"),
        })
    );
    assert_eq!(
        next_event(&mut events).await?,
        SessionEventKind::ExecutionComplete(ExecutionOutcome::success(json!({"ok": true})))
    );
    assert_eq!(supervisor.status(&session_id), SessionStatus::Ready);

    // The session is reusable.
    supervisor.prepare(&session_id, "df.head()")?;
    supervisor.run(&session_id)?;
    assert_matches!(next_event(&mut events).await?, SessionEventKind::Output(_));
    assert_matches!(
        next_event(&mut events).await?,
        SessionEventKind::ExecutionComplete(outcome) if outcome.is_success()
    );

    supervisor.stop(&session_id, true);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_error_is_reported_and_session_survives() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let supervisor = Supervisor::new(fixture.config_for(ECHO_WORKER)?);
    let session_id = supervisor.start(None, DATASET).await?;
    let mut events = supervisor.subscribe_session(&session_id);

    supervisor.prepare(&session_id, "raise ValueError()")?;
    supervisor.run(&session_id)?;

    assert_eq!(
        next_event(&mut events).await?,
        SessionEventKind::Output(OutputChunk::Stderr {
            content: "about to fail".to_string(),
        })
    );
    let detail = ErrorDetail {
        message: "boom".to_string(),
        traceback: Some("Traceback: boom".to_string()),
    };
    assert_eq!(
        next_event(&mut events).await?,
        SessionEventKind::Error(detail.clone())
    );
    assert_eq!(
        next_event(&mut events).await?,
        SessionEventKind::ExecutionComplete(ExecutionOutcome::failure(detail))
    );
    assert_eq!(supervisor.status(&session_id), SessionStatus::Ready);

    supervisor.stop(&session_id, true);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unparsable_output_fails_only_the_execution() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let supervisor = Supervisor::new(fixture.config_for(ECHO_WORKER)?);
    let session_id = supervisor.start(None, DATASET).await?;
    let mut events = supervisor.subscribe_session(&session_id);

    supervisor.prepare(&session_id, "garbage")?;
    supervisor.run(&session_id)?;

    assert_matches!(next_event(&mut events).await?, SessionEventKind::Error(_));
    assert_matches!(
        next_event(&mut events).await?,
        SessionEventKind::ExecutionComplete(outcome) if !outcome.is_success()
    );
    assert_eq!(supervisor.status(&session_id), SessionStatus::Ready);

    supervisor.prepare(&session_id, "1 + 1")?;
    supervisor.run(&session_id)?;
    assert_matches!(next_event(&mut events).await?, SessionEventKind::Output(_));
    assert_matches!(
        next_event(&mut events).await?,
        SessionEventKind::ExecutionComplete(outcome) if outcome.is_success()
    );

    supervisor.stop(&session_id, true);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crash_mid_execution_reports_then_stops() -> Result<()> {
    let fixture = WorkerFixture::new()?;
    let supervisor = Supervisor::new(fixture.config_for(CRASHING_WORKER)?);
    let session_id = supervisor.start(None, DATASET).await?;
    let mut events = supervisor.subscribe_session(&session_id);

    supervisor.prepare(&session_id, "segfault()")?;
    supervisor.run(&session_id)?;

    assert_matches!(next_event(&mut events).await?, SessionEventKind::Error(_));
    assert_matches!(
        next_event(&mut events).await?,
        SessionEventKind::ExecutionComplete(outcome) if !outcome.is_success()
    );
    assert_eq!(
        next_event(&mut events).await?,
        SessionEventKind::Stopped(StopInfo {
            code: Some(3),
            signal: None,
            reason: StopReason::Unexpected,
        })
    );
    assert_eq!(supervisor.status(&session_id), SessionStatus::Stopped);
    Ok(())
}
