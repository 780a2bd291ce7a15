use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use kernelhub_core::ExecutionStream;
use kernelhub_core::SessionEventKind;
use kernelhub_core::SessionId;
use kernelhub_core::SessionStatus;
use kernelhub_core::Supervisor;
use kernelhub_core::SupervisorConfig;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing::warn;

/// Extra time granted past the shutdown grace before giving up on a clean stop.
const STOP_MARGIN: Duration = Duration::from_secs(1);

const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Debug, Parser)]
pub struct RunCli {
    /// Dataset file name, resolved against the configured upload directory.
    #[arg(long = "dataset", value_name = "REF")]
    dataset: String,

    #[arg(
        long = "code",
        value_name = "SOURCE",
        conflicts_with = "code_file",
        required_unless_present = "code_file"
    )]
    code: Option<String>,

    #[arg(long = "code-file", value_name = "FILE")]
    code_file: Option<PathBuf>,

    /// TOML supervisor configuration. Defaults apply when omitted.
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(long = "session", value_name = "ID")]
    session: Option<String>,
}

pub async fn run(cli: RunCli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => SupervisorConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SupervisorConfig::default(),
    };
    let code = read_code(&cli)?;

    let supervisor = Supervisor::new(config);
    let session_id = supervisor
        .start(cli.session.map(SessionId::new), &cli.dataset)
        .await
        .context("failed to start session")?;
    info!(session = %session_id, "session ready");

    supervisor
        .prepare(&session_id, code)
        .context("failed to prepare code")?;

    let mut stream = ExecutionStream::open(&supervisor, &session_id);
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            frame = stream.next_frame() => {
                let Some(frame) = frame else {
                    break;
                };
                stdout.write_all(frame.to_string().as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!(session = %session_id, "interrupted; stopping all sessions");
                supervisor.shutdown();
                return Ok(ExitCode::from(INTERRUPTED_EXIT_CODE));
            }
        }
    }

    let succeeded = stream.succeeded();
    stop_session(&supervisor, &session_id).await;
    Ok(if succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn read_code(cli: &RunCli) -> Result<String> {
    match (&cli.code, &cli.code_file) {
        (Some(code), _) => Ok(code.clone()),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read code from {}", path.display())),
        (None, None) => anyhow::bail!("either --code or --code-file is required"),
    }
}

/// Asks the worker to exit and waits for it, force-stopping everything when
/// it does not go away in time.
async fn stop_session(supervisor: &Supervisor, session_id: &SessionId) {
    let mut events = supervisor.subscribe_session(session_id);
    if supervisor.status(session_id) == SessionStatus::Stopped {
        return;
    }
    supervisor.stop(session_id, false);

    let wait = supervisor.config().shutdown_grace() + STOP_MARGIN;
    let stopped = tokio::time::timeout(wait, async {
        while let Some(event) = events.next().await {
            if matches!(event.kind, SessionEventKind::Stopped(_)) {
                return true;
            }
        }
        false
    })
    .await;
    if !matches!(stopped, Ok(true)) {
        warn!(session = %session_id, "session did not stop within {wait:?}; forcing shutdown");
        supervisor.shutdown();
    }
}
