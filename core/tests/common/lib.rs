//! Shared fixtures for kernelhub integration tests: an upload directory with
//! a dataset in it, and `/bin/sh` workers that speak the worker protocol.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use kernelhub_core::EventSubscription;
use kernelhub_core::SessionEventKind;
use kernelhub_core::SupervisorConfig;
use kernelhub_core::WorkerConfig;
use tempfile::TempDir;

pub const DATASET: &str = "survey.csv";

/// Reports ready, then answers each `execute`:
/// code containing `raise` fails, `garbage` answers with an unparsable line,
/// anything else prints the dataset name and succeeds.
pub const ECHO_WORKER: &str = r#"
dataset="$1"
printf '{"type":"status","status":"ready"}\n'
while IFS= read -r line; do
  case "$line" in
    *'"type":"shutdown"'*)
      printf '{"type":"shutdown_ack"}\n'
      exit 0
      ;;
    *'"type":"execute"'*raise*)
      printf '{"type":"stderr","content":"about to fail"}\n'
      printf '{"type":"error","message":"boom","traceback":"Traceback: boom"}\n'
      ;;
    *'"type":"execute"'*garbage*)
      printf 'this is not json\n'
      ;;
    *'"type":"execute"'*)
      printf '{"type":"stdout","content":"dataset=%s"}\n' "$(basename "$dataset")"
      printf '{"type":"result","output":{"ok":true}}\n'
      ;;
  esac
done
"#;

/// Reports ready and exits with status 3 on the first `execute`.
pub const CRASHING_WORKER: &str = r#"
printf '{"type":"status","status":"ready"}\n'
IFS= read -r line
exit 3
"#;

/// Never reports ready.
pub const SILENT_WORKER: &str = "exec sleep 30\n";

/// Reports ready and ignores every command, including `shutdown`.
pub const STUBBORN_WORKER: &str = r#"
printf '{"type":"status","status":"ready"}\n'
while IFS= read -r line; do
  :
done
exec sleep 30
"#;

pub struct WorkerFixture {
    dir: TempDir,
}

impl WorkerFixture {
    /// Creates an upload directory holding [`DATASET`].
    pub fn new() -> Result<Self> {
        let dir = TempDir::new()?;
        std::fs::create_dir(dir.path().join("uploads"))?;
        let fixture = Self { dir };
        fixture.write_dataset(DATASET, "respondent,score\n1,4\n2,5\n")?;
        Ok(fixture)
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.dir.path().join("uploads")
    }

    pub fn write_dataset(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.upload_dir().join(name);
        std::fs::write(&path, contents)
            .with_context(|| format!("failed to write dataset {}", path.display()))?;
        Ok(path)
    }

    pub fn write_worker(&self, name: &str, script: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        std::fs::write(&path, script)
            .with_context(|| format!("failed to write worker {}", path.display()))?;
        Ok(path)
    }

    /// Config running `script` under `/bin/sh` with short timeouts.
    pub fn config(&self, script: &Path) -> SupervisorConfig {
        SupervisorConfig {
            worker: WorkerConfig {
                program: "/bin/sh".to_string(),
                args: vec![script.display().to_string()],
                ..WorkerConfig::default()
            },
            upload_dir: self.upload_dir(),
            startup_timeout_ms: 2_000,
            shutdown_grace_ms: 300,
            ..SupervisorConfig::default()
        }
    }

    /// Writes `script` and returns a config that runs it.
    pub fn config_for(&self, script: &str) -> Result<SupervisorConfig> {
        let path = self.write_worker("worker.sh", script)?;
        Ok(self.config(&path))
    }
}

/// The next event on `events`, failing after five seconds.
pub async fn next_event(events: &mut EventSubscription) -> Result<SessionEventKind> {
    let event = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .context("timed out waiting for a session event")?
        .context("event bus closed")?;
    Ok(event.kind)
}

/// Skips events until `accept` matches one, returning it.
pub async fn wait_for(
    events: &mut EventSubscription,
    accept: impl Fn(&SessionEventKind) -> bool,
) -> Result<SessionEventKind> {
    loop {
        let kind = next_event(events).await?;
        if accept(&kind) {
            return Ok(kind);
        }
    }
}
