use std::collections::BTreeMap;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::Command;
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::ExitInfo;
use super::ProcessEvent;
use super::ProcessHandle;
use super::SpawnedWorker;
use super::WorkerLauncher;
use super::death;
use crate::config::WorkerConfig;
use crate::error::ProcessError;

const READ_CHUNK_SIZE: usize = 8192;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for the output readers after the process exited. A
/// grandchild that inherited the pipes can keep them open indefinitely.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches workers as real OS processes with piped stdio.
#[derive(Debug, Clone)]
pub struct CommandLauncher {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl CommandLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }

    fn command(&self, dataset: &Path) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(dataset)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "linux")]
        {
            let parent_pid = unsafe { libc::getpid() };
            unsafe {
                command.pre_exec(move || {
                    death::set_parent_death(parent_pid);
                    Ok(())
                });
            }
        }
        command
    }
}

impl WorkerLauncher for CommandLauncher {
    fn launch(&self, dataset: &Path) -> Result<SpawnedWorker, ProcessError> {
        let mut child = self
            .command(dataset)
            .spawn()
            .map_err(|source| ProcessError::spawn(&self.program, source))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or(ProcessError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProcessError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProcessError::MissingPipe { stream: "stderr" })?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let kill = Arc::new(Notify::new());

        tokio::spawn(write_stdin(stdin, stdin_rx));
        let readers = [
            tokio::spawn(forward_output(stdout, events_tx.clone(), ProcessEvent::Stdout)),
            tokio::spawn(forward_output(stderr, events_tx.clone(), ProcessEvent::Stderr)),
        ];
        tokio::spawn(wait_for_exit(child, Arc::clone(&kill), readers, events_tx));

        debug!(program = %self.program, ?pid, dataset = %dataset.display(), "worker spawned");
        Ok(SpawnedWorker {
            handle: Box::new(ChildHandle {
                pid,
                stdin: stdin_tx,
                kill,
            }),
            events: events_rx,
        })
    }
}

#[derive(Debug)]
struct ChildHandle {
    pid: Option<u32>,
    stdin: mpsc::UnboundedSender<Vec<u8>>,
    kill: Arc<Notify>,
}

impl ProcessHandle for ChildHandle {
    fn id(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, bytes: Vec<u8>) -> Result<(), ProcessError> {
        self.stdin
            .send(bytes)
            .map_err(|_| ProcessError::StdinClosed)
    }

    fn terminate(&self) -> Result<(), ProcessError> {
        match self.pid {
            Some(pid) => death::send_sigterm(pid).map_err(|source| ProcessError::Signal { source }),
            None => Ok(()),
        }
    }

    fn kill(&self) -> Result<(), ProcessError> {
        self.kill.notify_one();
        Ok(())
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        self.kill.notify_one();
    }
}

async fn write_stdin(mut stdin: ChildStdin, mut frames: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = frames.recv().await {
        if let Err(err) = stdin.write_all(&bytes).await {
            debug!("worker stdin closed: {err}");
            break;
        }
        if let Err(err) = stdin.flush().await {
            debug!("worker stdin flush failed: {err}");
            break;
        }
    }
}

async fn forward_output<R: AsyncRead + Unpin>(
    mut reader: R,
    events: mpsc::Sender<ProcessEvent>,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if events.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!("failed to read worker output: {err}");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    mut child: Child,
    kill: Arc<Notify>,
    readers: [JoinHandle<()>; 2],
    events: mpsc::Sender<ProcessEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        () = kill.notified() => {
            if let Err(err) = child.start_kill() {
                debug!("kill on exited worker: {err}");
            }
            child.wait().await
        }
    };

    for mut reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
            .await
            .is_err()
        {
            warn!("worker output still open after exit; abandoning reader");
            reader.abort();
        }
    }

    let exit = match status {
        Ok(status) => exit_info(status),
        Err(err) => {
            warn!("failed to wait for worker: {err}");
            ExitInfo::unknown()
        }
    };
    let _ = events.send(ProcessEvent::Exited(exit)).await;
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ExitInfo {
        code: status.code(),
        signal,
    }
}
