use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use kernelhub_protocol::ErrorDetail;
use kernelhub_protocol::ExecutionOutcome;
use kernelhub_protocol::InboundFrame;
use kernelhub_protocol::OutboundFrame;
use kernelhub_protocol::OutputChunk;
use kernelhub_protocol::SessionEventKind;
use kernelhub_protocol::SessionId;
use kernelhub_protocol::SessionStatus;
use kernelhub_protocol::StopInfo;
use kernelhub_protocol::StopReason;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::SessionDescriptor;
use super::record::SessionRecord;
use super::timers::Timer;
use crate::codec;
use crate::codec::DecodedFrame;
use crate::config::SupervisorConfig;
use crate::dataset;
use crate::error::CodecError;
use crate::error::Result;
use crate::error::SupervisorError;
use crate::event_bus::EventBus;
use crate::process::ExitInfo;
use crate::process::ProcessEvent;
use crate::process::WorkerLauncher;

type Sessions = BTreeMap<SessionId, SessionRecord>;

/// Owns every session record. All mutation happens under `sessions`, which
/// is never held across an `.await`; events are published while it is held
/// so each session's events reach the bus in the order they happened.
#[derive(Debug)]
pub(super) struct Registry {
    config: SupervisorConfig,
    launcher: Arc<dyn WorkerLauncher>,
    bus: EventBus,
    sessions: Mutex<Sessions>,
    next_instance: AtomicU64,
    shutdown: CancellationToken,
}

impl Registry {
    pub(super) fn new(config: SupervisorConfig, launcher: Arc<dyn WorkerLauncher>) -> Self {
        let bus = EventBus::new(config.event_capacity);
        Self {
            config,
            launcher,
            bus,
            sessions: Mutex::new(BTreeMap::new()),
            next_instance: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        }
    }

    pub(super) fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub(super) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(super) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) async fn start(
        self: &Arc<Self>,
        session_id: SessionId,
        dataset_ref: &str,
    ) -> Result<SessionId> {
        {
            let sessions = self.lock();
            ensure_vacant(&sessions, &session_id)?;
        }
        let dataset = dataset::resolve(&self.config.upload_dir, dataset_ref).await?;
        let ready_rx = self.spawn_session(&session_id, dataset)?;
        match ready_rx.await {
            Ok(Ok(())) => Ok(session_id),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(SupervisorError::StartupAborted { session_id }),
        }
    }

    fn spawn_session(
        self: &Arc<Self>,
        session_id: &SessionId,
        dataset: PathBuf,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let mut sessions = self.lock();
        // The dataset lookup awaited; someone may have claimed the id since.
        ensure_vacant(&sessions, session_id)?;

        let worker = self
            .launcher
            .launch(&dataset)
            .map_err(|source| SupervisorError::Spawn {
                session_id: session_id.clone(),
                source,
            })?;
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let (ready_tx, ready_rx) = oneshot::channel();
        let mut record = SessionRecord::new(
            session_id.clone(),
            instance,
            dataset,
            worker.handle,
            self.config.max_frame_bytes,
            ready_tx,
        );
        record.timers.arm(
            Timer::Startup,
            self.schedule(
                self.config.startup_timeout(),
                session_id,
                instance,
                Registry::on_startup_deadline,
            ),
        );
        tokio::spawn(pump(
            Arc::downgrade(self),
            session_id.clone(),
            instance,
            worker.events,
        ));
        info!(
            session = %session_id,
            pid = ?record.process.id(),
            dataset = %record.dataset.display(),
            "worker started"
        );
        sessions.insert(session_id.clone(), record);
        Ok(ready_rx)
    }

    pub(super) fn prepare(&self, session_id: &SessionId, code: String) -> Result<()> {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| SupervisorError::not_ready(session_id, SessionStatus::Stopped))?;
        record.prepare(code)?;
        debug!(session = %session_id, "code prepared");
        Ok(())
    }

    pub(super) fn run(self: &Arc<Self>, session_id: &SessionId) -> Result<()> {
        let mut sessions = self.lock();
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| SupervisorError::not_ready(session_id, SessionStatus::Stopped))?;
        let code = record.begin_run(Instant::now())?;
        record.timers.disarm(Timer::Idle);

        let queued = codec::encode(&OutboundFrame::Execute { code })
            .map_err(|err| err.to_string())
            .and_then(|bytes| {
                record
                    .process
                    .write(bytes)
                    .map_err(|err| err.to_string())
            });
        match queued {
            Ok(()) => debug!(session = %session_id, "execute frame queued"),
            Err(reason) => {
                warn!(session = %session_id, "failed to send execute frame: {reason}");
                let detail = ErrorDetail::new(format!("failed to send code to worker: {reason}"));
                self.fail_execution(record, detail);
            }
        }
        Ok(())
    }

    pub(super) fn stop(self: &Arc<Self>, session_id: &SessionId, force: bool, reason: StopReason) {
        let mut sessions = self.lock();
        match sessions.get_mut(session_id) {
            Some(record) => self.stop_record(record, force, reason),
            None => debug!(session = %session_id, "stop ignored; no such session"),
        }
    }

    fn stop_record(self: &Arc<Self>, record: &mut SessionRecord, force: bool, reason: StopReason) {
        let session_id = &record.session_id;
        if record.status() == SessionStatus::Stopping {
            if force {
                info!(session = %session_id, "escalating stop to kill");
                kill(record);
            }
            return;
        }

        info!(session = %session_id, force, ?reason, "stopping session");
        record.begin_stop(reason);
        record.timers.disarm(Timer::Startup);
        record.timers.disarm(Timer::Idle);
        if force {
            kill(record);
            return;
        }

        let written = codec::encode(&OutboundFrame::Shutdown)
            .map_err(|err| err.to_string())
            .and_then(|bytes| {
                record
                    .process
                    .write(bytes)
                    .map_err(|err| err.to_string())
            });
        if let Err(reason) = written {
            warn!(session = %record.session_id, "failed to send shutdown frame: {reason}");
            if let Err(err) = record.process.terminate() {
                warn!(session = %record.session_id, "failed to terminate worker: {err}");
            }
        }
        let handle = self.schedule(
            self.config.shutdown_grace(),
            &record.session_id,
            record.instance,
            Registry::on_grace_elapsed,
        );
        record.timers.arm(Timer::Grace, handle);
    }

    pub(super) fn status(&self, session_id: &SessionId) -> SessionStatus {
        self.lock()
            .get(session_id)
            .map_or(SessionStatus::Stopped, SessionRecord::status)
    }

    pub(super) fn list_sessions(&self) -> Vec<SessionDescriptor> {
        let now = Instant::now();
        self.lock()
            .values()
            .map(|record| SessionDescriptor {
                session_id: record.session_id.clone(),
                status: record.status(),
                dataset: record.dataset.clone(),
                pid: record.process.id(),
                has_pending_code: record.has_pending_code(),
                uptime: now.saturating_duration_since(record.started_at),
                idle_for: record.idle_for(now),
            })
            .collect()
    }

    /// Force-stops every session and stops background sweeps. Records are
    /// removed as their processes report exit.
    pub(super) fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        let mut sessions = self.lock();
        info!(sessions = sessions.len(), "shutting down supervisor");
        for record in sessions.values_mut() {
            self.stop_record(record, true, StopReason::SupervisorShutdown);
        }
    }

    /// Gracefully stops every Ready session idle for longer than the
    /// threshold. Returns how many were stopped.
    pub(super) fn reap_idle(self: &Arc<Self>, now: Instant) -> usize {
        let threshold = self.config.idle_timeout();
        let mut sessions = self.lock();
        let mut reaped = 0;
        for record in sessions.values_mut() {
            if record.status() == SessionStatus::Ready && record.idle_for(now) > threshold {
                self.stop_record(record, false, StopReason::Idle);
                reaped += 1;
            }
        }
        reaped
    }

    fn on_stdout(self: &Arc<Self>, session_id: &SessionId, instance: u64, bytes: &[u8]) {
        let mut sessions = self.lock();
        let Some(record) = live(&mut sessions, session_id, instance) else {
            return;
        };
        record.touch(Instant::now());
        for decoded in record.decoder.push(bytes) {
            match decoded {
                Ok(DecodedFrame::Frame(frame)) => self.handle_frame(record, frame),
                Ok(DecodedFrame::Unrecognized { frame_type }) => {
                    debug!(session = %session_id, frame_type, "ignoring unrecognized frame");
                }
                Err(err) => self.handle_decode_error(record, err),
            }
        }
    }

    fn on_stderr(&self, session_id: &SessionId, instance: u64, bytes: &[u8]) {
        let mut sessions = self.lock();
        let Some(record) = live(&mut sessions, session_id, instance) else {
            return;
        };
        record.touch(Instant::now());
        let text = String::from_utf8_lossy(bytes);
        let content = text.trim();
        if content.is_empty() {
            return;
        }
        self.bus.publish(
            session_id,
            SessionEventKind::Output(OutputChunk::Stderr {
                content: content.to_string(),
            }),
        );
    }

    fn handle_frame(self: &Arc<Self>, record: &mut SessionRecord, frame: InboundFrame) {
        let session_id = record.session_id.clone();
        debug!(session = %session_id, ?frame, "worker frame");
        match frame {
            InboundFrame::Status { status } if status == "ready" => self.handle_ready(record),
            InboundFrame::Status { status } => {
                debug!(session = %session_id, status, "worker status");
            }
            InboundFrame::Result { output } => {
                if self.complete_execution(record) {
                    self.bus.publish(
                        &session_id,
                        SessionEventKind::ExecutionComplete(ExecutionOutcome::success(output)),
                    );
                }
            }
            InboundFrame::Error(detail) => {
                if record.in_flight() {
                    self.bus
                        .publish(&session_id, SessionEventKind::Error(detail.clone()));
                    self.complete_execution(record);
                    self.bus.publish(
                        &session_id,
                        SessionEventKind::ExecutionComplete(ExecutionOutcome::failure(detail)),
                    );
                } else {
                    warn!(
                        session = %session_id,
                        error = %detail.message,
                        "worker error with no execution in flight"
                    );
                }
            }
            InboundFrame::ShutdownAck => debug!(session = %session_id, "worker acknowledged shutdown"),
            output @ (InboundFrame::Stdout { .. }
            | InboundFrame::Stderr { .. }
            | InboundFrame::Image { .. }) => {
                if let Some(chunk) = output.as_output() {
                    self.bus.publish(&session_id, SessionEventKind::Output(chunk));
                }
            }
        }
    }

    fn handle_ready(self: &Arc<Self>, record: &mut SessionRecord) {
        let Some(ready_tx) = record.mark_ready() else {
            debug!(session = %record.session_id, status = %record.status(), "ignoring repeated ready");
            return;
        };
        record.timers.disarm(Timer::Startup);
        self.arm_idle(record, self.config.idle_timeout());
        info!(session = %record.session_id, "session ready");
        self.bus.publish(&record.session_id, SessionEventKind::Ready);
        let _ = ready_tx.send(Ok(()));
    }

    /// Clears the in-flight execution; false (and a warning) if there was none.
    fn complete_execution(self: &Arc<Self>, record: &mut SessionRecord) -> bool {
        if !record.finish_execution() {
            warn!(session = %record.session_id, "terminal frame with no execution in flight");
            return false;
        }
        if record.status() == SessionStatus::Ready {
            record.touch(Instant::now());
            self.arm_idle(record, self.config.idle_timeout());
        }
        true
    }

    /// Reports a failed execution and returns a Busy session to Ready.
    fn fail_execution(self: &Arc<Self>, record: &mut SessionRecord, detail: ErrorDetail) {
        let session_id = record.session_id.clone();
        self.bus
            .publish(&session_id, SessionEventKind::Error(detail.clone()));
        if self.complete_execution(record) {
            self.bus.publish(
                &session_id,
                SessionEventKind::ExecutionComplete(ExecutionOutcome::failure(detail)),
            );
        }
    }

    fn handle_decode_error(self: &Arc<Self>, record: &mut SessionRecord, err: CodecError) {
        warn!(session = %record.session_id, "undecodable worker output: {err}");
        let detail = ErrorDetail::new(format!("failed to parse worker output: {err}"));
        if record.status() == SessionStatus::Busy {
            self.fail_execution(record, detail);
        } else {
            self.bus
                .publish(&record.session_id, SessionEventKind::Error(detail));
        }
    }

    fn on_exit(&self, session_id: &SessionId, instance: u64, exit: ExitInfo) {
        let mut sessions = self.lock();
        let Some(mut record) = remove_live(&mut sessions, session_id, instance) else {
            return;
        };
        record.timers.cancel_all();
        let reason = record.stop_reason().unwrap_or(StopReason::Unexpected);
        let status = record.status();

        if record.in_flight() {
            let detail = ErrorDetail::new(format!(
                "worker exited during execution (code: {:?}, signal: {:?})",
                exit.code, exit.signal
            ));
            self.bus
                .publish(session_id, SessionEventKind::Error(detail.clone()));
            self.bus.publish(
                session_id,
                SessionEventKind::ExecutionComplete(ExecutionOutcome::failure(detail)),
            );
        }
        if let Some(ready_tx) = record.take_ready_tx() {
            let err = match record.stop_reason() {
                Some(_) => SupervisorError::StartupAborted {
                    session_id: session_id.clone(),
                },
                None => SupervisorError::ExitedDuringStartup {
                    session_id: session_id.clone(),
                    code: exit.code,
                    signal: exit.signal,
                },
            };
            let _ = ready_tx.send(Err(err));
        }

        if reason == StopReason::Unexpected {
            warn!(session = %session_id, %status, code = ?exit.code, signal = ?exit.signal, "worker exited unexpectedly");
        } else {
            info!(session = %session_id, ?reason, code = ?exit.code, signal = ?exit.signal, "session stopped");
        }
        self.bus.publish(
            session_id,
            SessionEventKind::Stopped(StopInfo {
                code: exit.code,
                signal: exit.signal,
                reason,
            }),
        );
    }

    fn on_startup_deadline(self: &Arc<Self>, session_id: &SessionId, instance: u64) {
        let mut sessions = self.lock();
        let starting = live(&mut sessions, session_id, instance)
            .is_some_and(|record| record.status() == SessionStatus::Starting);
        if !starting {
            return;
        }
        let Some(mut record) = remove_live(&mut sessions, session_id, instance) else {
            return;
        };
        record.timers.fired(Timer::Startup);
        record.timers.cancel_all();
        let timeout = self.config.startup_timeout();
        warn!(session = %session_id, ?timeout, "worker did not become ready; killing it");
        kill(&record);

        self.bus.publish(
            session_id,
            SessionEventKind::Error(ErrorDetail::new(format!(
                "worker did not report ready within {timeout:?}"
            ))),
        );
        self.bus.publish(
            session_id,
            SessionEventKind::Stopped(StopInfo {
                code: None,
                signal: None,
                reason: StopReason::StartupTimeout,
            }),
        );
        if let Some(ready_tx) = record.take_ready_tx() {
            let _ = ready_tx.send(Err(SupervisorError::StartupTimeout {
                session_id: session_id.clone(),
                timeout,
            }));
        }
    }

    fn on_idle_deadline(self: &Arc<Self>, session_id: &SessionId, instance: u64) {
        let mut sessions = self.lock();
        let Some(record) = live(&mut sessions, session_id, instance) else {
            return;
        };
        record.timers.fired(Timer::Idle);
        if record.status() != SessionStatus::Ready {
            return;
        }
        let threshold = self.config.idle_timeout();
        let idle = record.idle_for(Instant::now());
        if idle >= threshold {
            self.stop_record(record, false, StopReason::Idle);
        } else {
            self.arm_idle(record, threshold - idle);
        }
    }

    fn on_grace_elapsed(self: &Arc<Self>, session_id: &SessionId, instance: u64) {
        let mut sessions = self.lock();
        let Some(record) = live(&mut sessions, session_id, instance) else {
            return;
        };
        record.timers.fired(Timer::Grace);
        if record.status() == SessionStatus::Stopping {
            warn!(session = %session_id, "worker ignored shutdown; killing it");
            kill(record);
        }
    }

    fn arm_idle(self: &Arc<Self>, record: &mut SessionRecord, delay: Duration) {
        let handle = self.schedule(
            delay,
            &record.session_id,
            record.instance,
            Registry::on_idle_deadline,
        );
        record.timers.arm(Timer::Idle, handle);
    }

    /// Runs `on_fire` after `delay` unless aborted first. The task only holds
    /// a weak reference, so pending deadlines never keep the registry alive.
    fn schedule(
        self: &Arc<Self>,
        delay: Duration,
        session_id: &SessionId,
        instance: u64,
        on_fire: fn(&Arc<Registry>, &SessionId, u64),
    ) -> AbortHandle {
        let registry = Arc::downgrade(self);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                on_fire(&registry, &session_id, instance);
            }
        })
        .abort_handle()
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drains one worker's notifications in order until it exits.
async fn pump(
    registry: Weak<Registry>,
    session_id: SessionId,
    instance: u64,
    mut events: mpsc::Receiver<ProcessEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(registry) = registry.upgrade() else {
            return;
        };
        match event {
            ProcessEvent::Stdout(bytes) => registry.on_stdout(&session_id, instance, &bytes),
            ProcessEvent::Stderr(bytes) => registry.on_stderr(&session_id, instance, &bytes),
            ProcessEvent::Exited(exit) => {
                registry.on_exit(&session_id, instance, exit);
                return;
            }
        }
    }
    // The launcher dropped its side without reporting an exit.
    if let Some(registry) = registry.upgrade() {
        registry.on_exit(&session_id, instance, ExitInfo::unknown());
    }
}

fn ensure_vacant(sessions: &Sessions, session_id: &SessionId) -> Result<()> {
    match sessions.get(session_id) {
        Some(record) => Err(SupervisorError::AlreadyActive {
            session_id: session_id.clone(),
            status: record.status(),
        }),
        None => Ok(()),
    }
}

fn live<'a>(
    sessions: &'a mut Sessions,
    session_id: &SessionId,
    instance: u64,
) -> Option<&'a mut SessionRecord> {
    sessions
        .get_mut(session_id)
        .filter(|record| record.instance == instance)
}

fn remove_live(
    sessions: &mut Sessions,
    session_id: &SessionId,
    instance: u64,
) -> Option<SessionRecord> {
    if sessions
        .get(session_id)
        .is_some_and(|record| record.instance == instance)
    {
        sessions.remove(session_id)
    } else {
        None
    }
}

fn kill(record: &SessionRecord) {
    if let Err(err) = record.process.kill() {
        warn!(session = %record.session_id, "failed to kill worker: {err}");
    }
}
