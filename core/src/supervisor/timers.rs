use tokio::task::AbortHandle;

/// Cancellable per-session deadlines. Each slot holds the abort handle of a
/// sleeping task; replacing or cancelling a slot aborts the old task.
#[derive(Debug, Default)]
pub(super) struct SessionTimers {
    startup: Option<AbortHandle>,
    idle: Option<AbortHandle>,
    grace: Option<AbortHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Timer {
    Startup,
    Idle,
    Grace,
}

impl SessionTimers {
    pub(super) fn arm(&mut self, timer: Timer, handle: AbortHandle) {
        if let Some(previous) = self.slot(timer).replace(handle) {
            previous.abort();
        }
    }

    pub(super) fn disarm(&mut self, timer: Timer) {
        if let Some(handle) = self.slot(timer).take() {
            handle.abort();
        }
    }

    /// Forgets a timer whose task is the one currently running.
    pub(super) fn fired(&mut self, timer: Timer) {
        self.slot(timer).take();
    }

    pub(super) fn cancel_all(&mut self) {
        for timer in [Timer::Startup, Timer::Idle, Timer::Grace] {
            self.disarm(timer);
        }
    }

    fn slot(&mut self, timer: Timer) -> &mut Option<AbortHandle> {
        match timer {
            Timer::Startup => &mut self.startup,
            Timer::Idle => &mut self.idle,
            Timer::Grace => &mut self.grace,
        }
    }
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
