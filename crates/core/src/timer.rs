//! No-input watchdog timer.
//!
//! A one-shot countdown with three explicit states. `Halted` differs from
//! `Stopped`: while halted, `start` is refused until `resume` is called. Speech
//! detection halts the timer so that it cannot be restarted mid-utterance.

use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::debug;

/// Callback invoked with the countdown's epoch when it elapses. It is spawned,
/// not awaited.
pub type TimerCallback = Arc<dyn Fn(u64) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimerState {
    #[default]
    Stopped,
    Running,
    Halted,
}

impl fmt::Display for TimerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerState::Stopped => write!(f, "stopped"),
            TimerState::Running => write!(f, "running"),
            TimerState::Halted => write!(f, "halted"),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: TimerState,
    /// Bumped on every start/stop so a countdown that lost a race with
    /// `stop` or a restart can recognise itself as stale.
    epoch: u64,
}

pub struct NoInputTimer {
    delay: Duration,
    callback: TimerCallback,
    shared: Arc<Mutex<Shared>>,
    countdown: Option<JoinHandle<()>>,
}

impl NoInputTimer {
    pub fn new(delay: Duration, callback: TimerCallback) -> Self {
        Self {
            delay,
            callback,
            shared: Arc::new(Mutex::new(Shared::default())),
            countdown: None,
        }
    }

    pub fn state(&self) -> TimerState {
        self.shared.lock().state
    }

    /// Whether a firing reported with `epoch` is still valid: no stop, halt or
    /// restart has happened since that countdown began.
    ///
    /// Consumers that queue the callback's work should re-check this before
    /// acting on it.
    pub fn is_current(&self, epoch: u64) -> bool {
        let shared = self.shared.lock();
        shared.epoch == epoch && shared.state != TimerState::Halted
    }

    /// Starts (or restarts from zero) the countdown.
    ///
    /// Returns `false` without scheduling anything when the timer is halted.
    pub fn start(&mut self) -> bool {
        self.abort_countdown();

        let epoch = {
            let mut shared = self.shared.lock();
            if shared.state == TimerState::Halted {
                debug!("No-input timer is halted, not starting");
                return false;
            }
            shared.epoch += 1;
            shared.state = TimerState::Running;
            shared.epoch
        };

        let delay = self.delay;
        let shared = self.shared.clone();
        let callback = self.callback.clone();
        self.countdown = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fire = {
                let mut shared = shared.lock();
                if shared.epoch == epoch && shared.state == TimerState::Running {
                    shared.state = TimerState::Stopped;
                    true
                } else {
                    false
                }
            };
            if fire {
                debug!(?delay, "No-input timer elapsed");
                tokio::spawn(callback(epoch));
            }
        }));
        debug!(delay_ms = delay.as_millis() as u64, "No-input timer started");
        true
    }

    /// Cancels a pending countdown. A halted timer stays halted.
    pub fn stop(&mut self) {
        self.abort_countdown();
        let mut shared = self.shared.lock();
        shared.epoch += 1;
        if shared.state == TimerState::Running {
            shared.state = TimerState::Stopped;
        }
    }

    /// Stops the timer and refuses further starts until [`resume`](Self::resume).
    pub fn halt(&mut self) {
        self.stop();
        self.shared.lock().state = TimerState::Halted;
        debug!("No-input timer halted");
    }

    /// Leaves the halted state. Does not restart the countdown.
    pub fn resume(&mut self) {
        self.stop();
        let mut shared = self.shared.lock();
        if shared.state == TimerState::Halted {
            shared.state = TimerState::Stopped;
        }
        debug!("No-input timer resumed");
    }

    fn abort_countdown(&mut self) {
        if let Some(handle) = self.countdown.take() {
            handle.abort();
        }
    }
}

impl Drop for NoInputTimer {
    fn drop(&mut self) {
        self.abort_countdown();
    }
}

impl fmt::Debug for NoInputTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoInputTimer")
            .field("delay", &self.delay)
            .field("state", &self.state())
            .finish()
    }
}
