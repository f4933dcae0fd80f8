//! Periodic flush trigger.
//!
//! The timer never touches sensor state itself; each tick enqueues a
//! `Flush` command behind whatever the sequencer already has queued.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::sequencer::EngineHandle;

/// Seconds between automatic flushes.
pub const FLUSH_PERIOD_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerState {
    Running,
    Paused,
    Stopped,
}

/// Control side of a running flush timer. Cloning shares the same timer.
#[derive(Clone)]
pub struct FlushTimer {
    tx: Arc<watch::Sender<TimerState>>,
}

impl FlushTimer {
    /// Start ticking every `period`. The first flush fires one full period
    /// after start.
    pub fn start(engine: EngineHandle, period: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = watch::channel(TimerState::Running);
        let task = tokio::spawn(run(engine, period, rx));
        (Self { tx: Arc::new(tx) }, task)
    }

    pub fn pause(&self) {
        self.set(TimerState::Paused);
    }

    /// Resume after `pause`. The next flush is a full period away.
    pub fn resume(&self) {
        self.set(TimerState::Running);
    }

    /// Stop for good; the task exits.
    pub fn stop(&self) {
        self.set(TimerState::Stopped);
    }

    pub fn state(&self) -> TimerState {
        *self.tx.borrow()
    }

    fn set(&self, next: TimerState) {
        self.tx.send_if_modified(|current| {
            if *current == TimerState::Stopped || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn run(engine: EngineHandle, period: Duration, mut rx: watch::Receiver<TimerState>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(period_secs = period.as_secs(), "flush timer started");

    loop {
        let state = *rx.borrow_and_update();
        match state {
            TimerState::Stopped => break,
            TimerState::Paused => {
                if rx.changed().await.is_err() {
                    break;
                }
                if *rx.borrow() == TimerState::Running {
                    ticker.reset();
                }
            }
            TimerState::Running => {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!("flush timer tick");
                        engine.flush();
                    }
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("flush timer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer::Command;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::advance;

    const PERIOD: Duration = Duration::from_secs(FLUSH_PERIOD_SECS);

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn flushes(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Command>) -> usize {
        let mut n = 0;
        loop {
            match rx.try_recv() {
                Ok(Command::Flush) => n += 1,
                Ok(other) => panic!("unexpected command {other:?}"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return n,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_once_per_period() {
        let (handle, mut rx) = EngineHandle::detached();
        let (_timer, _task) = FlushTimer::start(handle, PERIOD);
        settle().await;
        assert_eq!(flushes(&mut rx), 0);

        advance(PERIOD).await;
        settle().await;
        assert_eq!(flushes(&mut rx), 1);

        for _ in 0..2 {
            advance(PERIOD).await;
            settle().await;
        }
        assert_eq!(flushes(&mut rx), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_timer_does_not_flush() {
        let (handle, mut rx) = EngineHandle::detached();
        let (timer, _task) = FlushTimer::start(handle, PERIOD);
        settle().await;

        timer.pause();
        settle().await;
        advance(PERIOD * 3).await;
        settle().await;
        assert_eq!(flushes(&mut rx), 0);
        assert_eq!(timer.state(), TimerState::Paused);

        timer.resume();
        settle().await;
        advance(PERIOD / 2).await;
        settle().await;
        assert_eq!(flushes(&mut rx), 0, "resume restarts the full period");

        advance(PERIOD / 2).await;
        settle().await;
        assert_eq!(flushes(&mut rx), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_the_task_and_is_final() {
        let (handle, mut rx) = EngineHandle::detached();
        let (timer, task) = FlushTimer::start(handle, PERIOD);
        settle().await;

        timer.stop();
        task.await.unwrap();
        timer.resume();
        assert_eq!(timer.state(), TimerState::Stopped);

        advance(PERIOD * 2).await;
        settle().await;
        assert_eq!(flushes(&mut rx), 0);
    }
}
