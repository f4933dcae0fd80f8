//! Single-consumer command queue in front of the engine.
//!
//! Every mutation of sensor state (ingest, flush, reload) is a `Command`
//! executed by one worker task in submission order, so operations never
//! interleave. Submitting is non-blocking and never fails; a command that
//! panics is logged and the worker carries on with the next one.

use std::panic::AssertUnwindSafe;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineSnapshot};
use crate::error::HubError;
use crate::model::RawReading;
use crate::state::SharedState;

#[derive(Debug)]
pub enum Command {
    Ingest {
        serial: String,
        readings: Vec<RawReading>,
        received_at: DateTime<Utc>,
    },
    Flush,
    Reload,
    Snapshot(oneshot::Sender<EngineSnapshot>),
    /// Flush once more, acknowledge, and stop the worker.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    fn submit(&self, cmd: Command) {
        if let Err(e) = self.tx.send(cmd) {
            debug!("sequencer stopped; dropping {:?}", e.0);
        }
    }

    pub fn ingest(&self, serial: impl Into<String>, readings: Vec<RawReading>) {
        self.ingest_at(serial, readings, Utc::now());
    }

    pub fn ingest_at(
        &self,
        serial: impl Into<String>,
        readings: Vec<RawReading>,
        received_at: DateTime<Utc>,
    ) {
        self.submit(Command::Ingest {
            serial: serial.into(),
            readings,
            received_at,
        });
    }

    pub fn flush(&self) {
        self.submit(Command::Flush);
    }

    pub fn reload(&self) {
        self.submit(Command::Reload);
    }

    /// Ask the worker for a view of the engine. Queued behind anything
    /// submitted earlier. `None` once the worker has stopped.
    pub async fn snapshot(&self) -> Option<EngineSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Snapshot(tx));
        rx.await.ok()
    }

    /// Wait until everything queued before this call has run and the
    /// worker has made its final flush. Returns `false` if the worker was
    /// already gone.
    pub async fn shutdown(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Shutdown(tx));
        rx.await.is_ok()
    }

    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

/// Start the worker. It owns `engine` from here on.
pub fn spawn(engine: Engine, shared: SharedState) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(run(engine, shared, rx));
    (EngineHandle { tx }, worker)
}

async fn run(mut engine: Engine, shared: SharedState, mut rx: mpsc::UnboundedReceiver<Command>) {
    info!("sequencer started");
    while let Some(cmd) = rx.recv().await {
        if let Command::Shutdown(done) = cmd {
            isolated(&mut engine, &shared, Command::Flush).await;
            let _ = done.send(());
            break;
        }
        isolated(&mut engine, &shared, cmd).await;
    }
    info!("sequencer stopped");
}

async fn isolated(engine: &mut Engine, shared: &SharedState, cmd: Command) {
    let name = label(&cmd);
    if AssertUnwindSafe(execute(engine, shared, cmd))
        .catch_unwind()
        .await
        .is_err()
    {
        error!(command = name, "command panicked; continuing with next");
        shared
            .write()
            .await
            .record_error(format!("{name} command panicked"));
    }
}

fn label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Ingest { .. } => "ingest",
        Command::Flush => "flush",
        Command::Reload => "reload",
        Command::Snapshot(_) => "snapshot",
        Command::Shutdown(_) => "shutdown",
    }
}

async fn execute(engine: &mut Engine, shared: &SharedState, cmd: Command) {
    match cmd {
        Command::Ingest {
            serial,
            readings,
            received_at,
        } => match engine.ingest(&serial, &readings, received_at).await {
            Ok(outcome) => {
                let mut st = shared.write().await;
                st.record_ingest(outcome.accepted, outcome.dropped);
                if let Some(serial) = &outcome.provisioned {
                    st.record_provision(serial, outcome.sensors_added);
                }
            }
            Err(e @ HubError::ProvisionRejected { .. }) => {
                // Expected until the first baseline sync; the device retries.
                debug!("{e}");
                shared.write().await.record_ingest(0, readings.len());
            }
            Err(e) => {
                warn!(serial = %serial, "ingest failed: {e}");
                let mut st = shared.write().await;
                st.record_ingest(0, readings.len());
                st.record_error(format!("ingest from {serial}: {e}"));
            }
        },
        Command::Flush => match engine.flush().await {
            Ok(outcome) => {
                debug!(aggregated = outcome.aggregated, committed = outcome.committed, "flush");
                shared
                    .write()
                    .await
                    .record_flush(outcome.aggregated, outcome.committed);
            }
            Err(e) => {
                error!("flush failed: {e}");
                shared.write().await.record_error(format!("flush: {e}"));
            }
        },
        Command::Reload => match engine.reload().await {
            Ok(outcome) => {
                shared.write().await.record_reload(format!(
                    "{} device(s), {} new sensor(s), {} history(ies) merged",
                    outcome.devices, outcome.sensors_added, outcome.histories_changed
                ));
            }
            Err(e) => {
                error!("reload failed: {e}");
                shared.write().await.record_error(format!("reload: {e}"));
            }
        },
        Command::Snapshot(reply) => {
            let _ = reply.send(engine.snapshot());
        }
        Command::Shutdown(done) => {
            let _ = done.send(());
        }
    }
}
