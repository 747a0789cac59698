use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::AccessUnit,
    error::{Error, Result},
    format::MediaKind,
    source::{MediaSource, StartParams},
};

/// Receives every buffer the puller forwards, then exactly one
/// `AccessUnit::EndOfStream`.
pub type AccessUnitNotify = Arc<dyn Fn(AccessUnit) + Send + Sync>;

/// Pulls raw buffers from a [`MediaSource`] one at a time on its own task.
///
/// Each pull is tagged with the current generation; `stop()` bumps the
/// generation so a pull scheduled before it is dropped when it runs.
pub struct Puller {
    source: Arc<dyn MediaSource>,
    kind: MediaKind,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<PullerCommand>,
}

impl Puller {
    pub fn new(source: Arc<dyn MediaSource>, notify: AccessUnitNotify) -> Self {
        let kind = source.format().kind();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let state = PullerState::new(Arc::clone(&source), kind, notify, tx.clone());
        let cancel_clone = cancel.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, rx, state).await });
        Self {
            source,
            kind,
            cancel,
            tx,
        }
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut rx: mpsc::UnboundedReceiver<PullerCommand>,
        mut state: PullerState,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = rx.recv() => {
                    if let Err(e) = state.handle(cmd).await {
                        log::error!("puller ({}) command error: {}", state.kind.as_str(), e);
                    }
                },
                else => break,
            }
        }
        log::debug!("puller ({}) loop finished", state.kind.as_str());
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Starts the source and schedules the first pull. Nothing is pulled if
    /// the source fails to start.
    pub async fn start(&self, params: StartParams) -> Result<()> {
        log::debug!("puller ({}) start", self.kind.as_str());
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(PullerCommand::Start { params, result: tx })
            .map_err(|_| Error::Closed("puller"))?;
        rx.await.map_err(|_| Error::Closed("puller"))?
    }

    /// Stops the source from the caller's side, then tells the pull loop to
    /// invalidate outstanding pulls and emit end-of-stream.
    ///
    /// The source is stopped outside the pull loop: a source stuck in
    /// `read()` keeps the loop busy, and only `stop()` can release it.
    pub async fn stop(&self) {
        log::debug!("source ({}) stopping", self.kind.as_str());
        let source = Arc::clone(&self.source);
        if let Err(e) = run_blocking(move || source.stop()).await {
            log::warn!("source ({}) stop failed: {}", self.kind.as_str(), e);
        }
        log::debug!("source ({}) stopped", self.kind.as_str());
        let _ = self.tx.send(PullerCommand::Stop);
    }

    /// Keeps pulling but releases every buffer instead of forwarding it.
    pub fn pause(&self) {
        let _ = self.tx.send(PullerCommand::Pause);
    }

    pub fn resume(&self) {
        let _ = self.tx.send(PullerCommand::Resume);
    }
}

impl Drop for Puller {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum PullerCommand {
    Start {
        params: StartParams,
        result: oneshot::Sender<Result<()>>,
    },
    Stop,
    Pull {
        generation: u64,
    },
    Pause,
    Resume,
}

struct PullerState {
    source: Arc<dyn MediaSource>,
    kind: MediaKind,
    notify: AccessUnitNotify,
    tx: mpsc::UnboundedSender<PullerCommand>,
    generation: u64,
    paused: bool,
    reached_eos: bool,
}

impl PullerState {
    fn new(
        source: Arc<dyn MediaSource>,
        kind: MediaKind,
        notify: AccessUnitNotify,
        tx: mpsc::UnboundedSender<PullerCommand>,
    ) -> Self {
        Self {
            source,
            kind,
            notify,
            tx,
            generation: 0,
            paused: false,
            reached_eos: false,
        }
    }

    async fn handle(&mut self, cmd: PullerCommand) -> Result<()> {
        match cmd {
            PullerCommand::Start { params, result } => {
                self.reached_eos = false;
                let source = Arc::clone(&self.source);
                let status = run_blocking(move || source.start(&params)).await;
                if status.is_ok() {
                    self.schedule_pull();
                }
                result
                    .send(status)
                    .map_err(|_| Error::Closed("puller start caller"))?;
            }
            PullerCommand::Stop => {
                self.generation += 1;
                self.handle_eos();
            }
            PullerCommand::Pull { generation } => {
                if generation != self.generation {
                    return Ok(());
                }
                self.pull().await;
            }
            PullerCommand::Pause => {
                self.paused = true;
            }
            PullerCommand::Resume => {
                self.paused = false;
            }
        }
        Ok(())
    }

    async fn pull(&mut self) {
        let source = Arc::clone(&self.source);
        let result = run_blocking(move || source.read()).await;

        if self.paused {
            match result {
                Ok(buffer) => {
                    buffer.release();
                    self.schedule_pull();
                }
                Err(e) => {
                    // an exhausted source would otherwise be re-read forever
                    log::debug!("puller ({}) paused read ended: {}", self.kind.as_str(), e);
                    self.handle_eos();
                }
            }
            return;
        }

        match result {
            Ok(buffer) => {
                log::trace!("puller ({}) pulled {}", self.kind.as_str(), buffer);
                (self.notify)(AccessUnit::Buffer(buffer));
                self.schedule_pull();
            }
            Err(Error::EndOfStream) => {
                log::debug!("puller ({}) stream ended", self.kind.as_str());
                self.handle_eos();
            }
            Err(e) => {
                log::error!("puller ({}) error reading stream: {}", self.kind.as_str(), e);
                self.handle_eos();
            }
        }
    }

    fn schedule_pull(&self) {
        let _ = self.tx.send(PullerCommand::Pull {
            generation: self.generation,
        });
    }

    fn handle_eos(&mut self) {
        if !self.reached_eos {
            log::debug!("puller ({}) posting EOS", self.kind.as_str());
            self.reached_eos = true;
            (self.notify)(AccessUnit::EndOfStream);
        }
    }
}

/// Runs a blocking source call on tokio's blocking pool.
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Source(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
#[path = "puller_test.rs"]
mod puller_test;
