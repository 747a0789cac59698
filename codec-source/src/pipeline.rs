use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::{AccessUnit, BufferFlags, BufferMeta, BufferPool, MediaBuffer},
    config::PipelineConfig,
    encoder::{
        Activity, ActivityNotifier, ConfigureFlags, DequeueOutput, Encoder, EncoderParams,
        InputSurface, OutputSlotInfo, SlotBuffer,
    },
    error::{Error, Result},
    format::{MediaFormat, MediaKind},
    output::OutputQueue,
    puller::{AccessUnitNotify, Puller},
    source::{MediaSource, StartParams},
};

/// Feeds raw buffers from a source (or an input surface) through an encoder
/// and queues the encoded output for a blocking consumer.
///
/// Control calls are messages to the pipeline loop; `read()` is the only
/// call that touches shared state directly.
pub struct Pipeline {
    kind: MediaKind,
    surface: Option<InputSurface>,
    puller: Option<Arc<Puller>>,
    output: Arc<OutputQueue>,
    format_rx: watch::Receiver<MediaFormat>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl Pipeline {
    /// Configures and starts `encoder`, then spawns the pipeline loop.
    ///
    /// Pull mode needs a `source`; surface mode ignores it. On failure the
    /// encoder is released before the error is returned.
    pub fn create(
        config: PipelineConfig,
        mut encoder: Box<dyn Encoder>,
        source: Option<Arc<dyn MediaSource>>,
    ) -> Result<Self> {
        let kind = config.format.kind();
        if !config.surface_input && source.is_none() {
            log::error!("pipeline ({}) has no source to pull from", kind.as_str());
            encoder.release();
            return Err(Error::NotInitialized);
        }

        let ready = match init_encoder(&config, encoder.as_mut()) {
            Ok(ready) => ready,
            Err(e) => {
                log::error!("encoder ({}) init failed: {}", kind.as_str(), e);
                encoder.release();
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (format_tx, format_rx) = watch::channel(ready.output_format);
        let output = Arc::new(OutputQueue::new());

        let puller = match source {
            Some(source) if !config.surface_input => {
                let notify_tx = tx.clone();
                let notify: AccessUnitNotify = Arc::new(move |unit| {
                    let _ = notify_tx.send(PipelineCommand::PullerNotify(unit));
                });
                Some(Arc::new(Puller::new(source, notify)))
            }
            _ => None,
        };

        let state = PipelineState {
            kind,
            surface: ready.surface.is_some(),
            stop_timeout: config.stop_timeout,
            encoder: Some(encoder),
            input_slots: ready.input_slots,
            output_slots: ready.output_slots,
            input_queue: VecDeque::new(),
            avail_inputs: VecDeque::new(),
            decoding_times: VecDeque::new(),
            drift_times: VecDeque::new(),
            first_sample_time_us: None,
            started: false,
            stopping: false,
            eos_reached: false,
            do_more_work_pending: false,
            status: None,
            stop_replies: Vec::new(),
            output: Arc::clone(&output),
            output_pool: BufferPool::new(kind.as_str()),
            format_tx,
            puller: puller.clone(),
            cancel: cancel.clone(),
            tx: tx.clone(),
        };

        let cancel_clone = cancel.clone();
        tokio::spawn(async move { Self::inner_loop(cancel_clone, rx, state).await });
        log::debug!("pipeline ({}) created", kind.as_str());

        Ok(Self {
            kind,
            surface: ready.surface,
            puller,
            output,
            format_rx,
            cancel,
            tx,
        })
    }

    async fn inner_loop(
        cancel: CancellationToken,
        mut rx: mpsc::UnboundedReceiver<PipelineCommand>,
        mut state: PipelineState,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break;
                },
                Some(cmd) = rx.recv() => {
                    if let Err(e) = state.handle(cmd).await {
                        log::error!("pipeline ({}) command error: {}", state.kind.as_str(), e);
                    }
                },
                else => break,
            }
        }
        state.shutdown();
        log::debug!("pipeline ({}) loop finished", state.kind.as_str());
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Starts pulling (or accepting surface frames). Calling it again while
    /// started resumes a paused pipeline.
    pub async fn start(&self, params: StartParams) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(PipelineCommand::Start { params, result: tx })?;
        rx.await.map_err(|_| Error::Closed("pipeline"))?
    }

    /// Requests end-of-stream and waits for it. Safe to call from several
    /// tasks at once; every caller gets the same status.
    pub async fn stop(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(PipelineCommand::Stop { result: tx })?;
        if let Some(puller) = &self.puller {
            log::info!("puller ({}) stopping", self.kind.as_str());
            puller.stop().await;
            log::info!("puller ({}) stopped", self.kind.as_str());
        }
        rx.await.map_err(|_| Error::Closed("pipeline"))?
    }

    pub async fn pause(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(PipelineCommand::Pause { result: tx })?;
        rx.await.map_err(|_| Error::Closed("pipeline"))?
    }

    /// Resumes after `pause()`. In surface mode a positive `skip_before_us`
    /// drops every frame stamped earlier than it.
    pub fn resume(&self, skip_before_us: i64) {
        let _ = self.send(PipelineCommand::Resume { skip_before_us });
    }

    /// Blocks until the next encoded buffer or the terminal status.
    ///
    /// Call from a blocking context (a plain thread or `spawn_blocking`).
    pub fn read(&self) -> Result<MediaBuffer> {
        self.output.read()
    }

    pub fn read_timeout(&self, timeout: Duration) -> Result<Option<MediaBuffer>> {
        self.output.read_timeout(timeout)
    }

    /// Hands a buffer obtained from `read()` back to its allocator.
    pub fn signal_buffer_returned(&self, buffer: MediaBuffer) {
        buffer.release();
    }

    pub fn input_surface(&self) -> Result<InputSurface> {
        self.surface.clone().ok_or(Error::NotSurfaceMode)
    }

    /// The encoder's current output format.
    pub fn format(&self) -> MediaFormat {
        self.format_rx.borrow().clone()
    }

    pub fn pending_output(&self) -> usize {
        self.output.len()
    }

    fn send(&self, cmd: PipelineCommand) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::Closed("pipeline"))
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum PipelineCommand {
    Start {
        params: StartParams,
        result: oneshot::Sender<Result<()>>,
    },
    Stop {
        result: oneshot::Sender<Result<()>>,
    },
    Pause {
        result: oneshot::Sender<Result<()>>,
    },
    Resume {
        skip_before_us: i64,
    },
    PullerNotify(AccessUnit),
    EncoderActivity(Activity),
    StopTimeout,
}

struct ReadyEncoder {
    output_format: MediaFormat,
    surface: Option<InputSurface>,
    input_slots: Vec<SlotBuffer>,
    output_slots: Vec<SlotBuffer>,
}

fn init_encoder(config: &PipelineConfig, encoder: &mut dyn Encoder) -> Result<ReadyEncoder> {
    let kind = config.format.kind();
    if config.surface_input && kind != MediaKind::Video {
        return Err(Error::Unsupported(format!(
            "surface input needs a video format, got {}",
            config.format.mime
        )));
    }

    encoder.configure(&config.encoder_format(), ConfigureFlags::ENCODE)?;
    let output_format = encoder.output_format()?;
    let surface = if config.surface_input {
        Some(encoder.create_input_surface()?)
    } else {
        None
    };

    encoder.start()?;
    let input_slots = if surface.is_some() {
        Vec::new()
    } else {
        encoder.input_slots()?
    };
    let output_slots = encoder.output_slots()?;
    log::debug!(
        "encoder ({}) ready: {} input / {} output slots",
        kind.as_str(),
        input_slots.len(),
        output_slots.len()
    );
    Ok(ReadyEncoder {
        output_format,
        surface,
        input_slots,
        output_slots,
    })
}

struct PipelineState {
    kind: MediaKind,
    surface: bool,
    stop_timeout: Option<Duration>,

    encoder: Option<Box<dyn Encoder>>,
    input_slots: Vec<SlotBuffer>,
    output_slots: Vec<SlotBuffer>,
    input_queue: VecDeque<AccessUnit>,
    avail_inputs: VecDeque<usize>,
    decoding_times: VecDeque<i64>,
    drift_times: VecDeque<i64>,
    first_sample_time_us: Option<i64>,

    started: bool,
    stopping: bool,
    eos_reached: bool,
    do_more_work_pending: bool,
    status: Option<Error>,
    stop_replies: Vec<oneshot::Sender<Result<()>>>,

    output: Arc<OutputQueue>,
    output_pool: Arc<BufferPool>,
    format_tx: watch::Sender<MediaFormat>,
    puller: Option<Arc<Puller>>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl PipelineState {
    async fn handle(&mut self, cmd: PipelineCommand) -> Result<()> {
        match cmd {
            PipelineCommand::Start { params, result } => {
                let status = self.on_start(params).await;
                result
                    .send(status)
                    .map_err(|_| Error::Closed("pipeline start caller"))?;
            }
            PipelineCommand::Stop { result } => self.on_stop(result),
            PipelineCommand::Pause { result } => {
                let status = self.on_pause();
                result
                    .send(status)
                    .map_err(|_| Error::Closed("pipeline pause caller"))?;
            }
            PipelineCommand::Resume { skip_before_us } => self.on_resume(skip_before_us),
            PipelineCommand::PullerNotify(unit) => self.on_puller_notify(unit),
            PipelineCommand::EncoderActivity(activity) => self.on_encoder_activity(activity),
            PipelineCommand::StopTimeout => {
                if self.stopping && !self.eos_reached {
                    log::warn!(
                        "encoder ({}) did not reach EOS in time, forcing it",
                        self.kind.as_str()
                    );
                    self.signal_eos(Error::StopTimeout);
                }
            }
        }
        Ok(())
    }

    async fn on_start(&mut self, params: StartParams) -> Result<()> {
        if self.stopping {
            log::error!("pipeline ({}) start while stopping", self.kind.as_str());
            return Err(Error::AlreadyStopping);
        }
        if self.eos_reached {
            return Err(Error::NotInitialized);
        }

        if self.started {
            log::info!("pipeline ({}) resuming", self.kind.as_str());
            // a repeated start never skips frames
            if self.surface {
                self.resume_surface(0)?;
            } else if let Some(puller) = &self.puller {
                puller.resume();
            }
            return Ok(());
        }

        log::info!("pipeline ({}) starting", self.kind.as_str());
        if self.surface {
            self.resume_surface(params.start_time_us.unwrap_or(0))?;
            self.schedule_do_more_work();
        } else {
            let puller = self.puller.clone().ok_or(Error::NotInitialized)?;
            puller.start(params).await?;
        }
        self.started = true;
        log::info!("pipeline ({}) started", self.kind.as_str());
        Ok(())
    }

    fn on_stop(&mut self, result: oneshot::Sender<Result<()>>) {
        log::info!("encoder ({}) stopping", self.kind.as_str());
        if self.eos_reached {
            log::info!("encoder ({}) already stopped", self.kind.as_str());
            let _ = result.send(Ok(()));
            return;
        }

        self.stop_replies.push(result);
        if self.stopping {
            return;
        }
        self.stopping = true;
        self.arm_stop_timeout();

        // pull mode: the caller stops the puller, whose EOS reaches the
        // encoder through the input queue
        if self.surface {
            let signalled = match self.encoder.as_mut() {
                Some(encoder) => encoder.signal_end_of_input_stream(),
                None => Err(Error::NotInitialized),
            };
            match signalled {
                Ok(()) => self.schedule_do_more_work(),
                Err(e) => self.signal_eos(e),
            }
        }
    }

    fn arm_stop_timeout(&self) {
        let Some(timeout) = self.stop_timeout else {
            return;
        };
        let cancel = self.cancel.child_token();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = tokio::time::sleep(timeout) => {
                    let _ = tx.send(PipelineCommand::StopTimeout);
                },
            }
        });
    }

    fn on_pause(&mut self) -> Result<()> {
        log::info!("pipeline ({}) pausing", self.kind.as_str());
        if self.surface {
            self.set_encoder_parameters(&EncoderParams::suspend())
        } else {
            if let Some(puller) = &self.puller {
                puller.pause();
            }
            Ok(())
        }
    }

    fn on_resume(&mut self, skip_before_us: i64) {
        log::info!("pipeline ({}) resuming", self.kind.as_str());
        if self.surface {
            if let Err(e) = self.resume_surface(skip_before_us) {
                log::error!("encoder ({}) resume failed: {}", self.kind.as_str(), e);
            }
        } else if let Some(puller) = &self.puller {
            puller.resume();
        }
    }

    fn resume_surface(&mut self, skip_before_us: i64) -> Result<()> {
        self.set_encoder_parameters(&EncoderParams::resume(skip_before_us))
    }

    /// Encoder failures are fatal for the session.
    fn set_encoder_parameters(&mut self, params: &EncoderParams) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        if let Err(e) = encoder.set_parameters(params) {
            self.signal_eos(e.clone());
            return Err(e);
        }
        Ok(())
    }

    fn on_puller_notify(&mut self, unit: AccessUnit) {
        if unit.is_end_of_stream() {
            log::info!("puller ({}) reached EOS", self.kind.as_str());
        }
        if self.encoder.is_none() {
            log::debug!(
                "pipeline ({}) dropping access unit after encoder shutdown",
                self.kind.as_str()
            );
            return;
        }

        self.input_queue.push_back(unit);
        if let Err(e) = self.feed_encoder_input() {
            self.signal_eos(e);
            return;
        }
        self.schedule_do_more_work();
    }

    fn on_encoder_activity(&mut self, activity: Activity) {
        self.do_more_work_pending = false;
        if self.encoder.is_none() {
            return;
        }
        match self.do_more_work(activity) {
            Ok(()) => self.schedule_do_more_work(),
            // reached EOS, or failed
            Err(e) => self.signal_eos(e),
        }
    }

    fn schedule_do_more_work(&mut self) {
        if self.do_more_work_pending {
            return;
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        self.do_more_work_pending = true;
        let tx = self.tx.clone();
        encoder.request_activity_notification(ActivityNotifier::new(move |activity| {
            let _ = tx.send(PipelineCommand::EncoderActivity(activity));
        }));
    }

    /// Pairs the oldest queued access units with the oldest free input
    /// slots until either runs out.
    fn feed_encoder_input(&mut self) -> Result<()> {
        let Some(encoder) = self.encoder.as_mut() else {
            return Ok(());
        };
        while !self.input_queue.is_empty() && !self.avail_inputs.is_empty() {
            let (Some(unit), Some(index)) =
                (self.input_queue.pop_front(), self.avail_inputs.pop_front())
            else {
                break;
            };
            let slot = self
                .input_slots
                .get(index)
                .cloned()
                .ok_or(Error::InvalidSlot(index))?;

            let (size, timestamp_us, flags) = match unit {
                AccessUnit::Buffer(buffer) => {
                    let timestamp_us = buffer.timestamp_us();
                    match self.kind {
                        MediaKind::Video => self.decoding_times.push_back(timestamp_us),
                        MediaKind::Audio => {
                            let first = *self.first_sample_time_us.get_or_insert(timestamp_us);
                            let drift = match buffer.drift_time_us() {
                                Some(drift) if drift != 0 => timestamp_us - first - drift,
                                _ => 0,
                            };
                            self.drift_times.push_back(drift);
                        }
                        MediaKind::Other => {}
                    }

                    let size = slot.fill(buffer.data())?;
                    if self.kind == MediaKind::Video {
                        // released by the encoder once it has consumed the slot
                        slot.attach(buffer);
                    } else {
                        buffer.release();
                    }
                    (size, timestamp_us, BufferFlags::empty())
                }
                AccessUnit::EndOfStream => (0, 0, BufferFlags::EOS),
            };
            encoder.queue_input_slot(index, size, timestamp_us, flags)?;
        }
        Ok(())
    }

    /// Collects free input slots and completed output slots, bounded by the
    /// counts the encoder reported. Returns `Err(EndOfStream)` once the
    /// encoder's final output has been drained.
    fn do_more_work(&mut self, activity: Activity) -> Result<()> {
        if !self.surface {
            let encoder = self.encoder.as_mut().ok_or(Error::NotInitialized)?;
            for _ in 0..activity.input_slots {
                match encoder.dequeue_input_slot()? {
                    Some(index) => self.avail_inputs.push_back(index),
                    None => break,
                }
            }
            self.feed_encoder_input()?;
        }

        for _ in 0..activity.output_slots {
            let encoder = self.encoder.as_mut().ok_or(Error::NotInitialized)?;
            let info = match encoder.dequeue_output_slot()? {
                DequeueOutput::Slot(info) => info,
                DequeueOutput::FormatChanged => {
                    let format = encoder.output_format()?;
                    log::debug!("encoder ({}) output format: {:?}", self.kind.as_str(), format);
                    self.format_tx.send_replace(format);
                    continue;
                }
                DequeueOutput::SlotsChanged => {
                    self.output_slots = encoder.output_slots()?;
                    continue;
                }
                DequeueOutput::WouldBlock => break,
            };

            let eos = info.flags.contains(BufferFlags::EOS);
            if !eos || info.size > 0 {
                let buffer = self.copy_out(&info)?;
                log::trace!("encoder ({}) output {}", self.kind.as_str(), buffer);
                self.output.push(buffer);
            }
            if let Some(encoder) = self.encoder.as_mut() {
                encoder.release_output_slot(info.index)?;
            }
            if eos {
                return Err(Error::EndOfStream);
            }
        }
        Ok(())
    }

    fn copy_out(&mut self, info: &OutputSlotInfo) -> Result<MediaBuffer> {
        let slot = self
            .output_slots
            .get(info.index)
            .ok_or(Error::InvalidSlot(info.index))?;
        let data = slot.read(info.offset, info.size)?;

        let mut meta = BufferMeta::at(info.timestamp_us);
        if info.flags.contains(BufferFlags::CODEC_CONFIG) {
            meta.flags.insert(BufferFlags::CODEC_CONFIG);
        } else {
            match self.kind {
                MediaKind::Video => {
                    // surface frames carry no separate decoding time
                    let decoding_time_us = if self.surface {
                        info.timestamp_us
                    } else {
                        self.decoding_times
                            .pop_front()
                            .unwrap_or(info.timestamp_us)
                    };
                    meta.decoding_time_us = Some(decoding_time_us);
                }
                MediaKind::Audio => {
                    meta.drift_time_us = self.drift_times.pop_front();
                }
                MediaKind::Other => {}
            }
        }
        if info.flags.contains(BufferFlags::SYNC_FRAME) {
            meta.flags.insert(BufferFlags::SYNC_FRAME);
        }
        Ok(self.output_pool.allocate(data, meta))
    }

    /// Records end-of-stream once, then answers every pending stop request
    /// if a stop is in progress.
    fn signal_eos(&mut self, status: Error) {
        if !self.eos_reached {
            if status.is_end_of_stream() {
                log::info!("encoder ({}) reached EOS", self.kind.as_str());
            } else {
                log::error!("encoder ({}) reached EOS with error: {}", self.kind.as_str(), status);
            }
            self.release_encoder();
            // unread output only survives a natural end of stream
            self.output.finish(status.clone(), self.stopping);
            self.eos_reached = true;
            self.status = Some(status);
        }

        if self.stopping && self.eos_reached {
            log::info!("encoder ({}) stopped", self.kind.as_str());
            let reply = self
                .status
                .clone()
                .unwrap_or(Error::EndOfStream)
                .into_stop_status();
            for result in self.stop_replies.drain(..) {
                let _ = result.send(reply.clone());
            }
            self.stopping = false;
        }
    }

    fn release_encoder(&mut self) {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.release();
            log::debug!("encoder ({}) released", self.kind.as_str());
        }
        self.input_slots.clear();
        self.output_slots.clear();
        self.avail_inputs.clear();
        self.input_queue.clear();
        self.decoding_times.clear();
        self.drift_times.clear();
        self.first_sample_time_us = None;
        self.do_more_work_pending = false;
        log::debug!(
            "pool ({}) has {} buffers with the reader",
            self.output_pool.name(),
            self.output_pool.outstanding()
        );
    }

    fn shutdown(&mut self) {
        self.release_encoder();
        self.output.finish(Error::Closed("pipeline"), true);
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
