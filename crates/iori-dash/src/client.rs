use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use bytes::Bytes;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::DashConfig,
    download::{DownloadRequest, DownloadResponse, SegmentDownloader},
    error::{DashError, DashResult},
    event::{EventSender, PlayerEvent},
    manifest::{Representation, SegmentTimeline, TimeRange},
    selector::StreamSelection,
    sink::MediaSink,
    util::slot::Slot,
    StreamType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Idle,
    Running,
    Paused,
    Stopped,
}

/// Outcome of [`DashClient::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekResolution {
    /// Start of the segment playback resumes from, or the requested
    /// position when no segment covers it.
    pub position: Duration,
    pub exact: bool,
}

/// Position of the download loop in the current timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    /// Not resolved yet; computed from the start hint or the timeline.
    Start,
    At(u64),
    /// Past the last known segment.
    End,
}

#[derive(Debug)]
struct ClientState {
    status: ClientStatus,
    representation: Option<Arc<Representation>>,
    cursor: Cursor,

    playback_time: Duration,
    buffered_time: Duration,
    time_buffer_depth: Duration,
    /// Presentation time at playback time zero, for dynamic content.
    time_origin: Option<Duration>,
    start_hint: Option<Duration>,
    last_requested: Option<TimeRange>,

    init_data: Option<Bytes>,
    init_delivered: bool,
    /// Downstream has received bytes since the last stop. Kept across
    /// restarts so content exhausted right after a seek still ends the
    /// stream.
    data_written: bool,
    eos_sent: bool,
    buffering: bool,
}

impl ClientState {
    fn new() -> Self {
        Self {
            status: ClientStatus::Idle,
            representation: None,
            cursor: Cursor::Start,
            playback_time: Duration::ZERO,
            buffered_time: Duration::ZERO,
            time_buffer_depth: Duration::ZERO,
            time_origin: None,
            start_hint: None,
            last_requested: None,
            init_data: None,
            init_delivered: false,
            data_written: false,
            eos_sent: false,
            buffering: false,
        }
    }

    fn buffer_full(&self) -> bool {
        self.buffered_time.saturating_sub(self.playback_time) > self.time_buffer_depth
    }

    fn presentation_time(&self, playback_time: Duration) -> Duration {
        self.time_origin.unwrap_or_default() + playback_time
    }
}

enum Step {
    Idle,
    EndOfStream,
    Download(DownloadRequest),
}

/// Download loop of one stream.
///
/// All methods are cheap to call from any task; the loop itself runs on a
/// spawned task and at most one instance of it is alive at a time.
#[derive(Clone)]
pub struct DashClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    stream_type: StreamType,
    config: Arc<DashConfig>,
    downloader: SegmentDownloader,
    sink: Arc<dyn MediaSink>,
    events: EventSender,
    selection: Mutex<Option<Arc<StreamSelection>>>,

    pending: Slot<Representation>,
    state: Mutex<ClientState>,

    busy: AtomicBool,
    /// Incremented for every spawned loop.
    generation: AtomicU64,
    token: Mutex<CancellationToken>,
    task: Mutex<Option<(u64, JoinHandle<()>)>>,
    span: tracing::Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DashClient {
    pub fn new(
        stream_type: StreamType,
        downloader: SegmentDownloader,
        sink: Arc<dyn MediaSink>,
        events: EventSender,
        config: Arc<DashConfig>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                stream_type,
                config,
                downloader,
                sink,
                events,
                selection: Mutex::new(None),
                pending: Slot::new(),
                state: Mutex::new(ClientState::new()),
                busy: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                token: Mutex::new(CancellationToken::new()),
                task: Mutex::new(None),
                span: tracing::info_span!("dash_client", stream = %stream_type),
            }),
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.inner.stream_type
    }

    /// Streams the loop may adapt between at segment boundaries.
    pub fn set_selection(&self, selection: Option<Arc<StreamSelection>>) {
        *lock(&self.inner.selection) = selection;
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.state().status
    }

    /// The staged representation if any, else the current one.
    pub fn representation(&self) -> Option<Arc<Representation>> {
        self.inner
            .pending
            .peek()
            .or_else(|| self.inner.state().representation.clone())
    }

    pub fn playback_time(&self) -> Duration {
        self.inner.state().playback_time
    }

    pub fn buffered_time(&self) -> Duration {
        self.inner.state().buffered_time
    }

    pub fn time_buffer_depth(&self) -> Duration {
        self.inner.state().time_buffer_depth
    }

    /// Replaces the representation right away. Meant for a paused or not yet
    /// started client; a staged update is dropped.
    pub fn set_representation(&self, representation: Arc<Representation>) {
        let mut state = self.inner.state();
        self.inner.pending.take();
        self.inner.swap_to(&mut state, representation);
    }

    /// Stages `representation` for the next loop iteration. An in-flight
    /// download is not interrupted.
    pub fn update_representation(&self, representation: Arc<Representation>) {
        tracing::debug!(parent: &self.inner.span, id = %representation.id, "Representation update staged");
        self.inner.pending.put(representation);
        self.inner.schedule();
    }

    /// Makes the next start resolve its first segment from `time`.
    pub fn set_start_hint(&self, time: Duration) {
        let mut state = self.inner.state();
        if state.cursor == Cursor::Start {
            state.start_hint = Some(time);
        }
    }

    pub fn start(&self) -> DashResult<()> {
        {
            let mut state = self.inner.state();
            if state.representation.is_none() {
                match self.inner.pending.take() {
                    Some(representation) => self.inner.swap_to(&mut state, representation),
                    None => return Err(DashError::RepresentationNotSet),
                }
            }
            if state.status == ClientStatus::Running {
                return Ok(());
            }

            state.status = ClientStatus::Running;
            state.buffered_time = state.playback_time;
            state.init_delivered = false;
            state.eos_sent = false;
            if !state.buffering {
                state.buffering = true;
                self.inner
                    .events
                    .send(PlayerEvent::BufferingStarted(self.inner.stream_type));
            }
            tracing::info!(
                parent: &self.inner.span,
                playback_time = ?state.playback_time,
                depth = ?state.time_buffer_depth,
                "Client started"
            );
        }

        let mut token = lock(&self.inner.token);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        drop(token);

        self.inner.schedule();
        Ok(())
    }

    /// Cancels downloads and waits for the loop to exit, keeping the
    /// representation and segment position.
    pub async fn pause(&self) {
        self.inner.cancel_and_wait().await;

        let mut state = self.inner.state();
        if state.status == ClientStatus::Running {
            state.status = ClientStatus::Paused;
        }
        tracing::debug!(parent: &self.inner.span, "Client paused");
    }

    /// Cancels downloads, signals end of stream downstream and resets the
    /// playback state.
    pub async fn stop(&self) {
        self.inner.cancel_and_wait().await;

        let mut state = self.inner.state();
        self.inner.send_end_of_stream(&mut state);
        state.status = ClientStatus::Stopped;
        state.cursor = Cursor::Start;
        state.last_requested = None;
        state.start_hint = None;
        state.time_origin = None;
        state.playback_time = Duration::ZERO;
        state.buffered_time = Duration::ZERO;
        state.init_delivered = false;
        state.data_written = false;
        state.eos_sent = false;
        state.buffering = false;
        tracing::info!(parent: &self.inner.span, "Client stopped");
    }

    /// Points the cursor at the segment covering `position`.
    ///
    /// The caller pauses the client before and starts it afterwards.
    pub fn seek(&self, position: Duration) -> SeekResolution {
        let mut state = self.inner.state();
        if let Some(representation) = self.inner.pending.take() {
            self.inner.swap_to(&mut state, representation);
        }

        let found = state.representation.clone().and_then(|representation| {
            let timeline = representation.timeline();
            let id = timeline.segment_id(position)?;
            let range = timeline.segment_time_range(id)?;
            let previous = timeline
                .previous_segment_id(id)
                .and_then(|previous| timeline.segment_time_range(previous));
            Some((id, range, previous))
        });

        match found {
            Some((id, range, previous)) => {
                state.cursor = Cursor::At(id);
                state.last_requested = previous;
                state.start_hint = None;
                state.playback_time = range.start;
                state.buffered_time = range.start;
                tracing::info!(parent: &self.inner.span, ?position, segment_id = id, resolved = ?range.start, "Seek resolved");
                SeekResolution {
                    position: range.start,
                    exact: true,
                }
            }
            None => {
                tracing::warn!(parent: &self.inner.span, ?position, "No segment covers seek position");
                let dynamic = state
                    .representation
                    .as_ref()
                    .is_some_and(|r| r.timeline().is_dynamic());
                state.cursor = if dynamic { Cursor::Start } else { Cursor::End };
                state.last_requested = None;
                state.start_hint = Some(position);
                state.playback_time = position;
                state.buffered_time = position;
                SeekResolution {
                    position,
                    exact: false,
                }
            }
        }
    }

    pub fn on_time_updated(&self, playback_time: Duration) {
        {
            let mut state = self.inner.state();
            if state.eos_sent {
                return;
            }
            state.playback_time = playback_time;

            let underrun = state.status == ClientStatus::Running
                && state.cursor != Cursor::End
                && playback_time >= state.buffered_time;
            if underrun && !state.buffering {
                state.buffering = true;
                self.inner
                    .events
                    .send(PlayerEvent::BufferingStarted(self.inner.stream_type));
            }
        }
        self.inner.schedule();
    }
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.state)
    }

    fn token(&self) -> CancellationToken {
        lock(&self.token).clone()
    }

    fn schedule(self: &Arc<Self>) {
        // Held until the handle is stored, so the slot always names the
        // newest loop.
        let mut task = lock(&self.task);
        let token = self.token();
        if token.is_cancelled() || self.state().status != ClientStatus::Running {
            return;
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let inner = self.clone();
        let handle = tokio::spawn(
            async move {
                inner.run(&token).await;
                inner.release(generation);
                // An update staged while the loop was exiting.
                if inner.pending.peek().is_some() {
                    inner.schedule();
                }
            }
            .instrument(self.span.clone()),
        );
        *task = Some((generation, handle));
    }

    /// Clears the busy guard if `generation` is still the newest loop.
    fn release(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) == generation {
            self.busy.store(false, Ordering::Release);
        }
    }

    async fn cancel_and_wait(&self) {
        self.token().cancel();
        let task = lock(&self.task).take();
        if let Some((generation, task)) = task {
            if let Err(e) = task.await {
                tracing::error!(parent: &self.span, error = %e, "Download loop panicked");
                self.release(generation);
            }
        }
    }

    async fn run(&self, token: &CancellationToken) {
        loop {
            let request = match self.next_step(token) {
                Step::Idle => return,
                Step::EndOfStream => return self.finish(token),
                Step::Download(request) => request,
            };

            let is_init = request.segment.is_init();
            match self.downloader.download(request, token).await {
                Ok(response) => {
                    if !self.complete(response, token) {
                        return;
                    }
                }
                Err(DashError::Cancelled) => {
                    tracing::debug!("Download cancelled");
                    return;
                }
                Err(e) => return self.fail(e, is_init, token),
            }
        }
    }

    fn next_step(&self, token: &CancellationToken) -> Step {
        let mut state = self.state();
        if token.is_cancelled() || state.status != ClientStatus::Running {
            return Step::Idle;
        }

        if let Some(representation) = self.pending.take() {
            self.swap_to(&mut state, representation);
        }
        let Some(mut representation) = state.representation.clone() else {
            return Step::Idle;
        };

        let selection = lock(&self.selection).clone();
        if let Some(better) = selection.and_then(|s| s.adapt(&representation)) {
            self.swap_to(&mut state, better.clone());
            representation = better;
        }

        let timeline = representation.timeline();
        if state.cursor == Cursor::Start {
            state.cursor = start_cursor(timeline, state.start_hint);
        }
        if !timeline.is_dynamic() && state.cursor == Cursor::End {
            return Step::EndOfStream;
        }

        if state.buffer_full() {
            if state.buffering {
                state.buffering = false;
                self.events
                    .send(PlayerEvent::BufferingCompleted(self.stream_type));
            }
            return Step::Idle;
        }

        if !state.init_delivered {
            match timeline.init_segment() {
                Some(init) => match state.init_data.clone() {
                    Some(data) => {
                        tracing::debug!("Replaying cached init segment");
                        self.sink.write_data(data);
                        state.init_delivered = true;
                        state.data_written = true;
                    }
                    None => {
                        return Step::Download(
                            DownloadRequest::new(init, self.stream_type).ignore_error(true),
                        )
                    }
                },
                None => state.init_delivered = true,
            }
        }

        let Cursor::At(mut id) = state.cursor else {
            // Live content without a resolvable segment yet.
            return Step::Idle;
        };
        if timeline.is_dynamic() {
            if let Some(first) = timeline.first_available_segment_id() {
                if id < first {
                    tracing::warn!(segment_id = id, first, "Fell behind the live window");
                    id = first;
                    state.cursor = Cursor::At(first);
                }
            }
        }

        match timeline.media_segment(id) {
            Some(segment) => {
                let deadline = segment
                    .period
                    .and_then(|range| self.download_deadline(&representation, range));
                Step::Download(
                    DownloadRequest::new(segment, self.stream_type)
                        .ignore_error(true)
                        .with_deadline(deadline),
                )
            }
            None if timeline.is_dynamic() => {
                tracing::trace!(segment_id = id, "Segment not yet available");
                Step::Idle
            }
            None => {
                state.cursor = Cursor::End;
                Step::EndOfStream
            }
        }
    }

    /// Records a finished download and pushes its bytes downstream. Returns
    /// whether the loop should continue.
    fn complete(&self, response: DownloadResponse, token: &CancellationToken) -> bool {
        let mut state = self.state();
        if token.is_cancelled() || state.status != ClientStatus::Running {
            tracing::debug!(segment = %response.segment, "Discarding cancelled download");
            return false;
        }
        let Some(representation) = state.representation.clone() else {
            return false;
        };

        match (response.segment_id(), response.segment.period) {
            (None, _) => {
                state.init_data = Some(response.data.clone());
                state.init_delivered = true;
            }
            (Some(id), Some(range)) => {
                let timeline = representation.timeline();
                if timeline.is_dynamic() {
                    if state.time_origin.is_none() {
                        state.time_origin = Some(range.start.saturating_sub(state.playback_time));
                    }
                    state.buffered_time += range.duration;
                } else {
                    state.buffered_time = range.end();
                }
                state.last_requested = Some(range);
                state.cursor = match timeline.next_segment_id(id) {
                    Some(next) => Cursor::At(next),
                    None => Cursor::End,
                };
                tracing::debug!(
                    segment_id = id,
                    buffered = ?state.buffered_time,
                    playback = ?state.playback_time,
                    "Segment pushed"
                );
            }
            (Some(id), None) => {
                tracing::warn!(segment_id = id, "Segment without time range");
                state.cursor = Cursor::End;
            }
        }

        self.sink.write_data(response.data);
        state.data_written = true;
        true
    }

    fn fail(&self, error: DashError, is_init: bool, token: &CancellationToken) {
        let mut state = self.state();
        if token.is_cancelled() || state.status != ClientStatus::Running {
            return;
        }

        let dynamic = state
            .representation
            .as_ref()
            .is_some_and(|r| r.timeline().is_dynamic());
        if dynamic && !is_init {
            if error.status() == Some(reqwest::StatusCode::NOT_FOUND) {
                if let (Cursor::At(id), Some(representation)) =
                    (state.cursor, state.representation.clone())
                {
                    tracing::warn!(segment_id = id, "Live segment not found, skipping");
                    state.cursor = match representation.timeline().next_segment_id(id) {
                        Some(next) => Cursor::At(next),
                        None => Cursor::End,
                    };
                }
            } else {
                tracing::warn!(error = %error, "Live segment download failed, retrying later");
            }
            return;
        }

        tracing::error!(error = %error, init = is_init, "Segment download failed, stopping");
        state.status = ClientStatus::Stopped;
        self.send_end_of_stream(&mut state);
        drop(state);

        token.cancel();
        self.events.send(PlayerEvent::StreamError(error.to_string()));
    }

    fn finish(&self, token: &CancellationToken) {
        let mut state = self.state();
        if token.is_cancelled() {
            return;
        }
        tracing::info!("End of content");
        self.send_end_of_stream(&mut state);
        state.status = ClientStatus::Stopped;
    }

    fn send_end_of_stream(&self, state: &mut ClientState) {
        if state.buffering {
            state.buffering = false;
            self.events
                .send(PlayerEvent::BufferingCompleted(self.stream_type));
        }
        if !state.data_written || state.eos_sent {
            return;
        }
        state.eos_sent = true;
        self.sink.write_end_of_stream();
        self.events.send(PlayerEvent::EndOfStream(self.stream_type));
    }

    /// Installs `next` and carries the cursor over through the time domain.
    fn swap_to(&self, state: &mut ClientState, next: Arc<Representation>) {
        let previous = state.representation.replace(next.clone());
        state.time_buffer_depth = time_buffer_depth(next.timeline(), &self.config);

        let Some(previous) = previous else {
            return;
        };
        if !previous.is_same_stream(&next) {
            state.init_data = None;
            state.init_delivered = false;
        }

        let timeline = next.timeline();
        state.cursor = match state.last_requested {
            Some(last) => match timeline.next_segment_id_after(last.start) {
                Some(id) => Cursor::At(id),
                None => {
                    let now = state.presentation_time(state.playback_time);
                    let fallback = timeline.segment_id(now).filter(|id| {
                        timeline
                            .segment_time_range(*id)
                            .is_some_and(|range| range.start > last.start)
                    });
                    match fallback {
                        Some(id) => {
                            tracing::warn!(segment_id = id, "Continuing from playback time after swap");
                            Cursor::At(id)
                        }
                        None => Cursor::End,
                    }
                }
            },
            None => match state.cursor {
                Cursor::At(id) => previous
                    .timeline()
                    .segment_time_range(id)
                    .and_then(|range| timeline.segment_id(range.start))
                    .map_or(Cursor::Start, Cursor::At),
                other => other,
            },
        };
        tracing::info!(
            from = %previous.id,
            to = %next.id,
            cursor = ?state.cursor,
            "Representation swapped"
        );
    }

    /// Upper bound for downloading one live segment.
    fn download_deadline(&self, representation: &Representation, range: TimeRange) -> Option<Duration> {
        let parameters = representation.timeline().parameters();
        if !parameters.dynamic {
            return None;
        }
        let throughput = self.downloader.throughput().average();
        if throughput <= 0.0 || representation.bandwidth == 0 {
            return None;
        }

        let expected = representation.bandwidth as f64 * range.duration.as_secs_f64() / throughput;
        let floor = parameters
            .min_buffer_time
            .unwrap_or(self.config.time_buffer_depth_default);
        Some(Duration::from_secs_f64(expected * 1.5).max(floor))
    }
}

fn start_cursor(timeline: &dyn SegmentTimeline, hint: Option<Duration>) -> Cursor {
    let id = match hint {
        Some(time) => timeline.segment_id(time),
        None => timeline.start_segment_id(),
    };
    match id {
        Some(id) => Cursor::At(id),
        None if timeline.is_dynamic() => Cursor::Start,
        None => Cursor::End,
    }
}

/// Target amount of media buffered ahead of playback.
///
/// Static content buffers one average segment plus enough whole segments to
/// cover `minBufferTime`.
pub(crate) fn time_buffer_depth(timeline: &dyn SegmentTimeline, config: &DashConfig) -> Duration {
    if let Some(depth) = config.time_buffer_depth {
        return depth;
    }

    let min_buffer_time = timeline
        .parameters()
        .min_buffer_time
        .unwrap_or(config.time_buffer_depth_default);
    if timeline.is_dynamic() {
        return min_buffer_time;
    }

    let average = match (timeline.duration(), timeline.segment_count()) {
        (Some(duration), Some(count)) if count > 0 && !duration.is_zero() => {
            duration / count as u32
        }
        _ => return config.time_buffer_depth_default,
    };
    let segments = (min_buffer_time.as_secs_f64() / average.as_secs_f64()).ceil() as u32;
    average + average * segments
}
