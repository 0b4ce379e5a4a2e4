use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;

use crate::{
    client::{ClientStatus, DashClient, SeekResolution},
    error::{DashError, DashResult},
    manifest::{AdaptationSet, Period, Representation},
    selector::{RepresentationSelector, StreamGroup, StreamSelection},
    util::slot::Slot,
    StreamType,
};

/// A demuxed access unit on its way to the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub stream_type: StreamType,
    pub pts: Duration,
    pub dts: Duration,
    pub data: Bytes,
}

/// Rebases packet timestamps so the first packet after a (re)start begins at
/// zero.
#[derive(Debug, Default)]
pub struct TimestampTrimmer {
    offset: Option<Duration>,
}

impl TimestampTrimmer {
    pub fn reset(&mut self) {
        self.offset = None;
    }

    pub fn trim(&mut self, mut packet: Packet) -> Packet {
        let offset = *self.offset.get_or_insert(packet.pts.min(packet.dts));
        packet.pts = packet.pts.saturating_sub(offset);
        packet.dts = packet.dts.saturating_sub(offset);
        packet
    }
}

/// Binds one [`DashClient`] to the streams of the current period.
pub struct MediaPipeline {
    stream_type: StreamType,
    client: DashClient,
    selection: Arc<StreamSelection>,
    trimmer: Mutex<TimestampTrimmer>,

    /// Representation chosen before the first start.
    pending_start: Slot<Representation>,
    started: AtomicBool,
    deactivated: AtomicBool,
}

impl MediaPipeline {
    pub fn new(client: DashClient, selection: Arc<StreamSelection>) -> Self {
        client.set_selection(Some(selection.clone()));
        Self {
            stream_type: client.stream_type(),
            client,
            selection,
            trimmer: Mutex::new(TimestampTrimmer::default()),
            pending_start: Slot::new(),
            started: AtomicBool::new(false),
            deactivated: AtomicBool::new(false),
        }
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn client(&self) -> &DashClient {
        &self.client
    }

    pub fn selection(&self) -> &Arc<StreamSelection> {
        &self.selection
    }

    /// Whether this pipeline has media in the current period.
    pub fn is_active(&self) -> bool {
        !self.is_deactivated()
            && (self.client.representation().is_some() || self.pending_start.peek().is_some())
    }

    pub fn is_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::Acquire)
    }

    /// Stops the stream for good. Later periods are not applied to it.
    pub async fn deactivate(&self) {
        if self.deactivated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pending_start.take();
        self.stop().await;
        tracing::info!(stream = %self.stream_type, "Stream deactivated");
    }

    fn current_id(&self) -> Option<String> {
        self.pending_start
            .peek()
            .or_else(|| self.client.representation())
            .map(|representation| representation.id.clone())
    }

    /// Picks up the streams of a new or reloaded period.
    ///
    /// The current representation is followed by id; otherwise the default
    /// adaptation set is chosen and its lowest bitrate representation.
    pub fn update_media(&self, period: &Period) -> DashResult<()> {
        if self.is_deactivated() {
            return Err(DashError::StreamDeactivated(self.stream_type));
        }
        let current = self.current_id();
        let followed = current.as_deref().and_then(|id| {
            period
                .adaptation_sets(self.stream_type)
                .find_map(|set| set.representations.iter().find(|r| r.id == id).map(|r| (set, r.clone())))
        });

        let (set, representation) = match followed {
            Some(found) => found,
            None => {
                let set = default_adaptation_set(period, self.stream_type)
                    .ok_or(DashError::NoMediaInPeriod(self.stream_type))?;
                let lowest = set
                    .representations
                    .iter()
                    .min_by_key(|r| r.bandwidth)
                    .cloned()
                    .ok_or(DashError::NoMediaInPeriod(self.stream_type))?;
                (set, lowest)
            }
        };

        self.selection.set_streams(set.representations.clone());
        if self.started.load(Ordering::Acquire) {
            self.client.update_representation(representation);
        } else {
            self.pending_start.put(representation);
        }
        Ok(())
    }

    /// Hands the representation chosen before the first start to the client.
    pub fn switch_stream_if_needed(&self) -> DashResult<()> {
        if self.is_deactivated() {
            return Ok(());
        }
        if let Some(representation) = self.pending_start.take() {
            self.client.set_representation(representation);
        }
        if self.client.representation().is_none() {
            return Ok(());
        }
        if !self.started.swap(true, Ordering::AcqRel) {
            self.trimmer_reset();
            self.client.start()?;
        }
        Ok(())
    }

    /// Presentation time of the first segment the pipeline would play.
    pub fn start_time(&self) -> Option<Duration> {
        if self.is_deactivated() {
            return None;
        }
        let representation = self
            .pending_start
            .peek()
            .or_else(|| self.client.representation())?;
        let timeline = representation.timeline();
        timeline
            .start_segment_id()
            .and_then(|id| timeline.segment_time_range(id))
            .map(|range| range.start)
    }

    /// Starts every pipeline from the latest first-segment time among them,
    /// so audio and video begin together.
    pub fn align_start(pipelines: &[&MediaPipeline]) {
        let Some(start) = pipelines.iter().filter_map(|p| p.start_time()).max() else {
            return;
        };
        for pipeline in pipelines {
            pipeline.client.set_start_hint(start);
        }
        tracing::debug!(?start, "Aligned stream start");
    }

    /// Switches to stream `index` of the current group and pins it.
    pub async fn change_stream(&self, index: usize) -> DashResult<()> {
        if self.is_deactivated() {
            return Err(DashError::StreamDeactivated(self.stream_type));
        }
        let representation = self
            .selection
            .stream(index)
            .ok_or(DashError::InvalidStreamIndex(index))?;
        if !self.selection.is_adaptive() {
            tracing::debug!(stream = %self.stream_type, index, "Adaptive selection disabled");
        }

        let was_running = self.client.status() == ClientStatus::Running;
        self.client.pause().await;
        tracing::info!(stream = %self.stream_type, id = %representation.id, "Changing stream");
        self.client.set_representation(representation);
        if was_running || self.started.load(Ordering::Acquire) {
            self.trimmer_reset();
            self.client.start()?;
        }
        Ok(())
    }

    pub fn set_selector(&self, selector: Option<Arc<dyn RepresentationSelector>>) {
        self.selection.set_selector(selector);
    }

    pub fn stream_group(&self) -> StreamGroup {
        self.selection.group(self.current_id().as_deref())
    }

    pub async fn pause(&self) {
        self.client.pause().await;
    }

    pub fn resume(&self) -> DashResult<()> {
        if !self.is_active() {
            return Ok(());
        }
        self.trimmer_reset();
        self.client.start()
    }

    pub async fn stop(&self) {
        self.client.stop().await;
        self.started.store(false, Ordering::Release);
    }

    pub fn seek(&self, position: Duration) -> SeekResolution {
        self.client.seek(position)
    }

    pub fn on_time_updated(&self, playback_time: Duration) {
        self.client.on_time_updated(playback_time);
    }

    pub fn correct_packet(&self, packet: Packet) -> Packet {
        self.trimmer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .trim(packet)
    }

    fn trimmer_reset(&self) {
        self.trimmer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .reset();
    }
}

/// The only set of its type, else the `main` one, else English, else the
/// first.
fn default_adaptation_set(period: &Period, stream_type: StreamType) -> Option<&AdaptationSet> {
    let sets: Vec<_> = period
        .adaptation_sets(stream_type)
        .filter(|set| !set.representations.is_empty())
        .collect();
    if sets.len() <= 1 {
        return sets.first().copied();
    }

    sets.iter()
        .find(|set| set.is_main)
        .or_else(|| {
            sets.iter().find(|set| {
                set.lang
                    .as_deref()
                    .is_some_and(|lang| lang == "en" || lang.starts_with("en-"))
            })
        })
        .or(sets.first())
        .copied()
}
