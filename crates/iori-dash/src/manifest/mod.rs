//! Manifest object graph.
//!
//! A [`Document`] is an immutable snapshot of one MPD download. Reloads build
//! a new document instead of patching the previous one, so every reader works
//! on a consistent graph.

pub mod clock;
pub mod loader;
mod parse;
pub mod template;
pub mod timeline;
mod base_url;

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};

pub use loader::ManifestLoader;
pub use timeline::{SegmentDescriptor, SegmentTimeline, TimeRange};

use crate::StreamType;

/// Presentation wide attributes shared by all timelines of a document.
#[derive(Debug, Clone, Default)]
pub struct DocumentParameters {
    pub dynamic: bool,
    pub availability_start_time: Option<DateTime<Utc>>,
    pub publish_time: Option<DateTime<Utc>>,
    pub presentation_duration: Option<Duration>,
    pub min_buffer_time: Option<Duration>,
    pub minimum_update_period: Option<Duration>,
    pub time_shift_buffer_depth: Option<Duration>,
    pub suggested_presentation_delay: Option<Duration>,
    /// Offset of the server clock relative to the local one.
    pub clock_offset: TimeDelta,
}

impl DocumentParameters {
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    /// Presentation time of the newest published media.
    pub fn live_edge(&self) -> Duration {
        self.availability_start_time
            .and_then(|start| (self.now() - start).to_std().ok())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Document {
    pub parameters: Arc<DocumentParameters>,
    pub periods: Vec<Period>,
}

impl Document {
    pub fn is_dynamic(&self) -> bool {
        self.parameters.dynamic
    }

    pub fn publish_time(&self) -> Option<DateTime<Utc>> {
        self.parameters.publish_time
    }

    /// Presentation time used to locate the current period: the live edge
    /// for dynamic documents, the playback position otherwise.
    pub fn presentation_time(&self, playback_time: Duration) -> Duration {
        if self.is_dynamic() {
            self.parameters.live_edge()
        } else {
            playback_time
        }
    }

    pub fn find_period(&self, time: Duration) -> Option<&Period> {
        self.periods.iter().find(|period| period.contains(time))
    }
}

#[derive(Debug, Clone)]
pub struct Period {
    pub id: Option<String>,
    pub start: Duration,
    pub duration: Option<Duration>,
    pub adaptation_sets: Vec<AdaptationSet>,
}

impl Period {
    pub fn end(&self) -> Option<Duration> {
        self.duration.map(|duration| self.start + duration)
    }

    pub fn contains(&self, time: Duration) -> bool {
        self.start <= time && self.end().map_or(true, |end| time < end)
    }

    pub fn adaptation_sets(&self, stream_type: StreamType) -> impl Iterator<Item = &AdaptationSet> {
        self.adaptation_sets
            .iter()
            .filter(move |set| set.stream_type == Some(stream_type))
    }
}

#[derive(Debug, Clone)]
pub struct AdaptationSet {
    pub id: Option<String>,
    pub stream_type: Option<StreamType>,
    pub lang: Option<String>,
    /// Carries `Role@value="main"`.
    pub is_main: bool,
    pub representations: Vec<Arc<Representation>>,
}

/// One encoded variant of a stream. Never mutated after parsing.
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub codecs: Option<String>,
    pub mime_type: Option<String>,
    pub lang: Option<String>,
    pub segments: Arc<dyn SegmentTimeline>,
}

impl Representation {
    pub fn timeline(&self) -> &dyn SegmentTimeline {
        self.segments.as_ref()
    }

    /// Whether both describe the same encoded stream, so cached
    /// initialization data stays valid.
    pub fn is_same_stream(&self, other: &Representation) -> bool {
        self.id == other.id
            && self.timeline().init_segment().map(|s| s.url)
                == other.timeline().init_segment().map(|s| s.url)
    }
}

impl fmt::Debug for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Representation")
            .field("id", &self.id)
            .field("bandwidth", &self.bandwidth)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("codecs", &self.codecs)
            .finish_non_exhaustive()
    }
}
