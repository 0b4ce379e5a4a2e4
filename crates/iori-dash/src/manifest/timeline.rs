use std::{fmt, sync::Arc, time::Duration};

use url::Url;

use super::{template::Template, DocumentParameters};
use crate::util::range::ByteRange;

/// Live start offset used when the manifest declares neither
/// `suggestedPresentationDelay` nor `minBufferTime`.
const DEFAULT_LIVE_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeRange {
    pub start: Duration,
    pub duration: Duration,
}

impl TimeRange {
    pub fn new(start: Duration, duration: Duration) -> Self {
        Self { start, duration }
    }

    pub fn end(&self) -> Duration {
        self.start + self.duration
    }

    pub fn contains(&self, time: Duration) -> bool {
        self.start <= time && time < self.end()
    }
}

/// Where to fetch one segment from.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentDescriptor {
    /// `None` for the initialization segment.
    pub id: Option<u64>,
    pub url: Url,
    pub byte_range: Option<ByteRange>,
    pub period: Option<TimeRange>,
    /// Set on the last segment of static content.
    pub end_of_stream: bool,
}

impl SegmentDescriptor {
    pub fn is_init(&self) -> bool {
        self.id.is_none()
    }
}

impl fmt::Display for SegmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "segment {id} ({})", self.url),
            None => write!(f, "init segment ({})", self.url),
        }
    }
}

/// Segment lookups of one representation.
///
/// Ids are representation relative. Times are presentation times.
pub trait SegmentTimeline: Send + Sync + fmt::Debug {
    fn parameters(&self) -> &DocumentParameters;

    fn init_segment(&self) -> Option<SegmentDescriptor>;

    /// First segment to play: the beginning for static content, a point
    /// behind the live edge for dynamic content.
    fn start_segment_id(&self) -> Option<u64>;

    /// Oldest segment that can still be downloaded.
    fn first_available_segment_id(&self) -> Option<u64>;

    /// Segment covering `time`. When `time` falls into a gap, the segment
    /// after the gap.
    fn segment_id(&self, time: Duration) -> Option<u64>;

    fn next_segment_id(&self, id: u64) -> Option<u64>;

    fn previous_segment_id(&self, id: u64) -> Option<u64>;

    /// First segment starting strictly after `time`.
    fn next_segment_id_after(&self, time: Duration) -> Option<u64>;

    fn segment_time_range(&self, id: u64) -> Option<TimeRange>;

    /// Descriptor of a segment that can be downloaded now.
    fn media_segment(&self, id: u64) -> Option<SegmentDescriptor>;

    fn duration(&self) -> Option<Duration>;

    fn segment_count(&self) -> Option<u64>;

    fn is_dynamic(&self) -> bool {
        self.parameters().dynamic
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimelineEntry {
    pub time: u64,
    pub duration: u64,
}

#[derive(Debug, Clone)]
pub(crate) enum Addressing {
    /// `SegmentTemplate@duration`
    Numbered {
        media: String,
        template: Template,
        start_number: u64,
        timescale: u64,
        duration: u64,
        presentation_time_offset: u64,
    },
    /// `SegmentTemplate` with a `SegmentTimeline`, `@r` already expanded.
    Explicit {
        media: String,
        template: Template,
        start_number: u64,
        timescale: u64,
        presentation_time_offset: u64,
        entries: Vec<TimelineEntry>,
    },
    /// The whole representation is one resource.
    Single {
        url: Url,
        range: Option<ByteRange>,
    },
}

/// Timeline built from the addressing information of one representation.
#[derive(Debug, Clone)]
pub struct RepresentationTimeline {
    pub(crate) parameters: Arc<DocumentParameters>,
    pub(crate) period_start: Duration,
    pub(crate) period_duration: Option<Duration>,
    pub(crate) availability_time_offset: Duration,
    pub(crate) init: Option<(Url, Option<ByteRange>)>,
    pub(crate) addressing: Addressing,
}

pub(crate) fn scaled_to_duration(value: u64, timescale: u64) -> Duration {
    let nanos = value as u128 * 1_000_000_000 / timescale.max(1) as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

fn duration_to_scaled(time: Duration, timescale: u64) -> u64 {
    let scaled = time.as_nanos() * timescale as u128 / 1_000_000_000;
    scaled.min(u64::MAX as u128) as u64
}

impl RepresentationTimeline {
    fn period_end(&self) -> Option<Duration> {
        self.period_duration.map(|d| self.period_start + d)
    }

    /// Segment time range, ignoring availability.
    fn range(&self, id: u64) -> Option<TimeRange> {
        match &self.addressing {
            Addressing::Numbered {
                timescale,
                duration,
                ..
            } => {
                if matches!(self.count(), Some(count) if id >= count) {
                    return None;
                }
                let start = self.period_start + scaled_to_duration(id * duration, *timescale);
                let mut length = scaled_to_duration(*duration, *timescale);
                if let Some(end) = self.period_end() {
                    length = length.min(end.saturating_sub(start));
                }
                Some(TimeRange::new(start, length))
            }
            Addressing::Explicit {
                timescale,
                presentation_time_offset,
                entries,
                ..
            } => {
                let entry = entries.get(usize::try_from(id).ok()?)?;
                let start = self.period_start
                    + scaled_to_duration(
                        entry.time.saturating_sub(*presentation_time_offset),
                        *timescale,
                    );
                Some(TimeRange::new(
                    start,
                    scaled_to_duration(entry.duration, *timescale),
                ))
            }
            Addressing::Single { .. } => (id == 0).then(|| {
                TimeRange::new(
                    self.period_start,
                    self.period_duration
                        .or(self.parameters.presentation_duration)
                        .unwrap_or_default(),
                )
            }),
        }
    }

    fn count(&self) -> Option<u64> {
        match &self.addressing {
            Addressing::Numbered {
                timescale,
                duration,
                ..
            } => {
                let period = duration_to_scaled(self.period_duration?, *timescale);
                Some(period.div_ceil((*duration).max(1)))
            }
            Addressing::Explicit { entries, .. } => Some(entries.len() as u64),
            Addressing::Single { .. } => Some(1),
        }
    }

    /// Rough id for `time`, to be corrected against [`Self::range`].
    fn estimate(&self, time: Duration) -> u64 {
        match &self.addressing {
            Addressing::Numbered {
                timescale,
                duration,
                ..
            } => {
                let relative = duration_to_scaled(time.saturating_sub(self.period_start), *timescale);
                relative / (*duration).max(1)
            }
            Addressing::Explicit { .. } | Addressing::Single { .. } => 0,
        }
    }

    fn is_available(&self, range: &TimeRange) -> bool {
        if !self.parameters.dynamic {
            return true;
        }

        let edge = self.parameters.live_edge() + self.availability_time_offset;
        if range.end() > edge {
            return false;
        }
        match self.parameters.time_shift_buffer_depth {
            Some(depth) => range.end() + depth >= self.parameters.live_edge(),
            None => true,
        }
    }

    /// Inclusive bounds of the segments downloadable right now.
    fn available_bounds(&self) -> Option<(u64, u64)> {
        match &self.addressing {
            Addressing::Numbered {
                timescale,
                duration,
                ..
            } if self.parameters.dynamic => {
                let edge = self.parameters.live_edge() + self.availability_time_offset;
                let elapsed = duration_to_scaled(edge.checked_sub(self.period_start)?, *timescale);
                let mut last = (elapsed / (*duration).max(1)).checked_sub(1)?;
                if let Some(count) = self.count() {
                    last = last.min(count.checked_sub(1)?);
                }

                let mut first = match self.parameters.time_shift_buffer_depth {
                    Some(depth) => self.estimate(self.parameters.live_edge().saturating_sub(depth)),
                    None => 0,
                };
                while first < last && !self.range(first).is_some_and(|r| self.is_available(&r)) {
                    first += 1;
                }
                (first <= last).then_some((first, last))
            }
            _ => {
                let count = self.count()?;
                let mut ids = (0..count).filter(|id| {
                    self.range(*id)
                        .is_some_and(|range| self.is_available(&range))
                });
                let first = ids.next()?;
                let last = ids.last().unwrap_or(first);
                Some((first, last))
            }
        }
    }

    /// First segment ending after `time`, or starting after it when
    /// `strictly_after` is set.
    fn find(&self, time: Duration, strictly_after: bool) -> Option<u64> {
        let starts_after = |range: &TimeRange| {
            if strictly_after {
                range.start > time
            } else {
                range.end() > time
            }
        };

        match &self.addressing {
            Addressing::Explicit { entries, .. } => {
                let index =
                    entries.partition_point(|entry| !starts_after(&self.entry_range(entry)));
                (index < entries.len()).then_some(index as u64)
            }
            _ => {
                let mut id = self.estimate(time);
                while id > 0 && self.range(id - 1).is_some_and(|r| starts_after(&r)) {
                    id -= 1;
                }
                loop {
                    let range = self.range(id)?;
                    if starts_after(&range) {
                        return Some(id);
                    }
                    id += 1;
                }
            }
        }
    }

    fn entry_range(&self, entry: &TimelineEntry) -> TimeRange {
        match &self.addressing {
            Addressing::Explicit {
                timescale,
                presentation_time_offset,
                ..
            } => TimeRange::new(
                self.period_start
                    + scaled_to_duration(
                        entry.time.saturating_sub(*presentation_time_offset),
                        *timescale,
                    ),
                scaled_to_duration(entry.duration, *timescale),
            ),
            _ => TimeRange::new(self.period_start, Duration::ZERO),
        }
    }

    fn media_url(&self, id: u64) -> Option<(Url, Option<ByteRange>)> {
        let (media, template, number, time) = match &self.addressing {
            Addressing::Numbered {
                media,
                template,
                start_number,
                duration,
                presentation_time_offset,
                ..
            } => (
                media,
                template,
                start_number + id,
                presentation_time_offset + id * duration,
            ),
            Addressing::Explicit {
                media,
                template,
                start_number,
                entries,
                ..
            } => (
                media,
                template,
                start_number + id,
                entries.get(usize::try_from(id).ok()?)?.time,
            ),
            Addressing::Single { url, range } => return Some((url.clone(), *range)),
        };

        let mut template = template.clone();
        template
            .insert(Template::NUMBER, number)
            .insert(Template::TIME, time);
        match Url::parse(&template.resolve(media)) {
            Ok(url) => Some((url, None)),
            Err(e) => {
                tracing::warn!(media, error = %e, "Invalid segment url");
                None
            }
        }
    }
}

impl SegmentTimeline for RepresentationTimeline {
    fn parameters(&self) -> &DocumentParameters {
        &self.parameters
    }

    fn init_segment(&self) -> Option<SegmentDescriptor> {
        let (url, byte_range) = self.init.clone()?;
        Some(SegmentDescriptor {
            id: None,
            url,
            byte_range,
            period: None,
            end_of_stream: false,
        })
    }

    fn start_segment_id(&self) -> Option<u64> {
        let (first, last) = self.available_bounds()?;
        if !self.parameters.dynamic {
            return Some(first);
        }

        let delay = self
            .parameters
            .suggested_presentation_delay
            .or(self.parameters.min_buffer_time)
            .unwrap_or(DEFAULT_LIVE_DELAY);
        let target = self.parameters.live_edge().saturating_sub(delay);
        let id = self.find(target, false).unwrap_or(last);
        Some(id.clamp(first, last))
    }

    fn first_available_segment_id(&self) -> Option<u64> {
        self.available_bounds().map(|(first, _)| first)
    }

    fn segment_id(&self, time: Duration) -> Option<u64> {
        self.find(time, false)
    }

    fn next_segment_id(&self, id: u64) -> Option<u64> {
        let next = id.checked_add(1)?;
        self.range(next).map(|_| next)
    }

    fn previous_segment_id(&self, id: u64) -> Option<u64> {
        let previous = id.checked_sub(1)?;
        self.range(previous).map(|_| previous)
    }

    fn next_segment_id_after(&self, time: Duration) -> Option<u64> {
        self.find(time, true)
    }

    fn segment_time_range(&self, id: u64) -> Option<TimeRange> {
        self.range(id)
    }

    fn media_segment(&self, id: u64) -> Option<SegmentDescriptor> {
        let range = self.range(id)?;
        if !self.is_available(&range) {
            return None;
        }

        let (url, byte_range) = self.media_url(id)?;
        Some(SegmentDescriptor {
            id: Some(id),
            url,
            byte_range,
            period: Some(range),
            end_of_stream: !self.parameters.dynamic && self.next_segment_id(id).is_none(),
        })
    }

    fn duration(&self) -> Option<Duration> {
        match &self.addressing {
            Addressing::Explicit { entries, .. } if self.period_duration.is_none() => {
                let last = entries.last()?;
                Some(self.entry_range(last).end().saturating_sub(self.period_start))
            }
            _ => self
                .period_duration
                .or(self.parameters.presentation_duration),
        }
    }

    fn segment_count(&self) -> Option<u64> {
        self.count()
    }
}
