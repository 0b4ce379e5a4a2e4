use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use dash_mpd::{SegmentBase, SegmentTemplate, MPD};
use url::Url;

use super::{
    base_url::{merge_baseurls, resolve_base},
    template::Template,
    timeline::{Addressing, RepresentationTimeline, TimelineEntry},
    AdaptationSet, Document, DocumentParameters, Period, Representation,
};
use crate::{
    error::{DashError, DashResult},
    util::range::ByteRange,
    StreamType,
};

impl Document {
    /// Parses MPD text downloaded from `url`.
    pub fn parse(text: &str, url: &Url, clock_offset: TimeDelta) -> DashResult<Self> {
        let mpd = dash_mpd::parse(text)?;
        Self::from_mpd(&mpd, url, clock_offset)
    }

    pub fn from_mpd(mpd: &MPD, url: &Url, clock_offset: TimeDelta) -> DashResult<Self> {
        let parameters = Arc::new(DocumentParameters {
            dynamic: mpd.mpdtype.as_deref() == Some("dynamic"),
            availability_start_time: mpd.availabilityStartTime,
            publish_time: mpd.publishTime,
            presentation_duration: mpd.mediaPresentationDuration,
            min_buffer_time: mpd.minBufferTime,
            minimum_update_period: mpd.minimumUpdatePeriod,
            time_shift_buffer_depth: mpd.timeShiftBufferDepth,
            suggested_presentation_delay: mpd.suggestedPresentationDelay,
            clock_offset,
        });
        let base = resolve_base(url, [mpd.base_url.first().map(|u| u.base.as_str())])?;

        let mut periods = Vec::with_capacity(mpd.periods.len());
        let mut previous_end = Some(Duration::ZERO);
        for (index, period) in mpd.periods.iter().enumerate() {
            // Period@start, else the end of the previous period, else zero
            // for the first one.
            let Some(start) = period.start.or(previous_end) else {
                tracing::warn!(index, "Skipping period without a resolvable start");
                continue;
            };
            let duration = period.duration.or_else(|| match mpd.periods.get(index + 1) {
                Some(next) => next.start.map(|next| next.saturating_sub(start)),
                None => parameters
                    .presentation_duration
                    .map(|total| total.saturating_sub(start)),
            });
            previous_end = duration.map(|duration| start + duration);

            let base = resolve_base(&base, [period.BaseURL.first().map(|u| u.base.as_str())])?;
            let scope = PeriodScope {
                parameters: &parameters,
                start,
                duration,
                segment_template: period.SegmentTemplate.as_ref(),
                segment_base: period.SegmentBase.as_ref(),
            };

            let mut adaptation_sets = Vec::with_capacity(period.adaptations.len());
            for (set_index, adaptation) in period.adaptations.iter().enumerate() {
                adaptation_sets.push(scope.adaptation_set(&base, set_index, adaptation)?);
            }

            periods.push(Period {
                id: period.id.clone(),
                start,
                duration,
                adaptation_sets,
            });
        }

        Ok(Self {
            parameters,
            periods,
        })
    }
}

struct PeriodScope<'a> {
    parameters: &'a Arc<DocumentParameters>,
    start: Duration,
    duration: Option<Duration>,
    segment_template: Option<&'a SegmentTemplate>,
    segment_base: Option<&'a SegmentBase>,
}

impl PeriodScope<'_> {
    fn adaptation_set(
        &self,
        base: &Url,
        set_index: usize,
        adaptation: &dash_mpd::AdaptationSet,
    ) -> DashResult<AdaptationSet> {
        let base = resolve_base(base, [adaptation.BaseURL.first().map(|u| u.base.as_str())])?;

        let first = adaptation.representations.first();
        let stream_type = stream_type_of(
            adaptation
                .contentType
                .as_deref()
                .or(adaptation.mimeType.as_deref())
                .or_else(|| first.and_then(|r| r.contentType.as_deref().or(r.mimeType.as_deref()))),
            adaptation
                .codecs
                .as_deref()
                .or_else(|| first.and_then(|r| r.codecs.as_deref())),
        );
        let is_main = adaptation
            .Role
            .iter()
            .any(|role| role.value.as_deref() == Some("main"));

        let mut representations = Vec::with_capacity(adaptation.representations.len());
        for (index, representation) in adaptation.representations.iter().enumerate() {
            let id = representation
                .id
                .clone()
                .unwrap_or_else(|| format!("{set_index}-{index}"));
            let base =
                resolve_base(&base, [representation.BaseURL.first().map(|u| u.base.as_str())])?;
            let bandwidth = representation.bandwidth.unwrap_or(0);

            let timeline = self.timeline(
                &base,
                &id,
                bandwidth,
                representation
                    .SegmentTemplate
                    .as_ref()
                    .or(adaptation.SegmentTemplate.as_ref())
                    .or(self.segment_template),
                representation
                    .SegmentBase
                    .as_ref()
                    .or(adaptation.SegmentBase.as_ref())
                    .or(self.segment_base),
            )?;

            representations.push(Arc::new(Representation {
                id,
                bandwidth,
                width: representation.width,
                height: representation.height,
                codecs: representation
                    .codecs
                    .clone()
                    .or_else(|| adaptation.codecs.clone()),
                mime_type: representation
                    .mimeType
                    .clone()
                    .or_else(|| adaptation.mimeType.clone()),
                lang: adaptation.lang.clone(),
                segments: Arc::new(timeline),
            }));
        }

        Ok(AdaptationSet {
            id: adaptation.id.as_ref().map(|id| id.to_string()),
            stream_type,
            lang: adaptation.lang.clone(),
            is_main,
            representations,
        })
    }

    fn timeline(
        &self,
        base: &Url,
        id: &str,
        bandwidth: u64,
        segment_template: Option<&SegmentTemplate>,
        segment_base: Option<&SegmentBase>,
    ) -> DashResult<RepresentationTimeline> {
        let mut timeline = RepresentationTimeline {
            parameters: self.parameters.clone(),
            period_start: self.start,
            period_duration: self.duration,
            availability_time_offset: Duration::ZERO,
            init: None,
            addressing: Addressing::Single {
                url: base.clone(),
                range: None,
            },
        };

        if let Some(segment_template) = segment_template {
            let mut template = Template::new();
            template
                .insert(Template::REPRESENTATION_ID, id)
                .insert(Template::BANDWIDTH, bandwidth);

            timeline.init = segment_template
                .initialization
                .as_deref()
                .map(|init| merge_baseurls(base, &template.resolve(init)))
                .transpose()?
                .map(|url| (url, None));
            timeline.availability_time_offset = segment_template
                .availabilityTimeOffset
                .filter(|offset| offset.is_finite() && *offset > 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or_default();

            let media = segment_template
                .media
                .as_deref()
                .ok_or_else(|| {
                    DashError::MpdParsing(format!("Missing media template in representation {id}"))
                })
                .and_then(|media| merge_baseurls(base, media))?
                .to_string();
            let start_number = segment_template.startNumber.unwrap_or(1);
            let timescale = segment_template.timescale.unwrap_or(1).max(1);
            let presentation_time_offset = segment_template.presentationTimeOffset.unwrap_or(0);

            timeline.addressing = if let Some(segment_timeline) = &segment_template.SegmentTimeline {
                let entries = self.expand_timeline(
                    &segment_timeline.segments,
                    timescale,
                    presentation_time_offset,
                );
                Addressing::Explicit {
                    media,
                    template,
                    start_number,
                    timescale,
                    presentation_time_offset,
                    entries,
                }
            } else if let Some(duration) = segment_template.duration {
                if !self.parameters.dynamic && self.duration.is_none() {
                    return Err(DashError::MpdParsing(format!(
                        "Cannot count segments of {id} without a period duration"
                    )));
                }
                Addressing::Numbered {
                    media,
                    template,
                    start_number,
                    timescale,
                    duration: (duration.round() as u64).max(1),
                    presentation_time_offset,
                }
            } else {
                return Err(DashError::MpdParsing(format!(
                    "SegmentTemplate of {id} has neither @duration nor SegmentTimeline"
                )));
            };
        } else if let Some(segment_base) = segment_base {
            // One resource; the initialization may be a byte range of it.
            if let Some(initialization) = &segment_base.Initialization {
                let url = initialization
                    .sourceURL
                    .as_deref()
                    .map(|source| merge_baseurls(base, source))
                    .transpose()?
                    .unwrap_or_else(|| base.clone());
                let range = initialization
                    .range
                    .as_deref()
                    .map(ByteRange::parse)
                    .transpose()?;

                let init_end = range.and_then(|range| range.last_byte());
                if let Some(last) = init_end.filter(|_| &url == base) {
                    timeline.addressing = Addressing::Single {
                        url: base.clone(),
                        range: Some(ByteRange::new(last + 1, None)),
                    };
                }
                timeline.init = Some((url, range));
            }
        }

        Ok(timeline)
    }

    /// Unrolls `S@r` repetitions into one entry per segment.
    fn expand_timeline(
        &self,
        segments: &[dash_mpd::S],
        timescale: u64,
        presentation_time_offset: u64,
    ) -> Vec<TimelineEntry> {
        let period_end = self.duration.map(|duration| {
            presentation_time_offset + duration_to_units(duration, timescale)
        });
        let live_end = self.parameters.dynamic.then(|| {
            let elapsed = self.parameters.live_edge().saturating_sub(self.start);
            presentation_time_offset + duration_to_units(elapsed, timescale)
        });

        let mut entries = Vec::new();
        let mut time = 0;
        for (index, segment) in segments.iter().enumerate() {
            if segment.d == 0 {
                tracing::warn!(index, "Ignoring zero-duration timeline entry");
                continue;
            }
            time = segment.t.unwrap_or(time);

            let repeat = match segment.r {
                Some(r) if r >= 0 => {
                    let repeat = r as u64;
                    match period_end.or(live_end) {
                        Some(end) => repeat.min(end.saturating_sub(time).div_ceil(segment.d).saturating_sub(1)),
                        None => repeat,
                    }
                }
                Some(_) => {
                    // Repeat until the next entry, the period end, or the live edge.
                    let until = segments
                        .get(index + 1)
                        .and_then(|next| next.t)
                        .or(period_end)
                        .or(live_end)
                        .unwrap_or(time + segment.d);
                    until.saturating_sub(time).div_ceil(segment.d).saturating_sub(1)
                }
                None => 0,
            };

            for _ in 0..=repeat {
                if entries.len() >= MAX_TIMELINE_ENTRIES {
                    tracing::warn!(entries = entries.len(), "Segment timeline truncated");
                    return entries;
                }
                entries.push(TimelineEntry {
                    time,
                    duration: segment.d,
                });
                let Some(next) = time.checked_add(segment.d) else {
                    tracing::warn!(time, "Segment timeline overflows");
                    return entries;
                };
                time = next;
            }
        }
        entries
    }
}

/// Upper bound on unrolled timeline entries of one representation.
const MAX_TIMELINE_ENTRIES: usize = 1 << 20;

fn duration_to_units(duration: Duration, timescale: u64) -> u64 {
    (duration.as_nanos() * timescale as u128 / 1_000_000_000).min(u64::MAX as u128) as u64
}

fn stream_type_of(content: Option<&str>, codecs: Option<&str>) -> Option<StreamType> {
    let content = content?;
    let text_codec = codecs.is_some_and(|codecs| {
        codecs.starts_with("stpp") || codecs.starts_with("wvtt")
    });
    if content.starts_with("video") {
        Some(StreamType::Video)
    } else if content.starts_with("audio") {
        Some(StreamType::Audio)
    } else if content.starts_with("text")
        || content == "application/ttml+xml"
        || (content == "application/mp4" && text_codec)
    {
        Some(StreamType::Subtitle)
    } else {
        None
    }
}
