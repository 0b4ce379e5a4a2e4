use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::{manifest::Representation, throughput::ThroughputHistory, StreamType};

/// Chooses a stream of a group.
pub trait RepresentationSelector: Send + Sync {
    /// Index into `group.streams`, or `None` for an empty group.
    fn select(&self, group: &StreamGroup) -> Option<usize>;

    /// Adaptive selectors are consulted again at every segment boundary.
    fn is_adaptive(&self) -> bool {
        true
    }
}

/// Highest bitrate strictly below the measured throughput, else the lowest.
pub struct ThroughputSelector {
    throughput: Arc<ThroughputHistory>,
}

impl ThroughputSelector {
    pub fn new(throughput: Arc<ThroughputHistory>) -> Self {
        Self { throughput }
    }
}

impl RepresentationSelector for ThroughputSelector {
    fn select(&self, group: &StreamGroup) -> Option<usize> {
        select_by_throughput(group, self.throughput.average())
    }
}

/// User override pinning one stream.
pub struct FixedSelector(pub usize);

impl RepresentationSelector for FixedSelector {
    fn select(&self, group: &StreamGroup) -> Option<usize> {
        (self.0 < group.streams.len()).then_some(self.0)
    }

    fn is_adaptive(&self) -> bool {
        false
    }
}

fn select_by_throughput(group: &StreamGroup, throughput: f64) -> Option<usize> {
    let below = group
        .streams
        .iter()
        .filter(|stream| (stream.bandwidth as f64) < throughput)
        .max_by_key(|stream| stream.bandwidth);
    let lowest = || group.streams.iter().min_by_key(|stream| stream.bandwidth);

    below.or_else(lowest).map(|stream| stream.index)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamDescription {
    pub index: usize,
    pub id: String,
    pub bandwidth: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
    pub codecs: Option<String>,
    pub lang: Option<String>,
}

impl StreamDescription {
    pub(crate) fn new(index: usize, representation: &Representation) -> Self {
        Self {
            index,
            id: representation.id.clone(),
            bandwidth: representation.bandwidth,
            width: representation.width,
            height: representation.height,
            codecs: representation.codecs.clone(),
            lang: representation.lang.clone(),
        }
    }
}

/// Streams of one type available in the current period, highest bandwidth
/// first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamGroup {
    pub stream_type: StreamType,
    pub streams: Vec<StreamDescription>,
    pub selected: Option<usize>,
}

/// The available streams of one pipeline together with the policy that
/// picks among them. Shared between a pipeline and its client.
pub struct StreamSelection {
    stream_type: StreamType,
    streams: RwLock<Vec<Arc<Representation>>>,
    selector: RwLock<Option<Arc<dyn RepresentationSelector>>>,
    throughput: Arc<ThroughputHistory>,
}

impl StreamSelection {
    pub fn new(
        stream_type: StreamType,
        throughput: Arc<ThroughputHistory>,
        selector: Option<Arc<dyn RepresentationSelector>>,
    ) -> Self {
        Self {
            stream_type,
            streams: RwLock::new(Vec::new()),
            selector: RwLock::new(selector),
            throughput,
        }
    }

    /// Selection driven by a [`ThroughputSelector`] on the given history.
    pub fn adaptive(stream_type: StreamType, throughput: Arc<ThroughputHistory>) -> Self {
        let selector = Arc::new(ThroughputSelector::new(throughput.clone()));
        Self::new(stream_type, throughput, Some(selector))
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn set_streams(&self, mut streams: Vec<Arc<Representation>>) {
        streams.sort_by(|a, b| b.bandwidth.cmp(&a.bandwidth));
        *self.streams.write().unwrap_or_else(|e| e.into_inner()) = streams;
    }

    pub fn streams(&self) -> Vec<Arc<Representation>> {
        self.streams.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stream(&self, index: usize) -> Option<Arc<Representation>> {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(index)
            .cloned()
    }

    pub fn lowest(&self) -> Option<Arc<Representation>> {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .cloned()
    }

    pub fn group(&self, current: Option<&str>) -> StreamGroup {
        let streams = self.streams();
        StreamGroup {
            stream_type: self.stream_type,
            selected: current.and_then(|id| streams.iter().position(|s| s.id == id)),
            streams: streams
                .iter()
                .enumerate()
                .map(|(index, stream)| StreamDescription::new(index, stream))
                .collect(),
        }
    }

    pub fn set_selector(&self, selector: Option<Arc<dyn RepresentationSelector>>) {
        *self.selector.write().unwrap_or_else(|e| e.into_inner()) = selector;
    }

    pub fn selector(&self) -> Option<Arc<dyn RepresentationSelector>> {
        self.selector
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_adaptive(&self) -> bool {
        self.selector().is_some_and(|selector| selector.is_adaptive())
    }

    /// Representation the adaptive policy prefers over `current`, if any.
    pub fn adapt(&self, current: &Representation) -> Option<Arc<Representation>> {
        let selector = self.selector().filter(|selector| selector.is_adaptive())?;
        if self.throughput.average() <= 0.0 {
            return None;
        }

        let group = self.group(Some(&current.id));
        let index = selector.select(&group)?;
        let candidate = self.stream(index)?;
        if candidate.id == current.id {
            return None;
        }

        tracing::info!(
            stream = %self.stream_type,
            from = %current.id,
            to = %candidate.id,
            bandwidth = candidate.bandwidth,
            throughput = self.throughput.average(),
            "Adapting to network conditions"
        );
        Some(candidate)
    }
}
