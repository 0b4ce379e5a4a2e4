//! Adaptive MPEG-DASH playback client.
//!
//! ```text
//!  ┌──────────────────┐  Period   ┌───────────────┐  Representation  ┌────────────┐
//!  │ ManifestRefresher├──────────►│ MediaPipeline ├─────────────────►│ DashClient │
//!  └──────────────────┘           └──────┬────────┘                  └─────┬──────┘
//!                                        │ StreamSelection                 │ DownloadRequest
//!                                        ▼                                 ▼
//!                              ┌────────────────────┐  samples  ┌───────────────────┐
//!                              │ ThroughputHistory  │◄──────────┤ SegmentDownloader │
//!                              └────────────────────┘           └───────────────────┘
//! ```
//!
//! One [`client::DashClient`] runs per stream type. Each client owns a single
//! download loop that keeps `buffered - playback <= time buffer depth`,
//! swaps representations only between segments and pushes bytes to a
//! [`sink::MediaSink`] in timeline order. [`player::DashPlayer`] ties the
//! pieces together and is the surface an application talks to.

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod event;
pub mod manifest;
pub mod pipeline;
pub mod player;
pub mod refresh;
pub mod selector;
pub mod sink;
pub mod throughput;
pub mod util;

use std::fmt;

use serde::Serialize;

pub use client::{ClientStatus, DashClient, SeekResolution};
pub use config::DashConfig;
pub use error::{DashError, DashResult};
pub use event::{EventReceiver, EventSender, PlayerEvent};
pub use player::{DashPlayer, DashPlayerBuilder};
pub use selector::{FixedSelector, RepresentationSelector, StreamGroup, ThroughputSelector};
pub use sink::{ChannelSink, MediaSink, SinkData};
pub use throughput::ThroughputHistory;
pub use util::{http::HttpClient, range::ByteRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
    /// Listed only; never downloaded.
    Subtitle,
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamType::Audio => write!(f, "audio"),
            StreamType::Video => write!(f, "video"),
            StreamType::Subtitle => write!(f, "subtitle"),
        }
    }
}
