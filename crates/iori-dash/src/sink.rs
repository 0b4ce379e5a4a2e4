use bytes::Bytes;
use tokio::sync::mpsc;

/// Downstream consumer of one stream's bytes, usually a demuxer.
///
/// Chunks arrive in timeline order. `write_end_of_stream` is only called after
/// at least one `write_data`.
pub trait MediaSink: Send + Sync {
    fn write_data(&self, data: Bytes);

    fn write_end_of_stream(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkData {
    Data(Bytes),
    EndOfStream,
}

/// Forwards chunks into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink(mpsc::UnboundedSender<SinkData>);

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkData>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self(sender), receiver)
    }
}

impl MediaSink for ChannelSink {
    fn write_data(&self, data: Bytes) {
        if self.0.send(SinkData::Data(data)).is_err() {
            tracing::debug!("sink receiver dropped, discarding data");
        }
    }

    fn write_end_of_stream(&self) {
        let _ = self.0.send(SinkData::EndOfStream);
    }
}
