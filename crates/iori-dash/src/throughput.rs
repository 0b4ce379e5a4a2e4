use std::{collections::VecDeque, sync::Mutex, time::Duration};

const MAX_SAMPLES: usize = 20;
const AVERAGE_SAMPLE_AMOUNT: usize = 4;
const MIN_SAMPLES: usize = 2;
const OUTLIER_RATIO: f64 = 1.3;

/// Rolling history of segment download throughput, shared by every stream
/// of a player.
#[derive(Debug, Default)]
pub struct ThroughputHistory {
    /// Bits per second, most recent first.
    samples: Mutex<VecDeque<f64>>,
}

impl ThroughputHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one finished transfer. Zero-length durations carry no
    /// information and are ignored.
    pub fn push(&self, bytes: usize, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }

        let bps = 8.0 * bytes as f64 / elapsed.as_secs_f64();
        let mut samples = self.lock();
        samples.push_front(bps);
        samples.truncate(MAX_SAMPLES);
        tracing::trace!(bytes, ?elapsed, bps, "throughput sample recorded");
    }

    /// Smoothed throughput in bits per second, or 0 with fewer than two
    /// samples.
    pub fn average(&self) -> f64 {
        let samples = self.lock();
        let count = averaging_window(&samples);
        if count == 0 {
            return 0.0;
        }
        samples.iter().take(count).sum::<f64>() / count as f64
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn reset(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<f64>> {
        self.samples
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Number of most recent samples to average. The default window grows by
/// one for every adjacent pair inside it whose ratio is an outlier.
fn averaging_window(samples: &VecDeque<f64>) -> usize {
    let total = samples.len();
    if total < MIN_SAMPLES {
        return 0;
    }
    if total <= AVERAGE_SAMPLE_AMOUNT {
        return total;
    }

    let mut window = AVERAGE_SAMPLE_AMOUNT;
    let mut i = 0;
    while i + 1 < window {
        let ratio = samples[i] / samples[i + 1];
        if ratio >= OUTLIER_RATIO || ratio <= 1.0 / OUTLIER_RATIO {
            window += 1;
            if window == total {
                break;
            }
        }
        i += 1;
    }
    window
}
