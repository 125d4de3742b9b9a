//! Batch payload compression with an adaptive floor (spec §4.4
//! "Compression"): below `compressionThreshold` bytes, payloads go out
//! uncompressed; an adaptive mode tracks the historical compression
//! ratio and turns compression off once it stops paying for itself.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use crate::config::{CompressionAlgorithm, PublisherCompressionConfig};

const RATIO_HISTORY_WINDOW: usize = 32;

pub struct Compressor {
    config: PublisherCompressionConfig,
    ratio_history: Mutex<Vec<f64>>,
}

/// `None` means the payload was sent as-is; `Some(algorithm)` matches
/// the outgoing `compressed=<algorithm>` attribute (spec §4.4).
pub type CompressedTag = Option<&'static str>;

impl Compressor {
    pub fn new(config: PublisherCompressionConfig) -> Self {
        Self { config, ratio_history: Mutex::new(Vec::with_capacity(RATIO_HISTORY_WINDOW)) }
    }

    /// Returns the bytes to actually send (possibly compressed) and the
    /// attribute tag to record alongside them.
    pub fn compress(&self, payload: &[u8]) -> (Vec<u8>, CompressedTag) {
        if !self.config.enabled || payload.len() < self.config.threshold {
            return (payload.to_vec(), None);
        }
        if matches!(self.config.algorithm, CompressionAlgorithm::None) {
            return (payload.to_vec(), None);
        }
        if self.adaptive_mode_disabled() {
            return (payload.to_vec(), None);
        }

        let compressed = gzip(payload);
        let ratio = compressed.len() as f64 / payload.len() as f64;
        self.record_ratio(ratio);
        (compressed, Some("gzip"))
    }

    fn adaptive_mode_disabled(&self) -> bool {
        let Some(floor) = self.config.adaptive_floor_ratio else { return false };
        let history = self.ratio_history.lock();
        if history.len() < RATIO_HISTORY_WINDOW {
            return false; // not enough history to judge yet
        }
        let average = history.iter().sum::<f64>() / history.len() as f64;
        // a ratio *above* the floor means compression barely shrinks the
        // payload; disable it once average effectiveness falls below par.
        average > floor
    }

    fn record_ratio(&self, ratio: f64) {
        let mut history = self.ratio_history.lock();
        if history.len() == RATIO_HISTORY_WINDOW {
            history.remove(0);
        }
        history.push(ratio);
    }
}

fn gzip(payload: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).expect("writing to an in-memory encoder cannot fail");
    encoder.finish().expect("finishing an in-memory encoder cannot fail")
}
