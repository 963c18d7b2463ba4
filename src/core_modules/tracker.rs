// THEORY:
// The `tracker` module gives the perception path "object permanence" across
// scan lines. A line-scan sensor never sees an object whole; it sees one slice
// per line. The `BlobTracker` stitches those slices back together.
//
// This module solves the line-to-line data association problem with segment
// overlap rather than per-pixel flood fill:
//
// 1.  **Run-length encoding**: each label line is reduced to its segments.
// 2.  **Matching**: every active blob is tested against every segment. Overlap
//     is judged on the blob's global x-range widened by a pixel tolerance, which
//     absorbs edge jitter and diagonal drift. One segment may feed several
//     blobs, and one blob may swallow several segments of the same line.
// 3.  **Birth**: a segment nobody claimed becomes a new `ActiveBlob`.
// 4.  **Death**: a blob unseen for more than `line_gap_tolerance` lines is
//     retired. Only blobs with at least `min_pixels` of evidence are reported;
//     this is the single noise filter between classification and ejection.
//
// Cost is O(blobs x segments) per line, both small compared to line width.
// The tracker owns its id counter, so independent instances never share ids,
// and all working buffers are sized once to the line width.

use crate::core_modules::active_blob::{ActiveBlob, ClosedBlob};
use crate::core_modules::classification::ClassLabelLine;
use crate::core_modules::segment::SegmentBuffer;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Tuning for association and noise rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum accumulated pixels for a closed blob to be reported.
    pub min_pixels: u64,
    /// Lines a blob may go unmatched before it is closed.
    pub line_gap_tolerance: u64,
    /// Pixels by which a blob's x-range is widened on both sides when matching.
    pub pixel_overlap_tolerance: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_pixels: 20,
            line_gap_tolerance: 2,
            pixel_overlap_tolerance: 2,
        }
    }
}

/// Associates segments across scan lines and reports objects that have passed.
pub struct BlobTracker {
    config: TrackerConfig,
    /// Objects currently crossing the sensor.
    active_blobs: Vec<ActiveBlob>,
    /// Segments of the line being processed.
    segments: SegmentBuffer,
    /// Per-segment "claimed by some blob" flags for the line being processed.
    matched: Vec<bool>,
    /// Blobs closed on the line being processed.
    closed: Vec<ClosedBlob>,
    /// Next id to hand out.
    next_id: u64,
}

impl BlobTracker {
    pub fn new(config: TrackerConfig, width: usize) -> Self {
        Self {
            config,
            active_blobs: Vec::new(),
            segments: SegmentBuffer::with_width(width),
            matched: Vec::with_capacity(width),
            closed: Vec::new(),
            next_id: 0,
        }
    }

    /// Drops every active blob and restarts ids at zero.
    pub fn reset(&mut self) {
        self.active_blobs.clear();
        self.closed.clear();
        self.next_id = 0;
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn active_blobs(&self) -> &[ActiveBlob] {
        &self.active_blobs
    }

    /// Advances the tracker by one scan line and returns the blobs that closed on it.
    ///
    /// Lines must arrive in strictly increasing `line_index` order.
    pub fn process_line(&mut self, line_index: u64, labels: &ClassLabelLine) -> &[ClosedBlob] {
        self.closed.clear();

        // --- 1. Run-length encoding ---
        let segments = self.segments.encode(labels.as_slice());
        self.matched.clear();
        self.matched.resize(segments.len(), false);

        // --- 2. Matching ---
        let tolerance = self.config.pixel_overlap_tolerance;
        for blob in self.active_blobs.iter_mut() {
            blob.begin_line();
            // Bounds as of the previous line; segments absorbed below do not widen them.
            let (start_x, end_x) = (blob.start_x, blob.end_x);
            for (segment, claimed) in segments.iter().zip(self.matched.iter_mut()) {
                if segment.overlaps(start_x, end_x, tolerance) {
                    blob.absorb(line_index, segment);
                    *claimed = true;
                }
            }
        }

        // --- 3. Birth ---
        for (segment, _) in segments
            .iter()
            .zip(self.matched.iter())
            .filter(|(_, claimed)| !**claimed)
        {
            let id = self.next_id;
            self.next_id += 1;
            trace!(id, line = line_index, start_x = segment.start_x, end_x = segment.end_x, "blob spawned");
            self.active_blobs.push(ActiveBlob::spawn(id, line_index, segment));
        }

        // --- 4. Death ---
        let gap = self.config.line_gap_tolerance;
        let min_pixels = self.config.min_pixels;
        let closed = &mut self.closed;
        self.active_blobs.retain(|blob| {
            if line_index.saturating_sub(blob.last_seen_line) <= gap {
                return true;
            }
            if blob.total_pixels() < min_pixels {
                trace!(id = blob.id, pixels = blob.total_pixels(), "blob rejected as noise");
                return false;
            }
            match blob.close() {
                Some(summary) => {
                    debug!(
                        id = summary.id,
                        class = summary.class_id,
                        pixels = summary.total_pixels,
                        lines = summary.length(),
                        "blob closed"
                    );
                    closed.push(summary);
                }
                None => trace!(id = blob.id, "blob closed without votes"),
            }
            false
        });

        &self.closed
    }
}
