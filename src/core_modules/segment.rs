// THEORY:
// A `Segment` is the unit of spatial grouping for a line-scan sensor: a
// contiguous run of pixels in one scan line that all carry the same class.
// Run-length encoding a label line into segments turns "hundreds of pixels"
// into "a handful of runs", which is what makes segment-overlap tracking so
// much cheaper than per-pixel connected-component labelling.
//
// Segments are ephemeral. They live in a `SegmentBuffer` that is sized to the
// line width once (a line can never hold more runs than pixels) and rewritten
// for every scan line.

/// A run `[start_x, end_x]` of identical, non-background class within one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start_x: usize,
    pub end_x: usize,
    pub class_id: i32,
}

impl Segment {
    pub fn pixel_count(&self) -> usize {
        self.end_x - self.start_x + 1
    }

    /// Sum of x over every pixel in the run.
    pub fn moment_x(&self) -> f64 {
        (self.start_x + self.end_x) as f64 * self.pixel_count() as f64 / 2.0
    }

    /// Overlap test against an extent widened by `tolerance` pixels on both sides.
    pub fn overlaps(&self, start_x: usize, end_x: usize, tolerance: usize) -> bool {
        start_x.saturating_sub(tolerance) <= self.end_x && self.start_x <= end_x + tolerance
    }
}

/// Reusable storage for the segments of one line.
#[derive(Debug, Clone)]
pub struct SegmentBuffer {
    segments: Vec<Segment>,
}

impl SegmentBuffer {
    pub fn with_width(width: usize) -> Self {
        Self {
            segments: Vec::with_capacity(width),
        }
    }

    /// Run-length encodes `labels`, left to right. Background (negative) pixels
    /// terminate runs and never appear in a segment.
    pub fn encode(&mut self, labels: &[i32]) -> &[Segment] {
        self.segments.clear();

        let mut x = 0;
        while x < labels.len() {
            let class_id = labels[x];
            if class_id < 0 {
                x += 1;
                continue;
            }
            let start_x = x;
            while x + 1 < labels.len() && labels[x + 1] == class_id {
                x += 1;
            }
            self.segments.push(Segment {
                start_x,
                end_x: x,
                class_id,
            });
            x += 1;
        }
        &self.segments
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_runs_of_identical_class() {
        let mut buffer = SegmentBuffer::with_width(10);
        let labels = [-1, 2, 2, 3, 3, 3, -1, -1, 2, 2];
        let segments = buffer.encode(&labels);
        assert_eq!(
            segments,
            &[
                Segment { start_x: 1, end_x: 2, class_id: 2 },
                Segment { start_x: 3, end_x: 5, class_id: 3 },
                Segment { start_x: 8, end_x: 9, class_id: 2 },
            ]
        );
        assert_eq!(segments[1].pixel_count(), 3);
        assert_eq!(segments[1].moment_x(), 12.0);
    }

    #[test]
    fn segments_partition_the_foreground_exactly() {
        let mut buffer = SegmentBuffer::with_width(64);
        let labels: Vec<i32> = (0..64)
            .map(|x: i32| match x % 11 {
                0 | 1 => -1,
                2..=5 => 0,
                6 => 4,
                _ => (x % 3) - 1,
            })
            .collect();
        let segments = buffer.encode(&labels);

        let mut covered = vec![false; labels.len()];
        let mut previous_end: Option<usize> = None;
        for segment in segments {
            if let Some(end) = previous_end {
                assert!(segment.start_x > end, "segments overlap or are unordered");
            }
            previous_end = Some(segment.end_x);
            for x in segment.start_x..=segment.end_x {
                assert_eq!(labels[x], segment.class_id);
                covered[x] = true;
            }
        }
        for (x, &label) in labels.iter().enumerate() {
            assert_eq!(covered[x], label >= 0, "pixel {x}");
        }
    }

    #[test]
    fn empty_and_all_background_lines_have_no_segments() {
        let mut buffer = SegmentBuffer::with_width(4);
        assert!(buffer.encode(&[]).is_empty());
        assert!(buffer.encode(&[-1, -1, -1, -1]).is_empty());
        assert_eq!(buffer.encode(&[7]).len(), 1);
    }

    #[test]
    fn overlap_honours_tolerance() {
        let segment = Segment { start_x: 10, end_x: 12, class_id: 0 };
        assert!(segment.overlaps(12, 20, 0));
        assert!(!segment.overlaps(14, 20, 0));
        assert!(segment.overlaps(14, 20, 2));
        assert!(segment.overlaps(0, 8, 2));
        assert!(!segment.overlaps(0, 7, 2));
    }
}
