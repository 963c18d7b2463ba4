// THEORY:
// An `ActiveBlob` is one physical object crossing the sensor, assembled line
// by line from the segments that overlap it. Where a frame camera sees a whole
// object at once, a line-scan sensor only ever sees a thin slice, so the blob
// has to accumulate everything incrementally:
//
// 1.  **Extent**: a global `[start_x, end_x]` bounding range plus the first,
//     last and most recently matched scan lines.
// 2.  **Evidence**: a per-class vote histogram (pixel counts) and the total
//     pixel count. The winning class is decided only when the blob closes.
// 3.  **Centroid**: running first moments in x and y. Storing sums instead of
//     pixel positions keeps the per-line update O(1) per segment.
// 4.  **Contour**: the segments matched on the current and the previous line,
//     kept only so that external views can draw the object's outline.
//
// When the tracker retires a blob it freezes it into a `ClosedBlob`, an owned
// summary the ejection planner can consume without touching tracker state.

use crate::core_modules::segment::Segment;

/// A tracked object in flight.
#[derive(Debug, Clone)]
pub struct ActiveBlob {
    /// Identifier unique within the tracker instance that created it.
    pub id: u64,
    /// Leftmost pixel ever matched.
    pub start_x: usize,
    /// Rightmost pixel ever matched.
    pub end_x: usize,
    /// Segments matched on the line just processed.
    pub current_segments: Vec<Segment>,
    /// Segments matched on the line before that.
    pub prev_segments: Vec<Segment>,
    /// Line on which the blob was spawned.
    pub start_line: u64,
    /// Latest line on which the blob was matched.
    pub end_line: u64,
    /// Line of the most recent match, used for gap-based closing.
    pub last_seen_line: u64,
    /// Pixel count per class index.
    votes: Vec<u64>,
    /// Sum of every vote ever added.
    total_pixels: u64,
    /// Sum of x over every matched pixel.
    moment_x: f64,
    /// Sum of line index over every matched pixel.
    moment_y: f64,
}

impl ActiveBlob {
    /// Starts a blob from an unmatched segment.
    pub fn spawn(id: u64, line_index: u64, segment: &Segment) -> Self {
        let mut blob = Self {
            id,
            start_x: segment.start_x,
            end_x: segment.end_x,
            current_segments: Vec::new(),
            prev_segments: Vec::new(),
            start_line: line_index,
            end_line: line_index,
            last_seen_line: line_index,
            votes: Vec::new(),
            total_pixels: 0,
            moment_x: 0.0,
            moment_y: 0.0,
        };
        blob.absorb(line_index, segment);
        blob
    }

    /// Rolls the contour snapshot forward before a new line is matched.
    pub(crate) fn begin_line(&mut self) {
        std::mem::swap(&mut self.prev_segments, &mut self.current_segments);
        self.current_segments.clear();
    }

    /// Folds a matched segment into extent, evidence and moments.
    pub(crate) fn absorb(&mut self, line_index: u64, segment: &Segment) {
        self.start_x = self.start_x.min(segment.start_x);
        self.end_x = self.end_x.max(segment.end_x);
        self.end_line = self.end_line.max(line_index);
        self.last_seen_line = self.last_seen_line.max(line_index);

        let count = segment.pixel_count() as u64;
        self.add_votes(segment.class_id, count);
        self.moment_x += segment.moment_x();
        self.moment_y += line_index as f64 * count as f64;
        self.current_segments.push(*segment);
    }

    /// Adds `count` pixels of evidence for `class_id`. Background is ignored.
    pub fn add_votes(&mut self, class_id: i32, count: u64) {
        if class_id < 0 || count == 0 {
            return;
        }
        let class = class_id as usize;
        if self.votes.len() <= class {
            self.votes.resize(class + 1, 0);
        }
        self.votes[class] += count;
        self.total_pixels += count;
    }

    pub fn votes(&self) -> &[u64] {
        &self.votes
    }

    pub fn total_pixels(&self) -> u64 {
        self.total_pixels
    }

    /// Class with the most votes; ties go to the lowest index. `None` without votes.
    pub fn winning_class(&self) -> Option<i32> {
        let mut winner = None;
        let mut best = 0;
        for (class, &count) in self.votes.iter().enumerate() {
            if count > best {
                best = count;
                winner = Some(class as i32);
            }
        }
        winner
    }

    /// Pixel-weighted mean x, or the bounding-box midpoint without pixels.
    pub fn center_x(&self) -> f64 {
        if self.total_pixels == 0 {
            return (self.start_x + self.end_x) as f64 / 2.0;
        }
        self.moment_x / self.total_pixels as f64
    }

    /// Pixel-weighted mean line index, or the line-range midpoint without pixels.
    pub fn center_y(&self) -> f64 {
        if self.total_pixels == 0 {
            return (self.start_line + self.end_line) as f64 / 2.0;
        }
        self.moment_y / self.total_pixels as f64
    }

    pub fn width(&self) -> usize {
        self.end_x - self.start_x + 1
    }

    /// Number of scan lines spanned.
    pub fn length(&self) -> u64 {
        self.end_line - self.start_line + 1
    }

    /// Combines another blob into this one: bounds, votes, moments and contour.
    /// The tracker never calls this itself; it is a building block for callers
    /// that reunite blobs split by noise.
    pub fn merge_from(&mut self, other: &ActiveBlob) {
        self.start_x = self.start_x.min(other.start_x);
        self.end_x = self.end_x.max(other.end_x);
        self.start_line = self.start_line.min(other.start_line);
        self.end_line = self.end_line.max(other.end_line);
        self.last_seen_line = self.last_seen_line.max(other.last_seen_line);

        for (class, &count) in other.votes.iter().enumerate() {
            self.add_votes(class as i32, count);
        }
        self.moment_x += other.moment_x;
        self.moment_y += other.moment_y;
        self.current_segments.extend_from_slice(&other.current_segments);
        self.prev_segments.extend_from_slice(&other.prev_segments);
    }

    /// Freezes the blob into a summary. `None` when it never collected a vote.
    pub fn close(&self) -> Option<ClosedBlob> {
        let class_id = self.winning_class()?;
        Some(ClosedBlob {
            id: self.id,
            class_id,
            start_x: self.start_x,
            end_x: self.end_x,
            start_line: self.start_line,
            end_line: self.end_line,
            center_x: self.center_x(),
            center_y: self.center_y(),
            total_pixels: self.total_pixels,
            votes: self.votes.clone(),
        })
    }
}

/// An object that has finished crossing the sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedBlob {
    pub id: u64,
    /// Winning class of the vote histogram.
    pub class_id: i32,
    pub start_x: usize,
    pub end_x: usize,
    pub start_line: u64,
    pub end_line: u64,
    /// Pixel-weighted centroid, x in pixels.
    pub center_x: f64,
    /// Pixel-weighted centroid, y as a (fractional) line index.
    pub center_y: f64,
    pub total_pixels: u64,
    pub votes: Vec<u64>,
}

impl ClosedBlob {
    pub fn width(&self) -> usize {
        self.end_x - self.start_x + 1
    }

    pub fn length(&self) -> u64 {
        self.end_line - self.start_line + 1
    }
}
