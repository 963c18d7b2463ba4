// THEORY:
// The `pipeline` module is the top-level, single-threaded API of the decision
// core. It wires the stages together in the order the material travels:
//
//   raw line -> ClassificationPipeline -> ClassLabelLine -> BlobTracker
//            -> closed blobs -> EjectionPlanner -> ejection commands
//
// One call processes one scan line and hands back a `LineReport` that borrows
// the pipeline's own buffers, so steady-state operation allocates nothing
// beyond the occasional command. Line indices are assigned here and only ever
// increase. Hardware is deliberately absent: commands leave this module as
// plain data and `live_pipeline` decides how to deliver them.

use crate::config::SorterConfig;
use crate::core_modules::active_blob::ClosedBlob;
use crate::core_modules::classification::{ClassLabelLine, ClassificationPipeline};
use crate::core_modules::classifier::ClassifierModel;
use crate::core_modules::ejection::{EjectionCommand, EjectionPlanner};
use crate::core_modules::line_source::LineSource;
use crate::core_modules::spectrum::Reflectance;
use crate::core_modules::tracker::BlobTracker;
use crate::error::ConfigError;
use std::collections::VecDeque;
use tracing::debug;

/// Everything that happened on one scan line.
#[derive(Debug)]
pub struct LineReport<'a> {
    pub line_index: u64,
    pub labels: &'a ClassLabelLine,
    /// Objects that finished on this line and passed the noise filter.
    pub closed: &'a [ClosedBlob],
    /// Ejections planned for those objects.
    pub commands: &'a [EjectionCommand],
}

/// Running totals since construction or the last reset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub lines: u64,
    pub blobs_closed: u64,
    pub commands_planned: u64,
}

/// Tracker and planner, kept apart from classification so a label line
/// borrowed from the classifier can be fed in directly.
struct ObjectStage {
    tracker: BlobTracker,
    planner: EjectionPlanner,
    commands: Vec<EjectionCommand>,
}

impl ObjectStage {
    fn advance(&mut self, line_index: u64, labels: &ClassLabelLine) -> (&[ClosedBlob], &[EjectionCommand]) {
        let closed = self.tracker.process_line(line_index, labels);
        self.commands.clear();
        self.commands
            .extend(closed.iter().filter_map(|blob| self.planner.process(blob)));
        if !self.commands.is_empty() {
            debug!(line = line_index, commands = self.commands.len(), "ejections planned");
        }
        (closed, &self.commands)
    }
}

pub struct SortingPipeline {
    classification: ClassificationPipeline,
    objects: ObjectStage,
    next_line: u64,
    stats: PipelineStats,
    /// Most recent label lines, oldest first. Empty unless enabled.
    history: VecDeque<ClassLabelLine>,
    history_length: usize,
}

impl SortingPipeline {
    /// Builds every stage for a line of `config.ejection.sensor_width` pixels.
    pub fn new(model: &ClassifierModel, config: &SorterConfig) -> Result<Self, ConfigError> {
        let width = config.ejection.sensor_width;
        let classification = ClassificationPipeline::new(model, config.classifier.confidence_threshold, width)?;
        Ok(Self {
            classification,
            objects: ObjectStage {
                tracker: BlobTracker::new(config.tracker, width),
                planner: EjectionPlanner::new(config.ejection.clone())?,
                commands: Vec::new(),
            },
            next_line: 0,
            stats: PipelineStats::default(),
            history: VecDeque::new(),
            history_length: 0,
        })
    }

    /// Loads the model named in the configuration, then builds the pipeline.
    pub fn from_config(config: &SorterConfig) -> Result<Self, ConfigError> {
        let model = ClassifierModel::load(&config.classifier.model_path)?;
        Self::new(&model, config)
    }

    /// Keeps the last `lines` label lines for inspection.
    pub fn with_label_history(mut self, lines: usize) -> Self {
        self.history_length = lines;
        self.history = VecDeque::with_capacity(lines);
        self
    }

    pub fn width(&self) -> usize {
        self.classification.width()
    }

    pub fn band_count(&self) -> usize {
        self.classification.band_count()
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    pub fn label_history(&self) -> impl Iterator<Item = &ClassLabelLine> {
        self.history.iter()
    }

    /// Fails if `source` does not produce lines this pipeline can consume.
    pub fn check_source(&self, source: &dyn LineSource) -> Result<(), ConfigError> {
        self.classification.check_band_count(source.band_count())?;
        if source.width() != self.width() {
            return Err(ConfigError::Validation(format!(
                "line source is {} pixels wide, sensor_width is {}",
                source.width(),
                self.width()
            )));
        }
        Ok(())
    }

    /// Classifies, tracks and plans one raw line (pixel-major, `width * band_count` values).
    pub fn process_line(&mut self, raw_line: &[Reflectance]) -> LineReport<'_> {
        let line_index = self.take_line_index();
        let labels = self.classification.process_line(raw_line);
        Self::remember(&mut self.history, self.history_length, labels);
        let (closed, commands) = self.objects.advance(line_index, labels);
        Self::count(&mut self.stats, closed, commands);
        LineReport {
            line_index,
            labels,
            closed,
            commands,
        }
    }

    /// Tracks and plans a line that was classified elsewhere.
    pub fn process_labels<'a>(&'a mut self, labels: &'a ClassLabelLine) -> LineReport<'a> {
        let line_index = self.take_line_index();
        Self::remember(&mut self.history, self.history_length, labels);
        let (closed, commands) = self.objects.advance(line_index, labels);
        Self::count(&mut self.stats, closed, commands);
        LineReport {
            line_index,
            labels,
            closed,
            commands,
        }
    }

    /// Forgets every tracked object and restarts line numbering.
    pub fn reset(&mut self) {
        self.objects.tracker.reset();
        self.objects.commands.clear();
        self.history.clear();
        self.next_line = 0;
        self.stats = PipelineStats::default();
    }

    fn take_line_index(&mut self) -> u64 {
        let index = self.next_line;
        self.next_line += 1;
        index
    }

    fn remember(history: &mut VecDeque<ClassLabelLine>, length: usize, labels: &ClassLabelLine) {
        if length == 0 {
            return;
        }
        if history.len() < length {
            history.push_back(labels.clone());
            return;
        }
        // Window full: recycle the oldest buffer.
        if let Some(mut oldest) = history.pop_front() {
            oldest.clone_from(labels);
            history.push_back(oldest);
        }
    }

    fn count(stats: &mut PipelineStats, closed: &[ClosedBlob], commands: &[EjectionCommand]) {
        stats.lines += 1;
        stats.blobs_closed += closed.len() as u64;
        stats.commands_planned += commands.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::line_source::MemoryLineSource;
    use crate::core_modules::spectrum::Preprocessing;
    use crate::core_modules::tracker::TrackerConfig;
    use std::time::Duration;

    const WIDTH: usize = 8;

    /// Feature is band0 - band1: clearly positive is class 1, clearly
    /// negative class 0, flat pixels fall below the confidence threshold.
    fn model() -> ClassifierModel {
        ClassifierModel {
            model_type: "LogisticRegression".to_string(),
            labels: vec!["dark".to_string(), "bright".to_string()],
            weights: vec![vec![-10.0], vec![10.0]],
            bias: vec![0.0, 0.0],
            selected_bands: vec![0],
            gap: 1,
            raw_band_count: 2,
            preprocessing: Preprocessing::default(),
        }
    }

    fn config() -> SorterConfig {
        let mut config = SorterConfig::default();
        config.tracker = TrackerConfig {
            min_pixels: 4,
            line_gap_tolerance: 1,
            pixel_overlap_tolerance: 1,
        };
        config.ejection.sensor_width = WIDTH;
        config.ejection.channel_count = 4;
        config.ejection.base_delay_ms = 100.0;
        config.ejection.fps = 500.0;
        config
    }

    /// A raw line with class-1 material on `object` and flat background elsewhere.
    fn raw_line(object: std::ops::RangeInclusive<usize>) -> Vec<Reflectance> {
        (0..WIDTH)
            .flat_map(|x| if object.contains(&x) { [0.9, 0.1] } else { [0.5, 0.5] })
            .collect()
    }

    #[test]
    fn object_travels_from_raw_lines_to_a_command() {
        let mut pipeline = SortingPipeline::new(&model(), &config()).unwrap();
        let mut commands = Vec::new();

        for index in 0..5u64 {
            let line = if index < 3 { raw_line(2..=4) } else { raw_line(1..=0) };
            let report = pipeline.process_line(&line);
            assert_eq!(report.line_index, index);
            if index == 0 {
                assert_eq!(report.labels.as_slice(), &[-1, -1, 1, 1, 1, -1, -1, -1]);
            }
            commands.extend(report.commands.iter().cloned());
        }

        assert_eq!(commands.len(), 1);
        let command = &commands[0];
        assert_eq!(command.class_id, 1);
        assert_eq!(command.center_channel, 1);
        // Centroid on line 1, last seen on line 2: one line of 2 ms already gone.
        assert_eq!(command.delay, Duration::from_millis(98));

        let stats = pipeline.stats();
        assert_eq!((stats.lines, stats.blobs_closed, stats.commands_planned), (5, 1, 1));
    }

    #[test]
    fn small_objects_never_reach_the_planner() {
        let mut pipeline = SortingPipeline::new(&model(), &config()).unwrap();
        let mut planned = 0;
        for index in 0..4 {
            let line = if index == 0 { raw_line(6..=6) } else { raw_line(1..=0) };
            planned += pipeline.process_line(&line).commands.len();
        }
        assert_eq!(planned, 0);
        assert_eq!(pipeline.stats().blobs_closed, 0);
    }

    #[test]
    fn pre_classified_lines_are_tracked_too() {
        let mut pipeline = SortingPipeline::new(&model(), &config()).unwrap();
        let object = ClassLabelLine::from_labels(vec![-1, 0, 0, 0, 0, -1, -1, -1]);
        let blank = ClassLabelLine::new(WIDTH);

        assert!(pipeline.process_labels(&object).closed.is_empty());
        assert!(pipeline.process_labels(&blank).closed.is_empty());
        let report = pipeline.process_labels(&blank);
        assert_eq!(report.line_index, 2);
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.closed[0].class_id, 0);
    }

    #[test]
    fn label_history_keeps_the_latest_lines() {
        let mut pipeline = SortingPipeline::new(&model(), &config())
            .unwrap()
            .with_label_history(2);
        pipeline.process_line(&raw_line(0..=0));
        pipeline.process_line(&raw_line(1..=1));
        pipeline.process_line(&raw_line(2..=2));

        let kept: Vec<_> = pipeline.label_history().collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].as_slice()[1], 1);
        assert_eq!(kept[1].as_slice()[2], 1);

        pipeline.reset();
        assert_eq!(pipeline.label_history().count(), 0);
        assert_eq!(pipeline.process_line(&raw_line(1..=0)).line_index, 0);
    }

    #[test]
    fn full_label_history_recycles_its_buffers() {
        let mut pipeline = SortingPipeline::new(&model(), &config())
            .unwrap()
            .with_label_history(2);
        pipeline.process_line(&raw_line(0..=0));
        pipeline.process_line(&raw_line(1..=1));
        let oldest = pipeline.label_history().next().unwrap().as_slice().as_ptr();

        pipeline.process_line(&raw_line(2..=2));
        let newest = pipeline.label_history().last().unwrap();
        assert_eq!(newest.as_slice().as_ptr(), oldest);
        assert_eq!(newest.as_slice()[2], 1);
        assert_eq!(newest.as_slice()[0], -1);
    }

    #[test]
    fn mismatched_sources_are_rejected() {
        let pipeline = SortingPipeline::new(&model(), &config()).unwrap();
        let good = MemoryLineSource::new(WIDTH, 2, vec![0.5; WIDTH * 2]).unwrap();
        let narrow = MemoryLineSource::new(4, 2, vec![0.5; 8]).unwrap();
        let wrong_bands = MemoryLineSource::new(WIDTH, 3, vec![0.5; WIDTH * 3]).unwrap();

        assert!(pipeline.check_source(&good).is_ok());
        assert!(pipeline.check_source(&narrow).is_err());
        assert!(matches!(
            pipeline.check_source(&wrong_bands),
            Err(ConfigError::BandCountMismatch { expected: 2, actual: 3 })
        ));
    }
}
