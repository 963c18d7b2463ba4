// THEORY:
// This file is the main entry point for the `spectral_sorter` library crate.
// It exposes the decision core of a line-scan sorting machine in two layers:
//
// - `pipeline::SortingPipeline` is the synchronous, line-at-a-time API:
//   raw spectra in, tracked objects and ejection commands out.
// - `live_pipeline::LivePipeline` runs that pipeline on its own thread and
//   feeds its commands to the `ActuationScheduler` in real time.
//
// The stages themselves live in `core_modules` and can be used on their own.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod live_pipeline;
pub mod pipeline;
