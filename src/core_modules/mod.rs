pub mod active_blob;
pub mod actuation;
pub mod channel_map;
pub mod classification;
pub mod classifier;
pub mod ejection;
pub mod feature_extractor;
pub mod hardware;
pub mod line_source;
pub mod segment;
pub mod spectrum;
pub mod timing;
pub mod tracker;
pub mod utils;
