//! Classification, pattern storage, and the learning pipeline.

pub mod classifier;
pub mod learning;
pub mod patterns;
pub mod redact;

pub use classifier::Classifier;
pub use learning::LearningPipeline;
pub use patterns::{PatternChange, PatternSnapshot, PatternStore};
