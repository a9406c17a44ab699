//! Hemoglobin screening from lower-eyelid conjunctiva photographs.
//!
//! A payload flows decode → segment → select → refine → composite →
//! colour features → dual-head model. Long-lived state lives in a
//! [`ModelBundle`] that every request borrows immutably.

pub mod bundle;
pub mod composite;
pub mod config;
pub mod decode;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod record;
pub mod refine;
pub mod scaler;
pub mod segment;
pub mod segmenter;
pub mod select;

pub use bundle::ModelBundle;
pub use composite::ColorFeatures;
pub use config::{FeatureStrategy, MaskSemantics, PipelineConfig, PipelineSettings};
pub use decode::{decode_payload, RawImage};
pub use error::{Error, Result};
pub use model::{HbBand, PredictionResult, Predictor};
pub use pipeline::{predict, segment_conjunctiva, Screening, ScreeningRequest, SegmentedRegion};
pub use segment::Segment;
