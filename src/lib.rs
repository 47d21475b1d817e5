//! A small two-stage depthwise convolutional network for telling cats from
//! dogs in grayscale images, with a hand-written forward and backward pass.

pub mod config;
pub mod dataset;
pub mod error;
pub mod gradcheck;
pub mod image;
pub mod layers;
pub mod network;
pub mod persistence;
pub mod summary;
pub mod training;

pub use config::{Dimensions, NetworkConfig, Tunables};
pub use dataset::{Dataset, Label, Sample};
pub use error::{CnnError, Result};
pub use gradcheck::{GradCheckReport, Probe, ProbeResult};
pub use image::Image;
pub use network::{ForwardTrace, Network, NetworkParameters, OutputLayerStats};
pub use summary::ModelSummary;
pub use training::{EpochStats, Evaluation, TrainingConfig, TrainingReport};
