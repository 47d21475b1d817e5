use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CnnError>;

#[derive(Error, Debug)]
pub enum CnnError {
    #[error("invalid network configuration: {0}")]
    InvalidConfig(String),

    #[error("input image is {actual:?} (width, height) but the network expects {expected:?}")]
    InputSize {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    // Header order: input width, input height, filters, kernel size.
    #[error("model header {found:?} does not match network {expected:?}")]
    HeaderMismatch { expected: [i32; 4], found: [i32; 4] },

    #[error("model file ended while reading {section}")]
    Truncated { section: &'static str },

    #[error("model file has {0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("dimension {0} does not fit in the model header")]
    DimensionOverflow(usize),

    #[error("cannot decode image {path}: {reason}")]
    Image { path: PathBuf, reason: String },

    #[error("no images could be loaded from {0}")]
    EmptyDataset(PathBuf),

    #[error("cannot train on a dataset with no samples")]
    NoSamples,
}
