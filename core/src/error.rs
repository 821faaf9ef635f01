//! Error types for the localizer.
//!
//! Only configuration problems and malformed input are errors. Degenerate populations,
//! missing observations and out-of-bounds particles are recovered inside the filter and
//! never surface here.

use thiserror::Error;

/// Invalid startup configuration. Raised before the cycle driver is constructed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The particle population must contain at least one particle.
    #[error("particle count must be positive")]
    NoParticles,

    /// The ranging noise standard deviation must be strictly positive and finite.
    #[error("observation sigma must be positive and finite, got {0}")]
    NonPositiveSigma(f64),

    /// At least one anchor is required to derive the world bounds.
    #[error("anchor set is empty")]
    NoAnchors,

    /// Two anchors share the same identifier.
    #[error("duplicate anchor identifier '{0}'")]
    DuplicateAnchor(String),

    /// An anchor coordinate is NaN or infinite.
    #[error("anchor '{0}' has a non-finite coordinate")]
    NonFiniteAnchor(String),

    /// The vertical range is inverted or non-finite.
    #[error("invalid z range [{0}, {1}]")]
    InvalidZRange(f64, f64),

    /// The confidence distance threshold must be strictly positive.
    #[error("confidence distance threshold must be positive, got {0}")]
    InvalidThreshold(f64),

    /// The confidence proportion must lie in (0, 1].
    #[error("confidence proportion must be in (0, 1], got {0}")]
    InvalidProportion(f64),

    /// A motion noise amplitude is negative or non-finite.
    #[error("motion noise '{0}' must be non-negative, got {1}")]
    NegativeNoise(&'static str, f64),

    /// The fixed cycle period must be positive and at most an hour.
    #[error("cycle period must be in (0, 3600] seconds, got {0}")]
    InvalidCyclePeriod(f64),

    /// The anchor position tolerance must be non-negative.
    #[error("anchor position tolerance must be non-negative, got {0}")]
    InvalidTolerance(f64),

    /// Occupancy cells must have a positive, finite size.
    #[error("occupancy cell size must be positive, got {0}")]
    InvalidCellSize(f64),

    #[error("occupancy grid has no cells")]
    EmptyOccupancyGrid,

    /// Every occupancy row must have the same number of cells.
    #[error("occupancy row {0} differs in length from the first row")]
    RaggedOccupancyGrid(usize),

    #[error("unknown occupancy cell '{0}', expected '.' or '#'")]
    InvalidOccupancyCell(char),

    /// The occupancy grid leaves no free cell inside the bounds.
    #[error("occupancy grid blocks the whole world")]
    NoFreeSpace,
}

/// Malformed tag report payload.
#[derive(Debug, Error)]
pub enum ReportError {
    /// The payload is not valid JSON or not a JSON object.
    #[error("malformed tag report: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload parsed but is not an object.
    #[error("tag report must be a JSON object")]
    NotAnObject,

    /// An anchor listed in `all_anc_id` has no entry, or the entry is not an object.
    #[error("anchor '{0}' is listed but has no ranging entry")]
    MissingAnchorEntry(String),
}

/// Top level error for the library and the command line front end.
#[derive(Debug, Error)]
pub enum LocalizationError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}
