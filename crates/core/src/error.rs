//! Error types surfaced by the core.

use thiserror::Error;

/// Failures of the canvas mirror.
///
/// `Clone` so that every caller waiting on one connect attempt can observe
/// the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BoardError {
    /// The mirror is not open; callers should `initialize()` and retry.
    #[error("board is {0}")]
    NotOpen(&'static str),
    /// The connect attempt failed (transport, feed closed early, watchdog).
    #[error("board connect failed: {0}")]
    ConnectFailed(String),
    /// The snapshot reports dimensions other than the configured canvas.
    #[error("board is {got_width}x{got_height}, expected {width}x{height}")]
    DimensionMismatch {
        /// Configured width.
        width: usize,
        /// Configured height.
        height: usize,
        /// Snapshot width.
        got_width: usize,
        /// Snapshot height.
        got_height: usize,
    },
    /// The snapshot payload does not describe a valid grid.
    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),
    /// An update event violated coordinate, color or time bounds.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),
}

/// Failures decoding a target image.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ImageError {
    /// Zero width or height.
    #[error("image must be at least 1x1, got {width}x{height}")]
    Empty {
        /// Declared width.
        width: u32,
        /// Declared height.
        height: u32,
    },
    /// `data` does not hold exactly `width * height` pixels.
    #[error("image data has {got} pixels, expected {expected}")]
    SizeMismatch {
        /// `width * height`.
        expected: usize,
        /// Actual pixel count.
        got: usize,
    },
    /// A pixel character is not a base-36 digit or `.`.
    #[error("invalid pixel {ch:?} at index {index}")]
    InvalidPixel {
        /// Offending character.
        ch: char,
        /// Row-major index.
        index: usize,
    },
    /// A pixel names a color outside the palette.
    #[error("color {color} at index {index} is outside the palette of {palette_size}")]
    ColorOutOfPalette {
        /// Decoded color.
        color: u8,
        /// Row-major index.
        index: usize,
        /// Configured palette size.
        palette_size: u8,
    },
}

/// A task record that cannot be tracked.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// Target image failed to decode.
    #[error(transparent)]
    Image(#[from] ImageError),
    /// The placement rectangle leaves the canvas.
    #[error("task at ({left},{top}) size {width}x{height} exceeds the {canvas_width}x{canvas_height} canvas")]
    OutOfBounds {
        /// Placement x.
        left: u32,
        /// Placement y.
        top: u32,
        /// Image width.
        width: u32,
        /// Image height.
        height: u32,
        /// Canvas width.
        canvas_width: usize,
        /// Canvas height.
        canvas_height: usize,
    },
    /// Weight is negative or not finite.
    #[error("invalid task weight {0}")]
    InvalidWeight(f64),
}

/// The request throttle has shut down.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("request throttle closed")]
pub struct ThrottleClosed;

/// Errors from [`crate::pending_set::RandomizedPendingSet`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum PendingSetError {
    /// `pop_random` on an empty set.
    #[error("the set is empty")]
    Empty,
}

/// Engine settings outside what the engine can run with.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A setting lies outside its accepted range.
    #[error("{field} must be in {min}..={max}, got {value}")]
    OutOfRange {
        /// Setting name.
        field: &'static str,
        /// Configured value.
        value: u64,
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
    },
}
