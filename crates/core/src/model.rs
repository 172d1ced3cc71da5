//! Data model shared by the core and its adapters.

use serde::{Deserialize, Serialize};

/// Palette index of a canvas cell.
pub type Color = u8;

/// Target-image sentinel meaning "don't care". Never present on the live canvas.
pub const TRANSPARENT: Color = 255;

/// Canvas coordinate. Packs into a `u32` as `x << 16 | y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pos {
    /// Column.
    pub x: u16,
    /// Row.
    pub y: u16,
}

impl Pos {
    /// Position at column `x`, row `y`.
    pub fn new(x: u16, y: u16) -> Self {
        Self { x, y }
    }

    /// Packs into `x << 16 | y`.
    pub fn pack(self) -> u32 {
        (self.x as u32) << 16 | self.y as u32
    }

    /// Inverse of [`Pos::pack`].
    pub fn unpack(packed: u32) -> Self {
        Self {
            x: (packed >> 16) as u16,
            y: (packed & 0xffff) as u16,
        }
    }

    /// Linear index into a column-major grid of the given height.
    pub fn index(self, height: usize) -> usize {
        self.x as usize * height + self.y as usize
    }
}

impl std::fmt::Display for Pos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:>3},{:>3})", self.x, self.y)
    }
}

/// One single-pixel change observed on the live update feed.
///
/// Fields are kept wide and signed: they are validated against the canvas
/// before being applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaintboardUpdate {
    /// Column as received.
    pub x: i64,
    /// Row as received.
    pub y: i64,
    /// Palette index as received.
    pub color: i64,
    /// Receipt time, unix epoch milliseconds.
    pub time: i64,
}

/// Full canvas snapshot. `data` is column-major: `data[x * height + y]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardState {
    /// Columns.
    pub width: usize,
    /// Rows.
    pub height: usize,
    /// Cell colors, `width * height` of them.
    pub data: Vec<Color>,
}

/// A single paint handed to a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaintTarget {
    /// Cell to paint.
    pub pos: Pos,
    /// Color the task wants there.
    pub color: Color,
}

/// Classified result of one paint request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaintOutcome {
    /// The paint was accepted.
    Success,
    /// Transport failure or undecodable response.
    NetworkError,
    /// Unclassified 5xx.
    ServerError,
    /// The endpoint is shedding load.
    RateLimited,
    /// The request itself was rejected.
    BadRequest,
    /// The event has not started yet.
    NotStarted,
    /// This credential already painted within its interval.
    Cooldowning,
    /// Permanent: the credential is not accepted.
    InvalidToken,
}

impl PaintOutcome {
    /// Classifies a remote status code.
    pub fn from_status(status: i64) -> Self {
        match status {
            200..=299 => Self::Success,
            500 | 429 => Self::Cooldowning,
            401 => Self::InvalidToken,
            403 => Self::NotStarted,
            503 => Self::RateLimited,
            400..=499 => Self::BadRequest,
            500..=599 => Self::ServerError,
            _ => Self::NetworkError,
        }
    }
}

/// Answer of the validate endpoint for a definitive check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    /// The credential may paint.
    Valid,
    /// The credential is rejected for good.
    Invalid {
        /// Message from the remote side.
        reason: String,
    },
}

/// Advisory credential status, written back best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    /// Not yet confirmed.
    #[default]
    Waiting,
    /// Painting normally.
    Working,
    /// Repeatedly told to cool down.
    Busy,
    /// Rejected; gets no loop.
    Invalid,
}

impl CredentialStatus {
    /// Whether a credential in this status should get a loop.
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Invalid)
    }

    /// Wire name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Working => "working",
            Self::Busy => "busy",
            Self::Invalid => "invalid",
        }
    }
}

/// Target image as stored: row-major, one character per pixel.
///
/// `0`-`9a-v` encode colors 0-31 and `.` is transparent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// `width * height` characters, row by row.
    pub data: String,
}

/// Placement and priority of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Canvas position of the image's top-left pixel.
    pub left_top: Pos,
    /// Relative priority among the owner's tasks.
    pub weight: f64,
}

/// A task as listed by the task directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Directory key.
    pub id: String,
    /// Account the task belongs to.
    pub owner: String,
    /// Target image.
    pub image: EncodedImage,
    /// Placement and weight.
    pub options: TaskOptions,
    /// Whether credentials of other owners may contribute to this task.
    #[serde(default, alias = "verified")]
    pub trusted: bool,
}

/// A write credential as listed by the credential directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    /// Secret sent with every paint.
    pub token: String,
    /// Account that submitted the credential, if known.
    #[serde(default)]
    pub owner: Option<String>,
    /// Account the credential's work is attributed to.
    pub receiver: String,
    /// Last status written back.
    #[serde(default)]
    pub status: CredentialStatus,
}

/// Last six characters of a token, for logs.
pub fn token_tail(token: &str) -> &str {
    let start = token
        .char_indices()
        .rev()
        .nth(5)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &token[start..]
}
