use std::path::PathBuf;

use thiserror::Error;

pub type TsdbResult<T> = Result<T, TsdbError>;

#[derive(Debug, Error)]
pub enum TsdbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected EOF while reading {what} at offset {offset}")]
    Truncated { what: &'static str, offset: usize },

    #[error("file too small: {}", .0.display())]
    FileTooSmall(PathBuf),

    #[error("invalid TSDB tag in {}", .0.display())]
    InvalidTag(PathBuf),

    #[error("unsupported TSDB version {version} in {}", .path.display())]
    UnsupportedVersion { version: u32, path: PathBuf },

    #[error("unknown entry type 0x{tag:02x} at offset {offset}")]
    UnknownEntry { tag: u8, offset: usize },

    #[error("value entry encountered before any timestamp was set")]
    ValueBeforeTimestamp,

    #[error("relative timestamp entry encountered before any absolute timestamp")]
    RelativeBeforeAbsolute,

    #[error("undefined channel id {0}")]
    UndefinedChannel(u16),

    #[error("unsupported formatId 0x{0:02x}")]
    UnsupportedFormat(u8),

    #[error(
        "series {series:?} already uses formatId=0x{existing:02x}, cannot write formatId=0x{requested:02x}"
    )]
    FormatMismatch {
        series: String,
        existing: u8,
        requested: u8,
    },

    #[error("series name too long ({len} bytes > 255): {name:?}")]
    SeriesNameTooLong { name: String, len: usize },

    #[error("exceeded max channel id (65535)")]
    ChannelIdsExhausted,

    #[error("cannot encode value for series {series:?} with formatId=0x{format_id:02x}")]
    CannotEncode { series: String, format_id: u8 },

    #[error("mixed or unsupported value types in series {0:?}")]
    MixedSeries(String),

    #[error("cannot select a format for an empty series {0:?}")]
    EmptySeries(String),

    #[error("input TSDB file contains no values")]
    EmptyInput,

    #[error("writer is already closed")]
    WriterClosed,

    #[error("{0}")]
    BadRequest(String),
}

impl TsdbError {
    /// Truncation errors are recovered locally by the incremental parser;
    /// everything else propagates.
    pub fn is_truncation(&self) -> bool {
        matches!(self, TsdbError::Truncated { .. })
    }
}
