use thiserror::Error;

/// All errors raised while reading, editing, or writing FITS files.
///
/// Every variant carries enough context (byte offset, keyword, HDU index)
/// to locate the offending record; errors raised inside an HDU are wrapped
/// in [`Error::Hdu`] by the list that owns it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An 80-column record could not be parsed.
    #[error("malformed card {keyword:?} at byte {offset}: {reason}")]
    MalformedCard {
        offset: u64,
        keyword: String,
        reason: String,
    },

    /// Keyword bookkeeping disagrees with itself (e.g. NAXIS vs NAXISn).
    #[error("inconsistent header at {keyword}: {reason}")]
    HeaderConsistency { keyword: String, reason: String },

    #[error("file truncated at byte {offset} (needed {wanted} more bytes)")]
    TruncatedFile { offset: u64, wanted: u64 },

    #[error("request at byte {offset} with length {len} is not aligned to 2880-byte blocks")]
    Alignment { offset: u64, len: usize },

    #[error("cannot read backward to byte {offset}, stream is already at byte {position}")]
    BackwardRead { offset: u64, position: u64 },

    /// Stored and computed checksums differ. Reported, never fatal to reads.
    #[error("{keyword} mismatch: stored {stored}, computed {computed}")]
    Checksum {
        keyword: &'static str,
        stored: String,
        computed: String,
    },

    #[error("shape mismatch: header declares {expected:?}, got {found:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("keyword {keyword:?} (occurrence {nth}) not found")]
    KeyNotFound { keyword: String, nth: usize },

    #[error("invalid keyword {0:?}")]
    InvalidKeyword(String),

    #[error("invalid value for {keyword}: {reason}")]
    InvalidValue { keyword: String, reason: String },

    #[error("invalid BITPIX value: {0}")]
    InvalidBitpix(i64),

    #[error("no column named {0:?}")]
    NoSuchColumn(String),

    #[error("index {index} out of range for length {len}")]
    OutOfRange { index: usize, len: usize },

    /// An operation was applied to the wrong kind of HDU.
    #[error("expected {expected} HDU, found {found}")]
    WrongKind { expected: &'static str, found: String },

    #[error("HDU list is not backed by a writable file")]
    ReadOnly,

    #[error("HDU {index}: {source}")]
    Hdu {
        index: usize,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Attach the index of the HDU in which the error was raised.
    pub fn in_hdu(self, index: usize) -> Self {
        match self {
            Error::Hdu { .. } => self,
            other => Error::Hdu {
                index,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through [`Error::Hdu`] wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Hdu { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn invalid_value(keyword: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidValue {
            keyword: keyword.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn consistency(keyword: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::HeaderConsistency {
            keyword: keyword.into(),
            reason: reason.into(),
        }
    }
}
