use std::{fmt, io};

/// Result type alias for dump decoding and loading operations.
pub type PmatResult<T> = Result<T, PmatError>;

/// Error type for dump loading, separating failures by decode stage.
///
/// Keeping magic/version/flag/tag/truncation failures distinct lets callers
/// report corrupt files accurately without string matching. All variants are
/// fatal to the load in progress: no partial dumpfile is ever exposed.
#[derive(Debug)]
pub enum PmatError {
    /// The stream does not begin with the `PMAT` magic bytes.
    BadMagic {
        /// The four bytes actually found at the head of the stream.
        found: [u8; 4],
    },
    /// The format-version major is not one this reader supports.
    ///
    /// Minor-version drift is accepted with best-effort field loading; a
    /// major mismatch means the record framing itself cannot be trusted.
    BadVersion {
        /// Format-version major read from the header.
        major: u8,
        /// Format-version minor read from the header.
        minor: u8,
    },
    /// The header flags byte has bits set above the defined range.
    UnknownFlag {
        /// The full flags byte as read.
        flags: u8,
    },
    /// An SV, CODEx, magic, or context tag outside the enumerated set.
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
        /// Stream position at which the tag was read.
        position: u64,
    },
    /// Unexpected EOF during a fixed-size or length-prefixed read.
    Truncated {
        /// Stream position at which the short read happened.
        position: u64,
    },
    /// An underlying I/O failure other than EOF.
    Io(io::Error),
}

impl fmt::Display for PmatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic { found } => {
                write!(f, "not a PMAT dump (magic bytes {found:02x?})")
            }
            Self::BadVersion { major, minor } => {
                write!(f, "unsupported format version {major}.{minor}")
            }
            Self::UnknownFlag { flags } => {
                write!(f, "unrecognised header flag bits in {flags:#04x}")
            }
            Self::UnknownTag { tag, position } => {
                write!(f, "unknown record tag {tag:#04x} at byte {position}")
            }
            Self::Truncated { position } => {
                write!(f, "dump truncated at byte {position}")
            }
            Self::Io(error) => write!(f, "read error: {error}"),
        }
    }
}

impl std::error::Error for PmatError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for PmatError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

/// Symbol-resolution failure, carrying enough context to say which segment
/// of the dotted name went wrong and what was found instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolError {
    /// The full symbol as given by the caller, e.g. `"$Foo::Bar::baz"`.
    pub symbol: String,
    /// The segment that failed to resolve, e.g. `"Bar::"` or `"baz"`.
    pub segment: String,
    /// What the resolver needed at that segment ("a stash entry", "a glob",
    /// "a scalar slot", ...).
    pub expected: &'static str,
    /// What was actually there ("nothing", or a short object description).
    pub found: String,
}

impl fmt::Display for SymbolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no symbol {symbol:?}: at {segment:?} expected {expected}, found {found}",
            symbol = self.symbol,
            segment = self.segment,
            expected = self.expected,
            found = self.found,
        )
    }
}

impl std::error::Error for SymbolError {}
