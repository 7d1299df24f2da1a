//! On-disk constants for the PMAT dump format.
//!
//! A dump is a header (magic, flags, versions, per-type size table), three
//! immortal addresses, a named-root table, a stack snapshot, a stream of
//! tagged SV records terminated by a zero tag, and an optional trailing
//! context-stack section. Everything after the flags byte uses the endian
//! and widths the flags byte declares.

use crate::{
    error::{PmatError, PmatResult},
    reader::{Endian, FloatSize, IntSize, ReaderConfig},
};

/// The four magic bytes at the head of every dump.
pub const MAGIC: [u8; 4] = *b"PMAT";

/// Format-version major this reader understands. A mismatch is fatal.
pub const FORMAT_MAJOR: u8 = 0;

/// Format-version minor this reader was written against. Other minors are
/// accepted with best-effort field loading driven by the size table.
pub const FORMAT_MINOR: u8 = 4;

/// Minimum format minor on which magic-annotation records carry the trailing
/// pointer field. Older producers wrote the four-field shape.
pub const MINOR_MAGIC_PTR: u8 = 2;

/// Heap-stream tag introducing a magic-annotation record.
pub const TAG_MAGIC: u8 = 0x80;

const FLAG_BIG_ENDIAN: u8 = 0x01;
const FLAG_UINT64: u8 = 0x02;
const FLAG_PTR64: u8 = 0x04;
const FLAG_LONG_FLOAT: u8 = 0x08;
const FLAG_ITHREADS: u8 = 0x10;
const FLAG_KNOWN: u8 = 0x1f;

/// Decoded header flags byte: platform widths plus the ithreads marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags {
    /// Reader configuration implied by the width bits.
    pub config: ReaderConfig,
    /// Whether the producer embedded constants in pads at compile time.
    pub ithreads: bool,
}

impl HeaderFlags {
    /// Decodes the flags byte, failing on bits above the defined range.
    pub fn from_byte(flags: u8) -> PmatResult<Self> {
        if flags & !FLAG_KNOWN != 0 {
            return Err(PmatError::UnknownFlag { flags });
        }
        let endian = if flags & FLAG_BIG_ENDIAN != 0 {
            Endian::Big
        } else {
            Endian::Little
        };
        let uint_size = if flags & FLAG_UINT64 != 0 { IntSize::U64 } else { IntSize::U32 };
        let ptr_size = if flags & FLAG_PTR64 != 0 { IntSize::U64 } else { IntSize::U32 };
        // Long-double producers pad the field to 16 bytes on disk.
        let float_size = if flags & FLAG_LONG_FLOAT != 0 {
            FloatSize::F128
        } else {
            FloatSize::F64
        };
        Ok(Self {
            config: ReaderConfig {
                endian,
                uint_size,
                ptr_size,
                float_size,
            },
            ithreads: flags & FLAG_ITHREADS != 0,
        })
    }
}

/// The producer interpreter's version, unpacked from the header's
/// `rev << 24 | ver << 16 | subver` encoding. Informational, except that
/// padlist layout decoding is keyed on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
pub struct PerlVersion {
    /// Revision (the leading `5`).
    pub rev: u8,
    /// Major version within the revision.
    pub ver: u8,
    /// Subversion.
    pub sub: u16,
}

impl PerlVersion {
    /// Unpacks the header's u32 encoding.
    #[must_use]
    pub fn from_packed(raw: u32) -> Self {
        Self {
            rev: (raw >> 24) as u8,
            ver: (raw >> 16) as u8,
            sub: raw as u16,
        }
    }

    /// `true` when this version is at least `rev.ver`.
    #[must_use]
    pub fn at_least(self, rev: u8, ver: u8) -> bool {
        (self.rev, self.ver) >= (rev, ver)
    }
}

impl std::fmt::Display for PerlVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{rev}.{ver}.{sub}", rev = self.rev, ver = self.ver, sub = self.sub)
    }
}

/// One entry of the per-type size table: how many bytes of type-specific
/// header, trailing pointers, and trailing strings each record of that type
/// carries. The table is what makes the format self-describing: decoders
/// consume exactly what it dictates and never hard-code field counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvShape {
    /// Bytes of type-specific header preceding the common header.
    pub header_bytes: u8,
    /// Number of trailing pointers after the common header.
    pub nptrs: u8,
    /// Number of trailing strings after the pointers.
    pub nstrs: u8,
}

/// SV record tags, matching the producer's type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SvTag {
    Glob = 1,
    Scalar = 2,
    Ref = 3,
    Array = 4,
    Hash = 5,
    Stash = 6,
    Code = 7,
    Io = 8,
    Lvalue = 9,
    Regexp = 10,
    Format = 11,
    Invlist = 12,
}

impl SvTag {
    /// Maps a heap-stream tag byte to a known SV type.
    #[must_use]
    pub fn from_byte(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Glob,
            2 => Self::Scalar,
            3 => Self::Ref,
            4 => Self::Array,
            5 => Self::Hash,
            6 => Self::Stash,
            7 => Self::Code,
            8 => Self::Io,
            9 => Self::Lvalue,
            10 => Self::Regexp,
            11 => Self::Format,
            12 => Self::Invlist,
            _ => return None,
        })
    }
}

/// CODEx sub-record tags inside a CODE body.
pub mod codex {
    /// A constant SV pointer.
    pub const CONSTSV: u8 = 1;
    /// A padlist-index slot containing a constant (ithreads).
    pub const CONSTIX: u8 = 2;
    /// A referenced glob pointer.
    pub const GVSV: u8 = 3;
    /// A padlist-index slot containing a glob (ithreads).
    pub const GVIX: u8 = 4;
    /// Legacy padname record: one uint and one string, skipped.
    pub const PADNAME: u8 = 5;
    /// Legacy pad-slot record: two uints and one pointer, skipped.
    pub const PADSV: u8 = 6;
    /// The padnames array pointer (producers >= 5.18).
    pub const PADNAMES: u8 = 7;
    /// A per-depth pad: uint depth then pointer (producers >= 5.18).
    pub const PAD: u8 = 8;
}

/// Context-stack record tags.
pub mod ctx {
    /// A subroutine call frame.
    pub const SUB: u8 = 1;
    /// An eval-block frame.
    pub const TRY: u8 = 2;
    /// A string-eval frame.
    pub const EVAL: u8 = 3;
}
