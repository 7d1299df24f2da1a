//! The typed value-object model.
//!
//! Every heap object decoded from a dump is an [`Sv`]: a common header
//! (address, reference count, owned size, optional blessing, magic list)
//! plus an [`SvBody`] variant carrying the type-specific fields. Addresses
//! are the object's identity; every inter-object link is stored as an
//! address and resolved lazily through the dumpfile's lookup, which is what
//! lets the pervasively cyclic graph live in a flat arena.
//!
//! Three synthetic subtypes (PADLIST, PADNAMES, PAD) are never emitted by
//! the producer; the fixup pass reclassifies plain arrays into them once a
//! code object's padlist pointer identifies their role.

use indexmap::IndexMap;
use smallvec::SmallVec;

use crate::{reach::Reach, reader::ReaderConfig, refs::Inref};

/// A producer-side pointer value, used as object identity. Zero is "null".
pub type Addr = u64;

/// Filters the zero "null" pointer into `None`.
#[inline]
#[must_use]
pub(crate) fn non_null(addr: Addr) -> Option<Addr> {
    (addr != 0).then_some(addr)
}

/// Object kind, covering producer-emitted types and the synthetic padlist
/// subtypes assigned during fixup.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    strum::Display, strum::IntoStaticStr, serde::Serialize,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum SvKind {
    Glob,
    Scalar,
    Ref,
    Array,
    Hash,
    Stash,
    Code,
    Io,
    Lvalue,
    Regexp,
    Format,
    Invlist,
    Padlist,
    Padnames,
    Pad,
}

/// A magic annotation attached to an object: not an object itself, but a
/// decoration with a one-character type and up to two target addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Magic {
    /// The single-character magic type.
    pub mg_type: u8,
    /// Whether the magic's object link contributes to its reference count.
    pub refcounted: bool,
    /// The attached object, or zero.
    pub obj: Addr,
    /// The attached raw pointer, or zero.
    pub ptr: Addr,
}

impl Magic {
    /// The magic type as a character, for display.
    #[must_use]
    pub fn type_char(&self) -> char {
        char::from(self.mg_type)
    }
}

/// GLOB: a named multi-slot container registered in a stash.
#[derive(Debug, Clone, Default)]
pub struct GlobBody {
    pub stash: Addr,
    pub scalar: Addr,
    pub array: Addr,
    pub hash: Addr,
    pub code: Addr,
    pub egv: Addr,
    pub io: Addr,
    pub form: Addr,
    /// The glob's name within its stash.
    pub name: Option<Vec<u8>>,
    pub file: Option<String>,
    pub line: Option<u64>,
}

/// Validity bit for the unsigned-integer body of a scalar.
pub const SCALAR_HAS_UV: u8 = 0x01;
/// Validity bit for the signed-integer body.
pub const SCALAR_HAS_IV: u8 = 0x02;
/// Validity bit for the float body.
pub const SCALAR_HAS_NV: u8 = 0x04;
/// Validity bit for the byte-string body.
pub const SCALAR_HAS_PV: u8 = 0x08;
/// UTF-8 flag on the byte-string body.
pub const SCALAR_PV_UTF8: u8 = 0x10;

/// SCALAR: optional integer / float / byte-string bodies.
#[derive(Debug, Clone, Default)]
pub struct ScalarBody {
    /// Unsigned-integer body, when the producer marked it valid.
    pub uv: Option<u64>,
    /// Signed-integer body (the same wire field, reinterpreted).
    pub iv: Option<i64>,
    /// Float body.
    pub nv: Option<f64>,
    /// Byte-string body. May be shorter than `pvlen` if the producer
    /// truncated long strings at dump time.
    pub pv: Option<Vec<u8>>,
    /// Full length of the byte-string body in the producer.
    pub pvlen: Option<u64>,
    /// Whether the byte-string body is UTF-8 encoded.
    pub utf8: bool,
    /// Stash of the `our` declaration that aliases this scalar, or zero.
    pub ourstash: Addr,
}

impl ScalarBody {
    /// Rebuilds the body from a raw flags byte and wire fields.
    #[must_use]
    pub(crate) fn from_wire(
        flags: u8,
        raw_uv: Option<u64>,
        nv: Option<f64>,
        pvlen: Option<u64>,
        pv: Option<Vec<u8>>,
        ourstash: Addr,
    ) -> Self {
        Self {
            uv: (flags & SCALAR_HAS_UV != 0).then_some(raw_uv.unwrap_or(0)),
            iv: (flags & SCALAR_HAS_IV != 0).then_some(raw_uv.unwrap_or(0) as i64),
            nv: if flags & SCALAR_HAS_NV != 0 { nv } else { None },
            pv: if flags & SCALAR_HAS_PV != 0 { pv } else { None },
            pvlen: if flags & SCALAR_HAS_PV != 0 { pvlen } else { None },
            utf8: flags & SCALAR_PV_UTF8 != 0,
            ourstash,
        }
    }
}

/// REF: a reference-holding scalar, strong or weakened.
#[derive(Debug, Clone, Default)]
pub struct RefBody {
    /// The referrant, or zero.
    pub rv: Addr,
    /// Whether the reference was weakened.
    pub weak: bool,
    /// Stash of the `our` declaration, or zero.
    pub ourstash: Addr,
}

/// ARRAY: an ordered sequence of element addresses.
#[derive(Debug, Clone, Default)]
pub struct ArrayBody {
    /// Element addresses; zero entries are empty slots.
    pub elems: Vec<Addr>,
    /// Set when the producer recorded the array as not owning its elements.
    pub unreal: bool,
    /// Set by fixup when this array is a hash's weak-backrefs list.
    pub is_backrefs: bool,
}

/// HASH: unordered byte-string keys mapped to addresses. Entries keep the
/// dump's order for deterministic display.
#[derive(Debug, Clone, Default)]
pub struct HashBody {
    pub entries: IndexMap<Vec<u8>, Addr>,
    /// The weak-backrefs link: an ARRAY of referrers, a single REF, or zero.
    pub backrefs: Addr,
}

impl HashBody {
    /// Looks up a value address by key, filtering empty slots.
    #[must_use]
    pub fn value(&self, key: &[u8]) -> Option<Addr> {
        self.entries.get(key).copied().and_then(non_null)
    }
}

/// STASH: a package symbol table. Composes a hash body with the class name
/// and MRO metadata links.
#[derive(Debug, Clone, Default)]
pub struct StashBody {
    pub hash: HashBody,
    /// The package name.
    pub name: Option<String>,
    pub mro_linear_all: Addr,
    pub mro_linear_current: Addr,
    pub mro_nextmethod: Addr,
    pub mro_isa: Addr,
}

/// CODE: a subroutine, with its lexical-storage padlist and any constants
/// or globs its body references.
#[derive(Debug, Clone, Default)]
pub struct CodeBody {
    pub stash: Addr,
    pub glob: Addr,
    /// The enclosing scope's code object.
    pub outside: Addr,
    pub padlist: Addr,
    pub constval: Addr,
    /// Nonzero when the sub is implemented in bytecode rather than native.
    pub oproot: Addr,
    pub file: Option<String>,
    pub line: Option<u64>,
    /// This code is a closure prototype that gets cloned at runtime.
    pub is_clone: bool,
    /// This code is a runtime clone of a prototype.
    pub is_cloned: bool,
    /// Implemented natively, no bytecode body.
    pub is_xsub: bool,
    /// The link to the enclosing scope does not count a reference.
    pub weak_outside: bool,
    /// The glob link counts a reference.
    pub glob_refcounted: bool,
    /// Constant SVs referenced by the body (explicit pointers, plus any
    /// ithreads pad-index constants resolved during fixup).
    pub constants: Vec<Addr>,
    /// Globs referenced by the body (ditto).
    pub globrefs: Vec<Addr>,
    /// The padnames array: explicit on newer producers, derived from the
    /// padlist's element zero otherwise.
    pub padnames: Addr,
    /// Per-depth pads, index 0 being depth 1.
    pub pads: Vec<Addr>,
    /// Unresolved ithreads pad indices holding constants; drained by fixup.
    pub(crate) const_ixs: Vec<u64>,
    /// Unresolved ithreads pad indices holding globs; drained by fixup.
    pub(crate) gv_ixs: Vec<u64>,
}

/// IO: a filehandle's format-related glob links.
#[derive(Debug, Clone, Default)]
pub struct IoBody {
    pub topgv: Addr,
    pub fmtgv: Addr,
    pub bottomgv: Addr,
}

/// LVALUE: a deferred-assignment scalar (substr/pos/vec).
#[derive(Debug, Clone, Default)]
pub struct LvalueBody {
    /// Single-character lvalue subtype.
    pub kind: u8,
    pub off: u64,
    pub len: u64,
    pub target: Addr,
}

/// A synthetic padlist-structure array: the same element layout as ARRAY,
/// plus the owning code's address assigned during fixup.
#[derive(Debug, Clone, Default)]
pub struct PadBody {
    /// Element addresses; zero entries are empty slots.
    pub elems: Vec<Addr>,
    /// The owning code object.
    pub padcv: Addr,
}

/// Type-specific body of a heap object.
#[derive(Debug, Clone)]
pub enum SvBody {
    Glob(GlobBody),
    Scalar(ScalarBody),
    Ref(RefBody),
    Array(ArrayBody),
    Hash(HashBody),
    Stash(StashBody),
    Code(CodeBody),
    Io(IoBody),
    Lvalue(LvalueBody),
    Regexp,
    Format,
    Invlist,
    /// A code object's padlist array, reclassified by fixup.
    Padlist(PadBody),
    /// The padnames array, reclassified by fixup.
    Padnames(PadBody),
    /// A per-depth pad, reclassified by fixup.
    Pad(PadBody),
}

impl SvBody {
    /// The kind tag for this body.
    #[must_use]
    pub fn kind(&self) -> SvKind {
        match self {
            Self::Glob(_) => SvKind::Glob,
            Self::Scalar(_) => SvKind::Scalar,
            Self::Ref(_) => SvKind::Ref,
            Self::Array(_) => SvKind::Array,
            Self::Hash(_) => SvKind::Hash,
            Self::Stash(_) => SvKind::Stash,
            Self::Code(_) => SvKind::Code,
            Self::Io(_) => SvKind::Io,
            Self::Lvalue(_) => SvKind::Lvalue,
            Self::Regexp => SvKind::Regexp,
            Self::Format => SvKind::Format,
            Self::Invlist => SvKind::Invlist,
            Self::Padlist(_) => SvKind::Padlist,
            Self::Padnames(_) => SvKind::Padnames,
            Self::Pad(_) => SvKind::Pad,
        }
    }
}

/// A single heap object: common header plus typed body, with the derived
/// per-object caches (inrefs list, reachability colour) set at most once.
#[derive(Debug, Clone)]
pub struct Sv {
    pub(crate) addr: Addr,
    pub(crate) refcnt: u32,
    pub(crate) size: u64,
    pub(crate) blessed_at: Addr,
    /// Owning glob's address, propagated by fixup into slot objects.
    pub(crate) glob_at: Addr,
    pub(crate) magic: SmallVec<[Magic; 1]>,
    pub(crate) body: SvBody,
    pub(crate) inrefs: Option<Vec<Inref>>,
    pub(crate) reach: Option<Reach>,
}

impl Sv {
    pub(crate) fn new(addr: Addr, refcnt: u32, size: u64, blessed_at: Addr, body: SvBody) -> Self {
        Self {
            addr,
            refcnt,
            size,
            blessed_at,
            glob_at: 0,
            magic: SmallVec::new(),
            body,
            inrefs: None,
            reach: None,
        }
    }

    /// The object's address: its identity for the lifetime of the dump.
    #[must_use]
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// The producer-recorded reference count.
    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    /// Bytes the producer charged to this object.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The blessing stash, if the object is blessed into a class.
    #[must_use]
    pub fn blessed_at(&self) -> Option<Addr> {
        non_null(self.blessed_at)
    }

    /// The owning glob, for objects sitting in a glob slot (set by fixup).
    #[must_use]
    pub fn glob_at(&self) -> Option<Addr> {
        non_null(self.glob_at)
    }

    /// Magic annotations in attachment order.
    #[must_use]
    pub fn magic(&self) -> &[Magic] {
        &self.magic
    }

    /// The typed body.
    #[must_use]
    pub fn body(&self) -> &SvBody {
        &self.body
    }

    /// The object kind.
    #[must_use]
    pub fn kind(&self) -> SvKind {
        self.body.kind()
    }

    /// The reachability colour, once the classifier has run. `None` means
    /// either "not yet classified" or "unreachable".
    #[must_use]
    pub fn reach(&self) -> Option<Reach> {
        self.reach
    }

    /// The cached inrefs list, once the inverse index has been built.
    #[must_use]
    pub fn cached_inrefs(&self) -> Option<&[Inref]> {
        self.inrefs.as_deref()
    }

    /// A short self-description, e.g. `SCALAR(PV)`, `ARRAY(3)`, `STASH(Foo)`.
    #[must_use]
    pub fn desc(&self) -> String {
        match &self.body {
            SvBody::Glob(g) => match &g.name {
                Some(name) => format!("GLOB({})", String::from_utf8_lossy(name)),
                None => "GLOB()".to_owned(),
            },
            SvBody::Scalar(s) => {
                let mut parts = Vec::with_capacity(4);
                if s.uv.is_some() {
                    parts.push("UV");
                }
                if s.iv.is_some() {
                    parts.push("IV");
                }
                if s.nv.is_some() {
                    parts.push("NV");
                }
                if s.pv.is_some() {
                    parts.push("PV");
                }
                format!("SCALAR({})", parts.join(","))
            }
            SvBody::Ref(r) => {
                if r.weak {
                    "REF(W)".to_owned()
                } else {
                    "REF()".to_owned()
                }
            }
            SvBody::Array(a) => {
                if a.unreal {
                    format!("ARRAY({},!REAL)", a.elems.len())
                } else {
                    format!("ARRAY({})", a.elems.len())
                }
            }
            SvBody::Hash(h) => format!("HASH({})", h.entries.len()),
            SvBody::Stash(st) => {
                format!("STASH({})", st.name.as_deref().unwrap_or(""))
            }
            SvBody::Code(_) => "CODE()".to_owned(),
            SvBody::Io(_) => "IO()".to_owned(),
            SvBody::Lvalue(lv) => format!("LVALUE({})", char::from(lv.kind)),
            SvBody::Regexp => "REGEXP()".to_owned(),
            SvBody::Format => "FORMAT()".to_owned(),
            SvBody::Invlist => "INVLIST()".to_owned(),
            SvBody::Padlist(p) => format!("PADLIST({})", p.elems.len()),
            SvBody::Padnames(p) => format!("PADNAMES({})", p.elems.len()),
            SvBody::Pad(p) => format!("PAD({})", p.elems.len()),
        }
    }

    /// The short description with the address appended.
    #[must_use]
    pub fn desc_addr(&self) -> String {
        format!("{desc} at {addr:#x}", desc = self.desc(), addr = self.addr)
    }

    /// Estimates the fixed-shape bytes this object occupies in the producer,
    /// from the variant and the dump's platform widths. Distinct from
    /// [`size`](Self::size), which is the producer-recorded owned total.
    #[must_use]
    pub fn structure_size(&self, config: ReaderConfig) -> u64 {
        let ptr = config.ptr_size.bytes() as u64;
        let uint = config.uint_size.bytes() as u64;
        let float = config.float_size.bytes() as u64;
        let common = 2 * ptr + 4 + uint;
        let body = match &self.body {
            SvBody::Glob(_) => 8 * ptr + uint,
            SvBody::Scalar(_) => 1 + 2 * uint + float + ptr,
            SvBody::Ref(_) => 1 + 2 * ptr,
            SvBody::Array(a) => uint + 1 + a.elems.len() as u64 * ptr,
            SvBody::Hash(h) => uint + ptr + h.entries.len() as u64 * (uint + ptr),
            SvBody::Stash(st) => {
                uint + 5 * ptr + st.hash.entries.len() as u64 * (uint + ptr)
            }
            SvBody::Code(c) => {
                uint + 1
                    + 7 * ptr
                    + (c.constants.len() + c.globrefs.len() + c.pads.len()) as u64 * ptr
            }
            SvBody::Io(_) => 3 * ptr,
            SvBody::Lvalue(_) => 1 + 2 * uint + ptr,
            SvBody::Regexp | SvBody::Format | SvBody::Invlist => 0,
            SvBody::Padlist(p) | SvBody::Padnames(p) | SvBody::Pad(p) => {
                uint + 1 + p.elems.len() as u64 * ptr
            }
        };
        common + body
    }

    /// The hash portion, for HASH and STASH objects.
    #[must_use]
    pub fn hash_body(&self) -> Option<&HashBody> {
        match &self.body {
            SvBody::Hash(h) => Some(h),
            SvBody::Stash(st) => Some(&st.hash),
            _ => None,
        }
    }

    pub(crate) fn hash_body_mut(&mut self) -> Option<&mut HashBody> {
        match &mut self.body {
            SvBody::Hash(h) => Some(h),
            SvBody::Stash(st) => Some(&mut st.hash),
            _ => None,
        }
    }

    /// Element addresses, for ARRAY and the synthetic padlist subtypes.
    #[must_use]
    pub fn array_elems(&self) -> Option<&[Addr]> {
        match &self.body {
            SvBody::Array(a) => Some(&a.elems),
            SvBody::Padlist(p) | SvBody::Padnames(p) | SvBody::Pad(p) => Some(&p.elems),
            _ => None,
        }
    }

    /// `true` when this is a REF with no magic attached: the shape that
    /// triggers indirect "via RV" reference emission.
    #[must_use]
    pub(crate) fn is_plain_ref(&self) -> Option<Addr> {
        match &self.body {
            SvBody::Ref(r) if self.magic.is_empty() => non_null(r.rv),
            _ => None,
        }
    }
}
