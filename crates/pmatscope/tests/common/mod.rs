//! In-memory PMAT dump builder: the test-side producer.
//!
//! Emits the dump format byte-for-byte (little-endian, 64-bit integers and
//! pointers, 8-byte floats) so every suite can assemble exactly the heap it
//! needs without fixture files. Record encoders mirror the wire layout: the
//! type-specific header, the common header, declared pointers, declared
//! strings, then any per-type variable body.

#![allow(dead_code)] // each suite uses its own slice of the builder

use pmatscope::{Addr, Dumpfile};

/// Immortal addresses baked into every built dump.
pub const UNDEF: Addr = 0xabc0;
pub const YES: Addr = 0xabc8;
pub const NO: Addr = 0xabd0;

const FLAG_UINT64: u8 = 0x02;
const FLAG_PTR64: u8 = 0x04;
const FLAG_ITHREADS: u8 = 0x10;

/// (header_bytes, nptrs, nstrs) for tags 1..=12 under the default widths.
const SHAPES: [(u8, u8, u8); 12] = [
    (8, 8, 2),  // GLOB: line; stash..form; name, file
    (25, 1, 1), // SCALAR: flags, uv, nv, pvlen; ourstash; pv
    (1, 2, 0),  // REF: flags; rv, ourstash
    (9, 0, 0),  // ARRAY: n, flags
    (8, 1, 0),  // HASH: n_keys; backrefs
    (8, 5, 1),  // STASH: n_keys; backrefs + 4 mro; name
    (17, 5, 1), // CODE: line, flags, oproot; stash..constval; file
    (0, 3, 0),  // IO: topgv, fmtgv, bottomgv
    (17, 1, 0), // LVALUE: type, off, len; target
    (0, 0, 0),  // REGEXP
    (0, 0, 0),  // FORMAT
    (0, 0, 0),  // INVLIST
];

#[derive(Debug, Clone)]
pub struct GlobRec {
    pub stash: Addr,
    pub scalar: Addr,
    pub array: Addr,
    pub hash: Addr,
    pub code: Addr,
    pub egv: Addr,
    pub io: Addr,
    pub form: Addr,
    pub name: Option<Vec<u8>>,
    pub file: Option<Vec<u8>>,
    pub line: u64,
    pub refcnt: u32,
    pub size: u64,
    pub blessed: Addr,
}

impl Default for GlobRec {
    fn default() -> Self {
        Self {
            stash: 0,
            scalar: 0,
            array: 0,
            hash: 0,
            code: 0,
            egv: 0,
            io: 0,
            form: 0,
            name: None,
            file: None,
            line: 0,
            refcnt: 1,
            size: 0,
            blessed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScalarRec {
    pub uv: Option<u64>,
    pub iv: Option<i64>,
    pub nv: Option<f64>,
    pub pv: Option<Vec<u8>>,
    pub utf8: bool,
    pub ourstash: Addr,
    pub refcnt: u32,
    pub size: u64,
    pub blessed: Addr,
}

impl Default for ScalarRec {
    fn default() -> Self {
        Self {
            uv: None,
            iv: None,
            nv: None,
            pv: None,
            utf8: false,
            ourstash: 0,
            refcnt: 1,
            size: 0,
            blessed: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CodeRec {
    pub stash: Addr,
    pub glob: Addr,
    pub outside: Addr,
    pub padlist: Addr,
    pub constval: Addr,
    pub oproot: Addr,
    pub line: u64,
    pub file: Option<Vec<u8>>,
    pub is_clone: bool,
    pub is_cloned: bool,
    pub is_xsub: bool,
    pub weak_outside: bool,
    pub glob_refcounted: bool,
    pub codex: Vec<Codex>,
    pub refcnt: u32,
    pub size: u64,
    pub blessed: Addr,
}

impl Default for CodeRec {
    fn default() -> Self {
        Self {
            stash: 0,
            glob: 0,
            outside: 0,
            padlist: 0,
            constval: 0,
            oproot: 0,
            line: 0,
            file: None,
            is_clone: false,
            is_cloned: false,
            is_xsub: false,
            weak_outside: false,
            glob_refcounted: false,
            codex: Vec::new(),
            refcnt: 1,
            size: 0,
            blessed: 0,
        }
    }
}

/// CODEx sub-records, in emission order.
#[derive(Debug, Clone, Copy)]
pub enum Codex {
    ConstSv(Addr),
    ConstIx(u64),
    GvSv(Addr),
    GvIx(u64),
    Padnames(Addr),
    Pad(u64, Addr),
}

#[derive(Debug)]
pub struct DumpBuilder {
    perl_version: u32,
    minor: u8,
    ithreads: bool,
    roots: Vec<(Vec<u8>, Addr)>,
    stack: Vec<Addr>,
    heap: Vec<u8>,
    contexts: Vec<u8>,
}

impl Default for DumpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DumpBuilder {
    pub fn new() -> Self {
        Self {
            perl_version: (5 << 24) | (36 << 16),
            minor: 4,
            ithreads: false,
            roots: Vec::new(),
            stack: Vec::new(),
            heap: Vec::new(),
            contexts: Vec::new(),
        }
    }

    pub fn perl_version(mut self, rev: u8, ver: u8, sub: u16) -> Self {
        self.perl_version =
            (u32::from(rev) << 24) | (u32::from(ver) << 16) | u32::from(sub);
        self
    }

    pub fn format_minor(mut self, minor: u8) -> Self {
        self.minor = minor;
        self
    }

    pub fn ithreads(mut self) -> Self {
        self.ithreads = true;
        self
    }

    pub fn root(&mut self, name: &str, addr: Addr) -> &mut Self {
        self.roots.push((name.as_bytes().to_vec(), addr));
        self
    }

    pub fn stack_push(&mut self, addr: Addr) -> &mut Self {
        self.stack.push(addr);
        self
    }

    // --- record encoders -------------------------------------------------

    pub fn glob(&mut self, addr: Addr, rec: GlobRec) -> &mut Self {
        self.heap.push(1);
        push_u64(&mut self.heap, rec.line);
        self.common(addr, rec.refcnt, rec.size, rec.blessed);
        for ptr in [
            rec.stash, rec.scalar, rec.array, rec.hash, rec.code, rec.egv, rec.io, rec.form,
        ] {
            push_u64(&mut self.heap, ptr);
        }
        push_str(&mut self.heap, rec.name.as_deref());
        push_str(&mut self.heap, rec.file.as_deref());
        self
    }

    pub fn scalar(&mut self, addr: Addr, rec: ScalarRec) -> &mut Self {
        let mut flags = 0u8;
        let mut wire_uv = 0u64;
        if let Some(uv) = rec.uv {
            flags |= 0x01;
            wire_uv = uv;
        }
        if let Some(iv) = rec.iv {
            flags |= 0x02;
            wire_uv = iv as u64;
        }
        if rec.nv.is_some() {
            flags |= 0x04;
        }
        if rec.pv.is_some() {
            flags |= 0x08;
        }
        if rec.utf8 {
            flags |= 0x10;
        }
        self.heap.push(2);
        self.heap.push(flags);
        push_u64(&mut self.heap, wire_uv);
        push_u64(&mut self.heap, rec.nv.unwrap_or(0.0).to_bits());
        push_u64(&mut self.heap, rec.pv.as_ref().map_or(0, |pv| pv.len() as u64));
        self.common(addr, rec.refcnt, rec.size, rec.blessed);
        push_u64(&mut self.heap, rec.ourstash);
        push_str(&mut self.heap, rec.pv.as_deref());
        self
    }

    /// A plain PV scalar.
    pub fn scalar_pv(&mut self, addr: Addr, pv: &[u8]) -> &mut Self {
        self.scalar(
            addr,
            ScalarRec {
                pv: Some(pv.to_vec()),
                ..ScalarRec::default()
            },
        )
    }

    pub fn ref_sv(&mut self, addr: Addr, rv: Addr, weak: bool) -> &mut Self {
        self.ref_sv_full(addr, rv, weak, 0, 0)
    }

    pub fn ref_sv_full(
        &mut self,
        addr: Addr,
        rv: Addr,
        weak: bool,
        ourstash: Addr,
        blessed: Addr,
    ) -> &mut Self {
        self.heap.push(3);
        self.heap.push(u8::from(weak));
        self.common(addr, 1, 0, blessed);
        push_u64(&mut self.heap, rv);
        push_u64(&mut self.heap, ourstash);
        self
    }

    pub fn array(&mut self, addr: Addr, elems: &[Addr], real: bool) -> &mut Self {
        self.heap.push(4);
        push_u64(&mut self.heap, elems.len() as u64);
        self.heap.push(u8::from(!real));
        self.common(addr, 1, 0, 0);
        for &elem in elems {
            push_u64(&mut self.heap, elem);
        }
        self
    }

    pub fn hash(&mut self, addr: Addr, entries: &[(&[u8], Addr)], backrefs: Addr) -> &mut Self {
        self.heap.push(5);
        push_u64(&mut self.heap, entries.len() as u64);
        self.common(addr, 1, 0, 0);
        push_u64(&mut self.heap, backrefs);
        for (key, value) in entries {
            push_str(&mut self.heap, Some(key));
            push_u64(&mut self.heap, *value);
        }
        self
    }

    pub fn stash(
        &mut self,
        addr: Addr,
        name: &str,
        entries: &[(&[u8], Addr)],
        backrefs: Addr,
    ) -> &mut Self {
        self.stash_with_mro(addr, name, entries, backrefs, [0; 4])
    }

    pub fn stash_with_mro(
        &mut self,
        addr: Addr,
        name: &str,
        entries: &[(&[u8], Addr)],
        backrefs: Addr,
        mro: [Addr; 4],
    ) -> &mut Self {
        self.heap.push(6);
        push_u64(&mut self.heap, entries.len() as u64);
        self.common(addr, 1, 0, 0);
        push_u64(&mut self.heap, backrefs);
        for ptr in mro {
            push_u64(&mut self.heap, ptr);
        }
        push_str(&mut self.heap, Some(name.as_bytes()));
        for (key, value) in entries {
            push_str(&mut self.heap, Some(key));
            push_u64(&mut self.heap, *value);
        }
        self
    }

    pub fn code(&mut self, addr: Addr, rec: CodeRec) -> &mut Self {
        let mut flags = 0u8;
        if rec.is_clone {
            flags |= 0x01;
        }
        if rec.is_cloned {
            flags |= 0x02;
        }
        if rec.is_xsub {
            flags |= 0x04;
        }
        if rec.weak_outside {
            flags |= 0x08;
        }
        if rec.glob_refcounted {
            flags |= 0x10;
        }
        self.heap.push(7);
        push_u64(&mut self.heap, rec.line);
        self.heap.push(flags);
        push_u64(&mut self.heap, rec.oproot);
        self.common(addr, rec.refcnt, rec.size, rec.blessed);
        for ptr in [rec.stash, rec.glob, rec.outside, rec.padlist, rec.constval] {
            push_u64(&mut self.heap, ptr);
        }
        push_str(&mut self.heap, rec.file.as_deref());
        for codex in &rec.codex {
            match *codex {
                Codex::ConstSv(sv) => {
                    self.heap.push(1);
                    push_u64(&mut self.heap, sv);
                }
                Codex::ConstIx(ix) => {
                    self.heap.push(2);
                    push_u64(&mut self.heap, ix);
                }
                Codex::GvSv(gv) => {
                    self.heap.push(3);
                    push_u64(&mut self.heap, gv);
                }
                Codex::GvIx(ix) => {
                    self.heap.push(4);
                    push_u64(&mut self.heap, ix);
                }
                Codex::Padnames(padnames) => {
                    self.heap.push(7);
                    push_u64(&mut self.heap, padnames);
                }
                Codex::Pad(depth, pad) => {
                    self.heap.push(8);
                    push_u64(&mut self.heap, depth);
                    push_u64(&mut self.heap, pad);
                }
            }
        }
        self.heap.push(0);
        self
    }

    pub fn io(&mut self, addr: Addr, topgv: Addr, fmtgv: Addr, bottomgv: Addr) -> &mut Self {
        self.heap.push(8);
        self.common(addr, 1, 0, 0);
        for ptr in [topgv, fmtgv, bottomgv] {
            push_u64(&mut self.heap, ptr);
        }
        self
    }

    pub fn lvalue(&mut self, addr: Addr, kind: u8, off: u64, len: u64, target: Addr) -> &mut Self {
        self.heap.push(9);
        self.heap.push(kind);
        push_u64(&mut self.heap, off);
        push_u64(&mut self.heap, len);
        self.common(addr, 1, 0, 0);
        push_u64(&mut self.heap, target);
        self
    }

    pub fn regexp(&mut self, addr: Addr, size: u64) -> &mut Self {
        self.heap.push(10);
        self.common_sized(addr, 1, size, 0);
        self
    }

    pub fn magic(
        &mut self,
        owner: Addr,
        mg_type: char,
        refcounted: bool,
        obj: Addr,
        ptr: Addr,
    ) -> &mut Self {
        self.heap.push(0x80);
        push_u64(&mut self.heap, owner);
        self.heap.push(mg_type as u8);
        self.heap.push(u8::from(refcounted));
        push_u64(&mut self.heap, obj);
        if self.minor >= 2 {
            push_u64(&mut self.heap, ptr);
        }
        self
    }

    /// Appends raw bytes to the heap stream, for corrupt-input tests.
    pub fn push_heap_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.heap.extend_from_slice(bytes);
        self
    }

    fn common(&mut self, addr: Addr, refcnt: u32, size: u64, blessed: Addr) {
        self.common_sized(addr, refcnt, size, blessed);
    }

    fn common_sized(&mut self, addr: Addr, refcnt: u32, size: u64, blessed: Addr) {
        push_u64(&mut self.heap, addr);
        self.heap.extend_from_slice(&refcnt.to_le_bytes());
        push_u64(&mut self.heap, size);
        push_u64(&mut self.heap, blessed);
    }

    // --- context encoders ------------------------------------------------

    pub fn context_sub(
        &mut self,
        gimme: u8,
        file: &str,
        line: u64,
        cv: Addr,
        args: Addr,
    ) -> &mut Self {
        self.contexts.push(1);
        self.contexts.push(gimme);
        push_str(&mut self.contexts, Some(file.as_bytes()));
        push_u64(&mut self.contexts, line);
        push_u64(&mut self.contexts, cv);
        push_u64(&mut self.contexts, args);
        self
    }

    pub fn context_try(&mut self, gimme: u8, file: &str, line: u64) -> &mut Self {
        self.contexts.push(2);
        self.contexts.push(gimme);
        push_str(&mut self.contexts, Some(file.as_bytes()));
        push_u64(&mut self.contexts, line);
        self
    }

    pub fn context_eval(&mut self, gimme: u8, file: &str, line: u64, source: Addr) -> &mut Self {
        self.contexts.push(3);
        self.contexts.push(gimme);
        push_str(&mut self.contexts, Some(file.as_bytes()));
        push_u64(&mut self.contexts, line);
        push_u64(&mut self.contexts, source);
        self
    }

    // --- assembly --------------------------------------------------------

    pub fn build(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"PMAT");
        let mut flags = FLAG_UINT64 | FLAG_PTR64;
        if self.ithreads {
            flags |= FLAG_ITHREADS;
        }
        out.push(flags);
        out.push(0); // reserved
        out.push(0); // format major
        out.push(self.minor);
        out.extend_from_slice(&self.perl_version.to_le_bytes());

        out.push(SHAPES.len() as u8);
        for (header_bytes, nptrs, nstrs) in SHAPES {
            out.extend_from_slice(&[header_bytes, nptrs, nstrs]);
        }

        for immortal in [UNDEF, YES, NO] {
            push_u64(&mut out, immortal);
        }

        out.extend_from_slice(&(self.roots.len() as u32).to_le_bytes());
        for (name, addr) in &self.roots {
            push_str(&mut out, Some(name));
            push_u64(&mut out, *addr);
        }

        push_u64(&mut out, self.stack.len() as u64);
        for &addr in &self.stack {
            push_u64(&mut out, addr);
        }

        out.extend_from_slice(&self.heap);
        out.push(0);

        if !self.contexts.is_empty() {
            out.extend_from_slice(&self.contexts);
            out.push(0);
        }
        out
    }

    pub fn load(&self) -> Dumpfile {
        Dumpfile::load(self.build().as_slice()).expect("builder output should load")
    }
}

fn push_u64(out: &mut Vec<u8>, value: u64) {
    out.extend_from_slice(&value.to_le_bytes());
}

fn push_str(out: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            push_u64(out, bytes.len() as u64);
            out.extend_from_slice(bytes);
        }
        None => push_u64(out, u64::MAX),
    }
}

// --- the shared package-scalar fixture -----------------------------------

/// Addresses used by [`package_scalar_dump`].
pub mod fixture {
    use super::Addr;

    pub const STASH: Addr = 0x1000;
    pub const BACKREFS: Addr = 0x1100;
    pub const GLOB: Addr = 0x1200;
    pub const SCALAR: Addr = 0x1300;
}

/// A dump of `$main::PACKAGE_SCALAR = "some value"`: the default stash with
/// its self-entry and backrefs list, one glob, one scalar.
pub fn package_scalar_dump() -> DumpBuilder {
    let mut b = DumpBuilder::new();
    b.root("defstash", fixture::STASH);
    b.stash(
        fixture::STASH,
        "main",
        &[
            (b"PACKAGE_SCALAR", fixture::GLOB),
            (b"main::", fixture::STASH),
        ],
        fixture::BACKREFS,
    );
    b.array(fixture::BACKREFS, &[fixture::GLOB], true);
    b.glob(
        fixture::GLOB,
        GlobRec {
            stash: fixture::STASH,
            scalar: fixture::SCALAR,
            egv: fixture::GLOB,
            name: Some(b"PACKAGE_SCALAR".to_vec()),
            file: Some(b"t/script.pl".to_vec()),
            line: 3,
            ..GlobRec::default()
        },
    );
    b.scalar_pv(fixture::SCALAR, b"some value");
    b
}
