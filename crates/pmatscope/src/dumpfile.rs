//! Dump-file loading, the object arena, and the fixup pass.
//!
//! Loading is two-pass: the record pass decodes the header, immortal
//! singletons, named roots, the operand stack, and every heap record into
//! the arena; the fixup pass then resolves the cross-object invariants that
//! need random access (padlist reclassification, glob back-links, backrefs
//! marking, ithreads constant resolution, shared-string-table scrubbing).
//! Loader failures are fatal: no partial dumpfile is ever returned.

use std::{
    collections::BTreeMap,
    fmt,
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    contexts::{Context, read_contexts},
    error::{PmatError, PmatResult},
    format::{
        FORMAT_MAJOR, FORMAT_MINOR, HeaderFlags, MAGIC, MINOR_MAGIC_PTR, PerlVersion, SvShape,
        SvTag, TAG_MAGIC, codex,
    },
    progress::{NoProgress, PROGRESS_INTERVAL, Progress},
    reader::{Endian, PmatReader, ReaderConfig},
    sv::{
        Addr, ArrayBody, CodeBody, GlobBody, HashBody, IoBody, LvalueBody, Magic, PadBody, RefBody,
        ScalarBody, StashBody, Sv, SvBody, SvKind, non_null,
    },
};

/// Well-known root names and their descriptions. Unknown names load fine
/// and fall back to the raw name.
const ROOT_DESCRIPTIONS: &[(&str, &str)] = &[
    ("main_cv", "the main code"),
    ("defstash", "the default stash"),
    ("mainstack", "the main stack AV"),
    ("beginav", "the BEGIN list"),
    ("checkav", "the CHECK list"),
    ("unitcheckav", "the UNITCHECK list"),
    ("initav", "the INIT list"),
    ("endav", "the END list"),
    ("strtab", "the shared string table"),
    ("envgv", "the ENV GV"),
    ("incgv", "the @INC GV"),
    ("statgv", "the stat GV"),
    ("statname", "the statname SV"),
    ("tmpsv", "the temporary SV"),
    ("defgv", "the default GV"),
    ("argvgv", "the ARGV GV"),
    ("argvoutgv", "the argvout GV"),
    ("errgv", "the error GV"),
    ("debstash", "the debugger stash"),
    ("stashcache", "the stash cache"),
    ("isarev", "the ISA reverse map"),
    ("registered_mros", "the registered MROs"),
    ("rs", "the record separator"),
    ("last_in_gv", "the last input GV"),
    ("defoutgv", "the default output GV"),
    ("hintgv", "the hints GV"),
    ("patchlevel", "the patch level"),
    ("e_script", "the '-e' script"),
    ("mess_sv", "the message SV"),
    ("ors_sv", "the output record separator"),
];

/// A named root: a well-known interpreter global pinned in the dump header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Root<'a> {
    /// The producer's name for the root, e.g. `"defstash"`.
    pub name: &'a str,
    pub addr: Addr,
}

impl Root<'_> {
    /// A human-readable description, falling back to the raw name for roots
    /// this build does not know.
    #[must_use]
    pub fn description(&self) -> &str {
        root_description(self.name).unwrap_or(self.name)
    }
}

/// Looks up the description for a well-known root name.
#[must_use]
pub fn root_description(name: &str) -> Option<&'static str> {
    ROOT_DESCRIPTIONS
        .iter()
        .find(|&&(known, _)| known == name)
        .map(|&(_, desc)| desc)
}

/// Per-kind census entry of a [`HeapSummary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct KindStats {
    /// Number of live objects of this kind.
    pub count: usize,
    /// Producer-recorded owned bytes, summed.
    pub owned_bytes: u64,
    /// Fixed-shape bytes implied by the variant and platform widths, summed.
    pub structure_bytes: u64,
}

/// A by-kind census of the loaded heap.
///
/// Kinds are keyed by their display name in a `BTreeMap` for deterministic
/// iteration, making summaries directly comparable and printable.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HeapSummary {
    /// Census per object kind.
    pub kinds: BTreeMap<&'static str, KindStats>,
    /// Total number of live objects.
    pub total_count: usize,
    /// Total producer-recorded owned bytes.
    pub total_owned_bytes: u64,
}

impl fmt::Display for HeapSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{count} objects, {bytes} bytes owned",
            count = self.total_count,
            bytes = self.total_owned_bytes
        )?;
        for (kind, stats) in &self.kinds {
            writeln!(
                f,
                "  {kind}: {count} ({bytes} bytes)",
                count = stats.count,
                bytes = stats.owned_bytes
            )?;
        }
        Ok(())
    }
}

/// Defensive cursor over a type-specific header buffer.
///
/// The size table dictates how many header bytes each record carries; a
/// newer producer may append fields we skip, an older one may omit fields,
/// which then read as `None`. Reads never fail, they just stop yielding.
struct HeaderCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    config: ReaderConfig,
}

impl<'a> HeaderCursor<'a> {
    fn new(buf: &'a [u8], config: ReaderConfig) -> Self {
        Self { buf, pos: 0, config }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.buf.len() {
            self.pos = self.buf.len();
            return None;
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn read_fixed(&mut self, n: usize) -> Option<u64> {
        let bytes = self.take(n)?;
        let mut value = 0u64;
        match self.config.endian {
            Endian::Little => {
                for &b in bytes.iter().rev() {
                    value = (value << 8) | u64::from(b);
                }
            }
            Endian::Big => {
                for &b in bytes {
                    value = (value << 8) | u64::from(b);
                }
            }
        }
        Some(value)
    }

    fn read_uint(&mut self) -> Option<u64> {
        self.read_fixed(self.config.uint_size.bytes())
    }

    fn read_ptr(&mut self) -> Option<u64> {
        self.read_fixed(self.config.ptr_size.bytes())
    }

    fn read_float(&mut self) -> Option<f64> {
        // Re-decode through the stream reader so all three widths share one
        // conversion path.
        let bytes = self.take(self.config.float_size.bytes())?;
        let mut reader = PmatReader::new(bytes, self.config);
        reader.read_float().ok()
    }
}

/// A fully loaded and fixed-up dump: the arena of all heap objects, the
/// named roots, the operand stack, and the call-context stack.
///
/// The dumpfile owns every object; analyses refer to objects by address and
/// resolve them through [`sv_at`](Self::sv_at).
#[derive(Debug)]
pub struct Dumpfile {
    config: ReaderConfig,
    format_minor: u8,
    perl_version: PerlVersion,
    ithreads: bool,
    pub(crate) svs: Vec<Sv>,
    pub(crate) by_addr: AHashMap<Addr, usize>,
    /// Immortal addresses, in `undef`, `yes`, `no` order.
    pub(crate) immortals: [Addr; 3],
    roots: IndexMap<String, Addr>,
    pub(crate) stack: Vec<Addr>,
    contexts: Vec<Context>,
    /// Map from oproot to the prototype CODE carrying it, for the inferred
    /// closure-prototype link.
    protosubs: AHashMap<Addr, Addr>,
    pub(crate) inrefs_built: bool,
    pub(crate) reach_done: bool,
}

impl Dumpfile {
    /// Loads a dump from a stream.
    pub fn load<R: Read>(reader: R) -> PmatResult<Self> {
        Self::load_with_progress(reader, &mut NoProgress)
    }

    /// Loads a dump from a file path.
    pub fn load_path<P: AsRef<Path>>(path: P) -> PmatResult<Self> {
        Self::load(BufReader::new(File::open(path)?))
    }

    /// Loads a dump, reporting progress at fixed work intervals.
    pub fn load_with_progress<R: Read, P: Progress>(
        reader: R,
        progress: &mut P,
    ) -> PmatResult<Self> {
        let mut reader = PmatReader::new(reader, ReaderConfig::provisional());

        let magic = reader.read_bytes(4)?;
        if magic != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&magic);
            return Err(PmatError::BadMagic { found });
        }

        let flags = HeaderFlags::from_byte(reader.read_u8()?)?;
        reader.set_config(flags.config);
        let _reserved = reader.read_u8()?;
        let major = reader.read_u8()?;
        let minor = reader.read_u8()?;
        if major != FORMAT_MAJOR {
            return Err(PmatError::BadVersion { major, minor });
        }
        if minor != FORMAT_MINOR {
            progress.on_warning(&format!(
                "format version 0.{minor} differs from supported 0.{FORMAT_MINOR}; \
                 loading fields best-effort"
            ));
        }
        let perl_version = PerlVersion::from_packed(reader.read_u32()?);

        let n_types = reader.read_u8()?;
        let mut shapes = Vec::with_capacity(usize::from(n_types));
        for _ in 0..n_types {
            shapes.push(SvShape {
                header_bytes: reader.read_u8()?,
                nptrs: reader.read_u8()?,
                nstrs: reader.read_u8()?,
            });
        }

        let undef_at = reader.read_ptr()?;
        let yes_at = reader.read_ptr()?;
        let no_at = reader.read_ptr()?;

        let mut dump = Self {
            config: flags.config,
            format_minor: minor,
            perl_version,
            ithreads: flags.ithreads,
            svs: Vec::new(),
            by_addr: AHashMap::new(),
            immortals: [undef_at, yes_at, no_at],
            roots: IndexMap::new(),
            stack: Vec::new(),
            contexts: Vec::new(),
            protosubs: AHashMap::new(),
            inrefs_built: false,
            reach_done: false,
        };

        dump.insert_sv(make_undef(undef_at));
        dump.insert_sv(make_bool(yes_at, true));
        dump.insert_sv(make_bool(no_at, false));

        let n_roots = reader.read_u32()?;
        for _ in 0..n_roots {
            let name = match reader.read_str()? {
                Some(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
                None => {
                    return Err(PmatError::Truncated {
                        position: reader.position(),
                    });
                }
            };
            let addr = reader.read_ptr()?;
            dump.roots.insert(name, addr);
        }

        let n_stack = reader.read_uint()?;
        for _ in 0..n_stack {
            dump.stack.push(reader.read_ptr()?);
        }

        // Heap body: tagged records until the zero tag. Magic annotations
        // may reference owners that appear later, so they are applied after
        // the whole stream is in.
        let mut pending_magic: Vec<(Addr, Magic)> = Vec::new();
        loop {
            let tag_position = reader.position();
            let tag = reader.read_u8()?;
            if tag == 0 {
                break;
            }
            if tag == TAG_MAGIC {
                let owner = reader.read_ptr()?;
                let mg_type = reader.read_u8()?;
                let mg_flags = reader.read_u8()?;
                let obj = reader.read_ptr()?;
                let ptr = if minor >= MINOR_MAGIC_PTR {
                    reader.read_ptr()?
                } else {
                    0
                };
                pending_magic.push((
                    owner,
                    Magic {
                        mg_type,
                        refcounted: mg_flags & 0x01 != 0,
                        obj,
                        ptr,
                    },
                ));
                continue;
            }
            let Some(sv_tag) = SvTag::from_byte(tag) else {
                return Err(PmatError::UnknownTag {
                    tag,
                    position: tag_position,
                });
            };
            let Some(&shape) = shapes.get(usize::from(tag) - 1) else {
                return Err(PmatError::UnknownTag {
                    tag,
                    position: tag_position,
                });
            };
            let sv = read_sv(&mut reader, sv_tag, shape)?;
            dump.insert_sv(sv);
            if dump.svs.len() % PROGRESS_INTERVAL == 0 {
                progress.on_load(dump.svs.len(), reader.position());
            }
        }
        progress.on_load(dump.svs.len(), reader.position());

        dump.contexts = read_contexts(&mut reader)?;

        for (owner, magic) in pending_magic {
            if let Some(sv) = dump.sv_at_mut(owner) {
                sv.magic.push(magic);
            }
        }

        dump.run_fixup_with_progress(progress);
        Ok(dump)
    }

    fn insert_sv(&mut self, sv: Sv) {
        if sv.addr == 0 {
            return;
        }
        match self.by_addr.get(&sv.addr) {
            // A real record at an already-seen address replaces the older
            // object (synthesized immortals included).
            Some(&idx) => self.svs[idx] = sv,
            None => {
                self.by_addr.insert(sv.addr, self.svs.len());
                self.svs.push(sv);
            }
        }
    }

    /// The platform configuration the dump was produced with.
    #[must_use]
    pub fn config(&self) -> ReaderConfig {
        self.config
    }

    /// The dump's format-minor version.
    #[must_use]
    pub fn format_minor(&self) -> u8 {
        self.format_minor
    }

    /// The producer interpreter's version.
    #[must_use]
    pub fn perl_version(&self) -> PerlVersion {
        self.perl_version
    }

    /// Whether the producer embedded constants in pads (ithreads build).
    #[must_use]
    pub fn ithreads(&self) -> bool {
        self.ithreads
    }

    /// Looks up an object by address. Unknown addresses are non-fatal and
    /// yield `None`.
    #[must_use]
    pub fn sv_at(&self, addr: Addr) -> Option<&Sv> {
        if addr == 0 {
            return None;
        }
        self.by_addr.get(&addr).map(|&idx| &self.svs[idx])
    }

    pub(crate) fn sv_at_mut(&mut self, addr: Addr) -> Option<&mut Sv> {
        if addr == 0 {
            return None;
        }
        self.by_addr.get(&addr).map(|&idx| &mut self.svs[idx])
    }

    /// All heap objects, in load order.
    pub fn heap(&self) -> impl Iterator<Item = &Sv> {
        self.svs.iter()
    }

    /// Number of objects in the arena.
    #[must_use]
    pub fn heap_len(&self) -> usize {
        self.svs.len()
    }

    /// The `undef` immortal.
    #[must_use]
    pub fn undef_at(&self) -> Addr {
        self.immortals[0]
    }

    /// The true-value immortal.
    #[must_use]
    pub fn yes_at(&self) -> Addr {
        self.immortals[1]
    }

    /// The false-value immortal.
    #[must_use]
    pub fn no_at(&self) -> Addr {
        self.immortals[2]
    }

    /// Whether `addr` is one of the three immortal singletons.
    #[must_use]
    pub fn is_immortal(&self, addr: Addr) -> bool {
        addr != 0 && self.immortals.contains(&addr)
    }

    /// The display name for an immortal address, if it is one.
    #[must_use]
    pub fn immortal_name(&self, addr: Addr) -> Option<&'static str> {
        if addr == 0 {
            return None;
        }
        if addr == self.immortals[0] {
            Some("undef")
        } else if addr == self.immortals[1] {
            Some("true")
        } else if addr == self.immortals[2] {
            Some("false")
        } else {
            None
        }
    }

    /// The named roots, in dump order.
    pub fn roots(&self) -> impl Iterator<Item = Root<'_>> {
        self.roots.iter().map(|(name, &addr)| Root {
            name: name.as_str(),
            addr,
        })
    }

    /// The address bound to a root name.
    #[must_use]
    pub fn root_addr(&self, name: &str) -> Option<Addr> {
        self.roots.get(name).copied().and_then(non_null)
    }

    /// The object bound to a root name.
    #[must_use]
    pub fn root_sv(&self, name: &str) -> Option<&Sv> {
        self.sv_at(self.root_addr(name)?)
    }

    /// The root name bound to `addr`, if any.
    #[must_use]
    pub fn root_at(&self, addr: Addr) -> Option<Root<'_>> {
        if addr == 0 {
            return None;
        }
        self.roots
            .iter()
            .find(|&(_, &root_addr)| root_addr == addr)
            .map(|(name, &addr)| Root {
                name: name.as_str(),
                addr,
            })
    }

    /// The operand-stack snapshot, top last.
    #[must_use]
    pub fn stack(&self) -> &[Addr] {
        &self.stack
    }

    /// The call-context stack, innermost first.
    #[must_use]
    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    /// The inferred closure-prototype of a cloned CODE object.
    #[must_use]
    pub fn protosub_of(&self, sv: &Sv) -> Option<Addr> {
        let SvBody::Code(code) = sv.body() else {
            return None;
        };
        if !code.is_cloned || code.oproot == 0 {
            return None;
        }
        self.protosubs
            .get(&code.oproot)
            .copied()
            .filter(|&proto| proto != sv.addr)
    }

    /// The language-level symbol name of an object owned by a glob slot,
    /// e.g. `$main::count`, available after fixup.
    #[must_use]
    pub fn symname_of(&self, sv: &Sv) -> Option<String> {
        let sigil = match sv.kind() {
            SvKind::Scalar | SvKind::Ref | SvKind::Lvalue => '$',
            SvKind::Array => '@',
            SvKind::Hash => '%',
            SvKind::Code => '&',
            _ => return None,
        };
        let glob = self.sv_at(sv.glob_at()?)?;
        let SvBody::Glob(g) = glob.body() else {
            return None;
        };
        let name = g.name.as_deref()?;
        let stash = self.sv_at(non_null(g.stash)?)?;
        let SvBody::Stash(st) = stash.body() else {
            return None;
        };
        let package = st.name.as_deref().unwrap_or("main");
        Some(format!(
            "{sigil}{package}::{name}",
            name = String::from_utf8_lossy(name)
        ))
    }

    /// A by-kind census of the heap.
    #[must_use]
    pub fn heap_summary(&self) -> HeapSummary {
        let mut kinds: BTreeMap<&'static str, KindStats> = BTreeMap::new();
        let mut total_owned_bytes = 0u64;
        for sv in &self.svs {
            let stats = kinds.entry(sv.kind().into()).or_default();
            stats.count += 1;
            stats.owned_bytes += sv.size();
            stats.structure_bytes += sv.structure_size(self.config);
            total_owned_bytes += sv.size();
        }
        HeapSummary {
            total_count: self.svs.len(),
            total_owned_bytes,
            kinds,
        }
    }

    /// Runs the fixup pass. Load already runs it; calling again is a no-op
    /// by construction, which is itself an invariant worth exercising.
    pub fn run_fixup(&mut self) {
        self.run_fixup_with_progress(&mut NoProgress);
    }

    fn run_fixup_with_progress<P: Progress>(&mut self, progress: &mut P) {
        let total = self.svs.len();

        // Glob slots: propagate the owning glob's address into its
        // scalar/array/hash/code slot objects.
        let mut backlinks: Vec<(Addr, Addr)> = Vec::new();
        // Hash backrefs arrays get flagged so their elements read as weak.
        let mut backref_arrays: Vec<Addr> = Vec::new();

        for sv in &self.svs {
            match sv.body() {
                SvBody::Glob(g) => {
                    for slot in [g.scalar, g.array, g.hash, g.code] {
                        if slot != 0 {
                            backlinks.push((slot, sv.addr));
                        }
                    }
                }
                SvBody::Hash(h) => {
                    if h.backrefs != 0 {
                        backref_arrays.push(h.backrefs);
                    }
                }
                SvBody::Stash(st) => {
                    if st.hash.backrefs != 0 {
                        backref_arrays.push(st.hash.backrefs);
                    }
                }
                _ => {}
            }
        }

        let mut done = 0usize;
        for (slot, glob_addr) in backlinks {
            if let Some(sv) = self.sv_at_mut(slot) {
                sv.glob_at = glob_addr;
            }
            done += 1;
            if done % PROGRESS_INTERVAL == 0 {
                progress.on_fixup(done, total);
            }
        }
        for addr in backref_arrays {
            if let Some(sv) = self.sv_at_mut(addr)
                && let SvBody::Array(a) = &mut sv.body
            {
                a.is_backrefs = true;
            }
        }

        self.fixup_codes(progress);
        self.scrub_strtab();
        progress.on_fixup(total, total);
    }

    /// Padlist handling per code object: reclassify the padlist array and
    /// its members into the synthetic subtypes, derive padnames/pads on
    /// pre-5.18 producers, and resolve ithreads pad-index constants.
    fn fixup_codes<P: Progress>(&mut self, progress: &mut P) {
        let explicit_pads = self.perl_version.at_least(5, 18);
        let code_indices: Vec<usize> = (0..self.svs.len())
            .filter(|&idx| matches!(self.svs[idx].body(), SvBody::Code(_)))
            .collect();
        let total = code_indices.len();

        for (done, &idx) in code_indices.iter().enumerate() {
            let code_addr = self.svs[idx].addr;
            let (padlist, mut padnames, mut pads, const_ixs, gv_ixs) = {
                let SvBody::Code(code) = &mut self.svs[idx].body else {
                    continue;
                };
                (
                    code.padlist,
                    code.padnames,
                    std::mem::take(&mut code.pads),
                    std::mem::take(&mut code.const_ixs),
                    std::mem::take(&mut code.gv_ixs),
                )
            };

            if padlist != 0 {
                self.reclassify(padlist, SvKind::Padlist, code_addr);
                if !explicit_pads {
                    // Element zero is padnames, the rest are per-depth pads.
                    if let Some(elems) = self.sv_at(padlist).and_then(Sv::array_elems) {
                        let mut elems = elems.iter().copied();
                        padnames = elems.next().unwrap_or(0);
                        pads = elems.collect();
                    }
                }
            }
            if padnames != 0 {
                self.reclassify(padnames, SvKind::Padnames, code_addr);
            }
            for &pad in &pads {
                if pad != 0 {
                    self.reclassify(pad, SvKind::Pad, code_addr);
                }
            }

            // Under ithreads the body's constants and globs live in pad
            // slots addressed by index: resolve them to real addresses and
            // blank the slots so reachability cannot double-count them.
            let mut resolved_consts = Vec::with_capacity(const_ixs.len());
            let mut resolved_gvs = Vec::with_capacity(gv_ixs.len());
            if !const_ixs.is_empty() || !gv_ixs.is_empty() {
                let first_pad = pads.first().copied().unwrap_or(0);
                let lookup = |df: &Self, ix: u64| -> Addr {
                    usize::try_from(ix)
                        .ok()
                        .and_then(|ix| {
                            df.sv_at(first_pad)
                                .and_then(Sv::array_elems)
                                .and_then(|elems| elems.get(ix).copied())
                        })
                        .unwrap_or(0)
                };
                for &ix in &const_ixs {
                    let resolved = lookup(self, ix);
                    if resolved != 0 {
                        resolved_consts.push(resolved);
                    }
                }
                for &ix in &gv_ixs {
                    let resolved = lookup(self, ix);
                    if resolved != 0 {
                        resolved_gvs.push(resolved);
                    }
                }
                let mut blank_targets: Vec<Addr> = pads.clone();
                blank_targets.push(padnames);
                for target in blank_targets {
                    let Some(sv) = self.sv_at_mut(target) else {
                        continue;
                    };
                    let elems = match &mut sv.body {
                        SvBody::Padlist(p) | SvBody::Padnames(p) | SvBody::Pad(p) => &mut p.elems,
                        SvBody::Array(a) => &mut a.elems,
                        _ => continue,
                    };
                    for &ix in const_ixs.iter().chain(&gv_ixs) {
                        if let Ok(ix) = usize::try_from(ix)
                            && let Some(slot) = elems.get_mut(ix)
                        {
                            *slot = 0;
                        }
                    }
                }
            }

            if let SvBody::Code(code) = &mut self.svs[idx].body {
                code.padnames = padnames;
                code.pads = pads;
                code.constants.extend(resolved_consts);
                code.globrefs.extend(resolved_gvs);
            }

            if done % PROGRESS_INTERVAL == 0 {
                progress.on_fixup(done, total);
            }
        }

        // The protosub map backs the inferred closure-prototype outref.
        self.protosubs.clear();
        for sv in &self.svs {
            if let SvBody::Code(code) = sv.body()
                && code.is_clone
                && code.oproot != 0
            {
                self.protosubs.entry(code.oproot).or_insert(sv.addr);
            }
        }
    }

    /// Turns an ARRAY into one of the synthetic padlist subtypes, or just
    /// refreshes the owning-code address if it already is one.
    fn reclassify(&mut self, addr: Addr, kind: SvKind, padcv: Addr) {
        let Some(sv) = self.sv_at_mut(addr) else {
            return;
        };
        let elems = match &mut sv.body {
            SvBody::Array(a) => std::mem::take(&mut a.elems),
            SvBody::Padlist(p) | SvBody::Padnames(p) | SvBody::Pad(p) => {
                p.padcv = padcv;
                return;
            }
            _ => return,
        };
        let body = PadBody { elems, padcv };
        sv.body = match kind {
            SvKind::Padlist => SvBody::Padlist(body),
            SvKind::Padnames => SvBody::Padnames(body),
            SvKind::Pad => SvBody::Pad(body),
            _ => return,
        };
    }

    /// The shared string table's values encode refcounts, not addresses;
    /// expose the hash with zero values so nothing traverses them.
    fn scrub_strtab(&mut self) {
        let Some(strtab) = self.roots.get("strtab").copied().and_then(non_null) else {
            return;
        };
        if let Some(sv) = self.sv_at_mut(strtab)
            && let Some(hash) = sv.hash_body_mut()
        {
            for value in hash.entries.values_mut() {
                *value = 0;
            }
        }
    }
}

fn make_undef(addr: Addr) -> Sv {
    Sv::new(addr, 1, 0, 0, SvBody::Scalar(ScalarBody::default()))
}

fn make_bool(addr: Addr, truth: bool) -> Sv {
    let body = ScalarBody {
        uv: Some(u64::from(truth)),
        iv: Some(i64::from(truth)),
        pv: Some(if truth { b"1".to_vec() } else { Vec::new() }),
        pvlen: Some(u64::from(truth)),
        ..ScalarBody::default()
    };
    Sv::new(addr, 1, 0, 0, SvBody::Scalar(body))
}

/// Decodes one SV record: type-specific header (sized by the table), the
/// common header, the declared pointers and strings, then any per-type
/// variable body.
fn read_sv<R: Read>(reader: &mut PmatReader<R>, tag: SvTag, shape: SvShape) -> PmatResult<Sv> {
    let config = reader.config();
    let header = reader.read_bytes(usize::from(shape.header_bytes))?;
    let mut cursor = HeaderCursor::new(&header, config);

    let addr = reader.read_ptr()?;
    let refcnt = reader.read_u32()?;
    let size = reader.read_uint()?;
    let blessed_at = reader.read_ptr()?;

    let ptrs = reader.read_ptrs(usize::from(shape.nptrs))?;
    let mut strs = Vec::with_capacity(usize::from(shape.nstrs));
    for _ in 0..shape.nstrs {
        strs.push(reader.read_str()?);
    }
    let ptr = |i: usize| ptrs.get(i).copied().unwrap_or(0);
    let lossy = |s: &Option<Vec<u8>>| {
        s.as_ref()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    };

    let body = match tag {
        SvTag::Glob => {
            let line = cursor.read_uint();
            SvBody::Glob(GlobBody {
                stash: ptr(0),
                scalar: ptr(1),
                array: ptr(2),
                hash: ptr(3),
                code: ptr(4),
                egv: ptr(5),
                io: ptr(6),
                form: ptr(7),
                name: strs.first().cloned().flatten(),
                file: strs.get(1).and_then(lossy),
                line,
            })
        }
        SvTag::Scalar => {
            let flags = cursor.read_u8().unwrap_or(0);
            let raw_uv = cursor.read_uint();
            let nv = cursor.read_float();
            let pvlen = cursor.read_uint();
            SvBody::Scalar(ScalarBody::from_wire(
                flags,
                raw_uv,
                nv,
                pvlen,
                strs.first().cloned().flatten(),
                ptr(0),
            ))
        }
        SvTag::Ref => {
            let flags = cursor.read_u8().unwrap_or(0);
            SvBody::Ref(RefBody {
                rv: ptr(0),
                weak: flags & 0x01 != 0,
                ourstash: ptr(1),
            })
        }
        SvTag::Array => {
            let n = cursor.read_uint().unwrap_or(0);
            let flags = cursor.read_u8().unwrap_or(0);
            let n = usize::try_from(n).map_err(|_| PmatError::Truncated {
                position: reader.position(),
            })?;
            let elems = reader.read_ptrs(n)?;
            SvBody::Array(ArrayBody {
                elems,
                unreal: flags & 0x01 != 0,
                is_backrefs: false,
            })
        }
        SvTag::Hash => {
            let hash = read_hash_body(reader, &mut cursor, ptr(0))?;
            SvBody::Hash(hash)
        }
        SvTag::Stash => {
            let hash = read_hash_body(reader, &mut cursor, ptr(0))?;
            SvBody::Stash(StashBody {
                hash,
                name: strs.first().and_then(lossy),
                mro_linear_all: ptr(1),
                mro_linear_current: ptr(2),
                mro_nextmethod: ptr(3),
                mro_isa: ptr(4),
            })
        }
        SvTag::Code => {
            let line = cursor.read_uint();
            let flags = cursor.read_u8().unwrap_or(0);
            let oproot = cursor.read_ptr().unwrap_or(0);
            let mut code = CodeBody {
                stash: ptr(0),
                glob: ptr(1),
                outside: ptr(2),
                padlist: ptr(3),
                constval: ptr(4),
                oproot,
                file: strs.first().and_then(lossy),
                line,
                is_clone: flags & 0x01 != 0,
                is_cloned: flags & 0x02 != 0,
                is_xsub: flags & 0x04 != 0,
                weak_outside: flags & 0x08 != 0,
                glob_refcounted: flags & 0x10 != 0,
                ..CodeBody::default()
            };
            read_codex(reader, &mut code)?;
            SvBody::Code(code)
        }
        SvTag::Io => SvBody::Io(IoBody {
            topgv: ptr(0),
            fmtgv: ptr(1),
            bottomgv: ptr(2),
        }),
        SvTag::Lvalue => {
            let kind = cursor.read_u8().unwrap_or(0);
            let off = cursor.read_uint().unwrap_or(0);
            let len = cursor.read_uint().unwrap_or(0);
            SvBody::Lvalue(LvalueBody {
                kind,
                off,
                len,
                target: ptr(0),
            })
        }
        SvTag::Regexp => SvBody::Regexp,
        SvTag::Format => SvBody::Format,
        SvTag::Invlist => SvBody::Invlist,
    };

    Ok(Sv::new(addr, refcnt, size, blessed_at, body))
}

/// Reads the key/value pairs of a HASH or STASH body. The pair count lives
/// in the type-specific header; the pairs themselves follow the strings.
fn read_hash_body<R: Read>(
    reader: &mut PmatReader<R>,
    cursor: &mut HeaderCursor<'_>,
    backrefs: Addr,
) -> PmatResult<HashBody> {
    let n_keys = cursor.read_uint().unwrap_or(0);
    let n_keys = usize::try_from(n_keys).map_err(|_| PmatError::Truncated {
        position: reader.position(),
    })?;
    let mut entries = IndexMap::with_capacity(n_keys);
    for _ in 0..n_keys {
        let key = reader.read_str()?.unwrap_or_default();
        let value = reader.read_ptr()?;
        entries.insert(key, value);
    }
    Ok(HashBody { entries, backrefs })
}

/// Reads the CODEx sub-record stream of a CODE body, up to its zero tag.
fn read_codex<R: Read>(reader: &mut PmatReader<R>, code: &mut CodeBody) -> PmatResult<()> {
    loop {
        let tag_position = reader.position();
        let tag = reader.read_u8()?;
        match tag {
            0 => return Ok(()),
            codex::CONSTSV => code.constants.push(reader.read_ptr()?),
            codex::CONSTIX => code.const_ixs.push(reader.read_uint()?),
            codex::GVSV => code.globrefs.push(reader.read_ptr()?),
            codex::GVIX => code.gv_ixs.push(reader.read_uint()?),
            codex::PADNAME => {
                let _ix = reader.read_uint()?;
                let _name = reader.read_str()?;
            }
            codex::PADSV => {
                let _depth = reader.read_uint()?;
                let _ix = reader.read_uint()?;
                let _sv = reader.read_ptr()?;
            }
            codex::PADNAMES => code.padnames = reader.read_ptr()?,
            codex::PAD => {
                let depth = reader.read_uint()?;
                let pad = reader.read_ptr()?;
                if let Ok(depth) = usize::try_from(depth)
                    && depth >= 1
                {
                    if code.pads.len() < depth {
                        code.pads.resize(depth, 0);
                    }
                    code.pads[depth - 1] = pad;
                }
            }
            tag => {
                return Err(PmatError::UnknownTag {
                    tag,
                    position: tag_position,
                });
            }
        }
    }
}
