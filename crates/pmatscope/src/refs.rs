//! The reference engine: outgoing reference enumeration and the inverse
//! inref index.
//!
//! For every object, `outrefs` is the complete set of outgoing references,
//! each carrying a stable human-readable role name, a four-valued strength,
//! and the target address. The inverse index is built lazily in one sweep
//! over the heap and cached on each object; named roots and the operand
//! stack contribute ownerless inrefs.
//!
//! Role names are part of the API surface: analyses and renderers key off
//! them, so they never change shape once emitted.

use crate::{
    dumpfile::Dumpfile,
    progress::{NoProgress, PROGRESS_INTERVAL, Progress},
    sv::{Addr, HashBody, Sv, SvBody, non_null},
};

/// Classification of an outgoing reference.
///
/// Only `Strong` references contribute to the target's reference count.
/// `Indirect` is the synthetic via-RV hop through a plain REF; `Inferred`
/// covers relations reconstructed by the engine that exist as no pointer in
/// the producer (the closure-prototype link).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, serde::Serialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum Strength {
    Strong,
    Weak,
    Indirect,
    Inferred,
}

/// A multiset of strengths for filtered reference views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrengthFilter {
    pub strong: bool,
    pub weak: bool,
    pub indirect: bool,
    pub inferred: bool,
}

impl StrengthFilter {
    /// Every strength.
    pub const ALL: Self = Self {
        strong: true,
        weak: true,
        indirect: true,
        inferred: true,
    };

    /// Only references present as real pointers in the producer.
    pub const DIRECT: Self = Self {
        strong: true,
        weak: true,
        indirect: false,
        inferred: false,
    };

    /// Only counted references.
    pub const STRONG: Self = Self {
        strong: true,
        weak: false,
        indirect: false,
        inferred: false,
    };

    /// Everything except weak references: the default view for tracing,
    /// where weak edges would only add noise.
    pub const NON_WEAK: Self = Self {
        strong: true,
        weak: false,
        indirect: true,
        inferred: true,
    };

    /// Whether `strength` belongs to the multiset.
    #[must_use]
    pub fn accepts(self, strength: Strength) -> bool {
        match strength {
            Strength::Strong => self.strong,
            Strength::Weak => self.weak,
            Strength::Indirect => self.indirect,
            Strength::Inferred => self.inferred,
        }
    }
}

/// One outgoing reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outref {
    /// Stable descriptive role, e.g. `"element [3]"` or `"the padlist"`.
    pub name: String,
    pub strength: Strength,
    /// The referred-to object's address.
    pub target: Addr,
}

/// One incoming reference: the inverse of exactly one outref, or an
/// ownerless entry contributed by a named root or the operand stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inref {
    /// The referring object, or `None` for root/stack entries.
    pub owner: Option<Addr>,
    /// The role, or for ownerless entries the root description.
    pub name: String,
    pub strength: Strength,
}

/// Unrendered role name; rendering is deferred so that count-only views
/// never allocate.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RoleBase<'a> {
    Fixed(&'static str),
    MagicObject(char),
    MagicPointer(char),
    Element(usize),
    Value(&'a [u8]),
    PadDepth(usize),
    Padname(usize),
    PadElem(usize),
    Lexical(&'a [u8]),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Role<'a> {
    pub(crate) base: RoleBase<'a>,
    pub(crate) via_rv: bool,
}

impl Role<'_> {
    pub(crate) fn render(&self) -> String {
        let mut name = match self.base {
            RoleBase::Fixed(s) => s.to_owned(),
            RoleBase::MagicObject(c) => format!("'{c}' magic object"),
            RoleBase::MagicPointer(c) => format!("'{c}' magic pointer"),
            RoleBase::Element(i) => format!("element [{i}]"),
            RoleBase::Value(key) => {
                format!("value {{{key}}}", key = String::from_utf8_lossy(key))
            }
            RoleBase::PadDepth(depth) => format!("pad at depth {depth}"),
            RoleBase::Padname(i) => format!("padname [{i}]"),
            RoleBase::PadElem(i) => format!("elem [{i}]"),
            RoleBase::Lexical(name) => String::from_utf8_lossy(name).into_owned(),
        };
        if self.via_rv {
            name.push_str(" via RV");
        }
        name
    }
}

impl Dumpfile {
    /// All outgoing references of `sv`, in stable enumeration order.
    #[must_use]
    pub fn outrefs(&self, sv: &Sv) -> Vec<Outref> {
        self.outrefs_matching(sv, StrengthFilter::ALL)
    }

    /// The subset of outgoing references whose strength is in `filter`.
    #[must_use]
    pub fn outrefs_matching(&self, sv: &Sv, filter: StrengthFilter) -> Vec<Outref> {
        let mut refs = Vec::new();
        self.each_outref(sv, filter, true, &mut |role, strength, target| {
            refs.push(Outref {
                name: role.render(),
                strength,
                target,
            });
        });
        refs
    }

    /// Outgoing references of the object at `addr`, or empty when the
    /// address is not in the heap.
    #[must_use]
    pub fn outrefs_at(&self, addr: Addr) -> Vec<Outref> {
        self.sv_at(addr).map(|sv| self.outrefs(sv)).unwrap_or_default()
    }

    /// Cardinality of the filtered view, without building the references.
    #[must_use]
    pub fn outref_count(&self, sv: &Sv, filter: StrengthFilter) -> usize {
        let mut count = 0usize;
        self.each_outref(sv, filter, true, &mut |_, _, _| count += 1);
        count
    }

    /// Emits one reference, dropping null targets and filtered strengths.
    fn emit_plain<'a, F: FnMut(Role<'a>, Strength, Addr)>(
        base: RoleBase<'a>,
        strength: Strength,
        target: Addr,
        filter: StrengthFilter,
        f: &mut F,
    ) {
        if target != 0 && filter.accepts(strength) {
            f(Role { base, via_rv: false }, strength, target);
        }
    }

    /// Emits a direct reference, then the synthetic indirect hop when the
    /// target is a REF without magic.
    fn emit_with_rv<'a, F: FnMut(Role<'a>, Strength, Addr)>(
        &'a self,
        base: RoleBase<'a>,
        strength: Strength,
        target: Addr,
        filter: StrengthFilter,
        f: &mut F,
    ) {
        if filter.accepts(strength) {
            f(Role { base, via_rv: false }, strength, target);
        }
        if filter.accepts(Strength::Indirect)
            && let Some(target_sv) = self.sv_at(target)
            && let Some(rv) = target_sv.is_plain_ref()
        {
            f(Role { base, via_rv: true }, Strength::Indirect, rv);
        }
    }

    /// Enumerates `sv`'s outrefs through a callback.
    ///
    /// `decorations` controls the magic and blessing edges; the internal
    /// walks that must not see them (reachability's final pass) disable it.
    pub(crate) fn each_outref<'a, F: FnMut(Role<'a>, Strength, Addr)>(
        &'a self,
        sv: &'a Sv,
        filter: StrengthFilter,
        decorations: bool,
        f: &mut F,
    ) {
        match &sv.body {
            SvBody::Glob(g) => {
                Self::emit_plain(RoleBase::Fixed("the scalar"), Strength::Strong, g.scalar, filter, f);
                Self::emit_plain(RoleBase::Fixed("the array"), Strength::Strong, g.array, filter, f);
                Self::emit_plain(RoleBase::Fixed("the hash"), Strength::Strong, g.hash, filter, f);
                Self::emit_plain(RoleBase::Fixed("the code"), Strength::Strong, g.code, filter, f);
                Self::emit_plain(RoleBase::Fixed("the io"), Strength::Strong, g.io, filter, f);
                Self::emit_plain(RoleBase::Fixed("the form"), Strength::Strong, g.form, filter, f);
                // A glob is its own effective glob unless aliased; the
                // self-link must not count a reference.
                let egv_strength = if g.egv == sv.addr {
                    Strength::Weak
                } else {
                    Strength::Strong
                };
                Self::emit_plain(RoleBase::Fixed("the egv"), egv_strength, g.egv, filter, f);
            }
            SvBody::Scalar(s) => {
                Self::emit_plain(
                    RoleBase::Fixed("the our stash"),
                    Strength::Strong,
                    s.ourstash,
                    filter,
                    f,
                );
            }
            SvBody::Ref(r) => {
                if let Some(rv) = non_null(r.rv) {
                    let strength = if r.weak { Strength::Weak } else { Strength::Strong };
                    self.emit_with_rv(RoleBase::Fixed("the referrant"), strength, rv, filter, f);
                }
                Self::emit_plain(
                    RoleBase::Fixed("the our stash"),
                    Strength::Strong,
                    r.ourstash,
                    filter,
                    f,
                );
            }
            SvBody::Array(a) => {
                let strength = if a.unreal || a.is_backrefs {
                    Strength::Weak
                } else {
                    Strength::Strong
                };
                for (i, &elem) in a.elems.iter().enumerate() {
                    if elem != 0 {
                        self.emit_with_rv(RoleBase::Element(i), strength, elem, filter, f);
                    }
                }
            }
            SvBody::Hash(h) => {
                self.each_hash_outref(h, filter, f);
            }
            SvBody::Stash(st) => {
                self.each_hash_outref(&st.hash, filter, f);
                Self::emit_plain(
                    RoleBase::Fixed("the mro linear all HV"),
                    Strength::Strong,
                    st.mro_linear_all,
                    filter,
                    f,
                );
                Self::emit_plain(
                    RoleBase::Fixed("the mro linear current"),
                    Strength::Strong,
                    st.mro_linear_current,
                    filter,
                    f,
                );
                Self::emit_plain(
                    RoleBase::Fixed("the mro next::method"),
                    Strength::Strong,
                    st.mro_nextmethod,
                    filter,
                    f,
                );
                Self::emit_plain(
                    RoleBase::Fixed("the mro ISA cache"),
                    Strength::Strong,
                    st.mro_isa,
                    filter,
                    f,
                );
            }
            SvBody::Code(c) => {
                let scope_strength = if c.weak_outside {
                    Strength::Weak
                } else {
                    Strength::Strong
                };
                Self::emit_plain(RoleBase::Fixed("the scope"), scope_strength, c.outside, filter, f);
                Self::emit_plain(RoleBase::Fixed("the stash"), Strength::Weak, c.stash, filter, f);
                let glob_strength = if c.glob_refcounted {
                    Strength::Strong
                } else {
                    Strength::Weak
                };
                Self::emit_plain(RoleBase::Fixed("the glob"), glob_strength, c.glob, filter, f);
                Self::emit_plain(
                    RoleBase::Fixed("the constant value"),
                    Strength::Strong,
                    c.constval,
                    filter,
                    f,
                );
                if filter.accepts(Strength::Inferred)
                    && let Some(proto) = self.protosub_of(sv)
                {
                    f(
                        Role {
                            base: RoleBase::Fixed("the protosub"),
                            via_rv: false,
                        },
                        Strength::Inferred,
                        proto,
                    );
                }
                for &constant in &c.constants {
                    Self::emit_plain(RoleBase::Fixed("a constant"), Strength::Strong, constant, filter, f);
                }
                for &gv in &c.globrefs {
                    Self::emit_plain(
                        RoleBase::Fixed("a referenced glob"),
                        Strength::Strong,
                        gv,
                        filter,
                        f,
                    );
                }
                Self::emit_plain(RoleBase::Fixed("the padlist"), Strength::Strong, c.padlist, filter, f);
                // With a padlist present the padnames and pads are already
                // reachable through it, so these become indirect.
                let pad_strength = if c.padlist != 0 {
                    Strength::Indirect
                } else {
                    Strength::Strong
                };
                Self::emit_plain(RoleBase::Fixed("the padnames"), pad_strength, c.padnames, filter, f);
                for (i, &pad) in c.pads.iter().enumerate() {
                    Self::emit_plain(RoleBase::PadDepth(i + 1), pad_strength, pad, filter, f);
                }
            }
            SvBody::Io(io) => {
                Self::emit_plain(RoleBase::Fixed("the top GV"), Strength::Strong, io.topgv, filter, f);
                Self::emit_plain(RoleBase::Fixed("the format GV"), Strength::Strong, io.fmtgv, filter, f);
                Self::emit_plain(
                    RoleBase::Fixed("the bottom GV"),
                    Strength::Strong,
                    io.bottomgv,
                    filter,
                    f,
                );
            }
            SvBody::Lvalue(lv) => {
                Self::emit_plain(RoleBase::Fixed("the target"), Strength::Strong, lv.target, filter, f);
            }
            SvBody::Regexp | SvBody::Format | SvBody::Invlist => {}
            SvBody::Padlist(p) => {
                for (i, &elem) in p.elems.iter().enumerate() {
                    if elem == 0 {
                        continue;
                    }
                    if i == 0 {
                        Self::emit_plain(RoleBase::Fixed("the padnames"), Strength::Strong, elem, filter, f);
                    } else {
                        Self::emit_plain(RoleBase::PadDepth(i), Strength::Strong, elem, filter, f);
                    }
                }
            }
            SvBody::Padnames(p) => {
                // Element zero is always undef and never reported.
                for (i, &elem) in p.elems.iter().enumerate().skip(1) {
                    Self::emit_plain(RoleBase::Padname(i), Strength::Strong, elem, filter, f);
                }
            }
            SvBody::Pad(p) => {
                for (i, &elem) in p.elems.iter().enumerate() {
                    if elem == 0 {
                        continue;
                    }
                    if i == 0 {
                        Self::emit_plain(RoleBase::Fixed("the @_ av"), Strength::Strong, elem, filter, f);
                    } else {
                        let base = match self.padname_of(p.padcv, i) {
                            Some(name) => RoleBase::Lexical(name),
                            None => RoleBase::PadElem(i),
                        };
                        self.emit_with_rv(base, Strength::Strong, elem, filter, f);
                    }
                }
            }
        }

        if decorations {
            for magic in &sv.magic {
                let strength = if magic.refcounted {
                    Strength::Strong
                } else {
                    Strength::Weak
                };
                Self::emit_plain(
                    RoleBase::MagicObject(magic.type_char()),
                    strength,
                    magic.obj,
                    filter,
                    f,
                );
                Self::emit_plain(
                    RoleBase::MagicPointer(magic.type_char()),
                    strength,
                    magic.ptr,
                    filter,
                    f,
                );
            }
            Self::emit_plain(
                RoleBase::Fixed("the bless package"),
                Strength::Weak,
                sv.blessed_at,
                filter,
                f,
            );
        }
    }

    /// The hash-shaped part of HASH and STASH outrefs: the backrefs link
    /// then each stored value.
    fn each_hash_outref<'a, F: FnMut(Role<'a>, Strength, Addr)>(
        &'a self,
        hash: &'a HashBody,
        filter: StrengthFilter,
        f: &mut F,
    ) {
        if let Some(backrefs) = non_null(hash.backrefs) {
            match self.sv_at(backrefs).map(Sv::body) {
                Some(SvBody::Array(list)) => {
                    Self::emit_plain(
                        RoleBase::Fixed("the backrefs list"),
                        Strength::Strong,
                        backrefs,
                        filter,
                        f,
                    );
                    for &referrer in &list.elems {
                        Self::emit_plain(
                            RoleBase::Fixed("a backref"),
                            Strength::Indirect,
                            referrer,
                            filter,
                            f,
                        );
                    }
                }
                // A hash with a single weak referrer links it directly.
                _ => {
                    Self::emit_plain(RoleBase::Fixed("a backref"), Strength::Weak, backrefs, filter, f);
                }
            }
        }
        for (key, &value) in &hash.entries {
            if value != 0 {
                self.emit_with_rv(RoleBase::Value(key), Strength::Strong, value, filter, f);
            }
        }
    }

    /// Resolves the padname text for slot `index` of a pad owned by the code
    /// at `padcv`. Empty names yield `None`.
    fn padname_of(&self, padcv: Addr, index: usize) -> Option<&[u8]> {
        let code = match self.sv_at(padcv)?.body() {
            SvBody::Code(c) => c,
            _ => return None,
        };
        let padnames = self.sv_at(code.padnames)?;
        let &slot = padnames.array_elems()?.get(index)?;
        match self.sv_at(non_null(slot)?)?.body() {
            SvBody::Scalar(s) => s.pv.as_deref().filter(|name| !name.is_empty()),
            _ => None,
        }
    }

    /// Builds the inverse reference index, if not already built.
    ///
    /// One sweep over the heap pushes every outref onto its target's inref
    /// list; named roots and operand-stack entries contribute ownerless
    /// inrefs. Immortal singletons receive none.
    pub fn build_inrefs<P: Progress>(&mut self, progress: &mut P) {
        if self.inrefs_built {
            return;
        }
        let total = self.svs.len();
        let mut buckets: Vec<Vec<Inref>> = vec![Vec::new(); total];

        for idx in 0..total {
            let sv = &self.svs[idx];
            let owner = sv.addr;
            self.each_outref(sv, StrengthFilter::ALL, true, &mut |role, strength, target| {
                if self.is_immortal(target) {
                    return;
                }
                if let Some(&target_idx) = self.by_addr.get(&target) {
                    buckets[target_idx].push(Inref {
                        owner: Some(owner),
                        name: role.render(),
                        strength,
                    });
                }
            });
            if (idx + 1) % PROGRESS_INTERVAL == 0 {
                progress.on_inrefs(idx + 1, total);
            }
        }

        for root in self.roots() {
            if self.is_immortal(root.addr) {
                continue;
            }
            if let Some(&idx) = self.by_addr.get(&root.addr) {
                buckets[idx].push(Inref {
                    owner: None,
                    name: root.description().to_owned(),
                    strength: Strength::Strong,
                });
            }
        }
        let stack_inrefs: Vec<usize> = self
            .stack
            .iter()
            .filter(|&&addr| !self.is_immortal(addr))
            .filter_map(|addr| self.by_addr.get(addr).copied())
            .collect();
        for idx in stack_inrefs {
            buckets[idx].push(Inref {
                owner: None,
                name: "a value on the stack".to_owned(),
                strength: Strength::Strong,
            });
        }

        let immortals = self.immortals;
        for (sv, bucket) in self.svs.iter_mut().zip(buckets) {
            sv.inrefs = Some(if immortals.contains(&sv.addr) {
                Vec::new()
            } else {
                bucket
            });
        }
        self.inrefs_built = true;
        progress.on_inrefs(total, total);
    }

    /// The incoming references of the object at `addr`, building the index
    /// on first use. Unknown addresses yield an empty slice.
    pub fn inrefs(&mut self, addr: Addr) -> &[Inref] {
        self.build_inrefs(&mut NoProgress);
        self.by_addr
            .get(&addr)
            .and_then(|&idx| self.svs[idx].inrefs.as_deref())
            .unwrap_or(&[])
    }

    /// The filtered incoming references of the object at `addr`.
    pub fn inrefs_matching(&mut self, addr: Addr, filter: StrengthFilter) -> Vec<Inref> {
        self.inrefs(addr)
            .iter()
            .filter(|inref| filter.accepts(inref.strength))
            .cloned()
            .collect()
    }
}
