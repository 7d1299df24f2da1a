//! Reachability classification.
//!
//! Every reachable heap object is assigned exactly one of five categories,
//! with precedence established by walk order: the symbol-table walk first,
//! the user-data walk second, and the interpreter-internal walk last. An
//! object left uncoloured after all three walks is unreachable from any
//! seed and reads as `None`.

use std::collections::VecDeque;

use ahash::AHashSet;

use crate::{
    dumpfile::Dumpfile,
    progress::{NoProgress, PROGRESS_INTERVAL, Progress},
    refs::StrengthFilter,
    sv::{Addr, SvBody, non_null},
};

/// Reachability category, in precedence order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr, serde::Serialize,
)]
#[strum(serialize_all = "lowercase")]
pub enum Reach {
    /// Symbol-table structure: stashes and the globs bound in them.
    Symtab,
    /// Program data hanging off package variables or the main program.
    User,
    /// Padlist structure: padlists, padnames, and pads.
    Padlist,
    /// A value stored in a named lexical slot.
    Lexical,
    /// Interpreter bookkeeping: everything else reachable.
    Internal,
}

impl Dumpfile {
    /// Runs the three reachability walks, if not already run. Colours are
    /// assigned at most once per object and cached on the objects.
    pub fn run_reachability<P: Progress>(&mut self, progress: &mut P) {
        if self.reach_done {
            return;
        }
        let total = self.svs.len();
        let mut colors: Vec<Option<Reach>> = vec![None; total];
        // Addresses queued for the final internal walk.
        let mut internal_pending: Vec<Addr> = Vec::new();
        let mut coloured = 0usize;

        let user_candidates = self.walk_symtab(&mut colors, &mut internal_pending, &mut coloured);
        progress.on_reachability(coloured, total);
        self.walk_user(user_candidates, &mut colors, &mut internal_pending, &mut coloured);
        progress.on_reachability(coloured, total);
        self.walk_internal(&mut colors, internal_pending, &mut coloured, progress);

        for (sv, color) in self.svs.iter_mut().zip(colors) {
            sv.reach = color;
        }
        self.reach_done = true;
        progress.on_reachability(coloured, total);
    }

    /// The reachability category of the object at `addr`, running the
    /// classifier on first use. `None` means unreachable or unknown.
    pub fn reachability(&mut self, addr: Addr) -> Option<Reach> {
        self.run_reachability(&mut NoProgress);
        self.sv_at(addr)?.reach()
    }

    fn index_of(&self, addr: Addr) -> Option<usize> {
        if addr == 0 || self.is_immortal(addr) {
            return None;
        }
        self.by_addr.get(&addr).copied()
    }

    /// Walk 1: from the default stash through the stash tree. Stashes and
    /// the globs bound in them are symbol table; glob slot contents and
    /// direct stash values become user-data candidates for walk 2.
    fn walk_symtab(
        &self,
        colors: &mut [Option<Reach>],
        internal_pending: &mut Vec<Addr>,
        coloured: &mut usize,
    ) -> Vec<Addr> {
        let mut stash_queue: VecDeque<Addr> = VecDeque::new();
        let mut visited: AHashSet<Addr> = AHashSet::new();
        let mut user_candidates: Vec<Addr> = Vec::new();

        if let Some(defstash) = self.root_addr("defstash") {
            stash_queue.push_back(defstash);
        }

        while let Some(stash_addr) = stash_queue.pop_front() {
            let Some(idx) = self.index_of(stash_addr) else {
                continue;
            };
            if !visited.insert(stash_addr) {
                continue;
            }
            color_if_none(colors, idx, Reach::Symtab, coloured);
            let sv = &self.svs[idx];

            for magic in sv.magic() {
                internal_pending.push(magic.obj);
                internal_pending.push(magic.ptr);
            }
            let Some(hash) = sv.hash_body() else {
                continue;
            };
            internal_pending.push(hash.backrefs);
            if let SvBody::Stash(st) = sv.body() {
                internal_pending.extend([
                    st.mro_linear_all,
                    st.mro_linear_current,
                    st.mro_nextmethod,
                    st.mro_isa,
                ]);
            }

            for (key, &value) in &hash.entries {
                let Some(value_sv) = self.sv_at(value) else {
                    continue;
                };
                if key.ends_with(b"::") {
                    // A nested package: recurse into the contained stash.
                    match value_sv.body() {
                        SvBody::Glob(g) => {
                            if let Some(glob_idx) = self.index_of(value) {
                                color_if_none(colors, glob_idx, Reach::Symtab, coloured);
                            }
                            if g.hash != 0 {
                                stash_queue.push_back(g.hash);
                            }
                        }
                        SvBody::Stash(_) => stash_queue.push_back(value),
                        _ => {}
                    }
                    continue;
                }
                match value_sv.body() {
                    SvBody::Glob(g) => {
                        if let Some(glob_idx) = self.index_of(value) {
                            color_if_none(colors, glob_idx, Reach::Symtab, coloured);
                        }
                        user_candidates
                            .extend([g.scalar, g.array, g.hash, g.code, g.io, g.form]);
                        for magic in value_sv.magic() {
                            internal_pending.push(magic.obj);
                            internal_pending.push(magic.ptr);
                        }
                    }
                    SvBody::Scalar(_) | SvBody::Ref(_) | SvBody::Array(_) | SvBody::Hash(_) => {
                        user_candidates.push(value);
                    }
                    _ => {}
                }
            }
        }

        user_candidates
    }

    /// Walk 2: from the user-data candidates and the main code. Values are
    /// user data; code objects route their padlist structure to `Padlist`,
    /// named pad slots to `Lexical`, and bookkeeping to `Internal`.
    fn walk_user(
        &self,
        user_candidates: Vec<Addr>,
        colors: &mut [Option<Reach>],
        internal_pending: &mut Vec<Addr>,
        coloured: &mut usize,
    ) {
        let mut queue: VecDeque<Addr> = user_candidates.into();
        if let Some(main_cv) = self.root_addr("main_cv") {
            queue.push_back(main_cv);
        }
        let mut visited: AHashSet<Addr> = AHashSet::new();

        while let Some(addr) = queue.pop_front() {
            let Some(idx) = self.index_of(addr) else {
                continue;
            };
            if !visited.insert(addr) {
                continue;
            }
            color_if_none(colors, idx, Reach::User, coloured);
            let sv = &self.svs[idx];

            for magic in sv.magic() {
                internal_pending.push(magic.obj);
                internal_pending.push(magic.ptr);
            }

            match sv.body() {
                SvBody::Ref(r) => {
                    if r.rv != 0 {
                        queue.push_back(r.rv);
                    }
                }
                SvBody::Array(a) => {
                    queue.extend(a.elems.iter().copied().filter(|&e| e != 0));
                }
                SvBody::Hash(h) => {
                    queue.extend(h.entries.values().copied().filter(|&v| v != 0));
                }
                SvBody::Stash(st) => {
                    queue.extend(st.hash.entries.values().copied().filter(|&v| v != 0));
                }
                SvBody::Code(c) => {
                    self.walk_user_code(c, colors, &mut queue, internal_pending, coloured);
                }
                SvBody::Lvalue(lv) => {
                    if let Some(target_idx) = self.index_of(lv.target) {
                        color_if_none(colors, target_idx, Reach::Internal, coloured);
                    }
                    internal_pending.push(lv.target);
                }
                // Globs from this seed are expected to be IO-bearing only;
                // scalars carry no outgoing user data.
                SvBody::Glob(_)
                | SvBody::Scalar(_)
                | SvBody::Io(_)
                | SvBody::Regexp
                | SvBody::Format
                | SvBody::Invlist
                | SvBody::Padlist(_)
                | SvBody::Padnames(_)
                | SvBody::Pad(_) => {}
            }
        }
    }

    /// The CODE-specific part of the user walk.
    fn walk_user_code(
        &self,
        code: &crate::sv::CodeBody,
        colors: &mut [Option<Reach>],
        queue: &mut VecDeque<Addr>,
        internal_pending: &mut Vec<Addr>,
        coloured: &mut usize,
    ) {
        for structural in [code.padlist, code.padnames] {
            if let Some(idx) = self.index_of(structural) {
                color_if_none(colors, idx, Reach::Padlist, coloured);
            }
        }
        for &pad in &code.pads {
            let Some(pad_idx) = self.index_of(pad) else {
                continue;
            };
            color_if_none(colors, pad_idx, Reach::Padlist, coloured);
            let Some(elems) = self.svs[pad_idx].array_elems() else {
                continue;
            };
            for (i, &elem) in elems.iter().enumerate() {
                if elem == 0 {
                    continue;
                }
                if i == 0 {
                    // The implicit @_ args array.
                    if let Some(elem_idx) = self.index_of(elem) {
                        color_if_none(colors, elem_idx, Reach::Internal, coloured);
                    }
                    internal_pending.push(elem);
                } else if self.pad_slot_named(code, i) {
                    if let Some(elem_idx) = self.index_of(elem) {
                        color_if_none(colors, elem_idx, Reach::Lexical, coloured);
                    }
                    queue.push_back(elem);
                } else {
                    if let Some(elem_idx) = self.index_of(elem) {
                        color_if_none(colors, elem_idx, Reach::Internal, coloured);
                    }
                    internal_pending.push(elem);
                }
            }
        }
        for &follow in [code.outside, code.constval]
            .iter()
            .chain(&code.constants)
            .chain(&code.globrefs)
        {
            if follow != 0 {
                queue.push_back(follow);
            }
        }
    }

    /// Whether pad slot `i` has a non-empty padname.
    fn pad_slot_named(&self, code: &crate::sv::CodeBody, index: usize) -> bool {
        let Some(padnames) = self.sv_at(code.padnames).and_then(|sv| sv.array_elems()) else {
            return false;
        };
        let Some(slot) = padnames.get(index).copied().and_then(non_null) else {
            return false;
        };
        match self.sv_at(slot).map(crate::sv::Sv::body) {
            Some(SvBody::Scalar(s)) => s.pv.as_deref().is_some_and(|name| !name.is_empty()),
            _ => false,
        }
    }

    /// Walk 3: from the remaining uncoloured named roots and everything
    /// queued as internal, recursing through structural outrefs (no magic
    /// or blessing edges).
    fn walk_internal<P: Progress>(
        &self,
        colors: &mut [Option<Reach>],
        internal_pending: Vec<Addr>,
        coloured: &mut usize,
        progress: &mut P,
    ) {
        let total = colors.len();
        let mut queue: VecDeque<Addr> = internal_pending.into();
        for root in self.roots() {
            if let Some(idx) = self.index_of(root.addr)
                && colors[idx].is_none()
            {
                queue.push_back(root.addr);
            }
        }
        let mut visited: AHashSet<Addr> = AHashSet::new();
        let mut steps = 0usize;

        while let Some(addr) = queue.pop_front() {
            let Some(idx) = self.index_of(addr) else {
                continue;
            };
            if !visited.insert(addr) {
                continue;
            }
            color_if_none(colors, idx, Reach::Internal, coloured);
            let sv = &self.svs[idx];
            self.each_outref(sv, StrengthFilter::ALL, false, &mut |_, _, target| {
                queue.push_back(target);
            });
            steps += 1;
            if steps % PROGRESS_INTERVAL == 0 {
                progress.on_reachability(*coloured, total);
            }
        }
    }
}

fn color_if_none(colors: &mut [Option<Reach>], idx: usize, color: Reach, coloured: &mut usize) {
    if colors[idx].is_none() {
        colors[idx] = Some(color);
        *coloured += 1;
    }
}
