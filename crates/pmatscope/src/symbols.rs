//! Symbol resolution, symbol-table enumeration, and the reverse-reference
//! trace.
//!
//! Symbol resolution walks the stash tree: a sigil-prefixed dotted name like
//! `$Foo::Bar::baz` descends through the `Foo::` and `Bar::` stash entries,
//! then selects the glob slot the sigil names. The reverse trace inverts the
//! question: starting from an object, it follows inrefs back toward named
//! roots, producing a bounded graph suitable for terminal rendering.

use std::fmt::Write;

use ahash::{AHashMap, AHashSet};

use crate::{
    dumpfile::Dumpfile,
    error::SymbolError,
    refs::{Strength, StrengthFilter},
    sv::{Addr, Sv, SvBody, non_null},
};

/// Sentinel root attached where the trace's depth bound cut exploration off.
pub const EDEPTH: &str = "EDEPTH";

/// A sigil-qualified symbol found by a symbol-table walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    /// The full name, e.g. `"$main::count"`.
    pub name: String,
    /// The bound object.
    pub addr: Addr,
}

/// One reverse edge in a [`RefTrace`]: `owner` refers to the node this edge
/// hangs off, under the given role and strength.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEdge {
    pub name: String,
    pub strength: Strength,
    pub owner: Addr,
    /// Set when `owner` was already in the graph: a back-edge closing a
    /// cycle, not expanded further.
    pub cycle: bool,
}

/// A node of a [`RefTrace`]: the roots that pin it plus the reverse edges
/// leading further out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceNode {
    /// Root labels attached here: named-root descriptions, immortal names,
    /// ownerless inref labels, or the [`EDEPTH`] sentinel.
    pub roots: Vec<String>,
    pub edges: Vec<TraceEdge>,
}

/// A bounded depth-first reverse-reference graph from one object back
/// toward named roots.
#[derive(Debug, Clone)]
pub struct RefTrace {
    start: Addr,
    nodes: AHashMap<Addr, TraceNode>,
}

impl RefTrace {
    /// The traced object.
    #[must_use]
    pub fn start(&self) -> Addr {
        self.start
    }

    /// The node for `addr`, if the trace reached it.
    #[must_use]
    pub fn node(&self, addr: Addr) -> Option<&TraceNode> {
        self.nodes.get(&addr)
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every root label anywhere in the graph.
    pub fn all_roots(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .values()
            .flat_map(|node| node.roots.iter().map(String::as_str))
    }

    /// Renders the trace as an indented tree, one line per edge, root
    /// labels at the leaves.
    #[must_use]
    pub fn render(&self, df: &Dumpfile) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}:", describe(df, self.start));
        let mut shown = AHashSet::new();
        shown.insert(self.start);
        self.render_into(df, self.start, 1, &mut shown, &mut out);
        out
    }

    fn render_into(
        &self,
        df: &Dumpfile,
        addr: Addr,
        indent: usize,
        shown: &mut AHashSet<Addr>,
        out: &mut String,
    ) {
        let Some(node) = self.nodes.get(&addr) else {
            return;
        };
        let pad = "  ".repeat(indent);
        for root in &node.roots {
            let _ = writeln!(out, "{pad}{root}");
        }
        for edge in &node.edges {
            let owner = describe(df, edge.owner);
            let label = format!(
                "{pad}{name} ({strength}) of {owner}",
                name = edge.name,
                strength = edge.strength
            );
            if edge.cycle {
                let _ = writeln!(out, "{label} (circular)");
            } else if !shown.insert(edge.owner) {
                let _ = writeln!(out, "{label} (already shown)");
            } else {
                let _ = writeln!(out, "{label}, which is:");
                self.render_into(df, edge.owner, indent + 1, shown, out);
            }
        }
    }
}

fn describe(df: &Dumpfile, addr: Addr) -> String {
    match df.sv_at(addr) {
        Some(sv) => sv.desc_addr(),
        None => format!("address {addr:#x}"),
    }
}

impl Dumpfile {
    fn defstash(&self) -> Result<&Sv, SymbolError> {
        self.root_sv("defstash").ok_or_else(|| SymbolError {
            symbol: String::new(),
            segment: "main".to_owned(),
            expected: "the default stash root",
            found: "nothing".to_owned(),
        })
    }

    /// Descends one package level: resolves segment `name` (without the
    /// trailing `::`) inside `stash` to the child stash.
    fn stash_child<'d>(
        &'d self,
        symbol: &str,
        stash: &Sv,
        name: &str,
    ) -> Result<&'d Sv, SymbolError> {
        let fail = |expected: &'static str, found: String| SymbolError {
            symbol: symbol.to_owned(),
            segment: format!("{name}::"),
            expected,
            found,
        };
        let entries = &stash
            .hash_body()
            .ok_or_else(|| fail("a stash", stash.desc()))?
            .entries;
        let key = format!("{name}::");
        let Some(child_addr) = entries.get(key.as_bytes()).copied().and_then(non_null) else {
            return Err(fail("a stash entry", "nothing".to_owned()));
        };
        let child = self
            .sv_at(child_addr)
            .ok_or_else(|| fail("a stash entry", format!("a dangling address {child_addr:#x}")))?;
        match child.body() {
            SvBody::Stash(_) => Ok(child),
            SvBody::Glob(g) => {
                let hash_addr = non_null(g.hash)
                    .ok_or_else(|| fail("a glob with a hash slot", child.desc()))?;
                self.sv_at(hash_addr)
                    .filter(|sv| matches!(sv.body(), SvBody::Stash(_) | SvBody::Hash(_)))
                    .ok_or_else(|| fail("a stash in the glob's hash slot", child.desc()))
            }
            _ => Err(fail("a glob or stash", child.desc())),
        }
    }

    /// Resolves a package name like `"Foo::Bar"` to its stash. The empty
    /// string and `"main"` both name the default stash.
    pub fn find_stash(&self, package: &str) -> Result<&Sv, SymbolError> {
        let mut stash = self.defstash()?;
        for (i, segment) in package.split("::").enumerate() {
            if segment.is_empty() || (i == 0 && segment == "main") {
                continue;
            }
            stash = self.stash_child(package, stash, segment)?;
        }
        Ok(stash)
    }

    /// Resolves a glob by its unsigiled dotted name, e.g. `"Foo::Bar::baz"`.
    pub fn find_glob(&self, name: &str) -> Result<&Sv, SymbolError> {
        let fail = |segment: String, expected: &'static str, found: String| SymbolError {
            symbol: name.to_owned(),
            segment,
            expected,
            found,
        };
        let mut segments: Vec<&str> = name.split("::").collect();
        let Some(last) = segments.pop().filter(|last| !last.is_empty()) else {
            return Err(fail(name.to_owned(), "a glob name", "an empty segment".to_owned()));
        };

        let mut stash = self.defstash()?;
        for (i, segment) in segments.iter().enumerate() {
            if segment.is_empty() || (i == 0 && *segment == "main") {
                continue;
            }
            stash = self.stash_child(name, stash, segment)?;
        }

        let entries = &stash
            .hash_body()
            .ok_or_else(|| fail(last.to_owned(), "a stash", stash.desc()))?
            .entries;
        let Some(glob_addr) = entries.get(last.as_bytes()).copied().and_then(non_null) else {
            return Err(fail(last.to_owned(), "a glob entry", "nothing".to_owned()));
        };
        let glob = self
            .sv_at(glob_addr)
            .ok_or_else(|| fail(last.to_owned(), "a glob entry", format!("a dangling address {glob_addr:#x}")))?;
        if matches!(glob.body(), SvBody::Glob(_)) {
            Ok(glob)
        } else {
            Err(fail(last.to_owned(), "a glob", glob.desc()))
        }
    }

    /// Resolves a sigil-prefixed symbol name to the bound object.
    ///
    /// The sigil selects the glob slot: `$` scalar, `@` array, `%` hash,
    /// `&` code. `$x`, `$::x`, and `$main::x` all name the same scalar.
    pub fn find_symbol(&self, symbol: &str) -> Result<&Sv, SymbolError> {
        let mut chars = symbol.chars();
        let sigil = chars.next().ok_or_else(|| SymbolError {
            symbol: symbol.to_owned(),
            segment: symbol.to_owned(),
            expected: "a sigil-prefixed name",
            found: "an empty string".to_owned(),
        })?;
        let rest = chars.as_str();
        let (slot_name, slot_of): (&'static str, fn(&crate::sv::GlobBody) -> Addr) = match sigil {
            '$' => ("a scalar slot", |g| g.scalar),
            '@' => ("an array slot", |g| g.array),
            '%' => ("a hash slot", |g| g.hash),
            '&' => ("a code slot", |g| g.code),
            _ => {
                return Err(SymbolError {
                    symbol: symbol.to_owned(),
                    segment: symbol.to_owned(),
                    expected: "a sigil ($, @, % or &)",
                    found: format!("{sigil:?}"),
                });
            }
        };

        let glob = self.find_glob(rest)?;
        let SvBody::Glob(g) = glob.body() else {
            return Err(SymbolError {
                symbol: symbol.to_owned(),
                segment: rest.to_owned(),
                expected: "a glob",
                found: glob.desc(),
            });
        };
        let slot_addr = non_null(slot_of(g)).ok_or_else(|| SymbolError {
            symbol: symbol.to_owned(),
            segment: rest.to_owned(),
            expected: slot_name,
            found: "an empty slot".to_owned(),
        })?;
        self.sv_at(slot_addr).ok_or_else(|| SymbolError {
            symbol: symbol.to_owned(),
            segment: rest.to_owned(),
            expected: slot_name,
            found: format!("a dangling address {slot_addr:#x}"),
        })
    }

    /// Enumerates every bound symbol under a package (the default stash when
    /// `None`), depth-first through child stashes, sorted by name.
    pub fn symbols_under(&self, package: Option<&str>) -> Result<Vec<Symbol>, SymbolError> {
        let start = match package {
            Some(package) => self.find_stash(package)?,
            None => self.defstash()?,
        };
        let mut symbols = Vec::new();
        let mut visited = AHashSet::new();
        let mut stack = vec![start.addr()];

        while let Some(stash_addr) = stack.pop() {
            if !visited.insert(stash_addr) {
                continue;
            }
            let Some(stash) = self.sv_at(stash_addr) else {
                continue;
            };
            let package = match stash.body() {
                SvBody::Stash(st) => st.name.as_deref().unwrap_or("main"),
                _ => continue,
            };
            let Some(hash) = stash.hash_body() else {
                continue;
            };
            for (key, &value) in &hash.entries {
                let Some(value_sv) = non_null(value).and_then(|addr| self.sv_at(addr)) else {
                    continue;
                };
                if key.ends_with(b"::") {
                    match value_sv.body() {
                        SvBody::Stash(_) => stack.push(value),
                        SvBody::Glob(g) if g.hash != 0 => stack.push(g.hash),
                        _ => {}
                    }
                    continue;
                }
                let SvBody::Glob(g) = value_sv.body() else {
                    continue;
                };
                let entry = String::from_utf8_lossy(key);
                for (sigil, slot) in [('$', g.scalar), ('@', g.array), ('%', g.hash), ('&', g.code)]
                {
                    if slot != 0 {
                        symbols.push(Symbol {
                            name: format!("{sigil}{package}::{entry}"),
                            addr: slot,
                        });
                    }
                }
            }
        }
        symbols.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(symbols)
    }

    /// Builds the bounded reverse-reference graph from the object at `addr`
    /// back toward named roots.
    ///
    /// `depth` limits recursion; where the bound cuts exploration off, the
    /// [`EDEPTH`] sentinel root is attached instead. `filter` restricts
    /// which inref strengths are followed.
    pub fn ref_trace(
        &mut self,
        addr: Addr,
        depth: Option<usize>,
        filter: StrengthFilter,
    ) -> RefTrace {
        self.build_inrefs(&mut crate::progress::NoProgress);
        let mut trace = RefTrace {
            start: addr,
            nodes: AHashMap::new(),
        };
        self.trace_step(&mut trace, addr, depth, filter);
        trace
    }

    fn trace_step(
        &self,
        trace: &mut RefTrace,
        addr: Addr,
        depth: Option<usize>,
        filter: StrengthFilter,
    ) {
        let mut node = TraceNode::default();
        if let Some(immortal) = self.immortal_name(addr) {
            node.roots.push(immortal.to_owned());
            trace.nodes.insert(addr, node);
            return;
        }
        if let Some(root) = self.root_at(addr) {
            node.roots.push(root.description().to_owned());
            trace.nodes.insert(addr, node);
            return;
        }
        // Insert before descending so cycles back to this node are caught.
        trace.nodes.insert(addr, node);

        let inrefs = match self.by_addr.get(&addr) {
            Some(&idx) => self.svs[idx].inrefs.as_deref().unwrap_or(&[]),
            None => &[],
        };
        let mut depth_exhausted = false;
        for inref in inrefs {
            if !filter.accepts(inref.strength) {
                continue;
            }
            match inref.owner {
                None => {
                    if let Some(node) = trace.nodes.get_mut(&addr) {
                        node.roots.push(inref.name.clone());
                    }
                }
                Some(owner) => {
                    let cycle = trace.nodes.contains_key(&owner);
                    if !cycle {
                        if depth == Some(0) {
                            if !depth_exhausted
                                && let Some(node) = trace.nodes.get_mut(&addr)
                            {
                                node.roots.push(EDEPTH.to_owned());
                                depth_exhausted = true;
                            }
                            continue;
                        }
                        self.trace_step(trace, owner, depth.map(|d| d - 1), filter);
                    }
                    if let Some(node) = trace.nodes.get_mut(&addr) {
                        node.edges.push(TraceEdge {
                            name: inref.name.clone(),
                            strength: inref.strength,
                            owner,
                            cycle,
                        });
                    }
                }
            }
        }
    }
}
