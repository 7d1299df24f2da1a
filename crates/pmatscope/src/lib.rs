//! Offline analyzer for PMAT heap dumps.
//!
//! A PMAT file is a self-describing binary snapshot of a dynamic-language
//! interpreter's value heap: every live value object, the well-known global
//! roots, the operand stack, and the call-context stack. This crate loads
//! such a file, reconstructs the full typed object graph in memory, and
//! exposes it for analysis:
//!
//! - navigation by address ([`Dumpfile::sv_at`]) or by language-level
//!   symbol ([`Dumpfile::find_symbol`]);
//! - outgoing references with strength classification
//!   ([`Dumpfile::outrefs`]) and the lazily built inverse index
//!   ([`Dumpfile::inrefs`]);
//! - reachability colouring from the root sets
//!   ([`Dumpfile::reachability`]);
//! - reverse-reference tracing back toward named roots
//!   ([`Dumpfile::ref_trace`]).
//!
//! ```no_run
//! use pmatscope::{Dumpfile, StrengthFilter};
//!
//! let mut df = Dumpfile::load_path("program.pmat")?;
//! let scalar = df.find_symbol("$main::PACKAGE_SCALAR")?.addr();
//! let trace = df.ref_trace(scalar, None, StrengthFilter::NON_WEAK);
//! println!("{}", trace.render(&df));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod contexts;
mod dumpfile;
mod error;
mod format;
mod progress;
mod quote;
mod reach;
mod reader;
mod refs;
mod symbols;
mod sv;

pub use crate::{
    contexts::{Context, Gimme},
    dumpfile::{Dumpfile, HeapSummary, KindStats, Root, root_description},
    error::{PmatError, PmatResult, SymbolError},
    format::{FORMAT_MAJOR, FORMAT_MINOR, HeaderFlags, PerlVersion, SvShape, SvTag},
    progress::{NoProgress, Progress, StderrProgress},
    quote::{pv_quote, pv_quote_limited},
    reach::Reach,
    reader::{Endian, FloatSize, IntSize, PmatReader, ReaderConfig},
    refs::{Inref, Outref, Strength, StrengthFilter},
    sv::{
        Addr, ArrayBody, CodeBody, GlobBody, HashBody, IoBody, LvalueBody, Magic, PadBody, RefBody,
        SCALAR_HAS_IV, SCALAR_HAS_NV, SCALAR_HAS_PV, SCALAR_HAS_UV, SCALAR_PV_UTF8, ScalarBody,
        StashBody, Sv, SvBody, SvKind,
    },
    symbols::{EDEPTH, RefTrace, Symbol, TraceEdge, TraceNode},
};
