//! Tests for the reference engine: per-variant outref role tables, strength
//! classification, filtered views, and the inverse inref index.

mod common;

use common::{Codex, CodeRec, DumpBuilder, GlobRec, ScalarRec, UNDEF, package_scalar_dump};
use pmatscope::{Outref, Strength, StrengthFilter};

fn roles(refs: &[Outref]) -> Vec<(&str, Strength, u64)> {
    refs.iter()
        .map(|r| (r.name.as_str(), r.strength, r.target))
        .collect()
}

fn find<'a>(refs: &'a [Outref], name: &str) -> &'a Outref {
    refs.iter()
        .find(|r| r.name == name)
        .unwrap_or_else(|| panic!("no outref named {name:?} in {refs:?}"))
}

// =============================================================================
// 1. GLOB outrefs
// =============================================================================

/// Glob slots are strong; the egv self-link is weak.
#[test]
fn glob_outrefs_cover_slots() {
    let mut b = DumpBuilder::new();
    b.glob(
        0x100,
        GlobRec {
            scalar: 0x200,
            array: 0x300,
            hash: 0x400,
            code: 0x500,
            io: 0x600,
            form: 0x700,
            egv: 0x100,
            ..GlobRec::default()
        },
    );
    b.scalar_pv(0x200, b"s");
    b.array(0x300, &[], true);
    b.hash(0x400, &[], 0);
    b.code(0x500, CodeRec::default());
    b.io(0x600, 0, 0, 0);
    b.regexp(0x700, 0);
    let df = b.load();

    let refs = df.outrefs_at(0x100);
    assert_eq!(
        roles(&refs),
        vec![
            ("the scalar", Strength::Strong, 0x200),
            ("the array", Strength::Strong, 0x300),
            ("the hash", Strength::Strong, 0x400),
            ("the code", Strength::Strong, 0x500),
            ("the io", Strength::Strong, 0x600),
            ("the form", Strength::Strong, 0x700),
            ("the egv", Strength::Weak, 0x100),
        ]
    );
}

/// A glob whose egv points elsewhere links it strongly.
#[test]
fn glob_foreign_egv_is_strong() {
    let mut b = DumpBuilder::new();
    b.glob(
        0x100,
        GlobRec {
            egv: 0x900,
            ..GlobRec::default()
        },
    );
    b.glob(0x900, GlobRec::default());
    let df = b.load();
    let refs = df.outrefs_at(0x100);
    assert_eq!(find(&refs, "the egv").strength, Strength::Strong);
}

// =============================================================================
// 2. REF outrefs and the via-RV policy
// =============================================================================

/// A strong REF emits one strong referrant edge.
#[test]
fn plain_ref_outrefs() {
    let mut b = DumpBuilder::new();
    b.ref_sv(0x100, 0x200, false);
    b.array(0x200, &[], true);
    let df = b.load();
    assert_eq!(
        roles(&df.outrefs_at(0x100)),
        vec![("the referrant", Strength::Strong, 0x200)]
    );
}

/// A weakened REF's referrant edge is weak.
#[test]
fn weak_ref_outrefs() {
    let mut b = DumpBuilder::new();
    b.ref_sv(0x100, 0x200, true);
    b.array(0x200, &[], true);
    let df = b.load();
    assert_eq!(
        roles(&df.outrefs_at(0x100)),
        vec![("the referrant", Strength::Weak, 0x200)]
    );
}

/// A REF to a magic-free REF also emits the indirect via-RV hop.
#[test]
fn ref_to_ref_adds_indirect_hop() {
    let mut b = DumpBuilder::new();
    b.ref_sv(0x100, 0x200, false);
    b.ref_sv(0x200, 0x300, false);
    b.array(0x300, &[], true);
    let df = b.load();
    assert_eq!(
        roles(&df.outrefs_at(0x100)),
        vec![
            ("the referrant", Strength::Strong, 0x200),
            ("the referrant via RV", Strength::Indirect, 0x300),
        ]
    );
}

/// A REF to a REF that carries magic gets no indirect hop.
#[test]
fn magic_on_inner_ref_suppresses_indirect_hop() {
    let mut b = DumpBuilder::new();
    b.ref_sv(0x100, 0x200, false);
    b.ref_sv(0x200, 0x300, false);
    b.array(0x300, &[], true);
    b.scalar_pv(0x400, b"magic backing");
    b.magic(0x200, 'P', false, 0x400, 0);
    let df = b.load();
    let refs = df.outrefs_at(0x100);
    assert_eq!(
        roles(&refs),
        vec![("the referrant", Strength::Strong, 0x200)],
        "magic on the inner REF must suppress the via-RV hop"
    );
}

// =============================================================================
// 3. ARRAY and HASH outrefs
// =============================================================================

/// Real arrays own their elements; unreal arrays do not.
#[test]
fn array_element_strength_follows_real_flag() {
    let mut b = DumpBuilder::new();
    b.array(0x100, &[0x300, 0, 0x400], true);
    b.array(0x200, &[0x300], false);
    b.scalar_pv(0x300, b"x");
    b.scalar_pv(0x400, b"y");
    let df = b.load();

    assert_eq!(
        roles(&df.outrefs_at(0x100)),
        vec![
            ("element [0]", Strength::Strong, 0x300),
            ("element [2]", Strength::Strong, 0x400),
        ],
        "empty slots are skipped and indices preserved"
    );
    assert_eq!(
        roles(&df.outrefs_at(0x200)),
        vec![("element [0]", Strength::Weak, 0x300)]
    );
}

/// Hash values are strong, keyed by role.
#[test]
fn hash_value_outrefs() {
    let mut b = DumpBuilder::new();
    b.hash(0x100, &[(b"foo", 0x300), (b"bar", 0x400)], 0);
    b.scalar_pv(0x300, b"x");
    b.ref_sv(0x400, 0x500, false);
    b.array(0x500, &[], true);
    let df = b.load();

    assert_eq!(
        roles(&df.outrefs_at(0x100)),
        vec![
            ("value {foo}", Strength::Strong, 0x300),
            ("value {bar}", Strength::Strong, 0x400),
            ("value {bar} via RV", Strength::Indirect, 0x500),
        ]
    );
}

/// A backrefs array contributes a strong list edge plus one indirect edge
/// per referrer; a single-REF backrefs link is weak.
#[test]
fn hash_backrefs_outrefs() {
    let mut b = DumpBuilder::new();
    b.hash(0x100, &[], 0x200);
    b.array(0x200, &[0x300, 0x400], false);
    b.ref_sv(0x300, 0x100, true);
    b.ref_sv(0x400, 0x100, true);
    b.hash(0x500, &[], 0x600);
    b.ref_sv(0x600, 0x500, true);
    let df = b.load();

    assert_eq!(
        roles(&df.outrefs_at(0x100)),
        vec![
            ("the backrefs list", Strength::Strong, 0x200),
            ("a backref", Strength::Indirect, 0x300),
            ("a backref", Strength::Indirect, 0x400),
        ]
    );
    assert_eq!(
        roles(&df.outrefs_at(0x500)),
        vec![("a backref", Strength::Weak, 0x600)]
    );
}

/// STASH outrefs are the hash's plus the four MRO links.
#[test]
fn stash_outrefs_add_mro_links() {
    let mut b = DumpBuilder::new();
    b.stash_with_mro(0x100, "Foo", &[(b"x", 0x300)], 0, [0x11, 0x12, 0x13, 0x14]);
    b.glob(0x300, GlobRec::default());
    b.array(0x11, &[], true);
    b.array(0x12, &[], true);
    b.hash(0x13, &[], 0);
    b.hash(0x14, &[], 0);
    let df = b.load();

    assert_eq!(
        roles(&df.outrefs_at(0x100)),
        vec![
            ("value {x}", Strength::Strong, 0x300),
            ("the mro linear all HV", Strength::Strong, 0x11),
            ("the mro linear current", Strength::Strong, 0x12),
            ("the mro next::method", Strength::Strong, 0x13),
            ("the mro ISA cache", Strength::Strong, 0x14),
        ]
    );
}

// =============================================================================
// 4. CODE and padlist-structure outrefs
// =============================================================================

const CODE: u64 = 0x1000;
const PADLIST: u64 = 0x1100;
const PADNAMES: u64 = 0x1200;
const PAD1: u64 = 0x1300;
const ARGS: u64 = 0x1400;
const LEXVAL: u64 = 0x1500;
const NAME: u64 = 0x1600;

fn code_dump() -> DumpBuilder {
    let mut b = DumpBuilder::new().perl_version(5, 36, 0);
    b.code(
        CODE,
        CodeRec {
            stash: 0x2000,
            glob: 0x2100,
            outside: 0x2200,
            constval: 0x2300,
            padlist: PADLIST,
            codex: vec![
                Codex::Padnames(PADNAMES),
                Codex::Pad(1, PAD1),
                Codex::ConstSv(0x2400),
                Codex::GvSv(0x2100),
            ],
            ..CodeRec::default()
        },
    );
    b.stash(0x2000, "main", &[], 0);
    b.glob(0x2100, GlobRec::default());
    b.code(0x2200, CodeRec::default());
    b.scalar_pv(0x2300, b"constant value");
    b.scalar_pv(0x2400, b"embedded");
    b.array(PADLIST, &[PADNAMES, PAD1], true);
    b.array(PADNAMES, &[0, NAME], true);
    b.array(PAD1, &[ARGS, LEXVAL], true);
    b.array(ARGS, &[], true);
    b.scalar_pv(NAME, b"$x");
    b.scalar_pv(LEXVAL, b"lexical value");
    b
}

/// The CODE role table, with padnames/pads indirect because the padlist
/// carries them.
#[test]
fn code_outrefs_cover_role_table() {
    let df = code_dump().load();
    let refs = df.outrefs_at(CODE);
    assert_eq!(
        roles(&refs),
        vec![
            ("the scope", Strength::Strong, 0x2200),
            ("the stash", Strength::Weak, 0x2000),
            ("the glob", Strength::Weak, 0x2100),
            ("the constant value", Strength::Strong, 0x2300),
            ("a constant", Strength::Strong, 0x2400),
            ("a referenced glob", Strength::Strong, 0x2100),
            ("the padlist", Strength::Strong, PADLIST),
            ("the padnames", Strength::Indirect, PADNAMES),
            ("pad at depth 1", Strength::Indirect, PAD1),
        ]
    );
}

/// PADLIST names its padnames and per-depth pads strongly.
#[test]
fn padlist_outrefs() {
    let df = code_dump().load();
    assert_eq!(
        roles(&df.outrefs_at(PADLIST)),
        vec![
            ("the padnames", Strength::Strong, PADNAMES),
            ("pad at depth 1", Strength::Strong, PAD1),
        ]
    );
}

/// PADNAMES reports padname slots from index 1 up; element 0 is omitted.
#[test]
fn padnames_outrefs_skip_element_zero() {
    let df = code_dump().load();
    assert_eq!(
        roles(&df.outrefs_at(PADNAMES)),
        vec![("padname [1]", Strength::Strong, NAME)]
    );
}

/// PAD element 0 is the args array; named slots take their padname as role.
#[test]
fn pad_outrefs_use_padnames() {
    let df = code_dump().load();
    assert_eq!(
        roles(&df.outrefs_at(PAD1)),
        vec![
            ("the @_ av", Strength::Strong, ARGS),
            ("$x", Strength::Strong, LEXVAL),
        ]
    );
}

/// A pad slot with no padname falls back to the elem role.
#[test]
fn unnamed_pad_slot_role() {
    let mut b = DumpBuilder::new().perl_version(5, 36, 0);
    b.code(
        CODE,
        CodeRec {
            padlist: PADLIST,
            codex: vec![Codex::Padnames(PADNAMES), Codex::Pad(1, PAD1)],
            ..CodeRec::default()
        },
    );
    b.array(PADLIST, &[PADNAMES, PAD1], true);
    b.array(PADNAMES, &[0], true);
    b.array(PAD1, &[0, LEXVAL], true);
    b.scalar_pv(LEXVAL, b"anonymous temporary");
    let df = b.load();
    assert_eq!(
        roles(&df.outrefs_at(PAD1)),
        vec![("elem [1]", Strength::Strong, LEXVAL)]
    );
}

/// Without a padlist, a code's weak-outside and glob-refcounted flags flip
/// the corresponding strengths.
#[test]
fn code_flag_bits_flip_strengths() {
    let mut b = DumpBuilder::new();
    b.code(
        0x100,
        CodeRec {
            outside: 0x200,
            glob: 0x300,
            weak_outside: true,
            glob_refcounted: true,
            ..CodeRec::default()
        },
    );
    b.code(0x200, CodeRec::default());
    b.glob(0x300, GlobRec::default());
    let df = b.load();
    let refs = df.outrefs_at(0x100);
    assert_eq!(find(&refs, "the scope").strength, Strength::Weak);
    assert_eq!(find(&refs, "the glob").strength, Strength::Strong);
}

// =============================================================================
// 5. Decorations: magic and blessing
// =============================================================================

/// Magic contributes object and pointer edges, strong iff refcounted.
#[test]
fn magic_outrefs() {
    let mut b = DumpBuilder::new();
    b.scalar_pv(0x100, b"tied");
    b.scalar_pv(0x200, b"backing");
    b.scalar_pv(0x300, b"vtable");
    b.magic(0x100, 'P', true, 0x200, 0x300);
    b.magic(0x100, 'w', false, 0x200, 0);
    let df = b.load();

    assert_eq!(
        roles(&df.outrefs_at(0x100)),
        vec![
            ("'P' magic object", Strength::Strong, 0x200),
            ("'P' magic pointer", Strength::Strong, 0x300),
            ("'w' magic object", Strength::Weak, 0x200),
        ]
    );
}

/// Blessing adds a weak edge to the class stash.
#[test]
fn blessed_object_links_its_package() {
    let mut b = DumpBuilder::new();
    b.stash(0x100, "Some::Class", &[], 0);
    b.scalar(
        0x300,
        ScalarRec {
            pv: Some(b"instance data".to_vec()),
            blessed: 0x100,
            ..ScalarRec::default()
        },
    );
    let df = b.load();

    assert_eq!(df.sv_at(0x300).unwrap().blessed_at(), Some(0x100));
    assert_eq!(
        roles(&df.outrefs_at(0x300)),
        vec![("the bless package", Strength::Weak, 0x100)]
    );
}

// =============================================================================
// 6. Filtered views and counts
// =============================================================================

/// The strength partitions reassemble: strong + weak + indirect + inferred
/// equals all, and direct equals strong + weak.
#[test]
fn filters_partition_the_outref_set() {
    let df = code_dump().load();
    let sv = df.sv_at(CODE).unwrap();
    let all = df.outrefs_matching(sv, StrengthFilter::ALL).len();

    let by_strength: usize = [
        StrengthFilter {
            strong: true,
            weak: false,
            indirect: false,
            inferred: false,
        },
        StrengthFilter {
            strong: false,
            weak: true,
            indirect: false,
            inferred: false,
        },
        StrengthFilter {
            strong: false,
            weak: false,
            indirect: true,
            inferred: false,
        },
        StrengthFilter {
            strong: false,
            weak: false,
            indirect: false,
            inferred: true,
        },
    ]
    .iter()
    .map(|&filter| df.outrefs_matching(sv, filter).len())
    .sum();
    assert_eq!(by_strength, all);

    let direct = df.outrefs_matching(sv, StrengthFilter::DIRECT).len();
    let strong = df.outrefs_matching(sv, StrengthFilter::STRONG).len();
    let weak = df
        .outrefs_matching(
            sv,
            StrengthFilter {
                strong: false,
                weak: true,
                indirect: false,
                inferred: false,
            },
        )
        .len();
    assert_eq!(direct, strong + weak);
}

/// The count-only mode agrees with the allocated view for every filter.
#[test]
fn outref_count_matches_allocation() {
    let df = code_dump().load();
    for sv in df.heap() {
        for filter in [
            StrengthFilter::ALL,
            StrengthFilter::DIRECT,
            StrengthFilter::STRONG,
            StrengthFilter::NON_WEAK,
        ] {
            assert_eq!(
                df.outref_count(sv, filter),
                df.outrefs_matching(sv, filter).len(),
                "count mismatch for {desc} under {filter:?}",
                desc = sv.desc_addr()
            );
        }
    }
}

// =============================================================================
// 7. The inref index
// =============================================================================

/// Every outref has exactly one matching inref on its target.
#[test]
fn inrefs_invert_outrefs() {
    let mut df = code_dump().load();
    df.build_inrefs(&mut pmatscope::NoProgress);

    let pairs: Vec<(u64, Outref)> = df
        .heap()
        .flat_map(|sv| {
            df.outrefs(sv)
                .into_iter()
                .map(move |outref| (sv.addr(), outref))
        })
        .collect();
    for (owner, outref) in pairs {
        if df.sv_at(outref.target).is_none() || df.is_immortal(outref.target) {
            continue;
        }
        let matching = df
            .inrefs(outref.target)
            .iter()
            .filter(|inref| {
                inref.owner == Some(owner)
                    && inref.name == outref.name
                    && inref.strength == outref.strength
            })
            .count();
        assert_eq!(
            matching, 1,
            "expected exactly one inref mirroring {outref:?} from {owner:#x}"
        );
    }
}

/// Named roots contribute ownerless inrefs labeled by description.
#[test]
fn roots_contribute_ownerless_inrefs() {
    let mut df = package_scalar_dump().load();
    let inrefs = df.inrefs(common::fixture::STASH);
    assert!(
        inrefs
            .iter()
            .any(|r| r.owner.is_none() && r.name == "the default stash"),
        "stash should carry the defstash root inref, got {inrefs:?}"
    );
}

/// Operand-stack entries contribute "a value on the stack" inrefs.
#[test]
fn stack_contributes_inrefs() {
    let mut b = DumpBuilder::new();
    b.scalar_pv(0x100, b"on the stack");
    b.stack_push(0x100);
    let mut df = b.load();
    let inrefs = df.inrefs(0x100);
    assert_eq!(inrefs.len(), 1);
    assert!(inrefs[0].owner.is_none());
    assert_eq!(inrefs[0].name, "a value on the stack");
}

/// Immortal singletons receive no inrefs even when referenced.
#[test]
fn immortals_receive_no_inrefs() {
    let mut b = DumpBuilder::new();
    b.array(0x100, &[UNDEF], true);
    let mut df = b.load();
    assert!(df.inrefs(UNDEF).is_empty());
}

/// The package-scalar fixture end to end: the glob holds the scalar, the
/// stash holds the glob twice (value map and backrefs).
#[test]
fn package_scalar_inref_shape() {
    let mut df = package_scalar_dump().load();

    let scalar_inrefs = df.inrefs_matching(common::fixture::SCALAR, StrengthFilter::ALL);
    assert_eq!(scalar_inrefs.len(), 1);
    assert_eq!(scalar_inrefs[0].owner, Some(common::fixture::GLOB));
    assert_eq!(scalar_inrefs[0].name, "the scalar");
    assert_eq!(scalar_inrefs[0].strength, Strength::Strong);

    let glob_inrefs = df.inrefs_matching(common::fixture::GLOB, StrengthFilter::ALL);
    let from_stash: Vec<_> = glob_inrefs
        .iter()
        .filter(|r| r.owner == Some(common::fixture::STASH))
        .map(|r| (r.name.as_str(), r.strength))
        .collect();
    assert!(
        from_stash.contains(&("value {PACKAGE_SCALAR}", Strength::Strong)),
        "glob should be held by the stash value map, got {from_stash:?}"
    );
    assert!(
        from_stash.contains(&("a backref", Strength::Indirect)),
        "glob should be held indirectly through the stash backrefs"
    );
}
