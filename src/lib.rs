//! Glob-rule to minimized-DFA compiler for access-control policies.
//!
//! Policy rules pair a shell-style glob pattern (alternation with `{a,b}`,
//! character classes, `?`, `*` and the recursive `**`) with a 32-bit
//! permission mask and an audit mask.  A whole ruleset is compiled into a
//! single deterministic automaton whose accepting states carry the union
//! of the permissions of every rule matching the input consumed so far.
//! The automaton is what an enforcement engine ultimately walks, one byte
//! at a time, so the compiler also squeezes the transition table down:
//! states are minimized and input bytes are folded into equivalence
//! classes before serialization.
//!
//! # Architecture
//!
//! The pipeline runs in four stages, each handing a value to the next:
//!
//! ```text
//! glob pattern ──translate──> byte regex ──regex_syntax::hir──> expression
//!     tree (+ accept leaves) ──followpos subset construction──> DFA
//!     ──partition refinement + byte classes──> minimized DFA + blob
//! ```
//!
//! Rules accumulate in a [`Ruleset`]: every rule becomes
//! `concat(expr, accept)` and the rules are joined under an alternation,
//! so the tree is built once per ruleset and the accept leaves tag which
//! rules matched.  The DFA derivation is the classical followpos
//! construction (Aho/Sethi/Ullman): a DFA state is a set of tree
//! positions, deduplicated by content hash.
//!
//! Minimization is partition refinement with two speed/size knobs
//! ([`DfaFlags::CONTROL_MINIMIZE_HASH_PERMS`] and
//! [`DfaFlags::CONTROL_MINIMIZE_HASH_TRANS`]) that pre-split the initial
//! partition.  With both knobs off the result is the true minimum DFA;
//! with either on, some mergeable states may stay apart, which only costs
//! table size, never correctness.
//!
//! The null byte never appears in matched input.  It is reserved as the
//! field separator for multi-component rules (see
//! [`Ruleset::add_rule_vec`]), which is how a single automaton matches
//! records like "class byte, mount point, device, type, flags".

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::io::Write;

use bitflags::bitflags;
use indexmap::IndexMap;
use log::{debug, warn};
use regex_syntax::hir::{self, Hir, HirKind};

// ---------------------------------------------------------------------------
// Permission bit layout
// ---------------------------------------------------------------------------

/// Permission bit layout shared with the enforcement engine.
///
/// A 32-bit mask holds two mirrored permission halves, one for the task's
/// own ("user") accesses and one for accesses performed on its behalf
/// ("other"), plus a few global control bits in the top of the word.  The
/// exec-modifier bits qualify *how* an exec permission is granted and are
/// treated as a unit per half.
pub mod perms {
    pub const MAY_EXEC: u32 = 1 << 0;
    pub const MAY_WRITE: u32 = 1 << 1;
    pub const MAY_READ: u32 = 1 << 2;
    pub const MAY_APPEND: u32 = 1 << 3;
    pub const MAY_LINK: u32 = 1 << 4;
    pub const MAY_LOCK: u32 = 1 << 5;
    pub const EXEC_MMAP: u32 = 1 << 6;
    pub const EXEC_UNSAFE: u32 = 1 << 7;
    pub const EXEC_INHERIT: u32 = 1 << 8;
    pub const EXEC_PROFILE: u32 = 1 << 9;
    pub const EXEC_UNCONFINED: u32 = 1 << 10;

    /// Exec-modifier bits within one permission half.
    pub const EXEC_TYPE: u32 =
        EXEC_MMAP | EXEC_UNSAFE | EXEC_INHERIT | EXEC_PROFILE | EXEC_UNCONFINED;

    pub const USER_SHIFT: u32 = 0;
    pub const OTHER_SHIFT: u32 = 14;

    pub const USER_EXEC: u32 = MAY_EXEC << USER_SHIFT;
    pub const OTHER_EXEC: u32 = MAY_EXEC << OTHER_SHIFT;
    pub const USER_EXEC_TYPE: u32 = EXEC_TYPE << USER_SHIFT;
    pub const OTHER_EXEC_TYPE: u32 = EXEC_TYPE << OTHER_SHIFT;
    pub const LINK_BITS: u32 = (MAY_LINK << USER_SHIFT) | (MAY_LINK << OTHER_SHIFT);

    pub const ONEXEC: u32 = 1 << 29;
    pub const CHANGE_PROFILE: u32 = 1 << 30;
    /// Accumulating this bit into a state's accept mask is a compile error.
    pub const ERROR_BIT: u32 = 1 << 31;

    /// Leading class byte of mount-family rule records.
    pub const CLASS_MOUNT: u8 = 0x07;
    /// Leading class byte of D-Bus-family rule records.
    pub const CLASS_DBUS: u8 = 0x20;

    /// Whether two masks agree on the exec modifiers of each half.
    ///
    /// Masks conflict when both set exec-modifier bits in the same half
    /// and those bits differ.  A half with no modifiers never conflicts.
    pub fn merged_x_consistent(a: u32, b: u32) -> bool {
        for shift in [USER_SHIFT, OTHER_SHIFT] {
            let qa = (a >> shift) & EXEC_TYPE;
            let qb = (b >> shift) & EXEC_TYPE;
            if qa != 0 && qb != 0 && qa != qb {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// What went wrong while translating a single glob pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternErrorKind {
    /// `]` with no matching `[`.
    UnmatchedClassClose,
    /// `[` left open at end of pattern.
    UnclosedClass,
    /// `}` with no matching `{`.
    UnmatchedGroupClose,
    /// `{` left open at end of pattern.
    UnclosedGroup,
    /// Alternation with no `,` between its braces.
    EmptyGroup,
    /// More than [`MAX_ALT_DEPTH`] nested alternations.
    NestingOverflow,
    /// Pattern ends in an unpaired `\`.
    TrailingEscape,
}

impl PatternErrorKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::UnmatchedClassClose => "invalid close ], no matching open [",
            Self::UnclosedClass => "unclosed character class",
            Self::UnmatchedGroupClose => "invalid close }, no matching open {",
            Self::UnclosedGroup => "unclosed alternation group",
            Self::EmptyGroup => "invalid number of items between {}",
            Self::NestingOverflow => "exceeded maximum nesting of {}",
            Self::TrailingEscape => "trailing '\\' escape character",
        }
    }
}

/// An error raised while compiling a ruleset.
#[derive(Debug)]
pub enum Error {
    /// A glob pattern failed to parse.  Carries the offending rule text.
    Pattern {
        pattern: String,
        kind: PatternErrorKind,
    },
    /// The translated regex was rejected by the regex front-end.
    Regex {
        regex: String,
        source: Box<regex_syntax::Error>,
    },
    /// A character class that cannot be lowered to single bytes.
    UnsupportedClass,
    /// A look-around assertion other than `^` (start) or `$` (end).
    UnsupportedLook,
    /// Merging rules produced a state with conflicting exec modifiers.
    ExecConflict,
    /// A state accumulated [`perms::ERROR_BIT`].
    ErrorBit,
    /// `create_dfa` was called on a ruleset with no rules.
    EmptyRuleset,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pattern { pattern, kind } => {
                write!(f, "cannot parse pattern '{}': {}", pattern, kind.as_str())
            }
            Self::Regex { regex, source } => {
                write!(f, "internal regex '{}' rejected: {}", regex, source)
            }
            Self::UnsupportedClass => write!(f, "unsupported character class"),
            Self::UnsupportedLook => write!(f, "unsupported look-around assertion"),
            Self::ExecConflict => {
                write!(f, "merged rules have conflicting x modifiers")
            }
            Self::ErrorBit => write!(f, "accumulated permission error bit"),
            Self::EmptyRuleset => write!(f, "ruleset contains no rules"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Regex { source, .. } => Some(&**source),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Compilation flags
// ---------------------------------------------------------------------------

bitflags! {
    /// Diagnostic and minimization controls for a compilation.
    ///
    /// The `DUMP_*` flags emit diagnostics through the [`log`] facade at
    /// debug level and never change the produced automaton.  The
    /// `CONTROL_*` flags trade minimality for minimization speed.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DfaFlags: u32 {
        /// Emit progress lines while building and minimizing.
        const DUMP_PROGRESS = 1 << 0;
        /// Emit final statistics per stage.
        const DUMP_STATS = 1 << 1;
        /// Emit the position-set to state mapping after construction.
        const DUMP_NODE_TO_DFA = 1 << 2;
        /// List states removed by the reachability prune.
        const DUMP_UNREACHABLE = 1 << 3;
        /// Report the byte equivalence-class count.
        const DUMP_EQUIV_STATS = 1 << 4;
        /// Print each rule's translated regex.
        const DUMP_RULE_EXPR = 1 << 5;
        /// Seed the initial partition with one block per distinct
        /// `(perms, audit)` pair instead of one accepting block.
        const CONTROL_MINIMIZE_HASH_PERMS = 1 << 6;
        /// Further split the initial partition by a fingerprint of each
        /// state's transition shape.
        const CONTROL_MINIMIZE_HASH_TRANS = 1 << 7;
    }
}

// ---------------------------------------------------------------------------
// Glob pattern translation
// ---------------------------------------------------------------------------

/// Maximum nesting of `{}` alternation groups.
pub const MAX_ALT_DEPTH: usize = 50;

/// How much regex machinery a translated pattern actually needs.
///
/// `Basic` patterns are pure literals and let callers skip the automaton
/// entirely; `TailGlob` marks the fast-path shape "literal prefix then a
/// trailing `**`".  Everything else is `Regex`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatternClass {
    Basic,
    TailGlob,
    Regex,
}

/// Classification returned alongside a translated pattern.
#[derive(Clone, Copy, Debug)]
pub struct Translation {
    pub class: PatternClass,
    /// Offset of the first regex construct in the source pattern, or 0
    /// when the pattern is a pure literal.
    pub first_re_pos: usize,
}

/// Collapse runs of `/` in a path, in place.
///
/// A leading `//` (but not `///`) is preserved untouched: it names a
/// distinct namespace and must not be folded into `/`.  Trailing single
/// slashes are kept.
pub fn filter_slashes(path: &mut Vec<u8>) {
    if path.len() < 2 {
        return;
    }
    let mut out = Vec::with_capacity(path.len());
    let mut i = 0;
    if path[0] == b'/' && path[1] == b'/' && (path.len() == 2 || path[2] != b'/') {
        out.extend_from_slice(b"//");
        i = 2;
    }
    let mut seen_slash = false;
    while i < path.len() {
        let b = path[i];
        if b == b'/' {
            if !seen_slash {
                out.push(b);
            }
            seen_slash = true;
        } else {
            out.push(b);
            seen_slash = false;
        }
        i += 1;
    }
    *path = out;
}

/// Append a literal byte to a regex buffer, `\xNN`-escaping anything that
/// is not printable ASCII so the buffer stays valid UTF-8.
fn push_literal(out: &mut String, b: u8) {
    if (0x20..0x7f).contains(&b) {
        out.push(b as char);
    } else {
        out.push_str(&format!("\\x{:02x}", b));
    }
}

/// Translate one glob pattern, returning the regex and its classification.
pub fn translate(pattern: &[u8], anchor: bool) -> Result<(String, Translation), Error> {
    let mut out = String::new();
    let t = translate_into(pattern, anchor, &mut out)?;
    Ok((out, t))
}

/// Translate a glob pattern into the internal byte-regex syntax, appending
/// to `out`.
///
/// The regex alphabet is plain ASCII with `\xNN` escapes for everything
/// else; its metacharacters are the PCRE set `. + | ( ) [ ] { } \ * ? ^ $`.
/// Glob constructs map as:
///
/// * `*` becomes `[^/\x00]*` and `**` becomes `[^\x00]*`.  When the star
///   run directly follows a `/` and ends the pattern or is followed by
///   another `/`, a `[^/\x00]` is emitted first so the star consumes at
///   least one byte (`/foo/*` must not match `/foo/`).
/// * `?` becomes `[^/\x00]`.
/// * `[...]` passes through as a character class.
/// * `{a,b}` becomes `(a|b)`, nesting bounded by [`MAX_ALT_DEPTH`].
/// * `^ $ . + | ( )` are matched literally and emitted escaped.
///
/// `anchor` wraps the emitted regex in `^`/`$`.  Escapes that quote a
/// character with no special meaning are dropped with a warning.
pub fn translate_into(
    pattern: &[u8],
    anchor: bool,
    out: &mut String,
) -> Result<Translation, Error> {
    let fail = |kind| Error::Pattern {
        pattern: String::from_utf8_lossy(pattern).into_owned(),
        kind,
    };

    let mut class = PatternClass::Basic;
    let mut first_re_pos = 0usize;
    let mut escape = false;
    let mut in_class = false;
    // One entry per open alternation group, counting its commas.
    let mut groups: Vec<usize> = Vec::new();

    if anchor {
        out.push('^');
    }

    let mut i = 0usize;
    while i < pattern.len() {
        let b = pattern[i];
        match b {
            b'\\' => {
                if escape {
                    // Two escapes in a row stay doubled so the regex
                    // level sees a quoted backslash.
                    out.push_str("\\\\");
                    escape = false;
                } else {
                    escape = true;
                    i += 1;
                    continue;
                }
            }
            b'*' => {
                if escape {
                    out.push_str("\\*");
                    escape = false;
                } else {
                    if out.as_bytes().last() == Some(&b'/') {
                        // A star run that forms a whole path component
                        // must consume at least one byte, otherwise
                        // /foo/* would match /foo/ itself.
                        let mut j = i;
                        while j < pattern.len() && pattern[j] == b'*' {
                            j += 1;
                        }
                        if j == pattern.len() || pattern[j] == b'/' {
                            out.push_str("[^/\\x00]");
                        }
                    }
                    if pattern.get(i + 1) == Some(&b'*') {
                        if first_re_pos == 0 {
                            first_re_pos = i;
                        }
                        // A trailing ** on an otherwise literal pattern
                        // is the tail-glob fast path.
                        if i + 2 == pattern.len() && class == PatternClass::Basic {
                            class = PatternClass::TailGlob;
                        } else {
                            class = PatternClass::Regex;
                        }
                        out.push_str("[^\\x00]*");
                        i += 1;
                    } else {
                        if first_re_pos == 0 {
                            first_re_pos = i;
                        }
                        class = PatternClass::Regex;
                        out.push_str("[^/\\x00]*");
                    }
                }
            }
            b'?' => {
                if escape {
                    // Not special at the regex level, pass it bare.
                    out.push('?');
                    escape = false;
                } else {
                    if first_re_pos == 0 {
                        first_re_pos = i;
                    }
                    class = PatternClass::Regex;
                    out.push_str("[^/\\x00]");
                }
            }
            b'[' => {
                if escape {
                    out.push_str("\\[");
                    escape = false;
                } else {
                    if first_re_pos == 0 {
                        first_re_pos = i;
                    }
                    in_class = true;
                    class = PatternClass::Regex;
                    out.push('[');
                }
            }
            b']' => {
                if escape {
                    out.push_str("\\]");
                    escape = false;
                } else {
                    if !in_class {
                        return Err(fail(PatternErrorKind::UnmatchedClassClose));
                    }
                    in_class = false;
                    out.push(']');
                }
            }
            b'{' => {
                if escape {
                    out.push_str("\\{");
                    escape = false;
                } else if in_class {
                    // Braces are ordinary characters inside a class.
                    out.push('{');
                } else {
                    if first_re_pos == 0 {
                        first_re_pos = i;
                    }
                    if groups.len() >= MAX_ALT_DEPTH {
                        return Err(fail(PatternErrorKind::NestingOverflow));
                    }
                    groups.push(0);
                    class = PatternClass::Regex;
                    out.push('(');
                }
            }
            b'}' => {
                if escape {
                    out.push_str("\\}");
                    escape = false;
                } else if in_class {
                    out.push('}');
                } else {
                    match groups.pop() {
                        None => return Err(fail(PatternErrorKind::UnmatchedGroupClose)),
                        Some(0) => return Err(fail(PatternErrorKind::EmptyGroup)),
                        Some(_) => out.push(')'),
                    }
                }
            }
            b',' => {
                if escape {
                    if in_class {
                        // An escaped comma in a class matches a literal
                        // comma, keep the quote for the regex level.
                        out.push_str("\\,");
                    } else {
                        out.push(',');
                    }
                    escape = false;
                } else if !in_class {
                    if let Some(n) = groups.last_mut() {
                        *n += 1;
                        out.push('|');
                    } else {
                        out.push(',');
                    }
                } else {
                    out.push(',');
                }
            }
            // Special outside character classes but not inside them.
            b'^' | b'$' => {
                if in_class {
                    out.push(b as char);
                } else {
                    out.push('\\');
                    out.push(b as char);
                }
                escape = false;
            }
            // Regex metacharacters the glob syntax treats as literals.
            // Always emitted escaped, so a preceding quote is redundant.
            b'.' | b'+' | b'|' | b'(' | b')' => {
                out.push('\\');
                if escape {
                    warn!(
                        "character '{}' was quoted unnecessarily, dropped preceding quote",
                        b as char
                    );
                    escape = false;
                }
                out.push(b as char);
            }
            _ => {
                if escape {
                    warn!(
                        "character '{}' was quoted unnecessarily, dropped preceding quote",
                        b as char
                    );
                    escape = false;
                }
                push_literal(out, b);
            }
        }
        i += 1;
    }

    if in_class {
        return Err(fail(PatternErrorKind::UnclosedClass));
    }
    if !groups.is_empty() {
        return Err(fail(PatternErrorKind::UnclosedGroup));
    }
    if escape {
        return Err(fail(PatternErrorKind::TrailingEscape));
    }
    if anchor {
        out.push('$');
    }

    Ok(Translation {
        class,
        first_re_pos,
    })
}

// ---------------------------------------------------------------------------
// Byte sets
// ---------------------------------------------------------------------------

/// A 256-entry boolean lookup table over byte values.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ByteSet([bool; 256]);

impl ByteSet {
    const NONE: Self = Self([false; 256]);

    #[inline]
    fn contains(&self, b: u8) -> bool {
        self.0[b as usize]
    }

    #[inline]
    fn insert(&mut self, b: u8) {
        self.0[b as usize] = true;
    }

    fn count(&self) -> usize {
        self.0.iter().filter(|&&x| x).count()
    }

    fn complement(&self) -> Self {
        let mut out = Self::NONE;
        for (i, &x) in self.0.iter().enumerate() {
            out.0[i] = !x;
        }
        out
    }

    fn bytes(&self) -> impl Iterator<Item = u8> + '_ {
        (0u16..256).map(|b| b as u8).filter(|&b| self.contains(b))
    }
}

impl fmt::Debug for ByteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.count())
    }
}

// ---------------------------------------------------------------------------
// Expression tree
// ---------------------------------------------------------------------------

/// Index into the expression arena ([`ExprTree`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct ExprIdx(u32);

impl ExprIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Which flavor of accept leaf a rule contributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum AcceptKind {
    /// Ordinary allow rule.
    Normal,
    /// Allow rule whose pattern had no wildcards.  Its exec modifiers
    /// override those of wildcard rules matching the same state.
    Exact,
    /// Deny rule.  Its permission bits are subtracted at the end.
    Deny,
}

/// One node of the rule expression tree.
///
/// Leaves (`Char`, `CharSet`, `Accept`) occupy match positions; interior
/// nodes combine them.  `Accept` consumes no input, it only tags the
/// states whose position set contains it.
#[derive(Clone, Debug)]
enum Expr {
    Char(u8),
    /// A character class.  With `negated` set the stored bytes are the
    /// excluded ones, which keeps mostly-full classes small and routes
    /// them through the default transition during subset construction.
    CharSet { bytes: ByteSet, negated: bool },
    Concat(ExprIdx, ExprIdx),
    Alt(ExprIdx, ExprIdx),
    Star(ExprIdx),
    Plus(ExprIdx),
    Optional(ExprIdx),
    Accept { kind: AcceptKind, perms: u32, audit: u32 },
}

/// Arena of expression nodes for one ruleset.
///
/// Interior nodes form a tree; accept leaves may be shared between rules
/// when their flags intern to the same leaf.
#[derive(Debug, Default)]
struct ExprTree {
    nodes: Vec<Expr>,
}

impl ExprTree {
    fn push(&mut self, node: Expr) -> ExprIdx {
        let idx = ExprIdx(self.nodes.len() as u32);
        self.nodes.push(node);
        idx
    }

    #[inline]
    fn node(&self, idx: ExprIdx) -> &Expr {
        &self.nodes[idx.idx()]
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Lower a parsed regex into the arena.  Returns `None` for
    /// sub-expressions that match only the empty string.
    fn lower(&mut self, hir: &Hir) -> Result<Option<ExprIdx>, Error> {
        match hir.kind() {
            HirKind::Empty => Ok(None),
            HirKind::Literal(lit) => {
                let mut expr = None;
                for &b in lit.0.iter() {
                    let c = self.push(Expr::Char(b));
                    expr = Some(match expr {
                        Some(prev) => self.push(Expr::Concat(prev, c)),
                        None => c,
                    });
                }
                Ok(expr)
            }
            HirKind::Class(hir::Class::Bytes(class)) => {
                let mut bytes = ByteSet::NONE;
                for range in class.ranges() {
                    for b in range.start()..=range.end() {
                        bytes.insert(b);
                    }
                }
                // Store mostly-full classes as their complement so the
                // subset construction emits a default transition instead
                // of a couple hundred explicit edges.
                let node = if bytes.count() > 128 {
                    Expr::CharSet {
                        bytes: bytes.complement(),
                        negated: true,
                    }
                } else {
                    Expr::CharSet {
                        bytes,
                        negated: false,
                    }
                };
                Ok(Some(self.push(node)))
            }
            HirKind::Class(hir::Class::Unicode(_)) => Err(Error::UnsupportedClass),
            HirKind::Look(hir::Look::Start) | HirKind::Look(hir::Look::End) => {
                // Matching is whole-string, anchors are vacuous here.
                Ok(None)
            }
            HirKind::Look(_) => Err(Error::UnsupportedLook),
            HirKind::Capture(cap) => self.lower(&cap.sub),
            HirKind::Repetition(rep) => self.lower_repetition(rep),
            HirKind::Concat(subs) => {
                let mut expr = None;
                for sub in subs {
                    if let Some(e) = self.lower(sub)? {
                        expr = Some(match expr {
                            Some(prev) => self.push(Expr::Concat(prev, e)),
                            None => e,
                        });
                    }
                }
                Ok(expr)
            }
            HirKind::Alternation(subs) => {
                let mut expr = None;
                let mut saw_empty = false;
                for sub in subs {
                    match self.lower(sub)? {
                        None => saw_empty = true,
                        Some(e) => {
                            expr = Some(match expr {
                                Some(prev) => self.push(Expr::Alt(prev, e)),
                                None => e,
                            });
                        }
                    }
                }
                // An empty branch makes the whole alternation optional.
                match (expr, saw_empty) {
                    (Some(e), true) => Ok(Some(self.push(Expr::Optional(e)))),
                    (expr, _) => Ok(expr),
                }
            }
        }
    }

    /// Lower `sub{min,max}`.  The unbounded shapes map directly onto
    /// `Star`/`Plus`; bounded counts unroll, re-lowering the body so
    /// every copy gets distinct match positions.
    fn lower_repetition(&mut self, rep: &hir::Repetition) -> Result<Option<ExprIdx>, Error> {
        let sub = &rep.sub;
        match (rep.min, rep.max) {
            (0, None) => Ok(self.lower(sub)?.map(|e| self.push(Expr::Star(e)))),
            (1, None) => Ok(self.lower(sub)?.map(|e| self.push(Expr::Plus(e)))),
            (0, Some(1)) => Ok(self.lower(sub)?.map(|e| self.push(Expr::Optional(e)))),
            (min, None) => {
                let mut expr = None;
                for i in 0..min {
                    let Some(mut e) = self.lower(sub)? else {
                        return Ok(None);
                    };
                    if i + 1 == min {
                        e = self.push(Expr::Plus(e));
                    }
                    expr = Some(match expr {
                        Some(prev) => self.push(Expr::Concat(prev, e)),
                        None => e,
                    });
                }
                Ok(expr)
            }
            (min, Some(max)) => {
                let mut expr = None;
                for i in 0..max {
                    let Some(mut e) = self.lower(sub)? else {
                        return Ok(None);
                    };
                    if i >= min {
                        e = self.push(Expr::Optional(e));
                    }
                    expr = Some(match expr {
                        Some(prev) => self.push(Expr::Concat(prev, e)),
                        None => e,
                    });
                }
                Ok(expr)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Position analysis
// ---------------------------------------------------------------------------

/// Leaf position number, assigned in stable left-to-right tree order.
type PosId = u32;

/// Ordered set of positions, kept sorted and deduplicated.
type PosSet = Vec<PosId>;

fn union_into(dst: &mut PosSet, src: &[PosId]) {
    dst.extend_from_slice(src);
    dst.sort_unstable();
    dst.dedup();
}

/// The nullable/firstpos/lastpos/followpos tables of one expression tree.
///
/// `nullable`, `firstpos` and `lastpos` are indexed by expression node,
/// `followpos` by position.  The whole structure only lives for the
/// duration of subset construction and is dropped as soon as the DFA
/// exists, which is where the bulk of compile-time memory goes.
struct Follow {
    /// Position to the leaf expression occupying it.
    positions: Vec<ExprIdx>,
    nullable: Vec<bool>,
    firstpos: Vec<PosSet>,
    lastpos: Vec<PosSet>,
    followpos: Vec<PosSet>,
}

impl Follow {
    /// Run the classical followpos computation over the tree.
    ///
    /// Accept leaves are their own positions and act as end markers: a
    /// DFA state whose position set contains one is accepting.
    fn compute(tree: &ExprTree, root: ExprIdx) -> Follow {
        let n = tree.len();
        let mut f = Follow {
            positions: Vec::new(),
            nullable: vec![false; n],
            firstpos: vec![Vec::new(); n],
            lastpos: vec![Vec::new(); n],
            followpos: Vec::new(),
        };
        let mut pos_of: Vec<Option<PosId>> = vec![None; n];
        f.visit(tree, root, &mut pos_of);
        f
    }

    fn visit(&mut self, tree: &ExprTree, idx: ExprIdx, pos_of: &mut [Option<PosId>]) {
        match *tree.node(idx) {
            Expr::Char(_) | Expr::CharSet { .. } | Expr::Accept { .. } => {
                // Interned accept leaves are visited once per referencing
                // rule; the first visit assigns the position.
                let p = match pos_of[idx.idx()] {
                    Some(p) => p,
                    None => {
                        let p = self.positions.len() as PosId;
                        self.positions.push(idx);
                        self.followpos.push(Vec::new());
                        pos_of[idx.idx()] = Some(p);
                        p
                    }
                };
                self.nullable[idx.idx()] = false;
                self.firstpos[idx.idx()] = vec![p];
                self.lastpos[idx.idx()] = vec![p];
            }
            Expr::Concat(a, b) => {
                self.visit(tree, a, pos_of);
                self.visit(tree, b, pos_of);
                self.nullable[idx.idx()] = self.nullable[a.idx()] && self.nullable[b.idx()];
                let mut first = self.firstpos[a.idx()].clone();
                if self.nullable[a.idx()] {
                    union_into(&mut first, &self.firstpos[b.idx()]);
                }
                self.firstpos[idx.idx()] = first;
                let mut last = self.lastpos[b.idx()].clone();
                if self.nullable[b.idx()] {
                    union_into(&mut last, &self.lastpos[a.idx()]);
                }
                self.lastpos[idx.idx()] = last;
                let last_a = self.lastpos[a.idx()].clone();
                let first_b = self.firstpos[b.idx()].clone();
                for &p in &last_a {
                    union_into(&mut self.followpos[p as usize], &first_b);
                }
            }
            Expr::Alt(a, b) => {
                self.visit(tree, a, pos_of);
                self.visit(tree, b, pos_of);
                self.nullable[idx.idx()] = self.nullable[a.idx()] || self.nullable[b.idx()];
                let mut first = self.firstpos[a.idx()].clone();
                union_into(&mut first, &self.firstpos[b.idx()]);
                self.firstpos[idx.idx()] = first;
                let mut last = self.lastpos[a.idx()].clone();
                union_into(&mut last, &self.lastpos[b.idx()]);
                self.lastpos[idx.idx()] = last;
            }
            Expr::Star(c) | Expr::Plus(c) => {
                self.visit(tree, c, pos_of);
                self.nullable[idx.idx()] = match tree.node(idx) {
                    Expr::Star(_) => true,
                    _ => self.nullable[c.idx()],
                };
                self.firstpos[idx.idx()] = self.firstpos[c.idx()].clone();
                self.lastpos[idx.idx()] = self.lastpos[c.idx()].clone();
                // The loop edge: the body may follow itself.
                let last_c = self.lastpos[c.idx()].clone();
                let first_c = self.firstpos[c.idx()].clone();
                for &p in &last_c {
                    union_into(&mut self.followpos[p as usize], &first_c);
                }
            }
            Expr::Optional(c) => {
                self.visit(tree, c, pos_of);
                self.nullable[idx.idx()] = true;
                self.firstpos[idx.idx()] = self.firstpos[c.idx()].clone();
                self.lastpos[idx.idx()] = self.lastpos[c.idx()].clone();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Accept mask reduction
// ---------------------------------------------------------------------------

/// Fold the accept leaves contributing to one state into its final
/// `(accept, audit)` masks.
///
/// Exact-match leaves override the exec modifiers of wildcard leaves per
/// permission half, deny bits are subtracted last, and quiet bits ride in
/// the audit column for the permissions they silence.  Leaves whose exec
/// modifiers disagree within the same half fail the whole ruleset.
fn reduce_accepts<I>(leaves: I) -> Result<(u32, u32), Error>
where
    I: IntoIterator<Item = (AcceptKind, u32, u32)>,
{
    use perms::*;

    let mut p = 0u32;
    let mut audit = 0u32;
    let mut exact = 0u32;
    let mut exact_audit = 0u32;
    let mut deny = 0u32;
    let mut quiet = 0u32;

    for (kind, flag, aud) in leaves {
        match kind {
            AcceptKind::Exact => {
                // Exact overrides only ever happen with x.
                if !merged_x_consistent(exact, flag) {
                    return Err(Error::ExecConflict);
                }
                exact |= flag;
                exact_audit |= aud;
            }
            AcceptKind::Deny => {
                deny |= flag;
                quiet |= aud;
            }
            AcceptKind::Normal => {
                if !merged_x_consistent(p, flag) {
                    return Err(Error::ExecConflict);
                }
                p |= flag;
                audit |= aud;
            }
        }
    }

    p |= exact & !(USER_EXEC_TYPE | OTHER_EXEC_TYPE);
    if exact & USER_EXEC_TYPE != 0 {
        p = (exact & USER_EXEC_TYPE) | (p & !USER_EXEC_TYPE);
        audit = (exact_audit & USER_EXEC_TYPE) | (audit & !USER_EXEC_TYPE);
    }
    if exact & OTHER_EXEC_TYPE != 0 {
        p = (exact & OTHER_EXEC_TYPE) | (p & !OTHER_EXEC_TYPE);
        audit = (exact_audit & OTHER_EXEC_TYPE) | (audit & !OTHER_EXEC_TYPE);
    }
    // A denied base exec bit takes its whole modifier class with it.
    if p & USER_EXEC & deny != 0 {
        p &= !USER_EXEC_TYPE;
    }
    if p & OTHER_EXEC & deny != 0 {
        p &= !OTHER_EXEC_TYPE;
    }
    p &= !deny;

    if p & ERROR_BIT != 0 {
        return Err(Error::ErrorBit);
    }

    Ok((p, (audit & !deny) | (quiet & deny)))
}

// ---------------------------------------------------------------------------
// DFA
// ---------------------------------------------------------------------------

/// Index into a [`Dfa`]'s state arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateId(u32);

impl StateId {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transition table of one state: explicit per-byte edges plus an
/// optional fall-through taken for every byte without an entry.
#[derive(Clone, Debug, Default)]
pub struct Cases {
    pub otherwise: Option<StateId>,
    pub edges: BTreeMap<u8, StateId>,
}

/// One DFA state.
#[derive(Clone, Debug)]
pub struct State {
    /// Dump label; -1 marks a state condemned during minimization.
    pub label: i32,
    pub accept: u32,
    pub audit: u32,
    pub cases: Cases,
    /// Back-pointer into the partition list, meaningful only while
    /// `minimize` runs.
    partition: usize,
}

/// A deterministic automaton over bytes.
///
/// Two states are distinguished: `start` is the entry point and
/// `nonmatching` is the dead state reached once no rule can still match.
/// Bytes without an explicit edge fall through to a state's `otherwise`
/// target, or to the dead state when there is none.
pub struct Dfa {
    states: Vec<State>,
    pub start: StateId,
    pub nonmatching: StateId,
}

#[derive(Debug, Default)]
struct DfaStats {
    duplicates: usize,
    proto_max: usize,
    proto_sum: usize,
}

struct DfaBuilder<'a> {
    tree: &'a ExprTree,
    follow: &'a Follow,
    states: Vec<State>,
    /// Canonical position set to state mapping.  Insertion order mirrors
    /// state creation order, so entry `i` belongs to state `i`.
    nodemap: IndexMap<Box<[PosId]>, StateId>,
    queue: VecDeque<StateId>,
    stats: DfaStats,
}

impl DfaBuilder<'_> {
    #[inline]
    fn leaf(&self, p: PosId) -> &Expr {
        self.tree.node(self.follow.positions[p as usize])
    }

    fn add_state(&mut self, nodes: Box<[PosId]>) -> Result<StateId, Error> {
        let (accept, audit) = reduce_accepts(nodes.iter().filter_map(|&p| match *self.leaf(p) {
            Expr::Accept { kind, perms, audit } => Some((kind, perms, audit)),
            _ => None,
        }))?;
        let id = StateId(self.states.len() as u32);
        self.stats.proto_sum += nodes.len();
        self.stats.proto_max = self.stats.proto_max.max(nodes.len());
        self.states.push(State {
            label: id.0 as i32,
            accept,
            audit,
            cases: Cases::default(),
            partition: 0,
        });
        self.nodemap.insert(nodes, id);
        Ok(id)
    }

    /// Resolve a position set to its state, creating and queueing a new
    /// state on first sight.  Content equality decides identity; the
    /// duplicate count only feeds statistics.
    fn find_target(&mut self, nodes: PosSet) -> Result<StateId, Error> {
        let key = nodes.into_boxed_slice();
        if let Some(&id) = self.nodemap.get(&key) {
            self.stats.duplicates += 1;
            return Ok(id);
        }
        let id = self.add_state(key)?;
        self.queue.push_back(id);
        Ok(id)
    }

    /// Compute and install the outgoing transitions of one state.
    ///
    /// Grouping the followpos contributions per byte yields the explicit
    /// edges; negated classes contribute the fall-through.  The default
    /// is installed first so explicit edges it already covers can be
    /// skipped.
    fn update_state_transitions(&mut self, id: StateId) -> Result<(), Error> {
        let nodes: Box<[PosId]> = self
            .nodemap
            .get_index(id.idx())
            .expect("state ids mirror nodemap insertion order")
            .0
            .clone();

        // Bytes some leaf of this state cares about, matched or excluded.
        let mut mentioned = [false; 256];
        for &p in nodes.iter() {
            match *self.leaf(p) {
                Expr::Char(b) => mentioned[b as usize] = true,
                Expr::CharSet { ref bytes, .. } => {
                    for b in bytes.bytes() {
                        mentioned[b as usize] = true;
                    }
                }
                _ => {}
            }
        }

        // A byte nobody mentions is matched exactly by the negated
        // classes, so their followpos union is the fall-through target.
        let mut otherwise: PosSet = Vec::new();
        for &p in nodes.iter() {
            if let Expr::CharSet { negated: true, .. } = *self.leaf(p) {
                let fp = self.follow.followpos[p as usize].clone();
                union_into(&mut otherwise, &fp);
            }
        }
        let default = if otherwise.is_empty() {
            None
        } else {
            Some(self.find_target(otherwise)?)
        };
        self.states[id.idx()].cases.otherwise = default;

        for b in 0u16..256 {
            if !mentioned[b as usize] {
                continue;
            }
            let b = b as u8;
            let mut target: PosSet = Vec::new();
            for &p in nodes.iter() {
                let matches = match *self.leaf(p) {
                    Expr::Char(c) => c == b,
                    Expr::CharSet {
                        ref bytes,
                        negated: false,
                    } => bytes.contains(b),
                    Expr::CharSet {
                        ref bytes,
                        negated: true,
                    } => !bytes.contains(b),
                    _ => false,
                };
                if matches {
                    let fp = self.follow.followpos[p as usize].clone();
                    union_into(&mut target, &fp);
                }
            }
            let t = self.find_target(target)?;
            if Some(t) != default {
                self.states[id.idx()].cases.edges.insert(b, t);
            }
        }
        Ok(())
    }
}

impl Dfa {
    /// Subset-construct a DFA from a ruleset tree.
    ///
    /// `follow` is consumed and dropped on return together with the
    /// position-set map; nothing downstream needs either.
    fn build(tree: &ExprTree, root: ExprIdx, follow: Follow, flags: DfaFlags) -> Result<Dfa, Error> {
        let mut b = DfaBuilder {
            tree,
            follow: &follow,
            states: Vec::new(),
            nodemap: IndexMap::new(),
            queue: VecDeque::new(),
            stats: DfaStats::default(),
        };

        let nonmatching = b.add_state(Vec::new().into_boxed_slice())?;
        let first = b.follow.firstpos[root.idx()].clone();
        let start = b.add_state(first.into_boxed_slice())?;
        b.queue.push_back(start);

        let mut processed = 0usize;
        while let Some(id) = b.queue.pop_front() {
            if processed % 1000 == 0 && flags.contains(DfaFlags::DUMP_PROGRESS) {
                debug!(
                    "creating dfa: queue {} states {} eliminated duplicates {}",
                    b.queue.len(),
                    b.states.len(),
                    b.stats.duplicates
                );
            }
            processed += 1;
            b.update_state_transitions(id)?;
        }

        if flags.contains(DfaFlags::DUMP_NODE_TO_DFA) {
            debug!("mapping of states to expr position sets:");
            for (nodes, id) in b.nodemap.iter() {
                debug!("  {} <= {:?}", id, nodes);
            }
        }
        if flags.contains(DfaFlags::DUMP_STATS) {
            debug!(
                "created dfa: states {} eliminated duplicates {} proto sets: longest {} avg {}",
                b.states.len(),
                b.stats.duplicates,
                b.stats.proto_max,
                b.stats.proto_sum / b.states.len().max(1)
            );
        }

        Ok(Dfa {
            states: b.states,
            start,
            nonmatching,
        })
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn state(&self, id: StateId) -> &State {
        &self.states[id.idx()]
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    /// Walk the automaton over `input` and return the accept masks of
    /// the state it lands in.
    pub fn lookup(&self, input: &[u8]) -> (u32, u32) {
        let mut s = self.start;
        for &b in input {
            let st = &self.states[s.idx()];
            s = match st.cases.edges.get(&b) {
                Some(&t) => t,
                None => st.cases.otherwise.unwrap_or(self.nonmatching),
            };
        }
        let st = &self.states[s.idx()];
        (st.accept, st.audit)
    }

    /// Like [`Dfa::lookup`], for an automaton whose transition table has
    /// been rewritten to equivalence classes.
    pub fn lookup_mapped(&self, eq: &EquivMap, input: &[u8]) -> (u32, u32) {
        let mut s = self.start;
        for &b in input {
            let st = &self.states[s.idx()];
            s = match st.cases.edges.get(&eq.class_of(b)) {
                Some(&t) => t,
                None => st.cases.otherwise.unwrap_or(self.nonmatching),
            };
        }
        let st = &self.states[s.idx()];
        (st.accept, st.audit)
    }

    /// Drop states unreachable from the start state.  The dead state is
    /// always kept.
    pub fn remove_unreachable(&mut self, flags: DfaFlags) {
        let mut reachable = vec![false; self.states.len()];
        reachable[self.nonmatching.idx()] = true;
        reachable[self.start.idx()] = true;
        let mut queue = VecDeque::new();
        queue.push_back(self.start);
        while let Some(id) = queue.pop_front() {
            let s = &self.states[id.idx()];
            if let Some(t) = s.cases.otherwise {
                if !reachable[t.idx()] {
                    reachable[t.idx()] = true;
                    queue.push_back(t);
                }
            }
            for &t in s.cases.edges.values() {
                if !reachable[t.idx()] {
                    reachable[t.idx()] = true;
                    queue.push_back(t);
                }
            }
        }

        let removed = reachable.iter().filter(|&&r| !r).count();
        if removed == 0 {
            return;
        }
        if flags.contains(DfaFlags::DUMP_UNREACHABLE) {
            for (i, s) in self.states.iter().enumerate() {
                if !reachable[i] {
                    debug!(
                        "unreachable: {{{}}}{}",
                        s.label,
                        if s.accept != 0 || s.audit != 0 {
                            format!(" (0x{:x} 0x{:x})", s.accept, s.audit)
                        } else {
                            String::new()
                        }
                    );
                }
            }
        }
        self.sweep(&reachable);
        if flags.contains(DfaFlags::DUMP_STATS) {
            debug!(
                "dfa: states {} removed {} unreachable states",
                self.states.len(),
                removed
            );
        }
    }

    /// Compact the arena to the flagged states and remap every state
    /// reference.  Kept states must not reference dropped ones.
    fn sweep(&mut self, keep: &[bool]) {
        let mut remap: Vec<u32> = vec![u32::MAX; self.states.len()];
        let mut next = 0u32;
        for (i, &k) in keep.iter().enumerate() {
            if k {
                remap[i] = next;
                next += 1;
            }
        }
        let old = std::mem::take(&mut self.states);
        for (i, mut s) in old.into_iter().enumerate() {
            if !keep[i] {
                continue;
            }
            if let Some(t) = s.cases.otherwise {
                s.cases.otherwise = Some(StateId(remap[t.idx()]));
            }
            let edges = std::mem::take(&mut s.cases.edges);
            s.cases.edges = edges
                .into_iter()
                .map(|(b, t)| (b, StateId(remap[t.idx()])))
                .collect();
            self.states.push(s);
        }
        self.start = StateId(remap[self.start.idx()]);
        self.nonmatching = StateId(remap[self.nonmatching.idx()]);
    }

    /// djb2 fingerprint of a state's transition shape.
    ///
    /// Deliberately blind to target identity: states pointing at
    /// different but equivalent targets must keep equal fingerprints, so
    /// only the byte pattern and the size of each target's table feed
    /// the hash.
    fn hash_trans(&self, i: usize) -> u64 {
        let mut hash: u64 = 5381;
        let s = &self.states[i];
        for (&b, &t) in &s.cases.edges {
            hash = hash.wrapping_mul(33).wrapping_add(b as u64);
            hash = hash
                .wrapping_mul(33)
                .wrapping_add(self.states[t.idx()].cases.edges.len() as u64);
        }
        if let Some(o) = s.cases.otherwise {
            if o != self.nonmatching {
                hash = hash.wrapping_mul(33).wrapping_add(5381);
                hash = hash
                    .wrapping_mul(33)
                    .wrapping_add(self.states[o.idx()].cases.edges.len() as u64);
            }
        }
        (hash << 8) | s.cases.edges.len() as u64
    }

    /// Whether two states transition into the same partitions, treating
    /// an absent fall-through and a fall-through to the dead state as
    /// the same thing.
    fn same_mappings(&self, a: usize, b: usize) -> bool {
        let live = |s: &State| match s.cases.otherwise {
            Some(t) if t != self.nonmatching => Some(self.states[t.idx()].partition),
            _ => None,
        };
        let sa = &self.states[a];
        let sb = &self.states[b];
        if live(sa) != live(sb) {
            return false;
        }
        if sa.cases.edges.len() != sb.cases.edges.len() {
            return false;
        }
        for (k, ta) in &sa.cases.edges {
            match sb.cases.edges.get(k) {
                None => return false,
                Some(tb) => {
                    if self.states[ta.idx()].partition != self.states[tb.idx()].partition {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// Merge equivalent states by partition refinement.
    ///
    /// The initial split puts non-accepting states in one block and
    /// accepting states in another, unless the hash knobs pre-split by
    /// accept masks and/or transition fingerprint.  Pre-splitting can
    /// keep mergeable states apart, trading table size for refinement
    /// speed; the recognized language never changes.
    pub fn minimize(&mut self, flags: DfaFlags) {
        if self.states.is_empty() {
            return;
        }

        let n = self.states.len();
        let mut keys: Vec<(u64, u64)> = Vec::with_capacity(n);
        for i in 0..n {
            let s = &self.states[i];
            let perm_hash = if flags.contains(DfaFlags::CONTROL_MINIMIZE_HASH_PERMS) {
                ((s.audit as u64) << 32) | s.accept as u64
            } else if s.accept != 0 || s.audit != 0 {
                1
            } else {
                0
            };
            let trans_hash = if flags.contains(DfaFlags::CONTROL_MINIMIZE_HASH_TRANS) {
                self.hash_trans(i)
            } else {
                0
            };
            keys.push((perm_hash, trans_hash));
        }

        // Partition storage is index-stable; `order` tracks scan order so
        // freshly split blocks can slot in right after their parent.
        let mut parts: Vec<Vec<usize>> = Vec::new();
        let mut order: Vec<usize> = Vec::new();
        let mut accept_count = 0usize;
        {
            let mut group_map: IndexMap<(u64, u64), usize> = IndexMap::new();
            for (i, &key) in keys.iter().enumerate() {
                let pid = match group_map.get(&key) {
                    Some(&pid) => pid,
                    None => {
                        let pid = parts.len();
                        parts.push(Vec::new());
                        order.push(pid);
                        group_map.insert(key, pid);
                        if key.0 != 0 {
                            accept_count += 1;
                        }
                        pid
                    }
                };
                parts[pid].push(i);
                self.states[i].partition = pid;
            }
            // The grouping map is scratch; free it before refinement.
        }

        let init_count = parts.len();
        if flags.contains(DfaFlags::DUMP_PROGRESS) {
            debug!(
                "minimize dfa: partitions {} (accept {})",
                parts.len(),
                accept_count
            );
        }

        loop {
            let mut new_parts = 0usize;
            let mut oi = 0usize;
            while oi < order.len() {
                let pid = order[oi];
                let rep = parts[pid][0];
                let mut kept = vec![rep];
                let mut moved = Vec::new();
                for k in 1..parts[pid].len() {
                    let s = parts[pid][k];
                    if self.same_mappings(rep, s) {
                        kept.push(s);
                    } else {
                        moved.push(s);
                    }
                }
                if !moved.is_empty() {
                    // Back-pointers are patched only now that the whole
                    // block has been scanned; patching mid-scan would
                    // corrupt the same_mappings comparisons above.
                    let new_pid = parts.len();
                    for &m in &moved {
                        self.states[m].partition = new_pid;
                    }
                    parts[pid] = kept;
                    parts.push(moved);
                    order.insert(oi + 1, new_pid);
                    new_parts += 1;
                }
                oi += 1;
            }
            if new_parts == 0 {
                break;
            }
        }

        if parts.len() == self.states.len() {
            if flags.contains(DfaFlags::DUMP_STATS) {
                debug!(
                    "dfa minimization removed no states: partitions {} init {} (accept {})",
                    parts.len(),
                    init_count,
                    accept_count
                );
            }
            return;
        }

        // The first member of each block becomes its representative.
        // Point every edge at representatives and fold the other
        // members' accept masks in.
        let rep_of: Vec<u32> = (0..self.states.len())
            .map(|i| parts[self.states[i].partition][0] as u32)
            .collect();
        let mut final_accept = 0usize;
        for &pid in &order {
            let rep = parts[pid][0];
            let mut cases = std::mem::take(&mut self.states[rep].cases);
            if let Some(o) = cases.otherwise {
                cases.otherwise = Some(StateId(rep_of[o.idx()]));
            }
            let edges = std::mem::take(&mut cases.edges);
            for (b, t) in edges {
                let t = StateId(rep_of[t.idx()]);
                // Retargeting can make an edge redundant with the new
                // default; drop it rather than shadow it.
                if Some(t) != cases.otherwise {
                    cases.edges.insert(b, t);
                }
            }
            self.states[rep].cases = cases;
            for k in 1..parts[pid].len() {
                let m = parts[pid][k];
                self.states[m].label = -1;
                let acc = self.states[m].accept;
                let aud = self.states[m].audit;
                self.states[rep].accept |= acc;
                self.states[rep].audit |= aud;
            }
            if self.states[rep].accept != 0 || self.states[rep].audit != 0 {
                final_accept += 1;
            }
        }
        if flags.contains(DfaFlags::DUMP_STATS) {
            debug!(
                "minimized dfa: final partitions {} (accept {}) init {} (accept {})",
                parts.len(),
                final_accept,
                init_count,
                accept_count
            );
        }

        self.start = StateId(rep_of[self.start.idx()]);
        self.nonmatching = StateId(rep_of[self.nonmatching.idx()]);

        let keep: Vec<bool> = self.states.iter().map(|s| s.label != -1).collect();
        self.sweep(&keep);
    }
}

// ---------------------------------------------------------------------------
// Alphabet compression
// ---------------------------------------------------------------------------

/// Byte to equivalence-class mapping for a DFA transition table.
///
/// Two bytes share a class exactly when every state of the automaton
/// sends them to the same target.  Class 0 is reserved for bytes with no
/// explicit transition anywhere (they always take the fall-through).
pub struct EquivMap {
    map: [u8; 256],
    classes: u16,
}

impl EquivMap {
    #[inline]
    pub fn class_of(&self, b: u8) -> u8 {
        self.map[b as usize]
    }

    /// Number of class ids in use, class 0 included.
    pub fn class_count(&self) -> u16 {
        self.classes
    }

    pub fn table(&self) -> &[u8; 256] {
        &self.map
    }
}

impl Dfa {
    /// Compute the input-byte equivalence classes of this automaton.
    ///
    /// States are processed one at a time.  Bytes targeting the same
    /// next state try to reuse an existing class; when a state
    /// distinguishes bytes that an earlier state lumped together, the
    /// offending subset is split into a fresh class.
    pub fn equivalence_classes(&self, flags: DfaFlags) -> EquivMap {
        let mut classes: BTreeMap<u8, u16> = BTreeMap::new();
        let mut next_class: u16 = 1;

        for s in &self.states {
            // Group this state's edges by target.
            let mut per_target: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
            for (&b, &t) in &s.cases.edges {
                per_target.entry(t.0).or_default().push(b);
            }

            for bytes in per_target.values() {
                let mut node_classes: BTreeMap<u16, Vec<u8>> = BTreeMap::new();
                let mut class_used = false;
                for &b in bytes {
                    let cls = match classes.get(&b) {
                        Some(&cls) => cls,
                        None => {
                            classes.insert(b, next_class);
                            class_used = true;
                            next_class
                        }
                    };
                    node_classes.entry(cls).or_default().push(b);
                }
                if class_used {
                    next_class += 1;
                }
                for (cls, members) in node_classes {
                    // A class shared with bytes this state distinguishes
                    // must be split.
                    let clash = classes
                        .iter()
                        .any(|(&ob, &oc)| oc == cls && !members.contains(&ob));
                    if clash {
                        for &b in &members {
                            classes.insert(b, next_class);
                        }
                        next_class += 1;
                    }
                }
            }
        }

        // Densify the surviving ids so the external table stays
        // byte-valued regardless of how many intermediates were burned.
        let mut dense: IndexMap<u16, u8> = IndexMap::new();
        let mut map = [0u8; 256];
        for b in 0u16..256 {
            if let Some(&cls) = classes.get(&(b as u8)) {
                let next = dense.len() as u8 + 1;
                let id = *dense.entry(cls).or_insert(next);
                map[b as usize] = id;
            }
        }
        debug_assert!(dense.len() <= 255, "class ids exhausted");
        let count = dense.len() as u16 + 1;

        if flags.contains(DfaFlags::DUMP_EQUIV_STATS) {
            debug!("equivalence classes reduce 256 bytes to {} classes", count);
        }
        EquivMap {
            map,
            classes: count,
        }
    }

    /// Rewrite the transition-table keys through the class map.  Targets
    /// and default transitions are untouched.
    pub fn apply_equivalence_classes(&mut self, eq: &EquivMap) {
        for s in &mut self.states {
            let edges = std::mem::take(&mut s.cases.edges);
            for (b, t) in edges {
                let prev = s.cases.edges.insert(eq.class_of(b), t);
                debug_assert!(
                    prev.is_none() || prev == Some(t),
                    "equivalence classes conflate distinct targets"
                );
            }
        }
    }

    /// Text dump of accepting states and the transition table.
    pub fn dump(&self, mut w: impl Write) {
        for (i, s) in self.states.iter().enumerate() {
            let id = StateId(i as u32);
            if id == self.start || s.accept != 0 || s.audit != 0 {
                write!(w, "{{{}}}", s.label).unwrap();
                if id == self.start {
                    write!(w, " <== start").unwrap();
                }
                if s.accept != 0 || s.audit != 0 {
                    write!(w, " (0x{:x} 0x{:x})", s.accept, s.audit).unwrap();
                }
                writeln!(w).unwrap();
            }
        }
        writeln!(w).unwrap();
        for s in &self.states {
            if let Some(t) = s.cases.otherwise {
                writeln!(w, "{{{}}} -> {{{}}}", s.label, self.states[t.idx()].label).unwrap();
            }
            for (&b, &t) in &s.cases.edges {
                writeln!(
                    w,
                    "{{{}}} -> {{{}}}: 0x{:02x}",
                    s.label,
                    self.states[t.idx()].label,
                    b
                )
                .unwrap();
            }
        }
    }

    /// Graphviz rendering, dead state and its edges omitted.
    pub fn to_dot(&self, mut w: impl Write) {
        writeln!(w, "digraph \"dfa\" {{").unwrap();
        writeln!(w, "\trankdir=LR;").unwrap();
        for (i, s) in self.states.iter().enumerate() {
            let id = StateId(i as u32);
            if id == self.nonmatching {
                continue;
            }
            write!(w, "\t\"{}\" [", s.label).unwrap();
            if id == self.start {
                write!(w, "style=bold").unwrap();
            }
            if s.accept != 0 {
                write!(w, " peripheries=2 label=\"{} (0x{:x})\"", s.label, s.accept).unwrap();
            }
            writeln!(w, "];").unwrap();
        }
        for s in &self.states {
            let mut excluded = Vec::new();
            for (&b, &t) in &s.cases.edges {
                if t == self.nonmatching {
                    excluded.push(b);
                } else {
                    writeln!(
                        w,
                        "\t\"{}\" -> \"{}\" [label=\"0x{:02x}\"];",
                        s.label,
                        self.states[t.idx()].label,
                        b
                    )
                    .unwrap();
                }
            }
            if let Some(o) = s.cases.otherwise {
                if o != self.nonmatching {
                    let label = if excluded.is_empty() {
                        "*".to_string()
                    } else {
                        let list: Vec<String> =
                            excluded.iter().map(|b| format!("{:02x}", b)).collect();
                        format!("[^ {}]", list.join(" "))
                    };
                    writeln!(
                        w,
                        "\t\"{}\" -> \"{}\" [label=\"{}\"];",
                        s.label,
                        self.states[o.idx()].label,
                        label
                    )
                    .unwrap();
                }
            }
        }
        writeln!(w, "}}").unwrap();
    }

    /// Dump the distinct `(accept, audit)` pairs present in the automaton.
    pub fn dump_uniq_perms(&self, mut w: impl Write, heading: &str) {
        let mut uniq: BTreeSet<(u32, u32)> = BTreeSet::new();
        for s in &self.states {
            uniq.insert((s.accept, s.audit));
        }
        writeln!(w, "unique permission sets: {} ({})", heading, uniq.len()).unwrap();
        for (p, a) in uniq {
            writeln!(w, "  0x{:x} 0x{:x}", p, a).unwrap();
        }
    }
}

/// Dump a class map as `class: members` lines.
pub fn dump_equivalence_classes(mut w: impl Write, eq: &EquivMap) {
    let mut rev: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    for b in 0u16..256 {
        rev.entry(eq.class_of(b as u8)).or_default().push(b as u8);
    }
    writeln!(w, "(eq):").unwrap();
    for (cls, bytes) in rev {
        write!(w, "{}:", cls).unwrap();
        for b in bytes {
            write!(w, " 0x{:02x}", b).unwrap();
        }
        writeln!(w).unwrap();
    }
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

const BLOB_MAGIC: &[u8; 4] = b"PMDF";
const BLOB_VERSION: u16 = 1;

/// Serialize a compressed DFA into the little-endian wire blob.
///
/// Layout: magic, version, class count, state count, start and dead
/// state indices, the 256-entry byte-to-class table, then one record per
/// state in arena order: accept mask, audit mask, default target (-1
/// when absent), edge count and sorted `(class, target)` pairs.
fn serialize_dfa(dfa: &Dfa, eq: &EquivMap) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(BLOB_MAGIC);
    out.extend_from_slice(&BLOB_VERSION.to_le_bytes());
    out.extend_from_slice(&eq.class_count().to_le_bytes());
    out.extend_from_slice(&(dfa.state_count() as u32).to_le_bytes());
    out.extend_from_slice(&dfa.start.0.to_le_bytes());
    out.extend_from_slice(&dfa.nonmatching.0.to_le_bytes());
    out.extend_from_slice(eq.table());
    for s in dfa.states() {
        out.extend_from_slice(&s.accept.to_le_bytes());
        out.extend_from_slice(&s.audit.to_le_bytes());
        let default = s.cases.otherwise.map_or(-1i32, |t| t.0 as i32);
        out.extend_from_slice(&default.to_le_bytes());
        out.extend_from_slice(&(s.cases.edges.len() as u16).to_le_bytes());
        for (&c, &t) in &s.cases.edges {
            out.push(c);
            out.extend_from_slice(&t.0.to_le_bytes());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Ruleset accumulation
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RuleExpr {
    source: String,
    regex: String,
}

/// An ordered collection of rules compiled together into one automaton.
///
/// Rules are translated and lowered as they are added; compilation
/// proper happens once per ruleset in [`Ruleset::create_dfa`].  Dropping
/// the ruleset releases everything.
pub struct Ruleset {
    tree: ExprTree,
    root: Option<ExprIdx>,
    /// Accept leaves interned per `(kind, perms, audit)` so rules with
    /// identical flags share one match position.
    accepts: IndexMap<(AcceptKind, u32, u32), ExprIdx>,
    rules: Vec<RuleExpr>,
}

impl Default for Ruleset {
    fn default() -> Self {
        Self::new()
    }
}

impl Ruleset {
    pub fn new() -> Ruleset {
        Ruleset {
            tree: ExprTree::default(),
            root: None,
            accepts: IndexMap::new(),
            rules: Vec::new(),
        }
    }

    /// Number of rules added so far.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Clear the accept-flag interning cache.  Later rules allocate
    /// fresh accept leaves even for already-seen flag combinations.
    pub fn reset_matchflags(&mut self) {
        self.accepts.clear();
    }

    /// Add one glob rule.  Returns the pattern classification so callers
    /// can route `Basic` patterns around the automaton entirely.
    pub fn add_rule(
        &mut self,
        pattern: &[u8],
        deny: bool,
        perms: u32,
        audit: u32,
    ) -> Result<PatternClass, Error> {
        let (regex, tr) = translate(pattern, false)?;
        let exact = tr.class == PatternClass::Basic;
        self.add_regex_rule(
            String::from_utf8_lossy(pattern).into_owned(),
            regex,
            exact,
            deny,
            perms,
            audit,
        )?;
        Ok(tr.class)
    }

    /// Add one rule matching several null-separated fields.
    ///
    /// Components are translated individually and joined with the
    /// reserved 0x00 byte, which is how record-shaped rules (mount,
    /// D-Bus) funnel through the same automaton as paths.
    pub fn add_rule_vec(
        &mut self,
        deny: bool,
        perms: u32,
        audit: u32,
        components: &[&[u8]],
    ) -> Result<(), Error> {
        let mut regex = String::new();
        let mut source = String::new();
        let mut exact = true;
        for (i, comp) in components.iter().enumerate() {
            if i > 0 {
                regex.push_str("\\x00");
                source.push_str("\\x00");
            }
            let tr = translate_into(comp, false, &mut regex)?;
            exact &= tr.class == PatternClass::Basic;
            source.push_str(&String::from_utf8_lossy(comp));
        }
        self.add_regex_rule(source, regex, exact, deny, perms, audit)
    }

    fn add_regex_rule(
        &mut self,
        source: String,
        regex: String,
        exact: bool,
        deny: bool,
        perms: u32,
        audit: u32,
    ) -> Result<(), Error> {
        let hir = regex_syntax::ParserBuilder::new()
            .utf8(false)
            .unicode(false)
            .build()
            .parse(&regex)
            .map_err(|e| Error::Regex {
                regex: regex.clone(),
                source: Box::new(e),
            })?;
        let expr = self.tree.lower(&hir)?;

        let kind = if deny {
            AcceptKind::Deny
        } else if exact {
            AcceptKind::Exact
        } else {
            AcceptKind::Normal
        };
        let accept = match self.accepts.get(&(kind, perms, audit)) {
            Some(&idx) => idx,
            None => {
                let idx = self.tree.push(Expr::Accept { kind, perms, audit });
                self.accepts.insert((kind, perms, audit), idx);
                idx
            }
        };

        let rule = match expr {
            Some(e) => self.tree.push(Expr::Concat(e, accept)),
            None => accept,
        };
        self.root = Some(match self.root {
            Some(r) => self.tree.push(Expr::Alt(r, rule)),
            None => rule,
        });
        self.rules.push(RuleExpr { source, regex });
        Ok(())
    }

    /// Build the raw DFA: subset construction only, no pruning or
    /// minimization.  Callers normally want [`Ruleset::compile`] or
    /// [`Ruleset::create_dfa`].
    pub fn build_dfa(&self, flags: DfaFlags) -> Result<Dfa, Error> {
        let root = self.root.ok_or(Error::EmptyRuleset)?;
        if flags.contains(DfaFlags::DUMP_RULE_EXPR) {
            for r in &self.rules {
                debug!("rule: {}   ->   {}", r.source, r.regex);
            }
        }
        let follow = Follow::compute(&self.tree, root);
        Dfa::build(&self.tree, root, follow, flags)
    }

    /// Compile into a pruned, minimized DFA keyed by raw input bytes.
    pub fn compile(&self, flags: DfaFlags) -> Result<Dfa, Error> {
        let mut dfa = self.build_dfa(flags)?;
        dfa.remove_unreachable(flags);
        dfa.minimize(flags);
        dfa.remove_unreachable(flags);
        Ok(dfa)
    }

    /// Full pipeline: compile, compress the alphabet and serialize the
    /// transition table for the enforcement engine.
    pub fn create_dfa(&self, flags: DfaFlags) -> Result<Vec<u8>, Error> {
        let mut dfa = self.compile(flags)?;
        let eq = dfa.equivalence_classes(flags);
        dfa.apply_equivalence_classes(&eq);
        Ok(serialize_dfa(&dfa, &eq))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    // -----------------------------------------------------------------------
    // Pattern translation
    // -----------------------------------------------------------------------

    fn check(input: &str, expected: &str, class: PatternClass) {
        let (regex, tr) = translate(input.as_bytes(), false).unwrap();
        assert_eq!(regex, expected, "translation of '{}'", input);
        assert_eq!(tr.class, class, "class of '{}'", input);
        // The append form must leave existing buffer contents intact.
        let mut buf = String::from("testprefix");
        translate_into(input.as_bytes(), false, &mut buf).unwrap();
        assert_eq!(buf, format!("testprefix{}", expected), "append of '{}'", input);
    }

    fn fail_kind(input: &str) -> PatternErrorKind {
        match translate(input.as_bytes(), false) {
            Err(Error::Pattern { kind, .. }) => kind,
            Err(e) => panic!("unexpected error kind for '{}': {}", input, e),
            Ok((regex, _)) => panic!("expected '{}' to fail, got '{}'", input, regex),
        }
    }

    fn check_fail(input: &str) {
        fail_kind(input);
    }

    fn filtered(s: &str) -> String {
        let mut v = s.as_bytes().to_vec();
        filter_slashes(&mut v);
        String::from_utf8(v).unwrap()
    }

    #[test]
    fn test_filter_slashes() {
        assert_eq!(filtered("///foo//////f//oo////////////////"), "/foo/f/oo/");
        assert_eq!(filtered("/foo/f/oo"), "/foo/f/oo");
        assert_eq!(filtered("/"), "/");
        assert_eq!(filtered(""), "");
        assert_eq!(filtered("//usr"), "//usr");
        assert_eq!(filtered("//"), "//");
        assert_eq!(filtered("///usr"), "/usr");
        assert_eq!(filtered("///"), "/");
        assert_eq!(filtered("/a/"), "/a/");
    }

    #[test]
    fn test_basic_patterns() {
        check("/most/basic/test", "/most/basic/test", PatternClass::Basic);
        check("\\\\", "\\\\", PatternClass::Basic);
        check("\\blort", "blort", PatternClass::Basic);
        check("\\\\blort", "\\\\blort", PatternClass::Basic);
        check("blort\\\\", "blort\\\\", PatternClass::Basic);
        check("\\*", "\\*", PatternClass::Basic);
        check("blort\\*", "blort\\*", PatternClass::Basic);
        check("\\*blort", "\\*blort", PatternClass::Basic);
        assert_eq!(fail_kind("\\"), PatternErrorKind::TrailingEscape);
        assert_eq!(fail_kind("blort\\"), PatternErrorKind::TrailingEscape);
    }

    #[test]
    fn test_simple_quoting() {
        check("\\[", "\\[", PatternClass::Basic);
        check("\\]", "\\]", PatternClass::Basic);
        check("\\?", "?", PatternClass::Basic);
        check("\\{", "\\{", PatternClass::Basic);
        check("\\}", "\\}", PatternClass::Basic);
        check("\\,", ",", PatternClass::Basic);
        check("^", "\\^", PatternClass::Basic);
        check("$", "\\$", PatternClass::Basic);
        check(".", "\\.", PatternClass::Basic);
        check("+", "\\+", PatternClass::Basic);
        check("|", "\\|", PatternClass::Basic);
        check("(", "\\(", PatternClass::Basic);
        check(")", "\\)", PatternClass::Basic);
        check("\\^", "\\^", PatternClass::Basic);
        check("\\$", "\\$", PatternClass::Basic);
        check("\\.", "\\.", PatternClass::Basic);
        check("\\+", "\\+", PatternClass::Basic);
        check("\\|", "\\|", PatternClass::Basic);
        check("\\(", "\\(", PatternClass::Basic);
        check("\\)", "\\)", PatternClass::Basic);
    }

    #[test]
    fn test_complex_quoting() {
        check("\\\\?", "\\\\[^/\\x00]", PatternClass::Regex);
        check("\\\\,", "\\\\,", PatternClass::Basic);
        check("\\\\^", "\\\\\\^", PatternClass::Basic);
        check("\\\\$", "\\\\\\$", PatternClass::Basic);
        check("\\\\.", "\\\\\\.", PatternClass::Basic);
        check("\\\\+", "\\\\\\+", PatternClass::Basic);
        check("\\\\|", "\\\\\\|", PatternClass::Basic);
        check("\\\\(", "\\\\\\(", PatternClass::Basic);
        check("\\\\)", "\\\\\\)", PatternClass::Basic);
        check_fail("\\\\[");
        check_fail("\\\\]");
        check_fail("\\\\{");
        check_fail("\\\\}");
    }

    #[test]
    fn test_globbing() {
        check("*", "[^/\\x00]*", PatternClass::Regex);
        check("blort*", "blort[^/\\x00]*", PatternClass::Regex);
        check("*blort", "[^/\\x00]*blort", PatternClass::Regex);
        check("blor?t", "blor[^/\\x00]t", PatternClass::Regex);
        check("/*", "/[^/\\x00][^/\\x00]*", PatternClass::Regex);
        check("/blort/*", "/blort/[^/\\x00][^/\\x00]*", PatternClass::Regex);
        check("/*/blort", "/[^/\\x00][^/\\x00]*/blort", PatternClass::Regex);
        check("/*/", "/[^/\\x00][^/\\x00]*/", PatternClass::Regex);
        check("/**", "/[^/\\x00][^\\x00]*", PatternClass::TailGlob);
        check("/blort/**", "/blort/[^/\\x00][^\\x00]*", PatternClass::TailGlob);
        check("/**/blort", "/[^/\\x00][^\\x00]*/blort", PatternClass::Regex);
        check("/**/", "/[^/\\x00][^\\x00]*/", PatternClass::Regex);
        // A lone ** is still the tail-glob shape; one in the middle is not.
        check("**", "[^\\x00]*", PatternClass::TailGlob);
        check("a**/b", "a[^\\x00]*/b", PatternClass::Regex);
    }

    #[test]
    fn test_character_classes() {
        check("[blort]", "[blort]", PatternClass::Regex);
        check("b[lor]t", "b[lor]t", PatternClass::Regex);
        check("b[\\lor]t", "b[lor]t", PatternClass::Regex);
        check("b[{a,b}]t", "b[{a,b}]t", PatternClass::Regex);
        check("b[\\{a,b\\}]t", "b[\\{a,b\\}]t", PatternClass::Regex);
        assert_eq!(fail_kind("[blort"), PatternErrorKind::UnclosedClass);
        assert_eq!(fail_kind("b[lort"), PatternErrorKind::UnclosedClass);
        assert_eq!(fail_kind("blort["), PatternErrorKind::UnclosedClass);
        assert_eq!(fail_kind("blort]"), PatternErrorKind::UnmatchedClassClose);
        assert_eq!(fail_kind("blo]rt"), PatternErrorKind::UnmatchedClassClose);
        assert_eq!(fail_kind("]blort"), PatternErrorKind::UnmatchedClassClose);
    }

    #[test]
    fn test_alternations() {
        check("{alpha,beta}", "(alpha|beta)", PatternClass::Regex);
        check(
            "baz{alpha,beta}blort",
            "baz(alpha|beta)blort",
            PatternClass::Regex,
        );
        check(
            "{{alpha,blort,nested},beta}",
            "((alpha|blort|nested)|beta)",
            PatternClass::Regex,
        );
        check(
            "{{alpha,{blort,nested}},beta}",
            "((alpha|(blort|nested))|beta)",
            PatternClass::Regex,
        );
        check(
            "{{alpha,alpha{blort,nested}}beta,beta}",
            "((alpha|alpha(blort|nested))beta|beta)",
            PatternClass::Regex,
        );
        check(
            "{{a,b{c,d}}e,{f,{g,{h{i,j,k},l}m},n}o}",
            "((a|b(c|d))e|(f|(g|(h(i|j|k)|l)m)|n)o)",
            PatternClass::Regex,
        );
        check("{alpha,b[{a,b}]t,gamma}", "(alpha|b[{a,b}]t|gamma)", PatternClass::Regex);
        assert_eq!(fail_kind("{beta}"), PatternErrorKind::EmptyGroup);
        assert_eq!(fail_kind("biz{}beta"), PatternErrorKind::EmptyGroup);
        assert_eq!(fail_kind("biz{beta"), PatternErrorKind::UnclosedGroup);
        assert_eq!(fail_kind("biz}beta"), PatternErrorKind::UnmatchedGroupClose);
        assert_eq!(fail_kind("biz{be,ta"), PatternErrorKind::UnclosedGroup);
        assert_eq!(fail_kind("biz,be}ta"), PatternErrorKind::UnmatchedGroupClose);
        check_fail("{{alpha,blort,nested}beta}");
    }

    /// Build `{..{a,b}..,b}` nested `depth` groups deep.
    fn nested_alternation(depth: usize) -> String {
        let mut s = String::from("a");
        for _ in 0..depth {
            s = format!("{{{},b}}", s);
        }
        s
    }

    #[test]
    fn test_nesting_depth_limit() {
        assert!(translate(nested_alternation(MAX_ALT_DEPTH).as_bytes(), false).is_ok());
        assert_eq!(
            fail_kind(&nested_alternation(MAX_ALT_DEPTH + 1)),
            PatternErrorKind::NestingOverflow
        );
    }

    #[test]
    fn test_anchoring() {
        let (rx, _) = translate(b"/a", true).unwrap();
        assert_eq!(rx, "^/a$");
        let (rx, _) = translate(b"/a", false).unwrap();
        assert_eq!(rx, "/a");
    }

    #[test]
    fn test_first_re_pos() {
        let (_, tr) = translate(b"blort*", false).unwrap();
        assert_eq!(tr.first_re_pos, 5);
        let (_, tr) = translate(b"/foo/{a,b}", false).unwrap();
        assert_eq!(tr.first_re_pos, 5);
        let (_, tr) = translate(b"/plain", false).unwrap();
        assert_eq!(tr.first_re_pos, 0);
    }

    #[test]
    fn test_nonprintable_bytes() {
        let (rx, tr) = translate(b"\x07mnt", false).unwrap();
        assert_eq!(rx, "\\x07mnt");
        assert_eq!(tr.class, PatternClass::Basic);
        let (rx, _) = translate(b"caf\xc3\xa9", false).unwrap();
        assert_eq!(rx, "caf\\xc3\\xa9");
    }

    // -----------------------------------------------------------------------
    // Follow-set computation
    // -----------------------------------------------------------------------

    fn accept_leaf(tree: &mut ExprTree) -> ExprIdx {
        tree.push(Expr::Accept {
            kind: AcceptKind::Normal,
            perms: 1,
            audit: 0,
        })
    }

    #[test]
    fn test_follow_plus() {
        // a+b with a trailing accept marker.
        let mut tree = ExprTree::default();
        let a = tree.push(Expr::Char(b'a'));
        let plus = tree.push(Expr::Plus(a));
        let b = tree.push(Expr::Char(b'b'));
        let cat = tree.push(Expr::Concat(plus, b));
        let acc = accept_leaf(&mut tree);
        let root = tree.push(Expr::Concat(cat, acc));
        let f = Follow::compute(&tree, root);
        // Positions in traversal order: a=0, b=1, accept=2.
        assert!(!f.nullable[plus.idx()]);
        assert!(!f.nullable[root.idx()]);
        assert_eq!(f.firstpos[root.idx()], vec![0]);
        assert_eq!(f.lastpos[cat.idx()], vec![1]);
        assert_eq!(f.followpos[0], vec![0, 1]);
        assert_eq!(f.followpos[1], vec![2]);
    }

    #[test]
    fn test_follow_star_optional() {
        // a*b? with a trailing accept marker.
        let mut tree = ExprTree::default();
        let a = tree.push(Expr::Char(b'a'));
        let star = tree.push(Expr::Star(a));
        let b = tree.push(Expr::Char(b'b'));
        let opt = tree.push(Expr::Optional(b));
        let body = tree.push(Expr::Concat(star, opt));
        let acc = accept_leaf(&mut tree);
        let root = tree.push(Expr::Concat(body, acc));
        let f = Follow::compute(&tree, root);
        assert!(f.nullable[star.idx()]);
        assert!(f.nullable[opt.idx()]);
        assert!(f.nullable[body.idx()]);
        assert_eq!(f.firstpos[root.idx()], vec![0, 1, 2]);
        assert_eq!(f.followpos[0], vec![0, 1, 2]);
        assert_eq!(f.followpos[1], vec![2]);
    }

    #[test]
    fn test_follow_alt() {
        // a|b with a trailing accept marker.
        let mut tree = ExprTree::default();
        let a = tree.push(Expr::Char(b'a'));
        let b = tree.push(Expr::Char(b'b'));
        let alt = tree.push(Expr::Alt(a, b));
        let acc = accept_leaf(&mut tree);
        let root = tree.push(Expr::Concat(alt, acc));
        let f = Follow::compute(&tree, root);
        assert!(!f.nullable[alt.idx()]);
        assert_eq!(f.firstpos[alt.idx()], vec![0, 1]);
        assert_eq!(f.lastpos[alt.idx()], vec![0, 1]);
        assert_eq!(f.followpos[0], vec![2]);
        assert_eq!(f.followpos[1], vec![2]);
    }

    // -----------------------------------------------------------------------
    // DFA construction and matching
    // -----------------------------------------------------------------------

    fn ruleset(rules: &[(&str, bool, u32, u32)]) -> Ruleset {
        let mut rs = Ruleset::new();
        for &(pattern, deny, perms, audit) in rules {
            rs.add_rule(pattern.as_bytes(), deny, perms, audit).unwrap();
        }
        rs
    }

    fn compiled(rules: &[(&str, bool, u32, u32)]) -> Dfa {
        ruleset(rules).compile(DfaFlags::empty()).unwrap()
    }

    #[test]
    fn test_literal_match() {
        let dfa = compiled(&[("/bin/sh", false, 0x4, 0)]);
        assert_eq!(dfa.lookup(b"/bin/sh").0, 0x4);
        assert_eq!(dfa.lookup(b"/bin/s").0, 0);
        assert_eq!(dfa.lookup(b"/bin/shh").0, 0);
        assert_eq!(dfa.lookup(b"").0, 0);
    }

    #[test]
    fn test_star_component() {
        let dfa = compiled(&[("/tmp/*", false, 1, 0)]);
        assert_eq!(dfa.lookup(b"/tmp/a").0, 1);
        assert_eq!(dfa.lookup(b"/tmp/abc").0, 1);
        // The star must consume at least one byte and never a slash.
        assert_eq!(dfa.lookup(b"/tmp/").0, 0);
        assert_eq!(dfa.lookup(b"/tmp/a/b").0, 0);
    }

    #[test]
    fn test_tail_glob() {
        let dfa = compiled(&[("/x/**", false, 1, 0)]);
        assert_eq!(dfa.lookup(b"/x/a").0, 1);
        assert_eq!(dfa.lookup(b"/x/a/b/c").0, 1);
        assert_eq!(dfa.lookup(b"/x/").0, 0);
        assert_eq!(dfa.lookup(b"/x").0, 0);
        // The null byte is out of every alphabet.
        assert_eq!(dfa.lookup(b"/x/a\x00b").0, 0);
    }

    #[test]
    fn test_single_char_glob() {
        let dfa = compiled(&[("/a?c", false, 1, 0)]);
        assert_eq!(dfa.lookup(b"/abc").0, 1);
        assert_eq!(dfa.lookup(b"/axc").0, 1);
        assert_eq!(dfa.lookup(b"/a/c").0, 0);
        assert_eq!(dfa.lookup(b"/ac").0, 0);
    }

    #[test]
    fn test_alternation_match() {
        let dfa = compiled(&[("{alpha,beta}", false, 1, 0)]);
        assert_eq!(dfa.lookup(b"alpha").0, 1);
        assert_eq!(dfa.lookup(b"beta").0, 1);
        assert_eq!(dfa.lookup(b"gamma").0, 0);
    }

    #[test]
    fn test_class_match() {
        let dfa = compiled(&[("/dev/tty[0-9]", false, 1, 0)]);
        assert_eq!(dfa.lookup(b"/dev/tty0").0, 1);
        assert_eq!(dfa.lookup(b"/dev/tty7").0, 1);
        assert_eq!(dfa.lookup(b"/dev/ttyS").0, 0);
        let dfa = compiled(&[("/dev/tty[^0-9]", false, 1, 0)]);
        assert_eq!(dfa.lookup(b"/dev/ttyS").0, 1);
        assert_eq!(dfa.lookup(b"/dev/tty4").0, 0);
    }

    #[test]
    fn test_empty_pattern_matches_empty_input() {
        let dfa = compiled(&[("", false, 1, 0)]);
        assert_eq!(dfa.lookup(b"").0, 1);
        assert_eq!(dfa.lookup(b"a").0, 0);
    }

    #[test]
    fn test_union_of_perms() {
        let dfa = compiled(&[("/f*", false, 0x1, 0), ("/foo", false, 0x2, 0)]);
        assert_eq!(dfa.lookup(b"/foo").0, 0x3);
        assert_eq!(dfa.lookup(b"/fbar").0, 0x1);
    }

    #[test]
    fn test_deny_subtraction() {
        let dfa = compiled(&[("/f*", false, 0x3, 0), ("/foo", true, 0x1, 0)]);
        assert_eq!(dfa.lookup(b"/foo").0, 0x2);
        assert_eq!(dfa.lookup(b"/fbar").0, 0x3);
    }

    #[test]
    fn test_deny_quiet_audit_packing() {
        // The denied write bit carries its quiet bit in the audit column.
        let dfa = compiled(&[
            ("/a", false, 0x6, 0x4),
            ("/a", true, 0x2, 0x2),
        ]);
        let (accept, audit) = dfa.lookup(b"/a");
        assert_eq!(accept, 0x4);
        assert_eq!(audit, 0x2);
    }

    #[test]
    fn test_exact_exec_override() {
        use perms::*;
        let dfa = compiled(&[
            ("/bin/*", false, USER_EXEC | EXEC_INHERIT, 0),
            ("/bin/sh", false, USER_EXEC | EXEC_PROFILE, 0),
        ]);
        // The literal rule's exec modifier wins where both match.
        assert_eq!(dfa.lookup(b"/bin/sh").0, USER_EXEC | EXEC_PROFILE);
        assert_eq!(dfa.lookup(b"/bin/ls").0, USER_EXEC | EXEC_INHERIT);
    }

    #[test]
    fn test_exec_conflict() {
        use perms::*;
        let rs = ruleset(&[
            ("/a*", false, USER_EXEC | EXEC_INHERIT, 0),
            ("/*b", false, USER_EXEC | EXEC_PROFILE, 0),
        ]);
        match rs.compile(DfaFlags::empty()) {
            Err(Error::ExecConflict) => {}
            other => panic!("expected exec conflict, got {:?}", other.map(|d| d.state_count())),
        }
    }

    #[test]
    fn test_error_bit_fails_ruleset() {
        let rs = ruleset(&[("/a", false, perms::ERROR_BIT | 1, 0)]);
        assert!(matches!(rs.compile(DfaFlags::empty()), Err(Error::ErrorBit)));
    }

    #[test]
    fn test_empty_ruleset() {
        let rs = Ruleset::new();
        assert!(matches!(rs.create_dfa(DfaFlags::empty()), Err(Error::EmptyRuleset)));
    }

    #[test]
    fn test_rule_vec() {
        let mut rs = Ruleset::new();
        rs.add_rule_vec(false, 1, 0, &[b"\x07/mnt/*", b"/dev/sd[ab]"])
            .unwrap();
        let dfa = rs.compile(DfaFlags::empty()).unwrap();
        assert_eq!(dfa.lookup(b"\x07/mnt/usb\x00/dev/sda").0, 1);
        assert_eq!(dfa.lookup(b"\x07/mnt/usb\x00/dev/sdc").0, 0);
        assert_eq!(dfa.lookup(b"\x07/mnt/usb").0, 0);
        // The separator cannot be smuggled in through a wildcard.
        assert_eq!(dfa.lookup(b"\x07/mnt/u\x00sb\x00/dev/sda").0, 0);
    }

    #[test]
    fn test_reset_matchflags() {
        let mut rs = Ruleset::new();
        rs.add_rule(b"/a", false, 1, 0).unwrap();
        rs.reset_matchflags();
        rs.add_rule(b"/b", false, 1, 0).unwrap();
        let dfa = rs.compile(DfaFlags::empty()).unwrap();
        assert_eq!(dfa.lookup(b"/a").0, 1);
        assert_eq!(dfa.lookup(b"/b").0, 1);
    }

    #[test]
    fn test_add_rule_reports_class() {
        let mut rs = Ruleset::new();
        assert_eq!(rs.add_rule(b"/plain", false, 1, 0).unwrap(), PatternClass::Basic);
        assert_eq!(rs.add_rule(b"/t/**", false, 1, 0).unwrap(), PatternClass::TailGlob);
        assert_eq!(rs.add_rule(b"/*.so", false, 1, 0).unwrap(), PatternClass::Regex);
        assert_eq!(rs.len(), 3);
    }

    // -----------------------------------------------------------------------
    // Minimization
    // -----------------------------------------------------------------------

    #[test]
    fn test_minimization_merges_states() {
        let rules = [("ab", false, 1u32, 0u32), ("cb", false, 1, 0)];
        let rs = ruleset(&rules);
        let mut raw = rs.build_dfa(DfaFlags::empty()).unwrap();
        raw.remove_unreachable(DfaFlags::empty());
        // dead, start, after-a, after-c, accept.
        assert_eq!(raw.state_count(), 5);
        let min = rs.compile(DfaFlags::empty()).unwrap();
        // after-a and after-c collapse.
        assert_eq!(min.state_count(), 4);
        for input in [&b"ab"[..], &b"cb"[..], &b"a"[..], &b"b"[..], &b"abb"[..], &b""[..]] {
            assert_eq!(raw.lookup(input), min.lookup(input), "input {:?}", input);
        }
    }

    #[test]
    fn test_minimization_preserves_language() {
        let rules = [
            ("/foo/*", false, 1u32, 0u32),
            ("/foo/bar", false, 2, 0),
            ("/b*/{x,y}/**", false, 4, 0),
            ("/foo/bar", true, 1, 0),
        ];
        let rs = ruleset(&rules);
        let raw = rs.build_dfa(DfaFlags::empty()).unwrap();
        let min = rs.compile(DfaFlags::empty()).unwrap();
        assert!(min.state_count() <= raw.state_count());
        for input in sample_inputs() {
            assert_eq!(raw.lookup(&input), min.lookup(&input), "input {:?}", input);
        }
    }

    #[test]
    fn test_hash_flags_trade_size_not_language() {
        let rules = [
            ("/foo/*", false, 1u32, 0u32),
            ("/foo/**", false, 2, 0),
            ("{a,b}*", false, 4, 0),
        ];
        let rs = ruleset(&rules);
        let baseline = rs.compile(DfaFlags::empty()).unwrap();
        for flags in [
            DfaFlags::CONTROL_MINIMIZE_HASH_PERMS,
            DfaFlags::CONTROL_MINIMIZE_HASH_TRANS,
            DfaFlags::CONTROL_MINIMIZE_HASH_PERMS | DfaFlags::CONTROL_MINIMIZE_HASH_TRANS,
        ] {
            let hashed = rs.compile(flags).unwrap();
            assert!(
                hashed.state_count() >= baseline.state_count(),
                "flags {:?}",
                flags
            );
            for input in sample_inputs() {
                assert_eq!(
                    baseline.lookup(&input),
                    hashed.lookup(&input),
                    "input {:?} flags {:?}",
                    input,
                    flags
                );
            }
        }
    }

    /// Every explicit edge must differ from the state's fall-through.
    #[test]
    fn test_no_edge_shadows_default() {
        for rules in [
            &[("/foo/*", false, 1u32, 0u32), ("/foo/bar", false, 2, 0)][..],
            &[("/**", false, 1, 0), ("/etc/shadow", true, 1, 0)][..],
        ] {
            let dfa = ruleset(rules).compile(DfaFlags::empty()).unwrap();
            for s in dfa.states() {
                if let Some(d) = s.cases.otherwise {
                    for (&b, &t) in &s.cases.edges {
                        assert_ne!(t, d, "byte 0x{:02x} shadows the default", b);
                    }
                }
            }
        }
    }

    #[test]
    fn test_determinism() {
        let rules = [
            ("/usr/**", false, 1u32, 0u32),
            ("/usr/local/*", false, 2, 0),
            ("{/a,/b}/c?", false, 4, 0),
        ];
        let blob1 = ruleset(&rules).create_dfa(DfaFlags::empty()).unwrap();
        let blob2 = ruleset(&rules).create_dfa(DfaFlags::empty()).unwrap();
        assert_eq!(blob1, blob2);
    }

    // -----------------------------------------------------------------------
    // Alphabet compression
    // -----------------------------------------------------------------------

    fn effective_target(dfa: &Dfa, s: &State, b: u8) -> StateId {
        match s.cases.edges.get(&b) {
            Some(&t) => t,
            None => s.cases.otherwise.unwrap_or(dfa.nonmatching),
        }
    }

    #[test]
    fn test_equivalence_classes_partition_behavior() {
        let dfa = compiled(&[("/foo/*", false, 1, 0), ("/f?o", false, 2, 0)]);
        let eq = dfa.equivalence_classes(DfaFlags::empty());
        for b1 in 0u16..256 {
            for b2 in (b1 + 1)..256 {
                let (b1, b2) = (b1 as u8, b2 as u8);
                let same_behavior = dfa
                    .states()
                    .iter()
                    .all(|s| effective_target(&dfa, s, b1) == effective_target(&dfa, s, b2));
                let same_class = eq.class_of(b1) == eq.class_of(b2);
                assert_eq!(
                    same_class, same_behavior,
                    "bytes 0x{:02x} and 0x{:02x}: class {} vs {}",
                    b1,
                    b2,
                    eq.class_of(b1),
                    eq.class_of(b2)
                );
            }
        }
        // Far fewer classes than bytes for a path ruleset.
        assert!(eq.class_count() < 16);
    }

    #[test]
    fn test_lookup_through_classes() {
        let rs = ruleset(&[("/foo/**", false, 1, 0), ("/foo/x", false, 2, 0)]);
        let plain = rs.compile(DfaFlags::empty()).unwrap();
        let mut mapped = rs.compile(DfaFlags::empty()).unwrap();
        let eq = mapped.equivalence_classes(DfaFlags::empty());
        mapped.apply_equivalence_classes(&eq);
        for input in sample_inputs() {
            assert_eq!(
                plain.lookup(&input),
                mapped.lookup_mapped(&eq, &input),
                "input {:?}",
                input
            );
        }
    }

    // -----------------------------------------------------------------------
    // Accept mask reduction
    // -----------------------------------------------------------------------

    #[test]
    fn test_reduce_plain_union() {
        let (p, a) = reduce_accepts([
            (AcceptKind::Normal, 0x1, 0x1),
            (AcceptKind::Normal, 0x2, 0x4),
        ])
        .unwrap();
        assert_eq!(p, 0x3);
        assert_eq!(a, 0x5);
    }

    #[test]
    fn test_reduce_exact_overrides_exec_type() {
        use perms::*;
        let (p, _) = reduce_accepts([
            (AcceptKind::Normal, USER_EXEC | EXEC_INHERIT | MAY_READ, 0),
            (AcceptKind::Exact, USER_EXEC | EXEC_UNCONFINED, 0),
        ])
        .unwrap();
        assert_eq!(p, USER_EXEC | EXEC_UNCONFINED | MAY_READ);
    }

    #[test]
    fn test_reduce_deny_clears_exec_class() {
        use perms::*;
        let (p, _) = reduce_accepts([
            (AcceptKind::Normal, USER_EXEC | EXEC_INHERIT | MAY_READ, 0),
            (AcceptKind::Deny, USER_EXEC, 0),
        ])
        .unwrap();
        assert_eq!(p, MAY_READ);
    }

    #[test]
    fn test_reduce_conflicting_modifiers() {
        use perms::*;
        assert!(matches!(
            reduce_accepts([
                (AcceptKind::Normal, USER_EXEC | EXEC_INHERIT, 0),
                (AcceptKind::Normal, USER_EXEC | EXEC_PROFILE, 0),
            ]),
            Err(Error::ExecConflict)
        ));
        // Different halves never conflict.
        assert!(reduce_accepts([
            (AcceptKind::Normal, USER_EXEC | EXEC_INHERIT, 0),
            (AcceptKind::Normal, OTHER_EXEC | (EXEC_PROFILE << OTHER_SHIFT), 0),
        ])
        .is_ok());
    }

    #[test]
    fn test_reduce_idempotent() {
        use perms::*;
        let leaves = [
            (AcceptKind::Normal, USER_EXEC | EXEC_INHERIT | MAY_READ, 0x4),
            (AcceptKind::Exact, USER_EXEC | EXEC_PROFILE, 0),
            (AcceptKind::Deny, MAY_WRITE, 0x2),
        ];
        let first = reduce_accepts(leaves).unwrap();
        // Feeding the folded mask back through as a plain accept leaf
        // reproduces itself.
        let again = reduce_accepts([(AcceptKind::Normal, first.0, first.1 & !0x2)]).unwrap();
        assert_eq!(again.0, first.0);
    }

    // -----------------------------------------------------------------------
    // Serialization
    // -----------------------------------------------------------------------

    #[test]
    fn test_blob_layout() {
        let rules = [("/foo/*", false, 0x5u32, 0x1u32), ("/bar", false, 2, 0)];
        let rs = ruleset(&rules);
        let blob = rs.create_dfa(DfaFlags::empty()).unwrap();

        assert_eq!(&blob[0..4], b"PMDF");
        let version = u16::from_le_bytes([blob[4], blob[5]]);
        assert_eq!(version, 1);
        let class_count = u16::from_le_bytes([blob[6], blob[7]]);
        assert!(class_count >= 2);
        let state_count = u32::from_le_bytes(blob[8..12].try_into().unwrap()) as usize;
        let start = u32::from_le_bytes(blob[12..16].try_into().unwrap()) as usize;
        let nonmatching = u32::from_le_bytes(blob[16..20].try_into().unwrap()) as usize;
        assert!(start < state_count);
        assert!(nonmatching < state_count);

        // Class table then per-state records; the walk must consume the
        // buffer exactly.
        let map = &blob[20..276];
        assert!(map.iter().all(|&c| (c as u16) < class_count));
        let mut off = 276;
        for _ in 0..state_count {
            let default = i32::from_le_bytes(blob[off + 8..off + 12].try_into().unwrap());
            assert!(default == -1 || (default as usize) < state_count);
            let edges = u16::from_le_bytes(blob[off + 12..off + 14].try_into().unwrap()) as usize;
            off += 14 + edges * 5;
        }
        assert_eq!(off, blob.len());
    }

    // -----------------------------------------------------------------------
    // Oracle comparison
    // -----------------------------------------------------------------------

    fn sample_inputs() -> Vec<Vec<u8>> {
        let segments = ["a", "b", "x", "foo", "bar", "/"];
        let mut out: Vec<Vec<u8>> = vec![Vec::new()];
        for n in 1..=3 {
            for combo in std::iter::repeat(segments.iter()).take(n).multi_cartesian_product() {
                out.push(combo.into_iter().flat_map(|s| s.bytes()).collect());
            }
        }
        out
    }

    fn oracle(glob: &str) -> regex::bytes::Regex {
        let (rx, _) = translate(glob.as_bytes(), false).unwrap();
        regex::bytes::RegexBuilder::new(&format!("^(?:{})$", rx))
            .unicode(false)
            .build()
            .unwrap()
    }

    #[test]
    fn test_against_regex_oracle() {
        let globs = [
            "/foo/*",
            "/foo/**",
            "/*/bar",
            "{a,b}*",
            "[ab]x?",
            "/foo/bar",
            "**",
        ];
        let mut rs = Ruleset::new();
        let mut oracles = Vec::new();
        for (i, g) in globs.iter().enumerate() {
            rs.add_rule(g.as_bytes(), false, 1 << i, 0).unwrap();
            oracles.push(oracle(g));
        }
        let dfa = rs.compile(DfaFlags::empty()).unwrap();
        for input in sample_inputs() {
            let mut want = 0u32;
            for (i, o) in oracles.iter().enumerate() {
                if o.is_match(&input) {
                    want |= 1 << i;
                }
            }
            assert_eq!(dfa.lookup(&input).0, want, "input {:?}", input);
        }
    }

    // -----------------------------------------------------------------------
    // Dumps
    // -----------------------------------------------------------------------

    #[test]
    fn test_dump_outputs() {
        let dfa = compiled(&[("/a*", false, 1, 0)]);
        let mut text = Vec::new();
        dfa.dump(&mut text);
        let text = String::from_utf8(text).unwrap();
        assert!(text.contains("<== start"));

        let mut dot = Vec::new();
        dfa.to_dot(&mut dot);
        let dot = String::from_utf8(dot).unwrap();
        assert!(dot.starts_with("digraph"));
        assert!(dot.ends_with("}\n"));

        let mut uniq = Vec::new();
        dfa.dump_uniq_perms(&mut uniq, "minimized");
        assert!(String::from_utf8(uniq).unwrap().contains("0x1"));

        let eq = dfa.equivalence_classes(DfaFlags::empty());
        let mut eqdump = Vec::new();
        dump_equivalence_classes(&mut eqdump, &eq);
        assert!(String::from_utf8(eqdump).unwrap().starts_with("(eq):"));
    }
}
