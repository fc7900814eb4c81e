//! Half-open interval algebra and the module/live-range reconciliation plan.
//!
//! The module list and the live address-range list are two independently
//! obtained views of the same virtual address space, and they disagree: a
//! module may be only partially resident, split across several live ranges,
//! or gone entirely. This module reconciles the two views into one ordered,
//! gap-free, non-overlapping sequence of operations over the union of both.

use crate::model::ModuleDescriptor;

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    /// Overlapping portion of two spans, if any.
    pub fn intersect(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(Span { start, end })
    }

    /// `self` minus `other`. At most two pieces survive: the part below
    /// `other` and the part above it.
    pub fn subtract(&self, other: &Span) -> Vec<Span> {
        if self.intersect(other).is_none() {
            return vec![*self];
        }

        let mut out = Vec::with_capacity(2);
        if self.start < other.start {
            out.push(Span::new(self.start, other.start));
        }
        if other.end < self.end {
            out.push(Span::new(other.end, self.end));
        }
        out
    }
}

/// How a span of the reconstructed image gets its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Span is live in the address space; read it.
    Read,
    /// Span is claimed by a module but not live; expected to zero-fill,
    /// though a read is still attempted (see `gather`).
    ZeroFill,
}

/// One entry of the reconciliation plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    pub span: Span,
    pub kind: OpKind,
}

/// Subtract every span in `covers` from `span`, keeping whatever survives.
fn subtract_all(span: Span, covers: &[Span]) -> Vec<Span> {
    let mut remaining = vec![span];
    for cover in covers {
        if cover.start >= span.end {
            // Covers are sorted; nothing past the module span can intersect.
            break;
        }
        remaining = remaining
            .into_iter()
            .flat_map(|piece| piece.subtract(cover))
            .collect();
        if remaining.is_empty() {
            break;
        }
    }
    remaining
}

/// Coalesce overlapping or touching spans into their union.
fn merge_spans(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort();
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        if span.is_empty() {
            continue;
        }
        match merged.last_mut() {
            Some(last) if span.start <= last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// Coalesce strictly overlapping spans, keeping touching spans separate.
/// Enumerated ranges are not guaranteed disjoint; double-covering a span
/// would break the plan's exact tiling, but adjacent ranges stay distinct
/// operations so each keeps its own metadata.
fn deoverlap_spans(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort();
    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        if span.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if span.start < last.end => last.end = last.end.max(span.end),
            _ => out.push(span),
        }
    }
    out
}

/// Reconcile module claims against live ranges.
///
/// Every live range becomes a `Read` operation; overlapping live ranges
/// are coalesced first so no byte is covered twice. The portions of module
/// spans not covered by any live range become `ZeroFill` operations;
/// overlapping leftovers from different modules are merged so the result
/// tiles `union(modules) ∪ union(live)` exactly once. Touching operations
/// are never merged, neither across kinds nor between adjacent live ranges.
pub fn plan_operations(modules: &[ModuleDescriptor], live: &[Span]) -> Vec<Operation> {
    let live = deoverlap_spans(live.to_vec());

    let mut fills = Vec::new();
    for module in modules {
        let claim = Span::new(module.base, module.end());
        if claim.is_empty() {
            continue;
        }
        fills.extend(subtract_all(claim, &live));
    }

    let mut ops: Vec<Operation> = merge_spans(fills)
        .into_iter()
        .map(|span| Operation {
            span,
            kind: OpKind::ZeroFill,
        })
        .chain(live.into_iter().map(|span| Operation {
            span,
            kind: OpKind::Read,
        }))
        .collect();
    ops.sort_by_key(|op| op.span.start);
    ops
}
