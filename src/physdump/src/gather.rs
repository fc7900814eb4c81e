//! Execute a reconciliation plan against the live address space.
//!
//! Reads are best-effort here: the plan's `ZeroFill` label is advisory, a
//! real read is attempted for every operation and only substituted with
//! zeroes when it fails. Nothing in this path aborts the run; an unreadable
//! range degrades to zeroed content.

use crate::engine::{EngineError, RangeRow};
use crate::interval::{plan_operations, OpKind, Span};
use crate::model::{MemoryContentBlock, MemoryRegion, ModuleDescriptor, RegionType};

impl RangeRow {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// Run the plan derived from `modules` and `ranges`, reading through
/// `read`. Returns parallel region/content sequences: entry `i` of each
/// describes the same span, so the two size sums always agree.
pub fn gather_memory<F>(
    modules: &[ModuleDescriptor],
    ranges: &[RangeRow],
    mut read: F,
) -> (Vec<MemoryRegion>, Vec<MemoryContentBlock>)
where
    F: FnMut(u64, usize) -> Result<Vec<u8>, EngineError>,
{
    let live: Vec<Span> = ranges.iter().map(RangeRow::span).collect();
    let plan = plan_operations(modules, &live);

    let mut regions = Vec::with_capacity(plan.len());
    let mut content = Vec::with_capacity(plan.len());

    for op in plan {
        let size = op.span.len();
        let mut region = MemoryRegion::bare(op.span.start, size);
        if op.kind == OpKind::Read {
            // A read span always starts where one of the enumerated ranges
            // starts (overlapping ranges coalesce keeping the lowest
            // start), so that range supplies the metadata.
            if let Some(row) = ranges.iter().find(|r| r.start == op.span.start) {
                region.protect = row.protect;
                region.allocation_protect = row.protect;
                region.region_type = row.kind;
            }
        }

        let bytes = match read(op.span.start, size as usize) {
            Ok(bytes) => pad_to(bytes, size as usize),
            Err(_) => vec![0u8; size as usize],
        };

        regions.push(region);
        content.push(MemoryContentBlock {
            start: op.span.start,
            bytes,
        });
    }

    (regions, content)
}

/// Short reads are topped up with zeroes so the block always matches its
/// region's size; over-long reads are truncated.
fn pad_to(mut bytes: Vec<u8>, size: usize) -> Vec<u8> {
    bytes.resize(size, 0);
    bytes
}
