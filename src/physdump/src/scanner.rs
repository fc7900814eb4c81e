//! Secure-world page scan over the physical page-frame metadata table.
//!
//! Pages owned by the isolated execution context are invisible to normal
//! process page tables, so there is no directory to consult. The only
//! usable signal is the page-frame record itself: exactly two references,
//! one share, and no PTE. The scan is a single linear pass over every
//! frame; the metadata table is already a flat random-access array, so an
//! auxiliary index would cost more than it saves.

use crate::engine::{EngineError, PfnMetadata};
use crate::model::{PAGE_BITS, PAGE_SIZE};

/// Progress is reported every 512 MiB of frames analyzed.
pub const STATUS_INTERVAL: u64 = 512 * 1024 * 1024;

/// The three-way predicate identifying a secure-world page.
pub fn is_secure_world_page(meta: &PfnMetadata) -> bool {
    meta.reference_count == 2 && meta.share_count == 1 && meta.pte_address == 0
}

/// Walk every page frame of a physical image of `image_size` bytes and
/// collect the physical addresses whose metadata satisfies the predicate,
/// in frame order. `progress(analyzed, total)` fires every
/// [`STATUS_INTERVAL`] bytes. A metadata fetch failure aborts the scan.
pub fn scan_secure_world<M, P>(
    image_size: u64,
    mut metadata: M,
    mut progress: P,
) -> Result<Vec<u64>, EngineError>
where
    M: FnMut(u64) -> Result<PfnMetadata, EngineError>,
    P: FnMut(u64, u64),
{
    let mut pages = Vec::new();
    let mut analyzed = 0u64;

    for pfn in 0..image_size / PAGE_SIZE {
        analyzed += PAGE_SIZE;
        if analyzed % STATUS_INTERVAL == 0 {
            progress(analyzed, image_size);
        }

        if is_secure_world_page(&metadata(pfn)?) {
            pages.push(pfn << PAGE_BITS);
        }
    }

    Ok(pages)
}

/// Concatenate the matched pages, byte-for-byte in scan order, into one
/// contiguous blob via fixed page-size physical reads.
///
/// Unlike the process-memory path there is no zero-fill fallback: these
/// pages are expected to be physically resident, so a failed read is an
/// inconsistency worth surfacing and aborts the extraction.
pub fn read_secure_world<R>(pages: &[u64], mut read: R) -> Result<Vec<u8>, EngineError>
where
    R: FnMut(u64, usize) -> Result<Vec<u8>, EngineError>,
{
    let mut blob = Vec::with_capacity(pages.len() * PAGE_SIZE as usize);
    for &address in pages {
        blob.extend_from_slice(&read(address, PAGE_SIZE as usize)?);
    }
    Ok(blob)
}
