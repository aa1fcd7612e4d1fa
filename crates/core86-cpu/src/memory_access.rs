//! The segmented-access funnel and the instruction prefetch queue (§3.4, §4.2).
//!
//! Every guest memory touch funnels through [`access`]/[`access_mut`]-style helpers here: segment
//! limit check, optional alignment check, linear-address translation through the paging unit (or
//! the identity map when paging is disabled), and a page-boundary split so a multi-byte access
//! straddling two physical pages still resolves correctly. Nothing above this layer is allowed to
//! touch `core86_mem::MemoryBus` or `core86_mmu::Mmu` directly.

use crate::segments::SegmentCache;
use core86_mem::MemoryBus;
use core86_mmu::{Mmu, WalkMode};
use core86_types::{vectors, AccessMode, AccessType, CpuException, PAGE_SHIFT, PAGE_SIZE};

/// Everything the funnel needs to resolve one access, borrowed for the duration of the call.
pub struct MemoryAccessContext<'a> {
    pub bus: &'a MemoryBus,
    pub mmu: &'a mut Mmu,
    pub paging_enabled: bool,
    pub cr3: u32,
    pub mode: AccessMode,
    /// CR0.WP: when clear, a supervisor write bypasses the page table's write-permission bit
    /// (§4.3).
    pub cr0_wp: bool,
    pub alignment_check_enabled: bool,
}

/// Checks that `[offset, offset+len)` lies within the segment's valid interval and that the
/// requested access type is one the segment grants (§3.1, §4.2 step 1).
pub fn check_segment_access(
    cache: &SegmentCache,
    offset: u32,
    len: u32,
    access_type: AccessType,
) -> Result<(), CpuException> {
    if !cache.access_mask.allows(access_type) {
        return Err(CpuException::with_error_code(vectors::GP, 0));
    }
    if len == 0 {
        return Ok(());
    }
    let last = offset.wrapping_add(len - 1);
    if last < offset || !cache.offset_in_limit(offset) || !cache.offset_in_limit(last) {
        return Err(CpuException::with_error_code(vectors::GP, 0));
    }
    Ok(())
}

/// #AC: unmasked only when CR0.AM, EFLAGS.AC, and CPL3 all hold (checked by the caller via
/// `alignment_check_enabled`), and only for data accesses (the reference never alignment-checks
/// instruction fetches).
pub fn check_alignment(ctx: &MemoryAccessContext, linear: u32, required_alignment: u32) -> Result<(), CpuException> {
    if ctx.alignment_check_enabled && linear % required_alignment != 0 {
        return Err(CpuException::new(vectors::AC));
    }
    Ok(())
}

fn translate(ctx: &mut MemoryAccessContext, linear: u32, access_type: AccessType) -> Result<u32, CpuException> {
    if !ctx.paging_enabled {
        return Ok(linear);
    }
    ctx.mmu.translate_linear(ctx.bus, ctx.cr3, linear, ctx.mode, access_type, ctx.cr0_wp, WalkMode::Normal)
}

/// Reads `buf.len()` bytes from `cache:offset`, splitting at page boundaries as needed.
pub fn read_segment_bytes(
    ctx: &mut MemoryAccessContext,
    cache: &SegmentCache,
    offset: u32,
    buf: &mut [u8],
) -> Result<(), CpuException> {
    check_segment_access(cache, offset, buf.len() as u32, AccessType::Read)?;
    let linear = cache.base.wrapping_add(offset);
    for_each_page_run(linear, buf.len(), |linear_chunk, byte_offset, len| {
        let physical = translate(ctx, linear_chunk, AccessType::Read)?;
        let mut chunk = vec![0u8; len];
        if !ctx.bus.checked_read_bytes(physical as u64, &mut chunk) {
            return Err(CpuException::with_error_code(vectors::GP, 0));
        }
        buf[byte_offset..byte_offset + len].copy_from_slice(&chunk);
        Ok(())
    })
}

/// Writes `data` to `cache:offset`, splitting at page boundaries as needed.
pub fn write_segment_bytes(
    ctx: &mut MemoryAccessContext,
    cache: &SegmentCache,
    offset: u32,
    data: &[u8],
) -> Result<(), CpuException> {
    check_segment_access(cache, offset, data.len() as u32, AccessType::Write)?;
    let linear = cache.base.wrapping_add(offset);
    for_each_page_run(linear, data.len(), |linear_chunk, byte_offset, len| {
        let physical = translate(ctx, linear_chunk, AccessType::Write)?;
        if !ctx.bus.checked_write_bytes(physical as u64, &data[byte_offset..byte_offset + len]) {
            return Err(CpuException::with_error_code(vectors::GP, 0));
        }
        Ok(())
    })
}

/// Fetches `len` bytes of code starting at `cache:offset` (execute access, used by the
/// prefetch queue to refill, never by data reads).
pub fn fetch_segment_bytes(
    ctx: &mut MemoryAccessContext,
    cache: &SegmentCache,
    offset: u32,
    buf: &mut [u8],
) -> Result<(), CpuException> {
    check_segment_access(cache, offset, buf.len() as u32, AccessType::Execute)?;
    let linear = cache.base.wrapping_add(offset);
    for_each_page_run(linear, buf.len(), |linear_chunk, byte_offset, len| {
        let physical = translate(ctx, linear_chunk, AccessType::Execute)?;
        let mut chunk = vec![0u8; len];
        if !ctx.bus.checked_read_bytes(physical as u64, &mut chunk) {
            return Err(CpuException::with_error_code(vectors::GP, 0));
        }
        buf[byte_offset..byte_offset + len].copy_from_slice(&chunk);
        Ok(())
    })
}

/// Splits `[linear, linear+total_len)` into per-page runs and invokes `op(linear_chunk,
/// byte_offset_into_caller_buffer, chunk_len)` for each. The recompiler and interpreter both rely
/// on this never handing `op` a chunk that straddles a page boundary, since translation is
/// necessarily per-page.
fn for_each_page_run(
    linear: u32,
    total_len: usize,
    mut op: impl FnMut(u32, usize, usize) -> Result<(), CpuException>,
) -> Result<(), CpuException> {
    let mut remaining = total_len;
    let mut cursor = linear;
    let mut byte_offset = 0usize;
    while remaining > 0 {
        let page_offset = cursor & (PAGE_SIZE - 1);
        let room_in_page = (PAGE_SIZE - page_offset) as usize;
        let chunk_len = remaining.min(room_in_page);
        op(cursor, byte_offset, chunk_len)?;
        cursor = cursor.wrapping_add(chunk_len as u32);
        byte_offset += chunk_len;
        remaining -= chunk_len;
    }
    Ok(())
}

pub const PREFETCH_QUEUE_SIZE: usize = 32;

/// The CPU's instruction prefetch queue (§3.4): a small ring the decoder pulls raw bytes from,
/// refilled from the code segment a cache line at a time so sequential decode inside a block
/// doesn't hit the bus once per byte.
#[derive(Debug, Clone)]
pub struct PrefetchQueue {
    buffer: [u8; PREFETCH_QUEUE_SIZE],
    len: usize,
    /// Linear address of `buffer[0]`, so a caller can check whether the next EIP is still
    /// contiguous with the queue's contents (used to avoid flushing across a plain sequential
    /// instruction boundary).
    base_linear: u32,
}

impl Default for PrefetchQueue {
    fn default() -> Self {
        PrefetchQueue { buffer: [0; PREFETCH_QUEUE_SIZE], len: 0, base_linear: 0 }
    }
}

impl PrefetchQueue {
    pub fn flush(&mut self) {
        self.len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the queue currently holds bytes starting exactly at `linear`.
    pub fn covers(&self, linear: u32) -> bool {
        self.len > 0 && self.base_linear == linear
    }

    pub fn available(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Refills the queue by fetching up to its capacity starting at `linear`. Any unconsumed
    /// bytes from a previous fill are discarded, matching the reference's "a refill always starts
    /// a fresh window" behaviour, since a refill is only requested once the decoder has run past
    /// the old window.
    pub fn refill(
        &mut self,
        ctx: &mut MemoryAccessContext,
        cache: &SegmentCache,
        offset: u32,
        linear: u32,
    ) -> Result<(), CpuException> {
        let mut buf = [0u8; PREFETCH_QUEUE_SIZE];
        let mut len = 0usize;
        for want in (1..=PREFETCH_QUEUE_SIZE).rev() {
            if fetch_segment_bytes(ctx, cache, offset, &mut buf[..want]).is_ok() {
                len = want;
                break;
            }
        }
        self.buffer = buf;
        self.len = len;
        self.base_linear = linear;
        if len == 0 {
            return Err(CpuException::with_error_code(vectors::GP, 0));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::{AccessTypeMask, SegmentAccess};
    use core86_mem::PhysicalMemory;
    use core86_types::PrivilegeLevel;
    use std::sync::Arc;

    fn full_access_cache(base: u32, limit_high: u32) -> SegmentCache {
        SegmentCache {
            selector: 0,
            base,
            limit_low: 0,
            limit_high,
            access: synthetic_access(),
            access_mask: AccessTypeMask { read: true, write: true, execute: true },
        }
    }

    // Local helper mirroring `SegmentAccess::synthetic`, which is private to `segments`.
    fn synthetic_access() -> SegmentAccess {
        SegmentAccess {
            present: true,
            dpl: PrivilegeLevel::KERNEL,
            executable: false,
            readable_or_writable: true,
            conforming: false,
            expand_down: false,
            default_size_32: true,
            is_system_descriptor: false,
            raw_type: 0,
        }
    }

    fn make_bus(size: u64) -> MemoryBus {
        MemoryBus::new(Arc::new(PhysicalMemory::new(size).unwrap()))
    }

    #[test]
    fn segment_limit_check_rejects_access_past_the_limit() {
        let cache = full_access_cache(0, 0x0F);
        assert!(check_segment_access(&cache, 0x0C, 4, AccessType::Read).is_err());
        assert!(check_segment_access(&cache, 0x0C, 2, AccessType::Read).is_ok());
    }

    #[test]
    fn read_segment_bytes_splits_across_a_page_boundary() {
        let bus = make_bus(0x4000);
        bus.write_bytes(0x0FFE, &[0xAA, 0xBB, 0xCC, 0xDD]);
        let mut mmu = Mmu::new();
        let mut ctx = MemoryAccessContext { bus: &bus, mmu: &mut mmu, paging_enabled: false, cr3: 0, mode: AccessMode::Supervisor, cr0_wp: true, alignment_check_enabled: false };
        let cache = full_access_cache(0, 0xFFFF_FFFF);

        let mut out = [0u8; 4];
        read_segment_bytes(&mut ctx, &cache, 0x0FFE, &mut out).unwrap();
        assert_eq!(out, [0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn prefetch_queue_refill_shrinks_to_what_the_segment_limit_allows() {
        let bus = make_bus(0x4000);
        bus.write_bytes(0x100, &[0x90; 8]);
        let mut mmu = Mmu::new();
        let mut ctx = MemoryAccessContext { bus: &bus, mmu: &mut mmu, paging_enabled: false, cr3: 0, mode: AccessMode::Supervisor, cr0_wp: true, alignment_check_enabled: false };
        let cache = full_access_cache(0, 0x103); // only 4 bytes visible starting at 0x100

        let mut queue = PrefetchQueue::default();
        queue.refill(&mut ctx, &cache, 0x100, 0x100).unwrap();
        assert_eq!(queue.available().len(), 4);
    }
}
