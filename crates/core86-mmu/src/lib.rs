//! The paging unit: a tagged-generation TLB in front of a two-level page walker (§3.3, §4.3).
//!
//! 4 MB (PSE) pages are not modelled; every walk is a standard directory → table → page chain.
//! Flushing the TLB is O(1): rather than clearing every slot, we bump a generation counter and
//! let stale entries compare unequal to it on next lookup. Only once the counter saturates do we
//! pay for an actual `memset`-equivalent.

#![forbid(unsafe_code)]

use core86_mem::MemoryBus;
use core86_types::{pf_error, AccessMode, AccessType, CpuException, PhysicalAddress, vectors, PAGE_MASK, PAGE_SHIFT};

const TLB_SLOTS: usize = 256; // power of two, indexed by `(linear >> 12) mod TLB_SLOTS`
const GENERATION_BITS: u32 = 12;
const GENERATION_MAX: u16 = (1 << GENERATION_BITS) - 1;

fn tlb_index(page_number: u32) -> usize {
    (page_number as usize) & (TLB_SLOTS - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TlbTag {
    page_number: u32,
    generation: u16,
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    tag: Option<TlbTag>,
    physical_page: u32,
}

impl TlbEntry {
    const EMPTY: TlbEntry = TlbEntry { tag: None, physical_page: 0 };
}

/// One `[user|supervisor] x [read|write|execute]` plane of the TLB.
struct TlbPlane {
    slots: [TlbEntry; TLB_SLOTS],
}

impl TlbPlane {
    fn new() -> Self {
        TlbPlane { slots: [TlbEntry::EMPTY; TLB_SLOTS] }
    }
}

fn access_index(mode: AccessMode, access: AccessType) -> usize {
    let mode_index = match mode {
        AccessMode::User => 0,
        AccessMode::Supervisor => 1,
    };
    let access_index = match access {
        AccessType::Read => 0,
        AccessType::Write => 1,
        AccessType::Execute => 2,
    };
    mode_index * 3 + access_index
}

/// Whether a walk should perform its side effects (accessed/dirty bit write-back, TLB install)
/// or just report the translation. The debugger and the prefetch-queue optimiser want to probe a
/// translation without those effects, per §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkMode {
    Normal,
    Silent,
}

pub struct Mmu {
    planes: [TlbPlane; 6],
    generation: u16,
}

impl Mmu {
    pub fn new() -> Self {
        Mmu {
            planes: std::array::from_fn(|_| TlbPlane::new()),
            generation: 0,
        }
    }

    /// Invalidates every translation. O(1): bumps the generation tag rather than clearing slots,
    /// except once every `2^12` flushes when the counter wraps and a real clear is unavoidable.
    pub fn flush(&mut self) {
        if self.generation == GENERATION_MAX {
            for plane in &mut self.planes {
                *plane = TlbPlane::new();
            }
            self.generation = 0;
        } else {
            self.generation += 1;
        }
    }

    /// Invalidates the TLB entries for a single page across every plane (`INVLPG`).
    pub fn invalidate_page(&mut self, linear_page: u32) {
        let index = tlb_index(linear_page);
        for plane in &mut self.planes {
            if let Some(tag) = plane.slots[index].tag {
                if tag.page_number == linear_page {
                    plane.slots[index].tag = None;
                }
            }
        }
    }

    fn lookup(&self, mode: AccessMode, access: AccessType, linear_page: u32) -> Option<u32> {
        let plane = &self.planes[access_index(mode, access)];
        let entry = &plane.slots[tlb_index(linear_page)];
        match entry.tag {
            Some(tag) if tag.page_number == linear_page && tag.generation == self.generation => {
                Some(entry.physical_page)
            }
            _ => None,
        }
    }

    /// Installs a TLB entry in every plane the permission vector from the walk actually grants.
    /// A lookup only checks tag/generation, not permissions, so a plane the walk didn't clear
    /// must never get an entry — otherwise a later access of a kind the walk forbade would hit
    /// the TLB and skip the permission check entirely.
    fn install(&mut self, linear_page: u32, physical_page: u32, perms: u8) {
        let tag = TlbTag { page_number: linear_page, generation: self.generation };
        let index = tlb_index(linear_page);
        for access in [AccessType::Read, AccessType::Write, AccessType::Execute] {
            for mode in [AccessMode::User, AccessMode::Supervisor] {
                if permission_allows(perms, mode, access) {
                    let plane = &mut self.planes[access_index(mode, access)];
                    plane.slots[index] = TlbEntry { tag: Some(tag), physical_page };
                }
            }
        }
    }

    /// Translates a linear address, consulting the TLB first and walking the page tables on a
    /// miss. `cr3` is the page-directory base (already masked to a page boundary); `cr0_pg` must
    /// be checked by the caller before calling this (paging-disabled translation is the identity
    /// map and doesn't go through the MMU at all). `cr0_wp` is CR0.WP: when clear, a supervisor
    /// write to a read-only page is allowed rather than faulting (§4.3,
    /// `CPU::LookupPageTable`'s `do_access_check = (CR0.WP || user_mode)`).
    pub fn translate_linear(
        &mut self,
        bus: &MemoryBus,
        cr3: PhysicalAddress,
        linear: u32,
        mode: AccessMode,
        access: AccessType,
        cr0_wp: bool,
        walk_mode: WalkMode,
    ) -> Result<PhysicalAddress, CpuException> {
        let linear_page = linear >> PAGE_SHIFT;
        let offset = linear & !PAGE_MASK;

        if let Some(physical_page) = self.lookup(mode, access, linear_page) {
            return Ok((physical_page << PAGE_SHIFT) | offset);
        }

        let (physical_page, perms) = self.walk(bus, cr3, linear, mode, access, cr0_wp, walk_mode)?;

        if walk_mode == WalkMode::Normal {
            self.install(linear_page, physical_page, perms);
        }

        Ok((physical_page << PAGE_SHIFT) | offset)
    }

    fn walk(
        &mut self,
        bus: &MemoryBus,
        cr3: PhysicalAddress,
        linear: u32,
        mode: AccessMode,
        access: AccessType,
        cr0_wp: bool,
        walk_mode: WalkMode,
    ) -> Result<(u32, u8), CpuException> {
        let dir_index = (linear >> 22) & 0x3FF;
        let table_index = (linear >> 12) & 0x3FF;

        let pde_addr = (cr3 & PAGE_MASK) + dir_index * 4;
        let mut pde = bus.read_u32(pde_addr as u64);
        let pde_present = pde & 0x1 != 0;
        if !pde_present {
            return Err(page_fault(linear, false, access, mode));
        }

        let pte_table_base = pde & PAGE_MASK;
        let pte_addr = pte_table_base + table_index * 4;
        let mut pte = bus.read_u32(pte_addr as u64);
        let pte_present = pte & 0x1 != 0;
        if !pte_present {
            return Err(page_fault(linear, false, access, mode));
        }

        let dir_perms = entry_permissions(pde, cr0_wp);
        let table_perms = entry_permissions(pte, cr0_wp);
        let effective = dir_perms & table_perms;

        if !permission_allows(effective, mode, access) {
            return Err(page_fault(linear, true, access, mode));
        }

        if walk_mode == WalkMode::Normal {
            const ACCESSED: u32 = 1 << 5;
            const DIRTY: u32 = 1 << 6;

            if pde & ACCESSED == 0 {
                pde |= ACCESSED;
                bus.write_u32(pde_addr as u64, pde);
            }
            if pte & ACCESSED == 0 {
                pte |= ACCESSED;
                bus.write_u32(pte_addr as u64, pte);
            }
            if access == AccessType::Write && pte & DIRTY == 0 {
                pte |= DIRTY;
                bus.write_u32(pte_addr as u64, pte);
            }
        }

        Ok(((pte & PAGE_MASK) >> PAGE_SHIFT, effective))
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

/// Composes a page directory/table entry's U/S and R/W bits into the five-bit permission vector
/// `[user_r, user_x, user_w, sup_r, sup_x, sup_w]` described in §4.3. Execute permission tracks
/// read permission (no NX bit in this architecture generation). `wp` is CR0.WP: when clear, a
/// supervisor write is granted even over a read-only entry, since write-protection of
/// supervisor-mode accesses is opt-in on this architecture generation.
fn entry_permissions(entry: u32, wp: bool) -> u8 {
    let writable = entry & 0x2 != 0;
    let user = entry & 0x4 != 0;

    let mut perms = 0u8;
    perms |= 1 << 3; // sup_r: supervisor can always read a present entry
    perms |= 1 << 4; // sup_x
    if writable || !wp {
        perms |= 1 << 5; // sup_w
    }
    if user {
        perms |= 1 << 0; // user_r
        perms |= 1 << 1; // user_x
        if writable {
            perms |= 1 << 2; // user_w
        }
    }
    perms
}

fn permission_allows(perms: u8, mode: AccessMode, access: AccessType) -> bool {
    let bit = match (mode, access) {
        (AccessMode::User, AccessType::Read) => 0,
        (AccessMode::User, AccessType::Execute) => 1,
        (AccessMode::User, AccessType::Write) => 2,
        (AccessMode::Supervisor, AccessType::Read) => 3,
        (AccessMode::Supervisor, AccessType::Execute) => 4,
        (AccessMode::Supervisor, AccessType::Write) => 5,
    };
    perms & (1 << bit) != 0
}

fn page_fault(linear: u32, present: bool, access: AccessType, mode: AccessMode) -> CpuException {
    let mut error_code = 0u32;
    if present {
        error_code |= pf_error::PRESENT;
    }
    if access == AccessType::Write {
        error_code |= pf_error::WRITE;
    }
    if mode == AccessMode::User {
        error_code |= pf_error::USER;
    }
    let _ = linear; // CR2 is set by the caller (core86-cpu owns CR2, not the MMU)
    CpuException::with_error_code(vectors::PF, error_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core86_mem::PhysicalMemory;
    use std::sync::Arc;

    fn identity_map(bus: &MemoryBus, dir_base: u32, present_flags: u32) {
        // Single page directory entry at index 0 pointing at a page table at dir_base + 0x1000,
        // single page table entry at index 0 mapping linear page 0 to physical page 0.
        let table_base = dir_base + 0x1000;
        bus.write_u32(dir_base as u64, (table_base & PAGE_MASK) | present_flags);
        bus.write_u32(table_base as u64, present_flags);
    }

    fn make_bus() -> MemoryBus {
        let ram = Arc::new(PhysicalMemory::new(0x10_0000).unwrap());
        MemoryBus::new(ram)
    }

    #[test]
    fn translates_through_two_level_tables() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x7); // present, writable, user
        let mut mmu = Mmu::new();

        let physical = mmu
            .translate_linear(&bus, 0x2000, 0x1234, AccessMode::User, AccessType::Read, true, WalkMode::Normal)
            .unwrap();
        assert_eq!(physical, 0x1234);
    }

    #[test]
    fn tlb_hit_skips_the_walk_but_agrees_with_it() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x7);
        let mut mmu = Mmu::new();

        let first = mmu
            .translate_linear(&bus, 0x2000, 0x500, AccessMode::User, AccessType::Write, true, WalkMode::Normal)
            .unwrap();
        let second = mmu
            .translate_linear(&bus, 0x2000, 0x500, AccessMode::User, AccessType::Write, true, WalkMode::Normal)
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn supervisor_only_page_faults_for_user_access() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x3); // present, writable, supervisor-only
        let mut mmu = Mmu::new();

        let err = mmu
            .translate_linear(&bus, 0x2000, 0x100, AccessMode::User, AccessType::Read, true, WalkMode::Normal)
            .unwrap_err();
        assert_eq!(err.vector, vectors::PF);
        assert_eq!(err.error_code.unwrap() & pf_error::PRESENT, pf_error::PRESENT);
        assert_eq!(err.error_code.unwrap() & pf_error::USER, pf_error::USER);
    }

    #[test]
    fn not_present_directory_entry_faults_with_present_bit_clear() {
        let bus = make_bus();
        let mut mmu = Mmu::new();
        let err = mmu
            .translate_linear(&bus, 0x2000, 0x9000_0000, AccessMode::Supervisor, AccessType::Read, true, WalkMode::Normal)
            .unwrap_err();
        assert_eq!(err.error_code.unwrap() & pf_error::PRESENT, 0);
    }

    #[test]
    fn read_only_page_faults_on_write() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x5); // present, read-only, user
        let mut mmu = Mmu::new();

        let err = mmu
            .translate_linear(&bus, 0x2000, 0x10, AccessMode::User, AccessType::Write, true, WalkMode::Normal)
            .unwrap_err();
        assert!(err.error_code.unwrap() & pf_error::WRITE != 0);
    }

    #[test]
    fn supervisor_write_to_read_only_page_succeeds_when_wp_clear() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x5); // present, read-only, user
        let mut mmu = Mmu::new();

        let physical = mmu
            .translate_linear(&bus, 0x2000, 0x10, AccessMode::Supervisor, AccessType::Write, false, WalkMode::Normal)
            .unwrap();
        assert_eq!(physical, 0x10);
    }

    #[test]
    fn supervisor_write_to_read_only_page_faults_when_wp_set() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x5); // present, read-only, user
        let mut mmu = Mmu::new();

        let err = mmu
            .translate_linear(&bus, 0x2000, 0x10, AccessMode::Supervisor, AccessType::Write, true, WalkMode::Normal)
            .unwrap_err();
        assert!(err.error_code.unwrap() & pf_error::WRITE != 0);
    }

    #[test]
    fn user_write_to_read_only_page_still_faults_regardless_of_wp() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x5); // present, read-only, user
        let mut mmu = Mmu::new();

        let err = mmu
            .translate_linear(&bus, 0x2000, 0x10, AccessMode::User, AccessType::Write, false, WalkMode::Normal)
            .unwrap_err();
        assert!(err.error_code.unwrap() & pf_error::WRITE != 0);
    }

    #[test]
    fn invlpg_forces_a_fresh_walk() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x7);
        let mut mmu = Mmu::new();
        mmu.translate_linear(&bus, 0x2000, 0x10, AccessMode::User, AccessType::Read, true, WalkMode::Normal).unwrap();

        mmu.invalidate_page(0);

        // Corrupt the table so a stale hit would return a different answer than a fresh walk.
        identity_map(&bus, 0x2000, 0x5); // now read-only
        let err = mmu
            .translate_linear(&bus, 0x2000, 0x10, AccessMode::User, AccessType::Write, true, WalkMode::Normal)
            .unwrap_err();
        assert!(err.error_code.unwrap() & pf_error::WRITE != 0);
    }

    #[test]
    fn flush_invalidates_without_touching_memory() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x7);
        let mut mmu = Mmu::new();
        mmu.translate_linear(&bus, 0x2000, 0x10, AccessMode::User, AccessType::Read, true, WalkMode::Normal).unwrap();
        mmu.flush();
        let physical = mmu
            .translate_linear(&bus, 0x2000, 0x10, AccessMode::User, AccessType::Read, true, WalkMode::Normal)
            .unwrap();
        assert_eq!(physical, 0x10);
    }

    #[test]
    fn silent_walk_does_not_set_accessed_or_dirty_bits() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x7);
        let mut mmu = Mmu::new();
        mmu.translate_linear(&bus, 0x2000, 0x10, AccessMode::Supervisor, AccessType::Write, true, WalkMode::Silent).unwrap();

        let pde = bus.read_u32(0x2000);
        let pte = bus.read_u32(0x3000);
        assert_eq!(pde & (1 << 5), 0, "accessed bit must not be set by a silent walk");
        assert_eq!(pte & (1 << 6), 0, "dirty bit must not be set by a silent walk");
    }

    #[test]
    fn normal_walk_sets_accessed_and_dirty_bits() {
        let bus = make_bus();
        identity_map(&bus, 0x2000, 0x7);
        let mut mmu = Mmu::new();
        mmu.translate_linear(&bus, 0x2000, 0x10, AccessMode::Supervisor, AccessType::Write, true, WalkMode::Normal).unwrap();

        let pde = bus.read_u32(0x2000);
        let pte = bus.read_u32(0x3000);
        assert_ne!(pde & (1 << 5), 0);
        assert_ne!(pte & (1 << 5), 0);
        assert_ne!(pte & (1 << 6), 0);
    }
}
