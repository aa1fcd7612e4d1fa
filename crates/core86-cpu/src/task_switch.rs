//! Task switching (§4.6): 16-/32-bit TSS image save/restore, busy-bit management, and the
//! JMP/CALL/interrupt/IRET entry points into the switch algorithm. This module performs the TSS
//! image I/O and descriptor bookkeeping; the caller (`core86-cpu`'s top-level dispatcher) is
//! responsible for actually loading the returned `TaskState` into the architectural registers and
//! validating the new task's LDT/segment selectors once it resumes in that context, since that
//! validation happens *as* the new task, with its own fault-delivery context.

use crate::memory_access::{self, MemoryAccessContext};
use crate::segments::{AccessTypeMask, SegmentAccess, SegmentCache, TablePointer};
use core86_types::{vectors, CpuException, PrivilegeLevel};

/// The architectural state saved into an outgoing TSS and produced from an incoming one. Segment
/// registers are carried as raw selectors; the caller reloads each through the ordinary segment
/// loader once it has switched CR3/LDTR, since their validity depends on the new task's tables.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskState {
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub fs: u16,
    pub gs: u16,
    pub ldt_selector: u16,
    pub is_32bit: bool,
}

const TSS32_BASE_LEN: usize = 104;
const TSS16_BASE_LEN: usize = 44;

fn tss_cache(base: u32, limit: u32) -> SegmentCache {
    SegmentCache {
        selector: 0,
        base,
        limit_low: 0,
        limit_high: limit,
        access: SegmentAccess {
            present: true,
            dpl: PrivilegeLevel::KERNEL,
            executable: false,
            readable_or_writable: true,
            conforming: false,
            expand_down: false,
            default_size_32: true,
            is_system_descriptor: true,
            raw_type: 0x9,
        },
        access_mask: AccessTypeMask { read: true, write: true, execute: false },
    }
}

/// Reads a 32-bit TSS image (§4.6, the "available/busy 32-bit TSS" layout). `link` (byte 0) and
/// the three inner-stack pairs (SS0/ESP0.., consumed separately by `far_control::fetch_inner_stack`
/// during privilege-changing transfers) are not part of `TaskState` since they aren't part of the
/// running architectural state — only read/written directly against the TSS image.
pub fn read_tss_32(mem: &mut MemoryAccessContext, base: u32, limit: u32) -> Result<TaskState, CpuException> {
    let cache = tss_cache(base, limit);
    let mut buf = [0u8; TSS32_BASE_LEN];
    memory_access::read_segment_bytes(mem, &cache, 0, &mut buf)?;
    let u32_at = |o: usize| u32::from_le_bytes([buf[o], buf[o + 1], buf[o + 2], buf[o + 3]]);
    let u16_at = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);

    Ok(TaskState {
        cr3: u32_at(28),
        eip: u32_at(32),
        eflags: u32_at(36),
        eax: u32_at(40),
        ecx: u32_at(44),
        edx: u32_at(48),
        ebx: u32_at(52),
        esp: u32_at(56),
        ebp: u32_at(60),
        esi: u32_at(64),
        edi: u32_at(68),
        es: u16_at(72),
        cs: u16_at(76),
        ss: u16_at(80),
        ds: u16_at(84),
        fs: u16_at(88),
        gs: u16_at(92),
        ldt_selector: u16_at(96),
        is_32bit: true,
    })
}

pub fn write_tss_32(mem: &mut MemoryAccessContext, base: u32, limit: u32, state: &TaskState) -> Result<(), CpuException> {
    let cache = tss_cache(base, limit);
    let mut buf = [0u8; TSS32_BASE_LEN];
    memory_access::read_segment_bytes(mem, &cache, 0, &mut buf)?;

    buf[32..36].copy_from_slice(&state.eip.to_le_bytes());
    buf[36..40].copy_from_slice(&state.eflags.to_le_bytes());
    buf[40..44].copy_from_slice(&state.eax.to_le_bytes());
    buf[44..48].copy_from_slice(&state.ecx.to_le_bytes());
    buf[48..52].copy_from_slice(&state.edx.to_le_bytes());
    buf[52..56].copy_from_slice(&state.ebx.to_le_bytes());
    buf[56..60].copy_from_slice(&state.esp.to_le_bytes());
    buf[60..64].copy_from_slice(&state.ebp.to_le_bytes());
    buf[64..68].copy_from_slice(&state.esi.to_le_bytes());
    buf[68..72].copy_from_slice(&state.edi.to_le_bytes());
    buf[72..74].copy_from_slice(&state.es.to_le_bytes());
    buf[74..76].copy_from_slice(&[0, 0]);
    buf[76..78].copy_from_slice(&state.cs.to_le_bytes());
    buf[78..80].copy_from_slice(&[0, 0]);
    buf[80..82].copy_from_slice(&state.ss.to_le_bytes());
    buf[82..84].copy_from_slice(&[0, 0]);
    buf[84..86].copy_from_slice(&state.ds.to_le_bytes());
    buf[86..88].copy_from_slice(&[0, 0]);
    buf[88..90].copy_from_slice(&state.fs.to_le_bytes());
    buf[90..92].copy_from_slice(&[0, 0]);
    buf[92..94].copy_from_slice(&state.gs.to_le_bytes());
    buf[94..96].copy_from_slice(&[0, 0]);

    memory_access::write_segment_bytes(mem, &cache, 0, &buf)
}

/// Reads a 16-bit (286-style) TSS image: half-width GPRs/pointers, no CR3/FS/GS.
pub fn read_tss_16(mem: &mut MemoryAccessContext, base: u32, limit: u32) -> Result<TaskState, CpuException> {
    let cache = tss_cache(base, limit);
    let mut buf = [0u8; TSS16_BASE_LEN];
    memory_access::read_segment_bytes(mem, &cache, 0, &mut buf)?;
    let u16_at = |o: usize| u16::from_le_bytes([buf[o], buf[o + 1]]);

    Ok(TaskState {
        cr3: 0,
        eip: u16_at(14) as u32,
        eflags: u16_at(16) as u32,
        eax: u16_at(18) as u32,
        ecx: u16_at(20) as u32,
        edx: u16_at(22) as u32,
        ebx: u16_at(24) as u32,
        esp: u16_at(26) as u32,
        ebp: u16_at(28) as u32,
        esi: u16_at(30) as u32,
        edi: u16_at(32) as u32,
        es: u16_at(34),
        cs: u16_at(36),
        ss: u16_at(38),
        ds: u16_at(40),
        fs: 0,
        gs: 0,
        ldt_selector: u16_at(42),
        is_32bit: false,
    })
}

pub fn write_tss_16(mem: &mut MemoryAccessContext, base: u32, limit: u32, state: &TaskState) -> Result<(), CpuException> {
    let cache = tss_cache(base, limit);
    let mut buf = [0u8; TSS16_BASE_LEN];
    memory_access::read_segment_bytes(mem, &cache, 0, &mut buf)?;

    buf[14..16].copy_from_slice(&(state.eip as u16).to_le_bytes());
    buf[16..18].copy_from_slice(&(state.eflags as u16).to_le_bytes());
    buf[18..20].copy_from_slice(&(state.eax as u16).to_le_bytes());
    buf[20..22].copy_from_slice(&(state.ecx as u16).to_le_bytes());
    buf[22..24].copy_from_slice(&(state.edx as u16).to_le_bytes());
    buf[24..26].copy_from_slice(&(state.ebx as u16).to_le_bytes());
    buf[26..28].copy_from_slice(&(state.esp as u16).to_le_bytes());
    buf[28..30].copy_from_slice(&(state.ebp as u16).to_le_bytes());
    buf[30..32].copy_from_slice(&(state.esi as u16).to_le_bytes());
    buf[32..34].copy_from_slice(&(state.edi as u16).to_le_bytes());
    buf[34..36].copy_from_slice(&state.es.to_le_bytes());
    buf[36..38].copy_from_slice(&state.cs.to_le_bytes());
    buf[38..40].copy_from_slice(&state.ss.to_le_bytes());
    buf[40..42].copy_from_slice(&state.ds.to_le_bytes());

    memory_access::write_segment_bytes(mem, &cache, 0, &buf)
}

/// Why the switch is happening (§4.6): governs the outgoing busy bit and whether a back-link is
/// written into the new TSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchSource {
    Jump,
    Call,
    InterruptOrException,
    IretToNestedTask,
}

impl TaskSwitchSource {
    fn leaves_outgoing_task_busy(self) -> bool {
        matches!(self, TaskSwitchSource::Call | TaskSwitchSource::InterruptOrException)
    }

    fn writes_back_link(self) -> bool {
        matches!(self, TaskSwitchSource::Call | TaskSwitchSource::InterruptOrException)
    }
}

pub struct TaskDescriptor {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub is_32bit: bool,
    pub busy: bool,
}

/// Decodes a TSS descriptor's type byte: 0x1/0x9 available, 0x3/0xB busy (16-/32-bit respectively).
pub fn decode_tss_descriptor(selector: u16, bytes: [u8; 8]) -> Option<TaskDescriptor> {
    let raw_type = bytes[5] & 0x0F;
    let (is_32bit, busy) = match raw_type {
        0x1 => (false, false),
        0x3 => (false, true),
        0x9 => (true, false),
        0xB => (true, true),
        _ => return None,
    };
    let base = (bytes[2] as u32) | ((bytes[3] as u32) << 8) | ((bytes[4] as u32) << 16) | ((bytes[7] as u32) << 24);
    let limit_raw = (bytes[0] as u32) | ((bytes[1] as u32) << 8) | (((bytes[6] & 0x0F) as u32) << 16);
    let limit = if bytes[6] & 0x80 != 0 { (limit_raw << 12) | 0xFFF } else { limit_raw };
    Some(TaskDescriptor { selector, base, limit, is_32bit, busy })
}

pub struct TaskSwitchOutcome {
    pub new_state: TaskState,
    pub new_tss: TaskDescriptor,
    pub back_link_selector: u16,
}

/// Performs the architectural task switch (§4.6): saves `outgoing` into the current TSS image,
/// reads the incoming TSS image, toggles busy bits, and (for CALL/interrupt sources) writes the
/// outgoing TSS selector into the incoming TSS's back-link field.
///
/// Paging and LDT validation for the new task are deliberately left to the caller: they must run
/// *after* CR3 has been switched to the new task's value, which this function doesn't do (it only
/// returns the value read from the incoming TSS).
pub fn switch_task(
    mem: &mut MemoryAccessContext,
    gdtr: TablePointer,
    current_tss: &TaskDescriptor,
    outgoing: &TaskState,
    new_tss_selector: u16,
    source: TaskSwitchSource,
) -> Result<TaskSwitchOutcome, CpuException> {
    let index = new_tss_selector >> 3;
    if !gdtr.contains_index(index) {
        return Err(CpuException::with_error_code(vectors::TS, new_tss_selector as u32));
    }
    let gdt_cache = tss_cache(gdtr.base, gdtr.limit);
    let mut descriptor_bytes = [0u8; 8];
    memory_access::read_segment_bytes(mem, &gdt_cache, index as u32 * 8, &mut descriptor_bytes)?;
    let new_tss = decode_tss_descriptor(new_tss_selector, descriptor_bytes)
        .ok_or_else(|| CpuException::with_error_code(vectors::GP, new_tss_selector as u32))?;

    if source != TaskSwitchSource::IretToNestedTask && new_tss.busy {
        return Err(CpuException::with_error_code(vectors::GP, new_tss_selector as u32));
    }

    if current_tss.is_32bit {
        write_tss_32(mem, current_tss.base, current_tss.limit, outgoing)?;
    } else {
        write_tss_16(mem, current_tss.base, current_tss.limit, outgoing)?;
    }
    set_busy_bit(mem, &gdt_cache, current_tss.selector, gdtr, !source.leaves_outgoing_task_busy() && current_tss.busy)?;

    let mut incoming = if new_tss.is_32bit {
        read_tss_32(mem, new_tss.base, new_tss.limit)?
    } else {
        read_tss_16(mem, new_tss.base, new_tss.limit)?
    };

    if source.writes_back_link() {
        write_back_link(mem, &new_tss, current_tss.selector)?;
        incoming.eflags |= 1 << 14; // NT (nested task) flag set in the new task's image copy too
    }

    if source != TaskSwitchSource::IretToNestedTask {
        set_busy_bit(mem, &gdt_cache, new_tss_selector, gdtr, true)?;
    }

    Ok(TaskSwitchOutcome { new_state: incoming, new_tss, back_link_selector: current_tss.selector })
}

fn set_busy_bit(
    mem: &mut MemoryAccessContext,
    _gdt_cache: &SegmentCache,
    selector: u16,
    gdtr: TablePointer,
    busy: bool,
) -> Result<(), CpuException> {
    let index = selector >> 3;
    let gdt_cache = tss_cache(gdtr.base, gdtr.limit);
    let mut byte = [0u8; 1];
    memory_access::read_segment_bytes(mem, &gdt_cache, index as u32 * 8 + 5, &mut byte)?;
    byte[0] = if busy { byte[0] | 0x02 } else { byte[0] & !0x02 };
    memory_access::write_segment_bytes(mem, &gdt_cache, index as u32 * 8 + 5, &byte)
}

fn write_back_link(mem: &mut MemoryAccessContext, tss: &TaskDescriptor, back_link: u16) -> Result<(), CpuException> {
    let cache = tss_cache(tss.base, tss.limit);
    memory_access::write_segment_bytes(mem, &cache, 0, &back_link.to_le_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core86_mem::{MemoryBus, PhysicalMemory};
    use core86_mmu::Mmu;
    use core86_types::AccessMode;
    use std::sync::Arc;

    fn make_ctx(bus: &MemoryBus, mmu: &mut Mmu) -> MemoryAccessContext<'_> {
        MemoryAccessContext { bus, mmu, paging_enabled: false, cr3: 0, mode: AccessMode::Supervisor, cr0_wp: true, alignment_check_enabled: false }
    }

    #[test]
    fn tss32_round_trips_general_registers_and_eip() {
        let bus = MemoryBus::new(Arc::new(PhysicalMemory::new(0x10_0000).unwrap()));
        let mut mmu = Mmu::new();
        let mut mem = make_ctx(&bus, &mut mmu);

        let state = TaskState { eip: 0x1234, eax: 0xDEAD_BEEF, esp: 0x8000, cs: 0x08, ss: 0x10, is_32bit: true, ..Default::default() };
        write_tss_32(&mut mem, 0x2000, 103, &state).unwrap();
        let restored = read_tss_32(&mut mem, 0x2000, 103).unwrap();
        assert_eq!(restored.eip, 0x1234);
        assert_eq!(restored.eax, 0xDEAD_BEEF);
        assert_eq!(restored.esp, 0x8000);
        assert_eq!(restored.cs, 0x08);
    }

    #[test]
    fn tss16_round_trips_general_registers() {
        let bus = MemoryBus::new(Arc::new(PhysicalMemory::new(0x10_0000).unwrap()));
        let mut mmu = Mmu::new();
        let mut mem = make_ctx(&bus, &mut mmu);

        let state = TaskState { eip: 0x100, ebx: 0x55, is_32bit: false, ..Default::default() };
        write_tss_16(&mut mem, 0x3000, 43, &state).unwrap();
        let restored = read_tss_16(&mut mem, 0x3000, 43).unwrap();
        assert_eq!(restored.eip, 0x100);
        assert_eq!(restored.ebx, 0x55);
    }

    #[test]
    fn decode_tss_descriptor_distinguishes_available_from_busy() {
        let mut bytes = [0u8; 8];
        bytes[5] = 0x89; // present, type 0x9 (available 32-bit TSS)
        let tss = decode_tss_descriptor(0x28, bytes).unwrap();
        assert!(tss.is_32bit);
        assert!(!tss.busy);

        bytes[5] = 0x8B; // type 0xB (busy 32-bit TSS)
        let busy = decode_tss_descriptor(0x28, bytes).unwrap();
        assert!(busy.busy);
    }
}
