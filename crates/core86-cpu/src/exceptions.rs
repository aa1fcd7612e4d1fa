//! Exception and interrupt delivery (§7): real-mode IVT dispatch, protected-mode IDT gate
//! dispatch, and V8086/VME redirection. `core86_interrupts` supplies the pure decisions (gate
//! decode, fault-nesting classification, V8086 redirection choice); this module performs the
//! actual stack pushes and segment loads those decisions drive.

use crate::memory_access::{self, MemoryAccessContext};
use crate::segments::{CpuOperatingMode, ScratchStack, SegmentCache, TablePointer};
use core86_interrupts::{decode_gate_descriptor, decode_ivt_entry, requires_error_code, FaultOutcome, FaultTracker, GateType};
use core86_types::{vectors, CpuException, PrivilegeLevel};

/// What `deliver` needs from the CPU to run a delivery to completion. Bundled as a context struct
/// (the Design Notes' "no ambient CPU singleton" rule) rather than a method directly on a would-be
/// monolithic `Cpu`, so this module can be unit-tested against a minimal harness.
pub struct DeliveryContext<'a> {
    pub mem: MemoryAccessContext<'a>,
    pub mode: CpuOperatingMode,
    pub idtr: TablePointer,
    pub gdtr: TablePointer,
    pub ldtr: TablePointer,
    pub cpl: PrivilegeLevel,
    pub cs: SegmentCache,
    pub ss: SegmentCache,
    pub eip: u32,
    pub esp: u32,
    pub eflags: u32,
    pub stack_is_32bit: bool,
    pub code_is_32bit: bool,
    /// Current task's TSS base/limit/width, consulted only when the delivery raises privilege
    /// (§4.5's inner-stack lookup: `SSn`/`ESPn`/`SPn` at fixed TSS offsets by target CPL).
    pub tss_base: u32,
    pub tss_is_32bit: bool,
}

/// Reads the inner stack pointer and selector for `target_cpl` out of the current TSS image.
fn fetch_inner_stack(
    ctx: &mut DeliveryContext,
    target_cpl: PrivilegeLevel,
) -> Result<(u16, u32), CpuException> {
    let tss_cache = SegmentCache { base: ctx.tss_base, limit_low: 0, limit_high: 0xFFFF, ..ctx.cs };
    let level = target_cpl.value() as u32;
    if ctx.tss_is_32bit {
        let offset = 4 + level * 8;
        let mut esp_bytes = [0u8; 4];
        memory_access::read_segment_bytes(&mut ctx.mem, &tss_cache, offset, &mut esp_bytes)?;
        let mut ss_bytes = [0u8; 2];
        memory_access::read_segment_bytes(&mut ctx.mem, &tss_cache, offset + 4, &mut ss_bytes)?;
        Ok((u16::from_le_bytes(ss_bytes), u32::from_le_bytes(esp_bytes)))
    } else {
        let offset = 2 + level * 4;
        let mut sp_bytes = [0u8; 2];
        memory_access::read_segment_bytes(&mut ctx.mem, &tss_cache, offset, &mut sp_bytes)?;
        let mut ss_bytes = [0u8; 2];
        memory_access::read_segment_bytes(&mut ctx.mem, &tss_cache, offset + 2, &mut ss_bytes)?;
        Ok((u16::from_le_bytes(ss_bytes), u16::from_le_bytes(sp_bytes) as u32))
    }
}

/// The outcome of a successful delivery: the new CS/EIP/ESP/EFLAGS/CPL the caller must commit, and
/// whether IF should be cleared (interrupt gates only).
pub struct DeliveryResult {
    pub new_cs: SegmentCache,
    pub new_eip: u32,
    pub new_ss: Option<SegmentCache>,
    pub new_esp: u32,
    pub new_eflags: u32,
    pub new_cpl: PrivilegeLevel,
}

/// Real-mode (and V8086-mode-via-real-IVT) delivery: push FLAGS/CS/IP, clear IF/TF, and jump
/// through the four-byte IVT entry at `vector * 4`.
pub fn deliver_real_mode(ctx: &mut DeliveryContext, vector: u8) -> Result<DeliveryResult, CpuException> {
    let mut stack = ScratchStack::new(ctx.mem.bus, ctx.esp, &ctx.ss, false);
    stack.push_word(ctx.eflags as u16);
    stack.push_word(ctx.cs.selector);
    stack.push_word(ctx.eip as u16);

    let mut entry_bytes = [0u8; 4];
    memory_access::read_segment_bytes(
        &mut ctx.mem,
        &SegmentCache { base: 0, limit_low: 0, limit_high: 0xFFFF, ..ctx.cs },
        vector as u32 * 4,
        &mut entry_bytes,
    )?;
    let (segment, offset) = decode_ivt_entry(entry_bytes);

    let new_cs = SegmentCache {
        selector: segment,
        base: (segment as u32) << 4,
        limit_low: 0,
        limit_high: 0xFFFF,
        access: ctx.cs.access,
        access_mask: ctx.cs.access_mask,
    };

    Ok(DeliveryResult {
        new_cs,
        new_eip: offset as u32,
        new_ss: None,
        new_esp: stack.esp,
        new_eflags: ctx.eflags & !((1 << 9) | (1 << 8)), // clear IF, TF
        new_cpl: ctx.cpl,
    })
}

/// Protected-mode delivery through the IDT (§7 step-by-step): fetch the gate, validate privilege
/// for software interrupts, switch to the inner stack on a privilege change, push the trap frame,
/// and jump to the handler. Task gates are rejected here — task-gate delivery is
/// `task_switch`'s job, triggered by the caller when `decode_gate_descriptor` reports
/// `GateType::Task`.
pub fn deliver_protected_mode(
    ctx: &mut DeliveryContext,
    vector: u8,
    error_code: Option<u32>,
    software_interrupt: bool,
) -> Result<DeliveryResult, CpuException> {
    let idt_cache = SegmentCache { base: ctx.idtr.base, limit_low: 0, limit_high: ctx.idtr.limit, ..ctx.cs };
    let gate_addr = vector as u32 * 8;
    if gate_addr as u64 + 7 > ctx.idtr.limit as u64 {
        return Err(CpuException::with_error_code(vectors::GP, vector as u32 * 8 + 2));
    }

    let mut gate_bytes = [0u8; 8];
    memory_access::read_segment_bytes(&mut ctx.mem, &idt_cache, gate_addr, &mut gate_bytes)?;
    let gate = decode_gate_descriptor(gate_bytes).ok_or_else(|| CpuException::with_error_code(vectors::GP, vector as u32 * 8 + 2))?;

    if gate.gate_type == GateType::Task {
        return Err(CpuException::new(vectors::UD)); // caller should have routed this to task_switch already
    }
    if !gate.present {
        return Err(CpuException::with_error_code(vectors::NP, vector as u32 * 8 + 2));
    }
    if software_interrupt && gate.dpl < ctx.cpl {
        return Err(CpuException::with_error_code(vectors::GP, vector as u32 * 8 + 2));
    }

    let target_cache_bytes = fetch_code_descriptor(ctx, gate.selector)?;
    let (target_base, target_limit, target_dpl, target_default_32) = decode_code_descriptor(target_cache_bytes);

    let privilege_change = target_dpl < ctx.cpl;
    let new_cpl = if privilege_change { target_dpl } else { ctx.cpl };

    let (old_ss, old_esp) = (ctx.ss, ctx.esp);
    let (mut stack, new_ss) = if privilege_change {
        let (ss_selector, new_esp) = fetch_inner_stack(ctx, target_dpl)?;
        let new_ss_bytes = fetch_code_descriptor(ctx, ss_selector)?;
        let (ss_base, ss_limit, ss_dpl, ss_default_32) = decode_code_descriptor(new_ss_bytes);
        if ss_dpl != target_dpl {
            return Err(CpuException::with_error_code(vectors::TS, ss_selector as u32));
        }
        let new_ss_cache = SegmentCache {
            selector: ss_selector,
            base: ss_base,
            limit_low: 0,
            limit_high: ss_limit,
            access: ctx.ss.access,
            access_mask: code_segment_access_mask(ss_default_32),
        };
        (ScratchStack::new(ctx.mem.bus, new_esp, &new_ss_cache, ss_default_32), Some(new_ss_cache))
    } else {
        (ScratchStack::new(ctx.mem.bus, ctx.esp, &ctx.ss, ctx.stack_is_32bit), None)
    };

    if gate.is_32bit() {
        if privilege_change {
            stack.push_dword(old_ss.selector as u32);
            stack.push_dword(old_esp);
        }
        if let Some(code) = error_code.or(if requires_error_code(vector) { Some(0) } else { None }) {
            stack.push_dword(code);
        }
        stack.push_dword(ctx.eflags);
        stack.push_dword(ctx.cs.selector as u32);
        stack.push_dword(ctx.eip);
    } else {
        if privilege_change {
            stack.push_word(old_ss.selector);
            stack.push_word(old_esp as u16);
        }
        if let Some(code) = error_code.or(if requires_error_code(vector) { Some(0) } else { None }) {
            stack.push_word(code as u16);
        }
        stack.push_word(ctx.eflags as u16);
        stack.push_word(ctx.cs.selector);
        stack.push_word(ctx.eip as u16);
    }

    let mut new_eflags = ctx.eflags;
    if gate.clears_interrupt_flag() {
        new_eflags &= !(1 << 9);
    }
    new_eflags &= !(1 << 8); // TF always cleared

    Ok(DeliveryResult {
        new_cs: SegmentCache {
            selector: gate.selector,
            base: target_base,
            limit_low: 0,
            limit_high: target_limit,
            access: ctx.cs.access,
            access_mask: code_segment_access_mask(target_default_32),
        },
        new_eip: gate.offset,
        new_ss,
        new_esp: stack.esp,
        new_eflags,
        new_cpl,
    })
}

/// A code segment's access mask is always execute(+read if the R bit was set); callers here only
/// ever load through a gate that already validated the target is a code segment, so this always
/// grants execute. The R bit isn't threaded through `decode_code_descriptor` (only base/limit/dpl
/// matter for a control transfer), so reads are conservatively allowed too.
fn code_segment_access_mask(_default_32: bool) -> crate::segments::AccessTypeMask {
    crate::segments::AccessTypeMask { read: true, write: false, execute: true }
}

fn fetch_code_descriptor(ctx: &mut DeliveryContext, selector: u16) -> Result<[u8; 8], CpuException> {
    let index = selector >> 3;
    let table = if selector & 0x4 != 0 { ctx.ldtr } else { ctx.gdtr };
    let table_cache = SegmentCache { base: table.base, limit_low: 0, limit_high: table.limit, ..ctx.cs };
    let mut bytes = [0u8; 8];
    memory_access::read_segment_bytes(&mut ctx.mem, &table_cache, index as u32 * 8, &mut bytes)?;
    Ok(bytes)
}

fn decode_code_descriptor(bytes: [u8; 8]) -> (u32, u32, PrivilegeLevel, bool) {
    let base = (bytes[2] as u32) | ((bytes[3] as u32) << 8) | ((bytes[4] as u32) << 16) | ((bytes[7] as u32) << 24);
    let limit_raw = (bytes[0] as u32) | ((bytes[1] as u32) << 8) | (((bytes[6] & 0x0F) as u32) << 16);
    let granularity = bytes[6] & 0x80 != 0;
    let default_32 = bytes[6] & 0x40 != 0;
    let limit = if granularity { (limit_raw << 12) | 0xFFF } else { limit_raw };
    let dpl = PrivilegeLevel::new((bytes[5] >> 5) & 0x3);
    (base, limit, dpl, default_32)
}

/// Drives a single exception/interrupt delivery end to end, including double/triple fault
/// escalation via `tracker`.
pub fn raise(
    ctx: &mut DeliveryContext,
    tracker: &mut FaultTracker,
    vector: u8,
    error_code: Option<u32>,
    software_interrupt: bool,
) -> Result<DeliveryResult, CpuException> {
    let outcome = tracker.begin_delivery(vector);
    let (effective_vector, effective_error) = match outcome {
        FaultOutcome::Deliver(v) => (v, error_code),
        FaultOutcome::DoubleFault => (vectors::DF, Some(0)),
        FaultOutcome::TripleFault => {
            return Err(CpuException::new(vectors::MC)); // triple fault: caller resets the CPU
        }
    };

    let result = if ctx.mode == CpuOperatingMode::Real {
        deliver_real_mode(ctx, effective_vector)
    } else {
        deliver_protected_mode(ctx, effective_vector, effective_error, software_interrupt)
    }?;

    tracker.end_delivery();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::{AccessTypeMask, SegmentAccess};
    use core86_mem::{MemoryBus, PhysicalMemory};
    use core86_mmu::Mmu;
    use core86_types::AccessMode;
    use std::sync::Arc;

    fn synthetic(dpl: PrivilegeLevel) -> SegmentAccess {
        SegmentAccess {
            present: true,
            dpl,
            executable: false,
            readable_or_writable: true,
            conforming: false,
            expand_down: false,
            default_size_32: false,
            is_system_descriptor: false,
            raw_type: 0,
        }
    }

    fn flat_cache(base: u32) -> SegmentCache {
        SegmentCache {
            selector: 0,
            base,
            limit_low: 0,
            limit_high: 0xFFFF,
            access: synthetic(PrivilegeLevel::KERNEL),
            access_mask: AccessTypeMask { read: true, write: true, execute: true },
        }
    }

    #[test]
    fn real_mode_delivery_pushes_flags_cs_ip_and_jumps_through_ivt() {
        let bus = MemoryBus::new(Arc::new(PhysicalMemory::new(0x10_0000).unwrap()));
        // IVT entry 0x21 -> offset 0x1234, segment 0xF000
        bus.write_bytes(0x21 * 4, &[0x34, 0x12, 0x00, 0xF0]);
        let mut mmu = Mmu::new();

        let mut ctx = DeliveryContext {
            mem: MemoryAccessContext { bus: &bus, mmu: &mut mmu, paging_enabled: false, cr3: 0, mode: AccessMode::Supervisor, cr0_wp: true, alignment_check_enabled: false },
            mode: CpuOperatingMode::Real,
            idtr: TablePointer::default(),
            gdtr: TablePointer::default(),
            ldtr: TablePointer::default(),
            cpl: PrivilegeLevel::KERNEL,
            cs: flat_cache(0x1000),
            ss: flat_cache(0x2000),
            eip: 0x50,
            esp: 0x100,
            eflags: 0x0202,
            stack_is_32bit: false,
            code_is_32bit: false,
            tss_base: 0,
            tss_is_32bit: true,
        };

        let result = deliver_real_mode(&mut ctx, 0x21).unwrap();
        assert_eq!(result.new_cs.selector, 0xF000);
        assert_eq!(result.new_eip, 0x1234);
        assert_eq!(result.new_esp, 0x100 - 6);
        assert_eq!(result.new_eflags & (1 << 9), 0, "IF must be cleared");
    }
}
