//! Far control transfer (§4.5): JMP/CALL/RET/IRET across conforming/non-conforming code segments,
//! call gates, and task gates/segments, including the privilege-raising inner-stack switch and
//! call-gate parameter copy. `core86_interrupts::classify_iret` supplies the six-way IRET
//! decision; this module performs the stack and segment work each case requires.

use crate::memory_access::{self, MemoryAccessContext};
use crate::segments::{ScratchStack, SegmentCache, TablePointer};
use core86_interrupts::{decode_gate_descriptor, GateDescriptor};
use core86_types::{vectors, CpuException, PrivilegeLevel};

/// Everything a far control transfer needs, borrowed for its duration.
pub struct TransferContext<'a> {
    pub mem: MemoryAccessContext<'a>,
    pub gdtr: TablePointer,
    pub ldtr: TablePointer,
    pub cpl: PrivilegeLevel,
    pub cs: SegmentCache,
    pub ss: SegmentCache,
    pub eip: u32,
    pub esp: u32,
    pub stack_is_32bit: bool,
    pub tss_base: u32,
    pub tss_is_32bit: bool,
}

pub struct TransferResult {
    pub new_cs: SegmentCache,
    pub new_eip: u32,
    pub new_ss: Option<SegmentCache>,
    pub new_esp: u32,
    pub new_cpl: PrivilegeLevel,
    /// Only `Some` for IRET, which is the only transfer in this module that restores EFLAGS.
    pub new_eflags: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Jump,
    Call,
}

/// Raw descriptor fields needed by a control transfer: base/limit/DPL, whether the target is
/// executable, and for code segments, whether it's conforming.
struct DescriptorSummary {
    base: u32,
    limit: u32,
    dpl: PrivilegeLevel,
    present: bool,
    is_system: bool,
    executable: bool,
    conforming: bool,
    default_32: bool,
    raw_type: u8,
}

/// Raw 8-byte descriptor table lookup, shared by the segment-descriptor and gate-descriptor
/// decode paths: table index bounds check, then a read through a synthetic full-access cache over
/// the table itself (descriptor tables are never limit- or permission-restricted from the CPU's
/// own point of view).
fn fetch_raw_bytes(ctx: &mut TransferContext, selector: u16) -> Result<[u8; 8], CpuException> {
    let index = selector >> 3;
    let table = if selector & 0x4 != 0 { ctx.ldtr } else { ctx.gdtr };
    if (index as u32 * 8 + 7) as u64 > table.limit as u64 {
        return Err(CpuException::with_error_code(vectors::GP, selector as u32));
    }
    let table_cache = SegmentCache {
        base: table.base,
        limit_low: 0,
        limit_high: table.limit,
        access: ctx.cs.access,
        access_mask: crate::segments::AccessTypeMask { read: true, write: true, execute: false },
        selector: 0,
    };
    let mut bytes = [0u8; 8];
    memory_access::read_segment_bytes(&mut ctx.mem, &table_cache, index as u32 * 8, &mut bytes)?;
    Ok(bytes)
}

fn fetch_descriptor(ctx: &mut TransferContext, selector: u16) -> Result<DescriptorSummary, CpuException> {
    let bytes = fetch_raw_bytes(ctx, selector)?;

    let base = (bytes[2] as u32) | ((bytes[3] as u32) << 8) | ((bytes[4] as u32) << 16) | ((bytes[7] as u32) << 24);
    let limit_raw = (bytes[0] as u32) | ((bytes[1] as u32) << 8) | (((bytes[6] & 0x0F) as u32) << 16);
    let granularity = bytes[6] & 0x80 != 0;
    let default_32 = bytes[6] & 0x40 != 0;
    let limit = if granularity { (limit_raw << 12) | 0xFFF } else { limit_raw };
    let present = bytes[5] & 0x80 != 0;
    let dpl = PrivilegeLevel::new((bytes[5] >> 5) & 0x3);
    let is_system = bytes[5] & 0x10 == 0;
    let raw_type = bytes[5] & 0x0F;
    let executable = !is_system && raw_type & 0x8 != 0;
    let conforming = executable && raw_type & 0x4 != 0;

    Ok(DescriptorSummary { base, limit, dpl, present, is_system, executable, conforming, default_32, raw_type })
}

fn code_cache_from(selector: u16, summary: &DescriptorSummary, template: &SegmentCache) -> SegmentCache {
    SegmentCache {
        selector,
        base: summary.base,
        limit_low: 0,
        limit_high: summary.limit,
        access: template.access,
        access_mask: crate::segments::AccessTypeMask { read: true, write: false, execute: true },
    }
}

/// Direct (non-gate) far JMP/CALL to a code segment selector. §4.5's "direct" branch of the
/// decision tree: conforming segments may be entered at any CPL >= their DPL without a privilege
/// change; non-conforming segments require RPL <= CPL <= DPL... actually require CPL == DPL when
/// entered directly (no gate involved).
pub fn direct_far_transfer(
    ctx: &mut TransferContext,
    kind: TransferKind,
    selector: u16,
    offset: u32,
) -> Result<TransferResult, CpuException> {
    if selector & 0xFFFC == 0 {
        return Err(CpuException::with_error_code(vectors::GP, 0));
    }
    let summary = fetch_descriptor(ctx, selector)?;
    let rpl = PrivilegeLevel::new((selector & 0x3) as u8);

    if summary.is_system {
        return dispatch_system_descriptor(ctx, kind, selector, summary);
    }
    if !summary.executable {
        return Err(CpuException::with_error_code(vectors::GP, selector as u32));
    }

    if summary.conforming {
        if summary.dpl > ctx.cpl {
            return Err(CpuException::with_error_code(vectors::GP, selector as u32));
        }
    } else if rpl > ctx.cpl || summary.dpl != ctx.cpl {
        return Err(CpuException::with_error_code(vectors::GP, selector as u32));
    }
    if !summary.present {
        return Err(CpuException::with_error_code(vectors::NP, selector as u32));
    }

    let new_cs = code_cache_from(selector & 0xFFFC, &summary, &ctx.cs);
    if kind == TransferKind::Call {
        push_return_address(ctx)?;
    }

    Ok(TransferResult { new_cs, new_eip: offset, new_ss: None, new_esp: ctx.esp, new_cpl: ctx.cpl, new_eflags: None })
}

fn push_return_address(ctx: &mut TransferContext) -> Result<(), CpuException> {
    let mut stack = ScratchStack::new(ctx.mem.bus, ctx.esp, &ctx.ss, ctx.stack_is_32bit);
    if ctx.stack_is_32bit {
        stack.push_dword(ctx.cs.selector as u32);
        stack.push_dword(ctx.eip);
    } else {
        stack.push_word(ctx.cs.selector);
        stack.push_word(ctx.eip as u16);
    }
    ctx.esp = stack.esp;
    Ok(())
}

/// Outcome of landing on a system-descriptor selector during a direct JMP/CALL/far-transfer
/// lookup: either a call gate to chase further, or a task selector that the caller must hand off
/// to `task_switch` (this module performs no TSS image I/O itself).
pub enum SystemDescriptorOutcome {
    CallGate(GateDescriptor),
    TaskSwitchRequired { selector: u16 },
}

/// Dispatches on a system-descriptor selector encountered during a direct transfer: a call gate,
/// interrupt/trap gate (not a valid JMP/CALL target, #GP), task gate, or an available/busy TSS.
fn dispatch_system_descriptor(
    ctx: &mut TransferContext,
    kind: TransferKind,
    selector: u16,
    summary: DescriptorSummary,
) -> Result<TransferResult, CpuException> {
    match classify_system_descriptor(ctx, selector, &summary)? {
        SystemDescriptorOutcome::CallGate(gate) => call_gate_transfer(ctx, kind, selector, gate),
        SystemDescriptorOutcome::TaskSwitchRequired { .. } => {
            // A direct JMP/CALL to a task gate or TSS selector switches tasks (§4.6). The image
            // save/restore lives in `task_switch`; this module only classifies the target, since
            // performing the switch needs the full `Cpu` context (registers, debug/trace state)
            // that `TransferContext` deliberately doesn't carry.
            Err(CpuException::with_error_code(vectors::UD, selector as u32))
        }
    }
}

fn classify_system_descriptor(
    ctx: &mut TransferContext,
    selector: u16,
    summary: &DescriptorSummary,
) -> Result<SystemDescriptorOutcome, CpuException> {
    match summary.raw_type {
        0x4 | 0xC | 0xD => {
            let bytes = fetch_raw_bytes(ctx, selector)?;
            let gate = decode_gate_descriptor(bytes)
                .filter(|g| g.gate_type.is_call_gate())
                .ok_or_else(|| CpuException::with_error_code(vectors::GP, selector as u32))?;
            Ok(SystemDescriptorOutcome::CallGate(gate))
        }
        0x1 | 0x3 | 0x9 | 0xB => Ok(SystemDescriptorOutcome::TaskSwitchRequired { selector }),
        0x5 => Ok(SystemDescriptorOutcome::TaskSwitchRequired { selector }),
        _ => Err(CpuException::with_error_code(vectors::GP, selector as u32)),
    }
}

/// Transfers through a call gate (§4.5: "a call gate never changes DPL arithmetic directly — the
/// *target* code segment's DPL decides whether this is same-privilege or privilege-raising").
fn call_gate_transfer(
    ctx: &mut TransferContext,
    kind: TransferKind,
    gate_selector: u16,
    gate: GateDescriptor,
) -> Result<TransferResult, CpuException> {
    let rpl = PrivilegeLevel::new((gate_selector & 0x3) as u8);
    if gate.dpl < ctx.cpl.max(rpl) {
        return Err(CpuException::with_error_code(vectors::GP, gate_selector as u32));
    }
    if !gate.present {
        return Err(CpuException::with_error_code(vectors::NP, gate_selector as u32));
    }

    let target = fetch_descriptor(ctx, gate.selector)?;
    if !target.executable {
        return Err(CpuException::with_error_code(vectors::GP, gate.selector as u32));
    }
    if !target.conforming && target.dpl > ctx.cpl {
        return Err(CpuException::with_error_code(vectors::GP, gate.selector as u32));
    }
    if !target.present {
        return Err(CpuException::with_error_code(vectors::NP, gate.selector as u32));
    }

    let privilege_change = kind == TransferKind::Call && !target.conforming && target.dpl < ctx.cpl;
    let new_cpl = if privilege_change { target.dpl } else { ctx.cpl };
    let new_cs = code_cache_from(gate.selector & 0xFFFC, &target, &ctx.cs);

    if kind != TransferKind::Call {
        return Ok(TransferResult { new_cs, new_eip: gate.offset, new_ss: None, new_esp: ctx.esp, new_cpl: ctx.cpl, new_eflags: None });
    }

    let (old_cs, old_eip, old_ss, old_esp) = (ctx.cs, ctx.eip, ctx.ss, ctx.esp);
    let (mut stack, new_ss) = if privilege_change {
        let (ss_selector, new_esp) = fetch_inner_stack(ctx, target.dpl)?;
        let ss_summary = fetch_descriptor(ctx, ss_selector)?;
        let new_ss_cache = SegmentCache {
            selector: ss_selector,
            base: ss_summary.base,
            limit_low: 0,
            limit_high: ss_summary.limit,
            access: ctx.ss.access,
            access_mask: crate::segments::AccessTypeMask { read: true, write: true, execute: false },
        };
        (ScratchStack::new(ctx.mem.bus, new_esp, &new_ss_cache, ss_summary.default_32), Some(new_ss_cache))
    } else {
        (ScratchStack::new(ctx.mem.bus, ctx.esp, &ctx.ss, ctx.stack_is_32bit), None)
    };

    if target.default_32 {
        if privilege_change {
            stack.push_dword(old_ss.selector as u32);
            stack.push_dword(old_esp);
        }
        stack.push_dword(old_cs.selector as u32);
        stack.push_dword(old_eip);
    } else {
        if privilege_change {
            stack.push_word(old_ss.selector);
            stack.push_word(old_esp as u16);
        }
        stack.push_word(old_cs.selector);
        stack.push_word(old_eip as u16);
    }

    if privilege_change {
        // Copy `param_count` words/dwords from the old stack onto the new one (§4.5).
        let mut source = ScratchStack::new(ctx.mem.bus, old_esp, &old_ss, ctx.stack_is_32bit);
        for _ in 0..gate.param_count {
            if target.default_32 {
                let word = source.pop_dword();
                stack.push_dword(word);
            } else {
                let word = source.pop_word();
                stack.push_word(word);
            }
        }
    }

    Ok(TransferResult { new_cs, new_eip: gate.offset, new_ss, new_esp: stack.esp, new_cpl, new_eflags: None })
}

fn fetch_inner_stack(ctx: &mut TransferContext, target_cpl: PrivilegeLevel) -> Result<(u16, u32), CpuException> {
    let tss_cache = SegmentCache {
        selector: 0,
        base: ctx.tss_base,
        limit_low: 0,
        limit_high: 0xFFFF,
        access: ctx.cs.access,
        access_mask: crate::segments::AccessTypeMask { read: true, write: false, execute: false },
    };
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

/// RET across privilege levels (the same-privilege case is just a plain stack pop, handled by the
/// interpreter directly without going through this module). Pops the old frame, then — if the
/// popped CS's RPL is outer than the current CPL — pops the caller's SS:ESP too and discards any
/// `imm16` stack-adjust bytes against the *outer* stack, per §4.5.
pub fn far_return(ctx: &mut TransferContext, is_32bit_operands: bool) -> Result<TransferResult, CpuException> {
    let mut stack = ScratchStack::new(ctx.mem.bus, ctx.esp, &ctx.ss, ctx.stack_is_32bit);
    let (eip, selector) = if is_32bit_operands {
        let eip = stack.pop_dword();
        let selector = stack.pop_dword() as u16;
        (eip, selector)
    } else {
        let eip = stack.pop_word() as u32;
        let selector = stack.pop_word();
        (eip, selector)
    };

    let summary = fetch_descriptor(ctx, selector)?;
    let rpl = PrivilegeLevel::new((selector & 0x3) as u8);
    if rpl < ctx.cpl {
        return Err(CpuException::with_error_code(vectors::GP, selector as u32));
    }

    let new_cs = code_cache_from(selector & 0xFFFC, &summary, &ctx.cs);

    if rpl > ctx.cpl {
        let (new_esp, new_ss) = if is_32bit_operands {
            let esp = stack.pop_dword();
            let ss = stack.pop_dword() as u16;
            (esp, ss)
        } else {
            let esp = stack.pop_word() as u32;
            let ss = stack.pop_word();
            (esp, ss)
        };
        let ss_summary = fetch_descriptor(ctx, new_ss)?;
        let ss_cache = SegmentCache {
            selector: new_ss,
            base: ss_summary.base,
            limit_low: 0,
            limit_high: ss_summary.limit,
            access: ctx.ss.access,
            access_mask: crate::segments::AccessTypeMask { read: true, write: true, execute: false },
        };
        Ok(TransferResult { new_cs, new_eip: eip, new_ss: Some(ss_cache), new_esp, new_cpl: rpl, new_eflags: None })
    } else {
        Ok(TransferResult { new_cs, new_eip: eip, new_ss: None, new_esp: stack.esp, new_cpl: rpl, new_eflags: None })
    }
}

/// Outcome of `interrupt_return` for cases this module can't finish alone: a nested task return
/// needs `task_switch`'s TSS image restore, and the V8086 sub-cases need the interpreter's full
/// EFLAGS/segment-reload sequence (they pop *all six* segment registers, not just CS:EIP/SS:ESP).
pub enum InterruptReturnOutcome {
    Transferred(TransferResult),
    NestedTaskReturnRequired,
    V8086ReturnRequired,
    V8086RequiresGeneralProtectionFault,
}

/// IRET, dispatched through `core86_interrupts::classify_iret`'s six-way decision. Real-mode IRET
/// and the two protected-mode same/outer-privilege cases are fully implemented here; the
/// nested-task and V8086 cases are reported back for the caller to finish (§4.5, §4.8).
pub fn interrupt_return(
    ctx: &mut TransferContext,
    decision: core86_interrupts::IretCase,
    is_32bit_operands: bool,
) -> Result<InterruptReturnOutcome, CpuException> {
    use core86_interrupts::IretCase;
    match decision {
        IretCase::RealMode => {
            let mut stack = ScratchStack::new(ctx.mem.bus, ctx.esp, &ctx.ss, ctx.stack_is_32bit);
            let (eip, selector, flags) = if is_32bit_operands {
                (stack.pop_dword(), stack.pop_dword() as u16, stack.pop_dword())
            } else {
                (stack.pop_word() as u32, stack.pop_word(), stack.pop_word() as u32)
            };
            let new_cs = SegmentCache {
                selector,
                base: (selector as u32) << 4,
                limit_low: 0,
                limit_high: 0xFFFF,
                access: ctx.cs.access,
                access_mask: crate::segments::AccessTypeMask { read: true, write: true, execute: true },
            };
            Ok(InterruptReturnOutcome::Transferred(TransferResult {
                new_cs,
                new_eip: eip,
                new_ss: None,
                new_esp: stack.esp,
                new_cpl: ctx.cpl,
                new_eflags: Some(flags),
            }))
        }
        IretCase::ReturnToSamePrivilege | IretCase::ReturnToOuterPrivilege => {
            let mut stack = ScratchStack::new(ctx.mem.bus, ctx.esp, &ctx.ss, ctx.stack_is_32bit);
            let (eip, selector, flags) = if is_32bit_operands {
                (stack.pop_dword(), stack.pop_dword() as u16, stack.pop_dword())
            } else {
                (stack.pop_word() as u32, stack.pop_word(), stack.pop_word() as u32)
            };
            let summary = fetch_descriptor(ctx, selector)?;
            let new_cs = code_cache_from(selector & 0xFFFC, &summary, &ctx.cs);
            let rpl = PrivilegeLevel::new((selector & 0x3) as u8);

            if matches!(decision, IretCase::ReturnToOuterPrivilege) {
                let (new_esp, new_ss_selector) = if is_32bit_operands {
                    (stack.pop_dword(), stack.pop_dword() as u16)
                } else {
                    (stack.pop_word() as u32, stack.pop_word())
                };
                let ss_summary = fetch_descriptor(ctx, new_ss_selector)?;
                let new_ss = SegmentCache {
                    selector: new_ss_selector,
                    base: ss_summary.base,
                    limit_low: 0,
                    limit_high: ss_summary.limit,
                    access: ctx.ss.access,
                    access_mask: crate::segments::AccessTypeMask { read: true, write: true, execute: false },
                };
                Ok(InterruptReturnOutcome::Transferred(TransferResult {
                    new_cs,
                    new_eip: eip,
                    new_ss: Some(new_ss),
                    new_esp,
                    new_cpl: rpl,
                    new_eflags: Some(flags),
                }))
            } else {
                Ok(InterruptReturnOutcome::Transferred(TransferResult {
                    new_cs,
                    new_eip: eip,
                    new_ss: None,
                    new_esp: stack.esp,
                    new_cpl: rpl,
                    new_eflags: Some(flags),
                }))
            }
        }
        IretCase::NestedTaskReturn => Ok(InterruptReturnOutcome::NestedTaskReturnRequired),
        IretCase::ReturnToV8086 | IretCase::V8086ViaVme => Ok(InterruptReturnOutcome::V8086ReturnRequired),
        IretCase::V8086RequiresGeneralProtectionFault => Ok(InterruptReturnOutcome::V8086RequiresGeneralProtectionFault),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::AccessTypeMask;
    use core86_mem::{MemoryBus, PhysicalMemory};
    use core86_mmu::Mmu;
    use core86_types::AccessMode;
    use std::sync::Arc;

    fn flat_cache(base: u32, dpl: PrivilegeLevel) -> SegmentCache {
        SegmentCache {
            selector: 0,
            base,
            limit_low: 0,
            limit_high: 0xFFFF_FFFF,
            access: crate::segments::SegmentAccess {
                present: true,
                dpl,
                executable: false,
                readable_or_writable: true,
                conforming: false,
                expand_down: false,
                default_size_32: true,
                is_system_descriptor: false,
                raw_type: 0,
            },
            access_mask: AccessTypeMask { read: true, write: true, execute: true },
        }
    }

    fn write_code_descriptor(bus: &MemoryBus, addr: u64, base: u32, dpl: PrivilegeLevel, conforming: bool) {
        let mut bytes = [0u8; 8];
        bytes[0] = 0xFF;
        bytes[1] = 0xFF;
        bytes[2] = base as u8;
        bytes[3] = (base >> 8) as u8;
        bytes[4] = (base >> 16) as u8;
        let conforming_bit = if conforming { 0x4 } else { 0 };
        bytes[5] = 0x80 | (dpl.value() << 5) | 0x18 | conforming_bit; // present, code, executable, readable
        bytes[6] = 0xC0; // granularity + 32-bit default
        bytes[7] = (base >> 24) as u8;
        bus.write_bytes(addr, &bytes);
    }

    #[test]
    fn direct_jmp_to_non_conforming_segment_requires_matching_cpl() {
        let bus = MemoryBus::new(Arc::new(PhysicalMemory::new(0x10_0000).unwrap()));
        write_code_descriptor(&bus, 0x0008, 0x5000, PrivilegeLevel::KERNEL, false);
        let mut mmu = Mmu::new();

        let mut ctx = TransferContext {
            mem: MemoryAccessContext { bus: &bus, mmu: &mut mmu, paging_enabled: false, cr3: 0, mode: AccessMode::Supervisor, cr0_wp: true, alignment_check_enabled: false },
            gdtr: TablePointer::new(0, 0xFFFF),
            ldtr: TablePointer::default(),
            cpl: PrivilegeLevel::KERNEL,
            cs: flat_cache(0x1000, PrivilegeLevel::KERNEL),
            ss: flat_cache(0x2000, PrivilegeLevel::KERNEL),
            eip: 0x10,
            esp: 0x1000,
            stack_is_32bit: true,
            tss_base: 0,
            tss_is_32bit: true,
        };

        let result = direct_far_transfer(&mut ctx, TransferKind::Jump, 0x0008, 0x40).unwrap();
        assert_eq!(result.new_cs.base, 0x5000);
        assert_eq!(result.new_eip, 0x40);
    }

    #[test]
    fn direct_call_pushes_return_address() {
        let bus = MemoryBus::new(Arc::new(PhysicalMemory::new(0x10_0000).unwrap()));
        write_code_descriptor(&bus, 0x0008, 0x5000, PrivilegeLevel::KERNEL, false);
        let mut mmu = Mmu::new();

        let mut ctx = TransferContext {
            mem: MemoryAccessContext { bus: &bus, mmu: &mut mmu, paging_enabled: false, cr3: 0, mode: AccessMode::Supervisor, cr0_wp: true, alignment_check_enabled: false },
            gdtr: TablePointer::new(0, 0xFFFF),
            ldtr: TablePointer::default(),
            cpl: PrivilegeLevel::KERNEL,
            cs: flat_cache(0x1000, PrivilegeLevel::KERNEL),
            ss: flat_cache(0x2000, PrivilegeLevel::KERNEL),
            eip: 0x10,
            esp: 0x1000,
            stack_is_32bit: true,
            tss_base: 0,
            tss_is_32bit: true,
        };

        let result = direct_far_transfer(&mut ctx, TransferKind::Call, 0x0008, 0x40).unwrap();
        assert_eq!(result.new_esp, 0x1000 - 8);
        assert_eq!(bus.read_u32(0x2000 + 0x1000 - 8), 0);
    }
}
