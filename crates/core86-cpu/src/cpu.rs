//! Top-level architectural state machine (§6): ties the register file, segmentation, paging,
//! x87 state, and the exception/far-control/task-switch machinery together into one executable
//! CPU, and drives the timing manager at each instruction boundary (§4.1's single suspension
//! point, §4.9).
//!
//! `far_control` and `task_switch` each leave a handful of cases to their caller because they
//! need more context than their own argument structs carry (see the doc comments on
//! `SystemDescriptorOutcome::TaskSwitchRequired`, `InterruptReturnOutcome::NestedTaskReturnRequired`
//! /`V8086ReturnRequired`, and `switch_task`'s own doc comment). This module is that caller.

use crate::exceptions::{self, DeliveryContext};
use crate::far_control::{self, InterruptReturnOutcome, TransferContext, TransferKind};
use crate::fpu::FpuState;
use crate::memory_access::{MemoryAccessContext, PrefetchQueue};
use crate::registers::GeneralRegisters;
use crate::segments::{
    self, AccessTypeMask, CpuOperatingMode, SegmentAccess, SegmentCache, SegmentRole, TablePointer, TssCache,
};
use crate::task_switch::{self, TaskDescriptor, TaskState, TaskSwitchSource};
use core86_interrupts::{
    classify_iret, v8086_software_interrupt_decision, vme_bitmap_bit, FaultOutcome, FaultTracker, IretCase,
    IretContext, V8086InterruptDecision,
};
use core86_mem::MemoryBus;
use core86_mmu::Mmu;
use core86_timers::{EventId, TimingManager};
use core86_types::{vectors, AccessMode, CpuException, CpuModel, PrivilegeLevel, SegmentRegister};
use std::sync::Arc;

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_VME: u32 = 1 << 0;
pub const CR4_PVI: u32 = 1 << 1;
pub const CR4_PSE: u32 = 1 << 4;

pub const EFLAG_CF: u32 = 1 << 0;
pub const EFLAG_PF: u32 = 1 << 2;
pub const EFLAG_AF: u32 = 1 << 4;
pub const EFLAG_ZF: u32 = 1 << 6;
pub const EFLAG_SF: u32 = 1 << 7;
pub const EFLAG_TF: u32 = 1 << 8;
pub const EFLAG_IF: u32 = 1 << 9;
pub const EFLAG_DF: u32 = 1 << 10;
pub const EFLAG_OF: u32 = 1 << 11;
pub const EFLAG_IOPL: u32 = 0x3 << 12;
pub const EFLAG_NT: u32 = 1 << 14;
pub const EFLAG_RF: u32 = 1 << 16;
pub const EFLAG_VM: u32 = 1 << 17;
pub const EFLAG_AC: u32 = 1 << 18;
pub const EFLAG_VIF: u32 = 1 << 19;
pub const EFLAG_VIP: u32 = 1 << 20;

/// Reset-time configuration (§6.2): the model to emulate and the initial CS:EIP, which on real
/// hardware is the special `F000:FFF0` reset vector with a non-selector-derived base.
#[derive(Debug, Clone, Copy)]
pub struct CpuConfig {
    pub model: CpuModel,
    pub reset_cs_selector: u16,
    pub reset_cs_base: u32,
    pub reset_eip: u32,
}

impl Default for CpuConfig {
    fn default() -> Self {
        CpuConfig {
            model: CpuModel::I486,
            reset_cs_selector: 0xF000,
            reset_cs_base: 0xFFFF_0000,
            reset_eip: 0x0000_FFF0,
        }
    }
}

/// Why `run_cycles` returned control to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStop {
    Halted,
    BudgetExhausted,
    Stopped,
}

/// The device layer is out of scope for this crate; an external interrupt controller (PIC/APIC)
/// is modelled only as this trait so `run_cycles` can sample it once per instruction boundary
/// without owning it.
pub trait InterruptController {
    fn has_pending(&self) -> bool;
    fn acknowledge(&mut self) -> u8;
}

/// Builds a `MemoryAccessContext` from individually-borrowed fields so callers can still touch
/// other, disjoint fields of `Cpu` while the context is alive (see the Design Notes on avoiding
/// an ambient CPU singleton — this keeps the funnel usable without borrowing all of `self`).
pub(crate) fn build_mem_context<'a>(
    bus: &'a MemoryBus,
    mmu: &'a mut Mmu,
    cr0: u32,
    cr3: u32,
    cpl: PrivilegeLevel,
    eflags: u32,
) -> MemoryAccessContext<'a> {
    MemoryAccessContext {
        bus,
        mmu,
        paging_enabled: cr0 & CR0_PG != 0,
        cr3,
        mode: AccessMode::from_cpl(cpl),
        cr0_wp: cr0 & CR0_WP != 0,
        alignment_check_enabled: cr0 & CR0_AM != 0 && eflags & EFLAG_AC != 0 && cpl == PrivilegeLevel::USER,
    }
}

fn real_mode_segment(bus: &MemoryBus, role: SegmentRole, selector: u16) -> SegmentCache {
    match segments::load_segment(
        bus,
        CpuOperatingMode::Real,
        role,
        selector,
        PrivilegeLevel::KERNEL,
        TablePointer::default(),
        TablePointer::default(),
        false,
    ) {
        Ok(outcome) => outcome.cache,
        Err(_) => SegmentCache::null(),
    }
}

pub struct Cpu {
    pub regs: GeneralRegisters,
    pub eip: u32,
    pub eflags: u32,

    pub cs: SegmentCache,
    pub ss: SegmentCache,
    pub ds: SegmentCache,
    pub es: SegmentCache,
    pub fs: SegmentCache,
    pub gs: SegmentCache,

    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],

    pub gdtr: TablePointer,
    pub idtr: TablePointer,
    pub ldtr: SegmentCache,
    pub ldtr_selector: u16,
    pub tr: TssCache,

    pub fpu: FpuState,

    pub cpl: PrivilegeLevel,
    pub model: CpuModel,

    pub bus: Arc<MemoryBus>,
    pub mmu: Mmu,

    pub prefetch: PrefetchQueue,
    fault_tracker: FaultTracker,

    halted: bool,
    stopped: bool,
    nmi_pending: bool,
    irq_pending: Option<u8>,
    /// Set for exactly one instruction after `STI`/`MOV SS`/`POP SS` (§4.8, the interrupt-shadow
    /// and trap-flag-inhibition rule): no external interrupt, NMI, or single-step trap fires
    /// until the *next* instruction has completed.
    inhibit_interrupts_for_one_instruction: bool,
    pending_cycles: i64,
}

impl Cpu {
    pub fn new(config: CpuConfig, bus: Arc<MemoryBus>) -> Self {
        let mut cpu = Cpu {
            regs: GeneralRegisters::default(),
            eip: 0,
            eflags: 0,
            cs: SegmentCache::null(),
            ss: SegmentCache::null(),
            ds: SegmentCache::null(),
            es: SegmentCache::null(),
            fs: SegmentCache::null(),
            gs: SegmentCache::null(),
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 8],
            gdtr: TablePointer::default(),
            idtr: TablePointer::default(),
            ldtr: SegmentCache::null(),
            ldtr_selector: 0,
            tr: TssCache::null(),
            fpu: FpuState::default(),
            cpl: PrivilegeLevel::KERNEL,
            model: config.model,
            bus,
            mmu: Mmu::new(),
            prefetch: PrefetchQueue::default(),
            fault_tracker: FaultTracker::new(),
            halted: false,
            stopped: false,
            nmi_pending: false,
            irq_pending: None,
            inhibit_interrupts_for_one_instruction: false,
            pending_cycles: 0,
        };
        cpu.reset(config);
        cpu
    }

    /// Architectural reset (§6.2): clears registers, sets CR0/EFLAGS/DR6/DR7 to their documented
    /// power-up values, and loads CS with the special `F000:FFF0`-style reset vector whose base
    /// isn't `selector << 4` like an ordinary real-mode load.
    pub fn reset(&mut self, config: CpuConfig) {
        self.regs = GeneralRegisters::default();
        self.eflags = 0x0000_0002;
        self.cr0 = CR0_ET;
        self.cr2 = 0;
        self.cr3 = 0;
        self.cr4 = 0;
        self.dr = [0; 8];
        self.dr[6] = 0xFFFF_0FF0;
        self.dr[7] = 0x0000_0400;

        self.gdtr = TablePointer::default();
        self.idtr = TablePointer::new(0, 0x3FF);
        self.ldtr = SegmentCache::null();
        self.ldtr_selector = 0;
        self.tr = TssCache::null();

        self.fpu.reset();
        self.cpl = PrivilegeLevel::KERNEL;
        self.model = config.model;

        let mut cs = real_mode_segment(&self.bus, SegmentRole::Code, config.reset_cs_selector);
        cs.base = config.reset_cs_base;
        self.cs = cs;
        self.ss = real_mode_segment(&self.bus, SegmentRole::Stack, 0);
        self.ds = real_mode_segment(&self.bus, SegmentRole::Data, 0);
        self.es = real_mode_segment(&self.bus, SegmentRole::Data, 0);
        self.fs = real_mode_segment(&self.bus, SegmentRole::Data, 0);
        self.gs = real_mode_segment(&self.bus, SegmentRole::Data, 0);

        self.eip = config.reset_eip;
        self.mmu.flush();
        self.prefetch.flush();
        self.fault_tracker = FaultTracker::new();
        self.halted = false;
        self.stopped = false;
        self.nmi_pending = false;
        self.irq_pending = None;
        self.inhibit_interrupts_for_one_instruction = false;
        self.pending_cycles = 0;
    }

    pub fn operating_mode(&self) -> CpuOperatingMode {
        if self.cr0 & CR0_PE == 0 {
            CpuOperatingMode::Real
        } else if self.eflags & EFLAG_VM != 0 {
            CpuOperatingMode::V8086
        } else {
            CpuOperatingMode::Protected
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn halt(&mut self) {
        self.halted = true;
    }

    pub fn stop_execution(&mut self) {
        self.stopped = true;
    }

    /// Level-triggered external interrupt line, sampled once per instruction boundary when
    /// EFLAGS.IF is set (§4.8). Since the interrupt controller is a device and out of scope here,
    /// the vector is supplied directly rather than looked up from a PIC model.
    pub fn set_irq_state(&mut self, asserted: bool, vector: u8) {
        self.irq_pending = if asserted { Some(vector) } else { None };
    }

    pub fn external_interrupt_number(&self) -> Option<u8> {
        self.irq_pending
    }

    pub fn signal_nmi(&mut self) {
        self.nmi_pending = true;
    }

    pub(crate) fn mem_ctx(&mut self) -> MemoryAccessContext<'_> {
        build_mem_context(self.bus.as_ref(), &mut self.mmu, self.cr0, self.cr3, self.cpl, self.eflags)
    }

    /// Runs the CR0 gate every FPU-bearing instruction checks first (§4.11): raises #NM if the
    /// FPU is unavailable (EM set, or TS set and `instruction_bypasses_ts` is false), raises #MF
    /// or asserts IRQ13 if a previous instruction left an unmasked exception pending, per
    /// `fpu::check_fpu_gate`.
    pub(crate) fn check_fpu_gate(&mut self, instruction_bypasses_ts: bool) -> Result<(), CpuException> {
        let gate = crate::fpu::check_fpu_gate(
            self.cr0 & CR0_EM != 0,
            self.cr0 & CR0_TS != 0,
            self.cr0 & CR0_NE != 0,
            instruction_bypasses_ts,
            self.fpu.pending_unmasked_exception(),
        );
        match gate {
            crate::fpu::FpuGate::Proceed => Ok(()),
            crate::fpu::FpuGate::DeviceNotAvailable => Err(CpuException::new(vectors::NM)),
            crate::fpu::FpuGate::ErrorViaException => Err(CpuException::new(vectors::MF)),
            crate::fpu::FpuGate::ErrorViaIrq13 => {
                self.set_irq_state(true, crate::fpu::IRQ13_VECTOR);
                Ok(())
            }
        }
    }

    pub(crate) fn segment_cache(&self, reg: SegmentRegister) -> SegmentCache {
        match reg {
            SegmentRegister::ES => self.es,
            SegmentRegister::CS => self.cs,
            SegmentRegister::SS => self.ss,
            SegmentRegister::DS => self.ds,
            SegmentRegister::FS => self.fs,
            SegmentRegister::GS => self.gs,
        }
    }

    fn set_segment_cache(&mut self, reg: SegmentRegister, cache: SegmentCache) {
        match reg {
            SegmentRegister::ES => self.es = cache,
            SegmentRegister::CS => self.cs = cache,
            SegmentRegister::SS => self.ss = cache,
            SegmentRegister::DS => self.ds = cache,
            SegmentRegister::FS => self.fs = cache,
            SegmentRegister::GS => self.gs = cache,
        }
    }

    /// Loads `selector` into segment register `reg` through the ordinary segment loader (§4.4),
    /// writing back the accessed bit into the backing descriptor table on success.
    pub fn load_segment_register(&mut self, reg: SegmentRegister, selector: u16) -> Result<(), CpuException> {
        let role = segments::segment_role(reg);
        let mode = self.operating_mode();
        let elide = self.model.elides_redundant_accessed_bit_write();
        let outcome = segments::load_segment(&self.bus, mode, role, selector, self.cpl, self.gdtr, self.ldtr_table(), elide)?;
        if let Some((addr, bytes)) = outcome.descriptor_table_write_back {
            self.bus.write_bytes(addr, &bytes);
        }
        self.set_segment_cache(reg, outcome.cache);
        if reg == SegmentRegister::CS {
            self.cpl = outcome.cache.access.dpl;
        }
        Ok(())
    }

    fn ldtr_table(&self) -> TablePointer {
        TablePointer::new(self.ldtr.base, self.ldtr.limit_high)
    }

    /// Loads LDTR itself from a GDT selector (`LLDT`): always fetched from the GDT, never the LDT.
    pub fn load_ldtr(&mut self, selector: u16) -> Result<(), CpuException> {
        if selector & 0xFFFC == 0 {
            self.ldtr = SegmentCache::null();
            self.ldtr_selector = 0;
            return Ok(());
        }
        let outcome = segments::load_segment(
            &self.bus,
            CpuOperatingMode::Protected,
            SegmentRole::Data,
            selector,
            PrivilegeLevel::KERNEL,
            self.gdtr,
            TablePointer::default(),
            false,
        )?;
        if !outcome.cache.access.is_system_descriptor || !matches!(outcome.cache.access.raw_type, 0x2) {
            return Err(CpuException::with_error_code(vectors::GP, selector as u32));
        }
        self.ldtr_selector = selector;
        self.ldtr = SegmentCache {
            limit_high: outcome.cache.limit_high,
            ..outcome.cache
        };
        Ok(())
    }

    /// Loads TR (`LTR`): validates an available (non-busy) TSS descriptor and marks it busy.
    pub fn load_tr(&mut self, selector: u16) -> Result<(), CpuException> {
        let index = selector >> 3;
        if !self.gdtr.contains_index(index) {
            return Err(CpuException::with_error_code(vectors::GP, selector as u32));
        }
        let addr = self.gdtr.base as u64 + index as u64 * 8;
        let mut bytes = [0u8; 8];
        self.bus.read_bytes(addr, &mut bytes);
        let descriptor = task_switch::decode_tss_descriptor(selector, bytes)
            .ok_or_else(|| CpuException::with_error_code(vectors::GP, selector as u32))?;
        if descriptor.busy {
            return Err(CpuException::with_error_code(vectors::GP, selector as u32));
        }
        bytes[5] |= 0x02;
        self.bus.write_bytes(addr, &bytes);
        self.tr = TssCache { selector, base: descriptor.base, limit: descriptor.limit, is_32bit: descriptor.is_32bit, busy: true };
        Ok(())
    }

    fn current_task_descriptor(&self) -> TaskDescriptor {
        TaskDescriptor { selector: self.tr.selector, base: self.tr.base, limit: self.tr.limit, is_32bit: self.tr.is_32bit, busy: self.tr.busy }
    }

    fn outgoing_task_state(&self) -> TaskState {
        TaskState {
            cr3: self.cr3,
            eip: self.eip,
            eflags: self.eflags,
            eax: self.regs.reg32(crate::registers::EAX),
            ecx: self.regs.reg32(crate::registers::ECX),
            edx: self.regs.reg32(crate::registers::EDX),
            ebx: self.regs.reg32(crate::registers::EBX),
            esp: self.regs.reg32(crate::registers::ESP),
            ebp: self.regs.reg32(crate::registers::EBP),
            esi: self.regs.reg32(crate::registers::ESI),
            edi: self.regs.reg32(crate::registers::EDI),
            es: self.es.selector,
            cs: self.cs.selector,
            ss: self.ss.selector,
            ds: self.ds.selector,
            fs: self.fs.selector,
            gs: self.gs.selector,
            ldt_selector: self.ldtr_selector,
            is_32bit: self.tr.is_32bit,
        }
    }

    /// Performs a task switch (§4.6) and resumes execution as the new task: switches CR3 first,
    /// then reloads every segment register (including LDTR) through the ordinary loaders, so any
    /// fault raised while doing so is delivered *as the new task*, per `switch_task`'s own
    /// contract.
    fn perform_task_switch(
        &mut self,
        new_tss_selector: u16,
        source: TaskSwitchSource,
        error_code: Option<u32>,
    ) -> Result<(), CpuException> {
        let current_tss = self.current_task_descriptor();
        let outgoing = self.outgoing_task_state();
        let gdtr = self.gdtr;
        let mut mem = self.mem_ctx();
        let outcome = task_switch::switch_task(&mut mem, gdtr, &current_tss, &outgoing, new_tss_selector, source)?;

        self.tr = TssCache {
            selector: outcome.new_tss.selector,
            base: outcome.new_tss.base,
            limit: outcome.new_tss.limit,
            is_32bit: outcome.new_tss.is_32bit,
            busy: true,
        };

        let state = outcome.new_state;
        self.cr3 = state.cr3;
        self.mmu.flush();
        self.regs.set_reg32(crate::registers::EAX, state.eax);
        self.regs.set_reg32(crate::registers::ECX, state.ecx);
        self.regs.set_reg32(crate::registers::EDX, state.edx);
        self.regs.set_reg32(crate::registers::EBX, state.ebx);
        self.regs.set_reg32(crate::registers::ESP, state.esp);
        self.regs.set_reg32(crate::registers::EBP, state.ebp);
        self.regs.set_reg32(crate::registers::ESI, state.esi);
        self.regs.set_reg32(crate::registers::EDI, state.edi);
        self.eflags = state.eflags;
        self.eip = state.eip;
        self.cpl = PrivilegeLevel::new((state.cs & 0x3) as u8);

        self.load_ldtr(state.ldt_selector)?;
        self.load_segment_register(SegmentRegister::CS, state.cs)?;
        self.load_segment_register(SegmentRegister::SS, state.ss)?;
        if let Some(code) = error_code {
            let cache = self.ss;
            let esp = self.regs.reg32(crate::registers::ESP);
            let mut stack = crate::segments::ScratchStack::new(&self.bus, esp, &cache, state.is_32bit);
            if state.is_32bit {
                stack.push_dword(code);
            } else {
                stack.push_word(code as u16);
            }
            self.regs.set_reg32(crate::registers::ESP, stack.esp);
        }
        self.load_segment_register(SegmentRegister::ES, state.es)?;
        self.load_segment_register(SegmentRegister::DS, state.ds)?;
        if state.is_32bit {
            self.load_segment_register(SegmentRegister::FS, state.fs)?;
            self.load_segment_register(SegmentRegister::GS, state.gs)?;
        }
        self.prefetch.flush();
        Ok(())
    }

    /// Direct far JMP/CALL (§4.5), including the task-gate/TSS case `far_control` can't finish on
    /// its own: intercepted here before calling into it, per `dispatch_system_descriptor`'s doc
    /// comment.
    pub(crate) fn far_transfer(&mut self, kind: TransferKind, selector: u16, offset: u32) -> Result<(), CpuException> {
        if let CpuOperatingMode::Protected = self.operating_mode() {
            if selector & 0xFFFC != 0 {
                let index = selector >> 3;
                let table = if selector & 0x4 != 0 { self.ldtr_table() } else { self.gdtr };
                if table.contains_index(index) {
                    let addr = table.base as u64 + index as u64 * 8;
                    let mut bytes = [0u8; 8];
                    self.bus.read_bytes(addr, &mut bytes);
                    let is_system = bytes[5] & 0x10 == 0;
                    let raw_type = bytes[5] & 0x0F;
                    let is_task_target = is_system && matches!(raw_type, 0x1 | 0x3 | 0x9 | 0xB | 0x5);
                    if is_task_target {
                        let source = if kind == TransferKind::Call { TaskSwitchSource::Call } else { TaskSwitchSource::Jump };
                        return self.perform_task_switch(selector, source, None);
                    }
                }
            }
        }

        let gdtr = self.gdtr;
        let ldtr = self.ldtr_table();
        let cpl = self.cpl;
        let (cs, ss, eip, esp, stack_is_32bit) = (self.cs, self.ss, self.eip, self.regs.reg32(crate::registers::ESP), self.stack_is_32bit());
        let (tss_base, tss_is_32bit) = (self.tr.base, self.tr.is_32bit);
        let mut mem = self.mem_ctx();
        let mut ctx = TransferContext { mem, gdtr, ldtr, cpl, cs, ss, eip, esp, stack_is_32bit, tss_base, tss_is_32bit };
        let result = far_control::direct_far_transfer(&mut ctx, kind, selector, offset)?;
        self.apply_transfer(result);
        Ok(())
    }

    pub(crate) fn far_return(&mut self, is_32bit_operands: bool) -> Result<(), CpuException> {
        let mut ctx = self.transfer_context();
        let result = far_control::far_return(&mut ctx, is_32bit_operands)?;
        self.apply_transfer(result);
        Ok(())
    }

    fn transfer_context(&mut self) -> TransferContext<'_> {
        let gdtr = self.gdtr;
        let ldtr = self.ldtr_table();
        let cpl = self.cpl;
        let (cs, ss, eip, esp) = (self.cs, self.ss, self.eip, self.regs.reg32(crate::registers::ESP));
        let stack_is_32bit = self.stack_is_32bit();
        let (tss_base, tss_is_32bit) = (self.tr.base, self.tr.is_32bit);
        let mem = self.mem_ctx();
        TransferContext { mem, gdtr, ldtr, cpl, cs, ss, eip, esp, stack_is_32bit, tss_base, tss_is_32bit }
    }

    fn apply_transfer(&mut self, result: far_control::TransferResult) {
        self.cs = result.new_cs;
        self.eip = result.new_eip;
        if let Some(ss) = result.new_ss {
            self.ss = ss;
        }
        self.regs.set_reg32(crate::registers::ESP, result.new_esp);
        self.cpl = result.new_cpl;
        if let Some(eflags) = result.new_eflags {
            self.eflags = eflags;
        }
        self.prefetch.flush();
    }

    /// Public so alternate execution backends (`core86-jit`'s block cache) can fold this into
    /// their own block keys without redoing the segment-cache arithmetic.
    pub fn stack_is_32bit(&self) -> bool {
        self.ss.access.default_size_32
    }

    pub fn code_is_32bit(&self) -> bool {
        self.cs.access.default_size_32
    }

    /// IRET (§4.5/§4.8), dispatched through `classify_iret`; finishes the nested-task and V8086
    /// cases `far_control::interrupt_return` reports back instead of handling directly.
    pub(crate) fn execute_iret(&mut self, is_32bit_operands: bool) -> Result<(), CpuException> {
        let mode = self.operating_mode();
        let decision = classify_iret(IretContext {
            real_mode: mode == CpuOperatingMode::Real,
            v8086_mode: mode == CpuOperatingMode::V8086,
            iopl: ((self.eflags & EFLAG_IOPL) >> 12) as u8,
            vme_enabled: self.cr4 & CR4_VME != 0,
            nested_task: self.eflags & EFLAG_NT != 0,
            target_is_v8086: false, // refined below once the popped EFLAGS image is known, for the same-privilege/outer cases this module fully handles
            target_cpl: self.cpl,
            current_cpl: self.cpl,
        });

        if matches!(decision, IretCase::NestedTaskReturn) {
            let back_link = self.tr.selector; // overwritten below by the TSS back-link field
            let _ = back_link;
            let link_selector = self.read_tss_back_link()?;
            return self.perform_task_switch(link_selector, TaskSwitchSource::IretToNestedTask, None);
        }

        if matches!(decision, IretCase::ReturnToV8086 | IretCase::V8086ViaVme) {
            return self.execute_v8086_iret(is_32bit_operands);
        }
        if matches!(decision, IretCase::V8086RequiresGeneralProtectionFault) {
            return Err(CpuException::with_error_code(vectors::GP, 0));
        }

        let mut ctx = self.transfer_context();
        match far_control::interrupt_return(&mut ctx, decision, is_32bit_operands)? {
            InterruptReturnOutcome::Transferred(result) => {
                self.apply_transfer(result);
                Ok(())
            }
            InterruptReturnOutcome::NestedTaskReturnRequired => {
                let link_selector = self.read_tss_back_link()?;
                self.perform_task_switch(link_selector, TaskSwitchSource::IretToNestedTask, None)
            }
            InterruptReturnOutcome::V8086ReturnRequired => self.execute_v8086_iret(is_32bit_operands),
            InterruptReturnOutcome::V8086RequiresGeneralProtectionFault => Err(CpuException::with_error_code(vectors::GP, 0)),
        }
    }

    fn read_tss_back_link(&mut self) -> Result<u16, CpuException> {
        let mut bytes = [0u8; 2];
        self.bus.read_bytes(self.tr.base as u64, &mut bytes);
        Ok(u16::from_le_bytes(bytes))
    }

    /// The V8086-mode IRET's full six-register pop (§4.5, §4.8): EIP, CS, EFLAGS, ESP, SS, and
    /// then ES/DS/FS/GS, all as dwords (a V8086 IRET is always a 32-bit-operand-size form since
    /// it only occurs coming from protected-mode code).
    fn execute_v8086_iret(&mut self, _is_32bit_operands: bool) -> Result<(), CpuException> {
        let cache = self.ss;
        let mut esp = self.regs.reg32(crate::registers::ESP);
        let mut stack = crate::segments::ScratchStack::new(&self.bus, esp, &cache, self.stack_is_32bit());
        let eip = stack.pop_dword();
        let cs = stack.pop_dword() as u16;
        let eflags = stack.pop_dword();
        let new_esp = stack.pop_dword();
        let ss = stack.pop_dword() as u16;
        let es = stack.pop_dword() as u16;
        let ds = stack.pop_dword() as u16;
        let fs = stack.pop_dword() as u16;
        let gs = stack.pop_dword() as u16;
        esp = stack.esp;
        let _ = esp;

        self.eflags = eflags | EFLAG_VM;
        self.eip = eip;
        self.cpl = PrivilegeLevel::USER;
        self.cs = real_mode_segment(&self.bus, SegmentRole::Code, cs);
        self.ss = real_mode_segment(&self.bus, SegmentRole::Stack, ss);
        self.es = real_mode_segment(&self.bus, SegmentRole::Data, es);
        self.ds = real_mode_segment(&self.bus, SegmentRole::Data, ds);
        self.fs = real_mode_segment(&self.bus, SegmentRole::Data, fs);
        self.gs = real_mode_segment(&self.bus, SegmentRole::Data, gs);
        self.regs.set_reg32(crate::registers::ESP, new_esp);
        self.prefetch.flush();
        Ok(())
    }

    /// Raises `vector` via `exceptions::raise`, committing its result to architectural state.
    /// Routes IDT task gates to `task_switch` first, since `exceptions::deliver_protected_mode`
    /// rejects them (per its own doc comment).
    pub fn raise_exception(&mut self, vector: u8, error_code: Option<u32>, software_interrupt: bool) -> Result<(), CpuException> {
        if self.operating_mode() != CpuOperatingMode::Real {
            if let Some(selector) = self.idt_task_gate_target(vector)? {
                return self.perform_task_switch(selector, TaskSwitchSource::InterruptOrException, error_code);
            }
        }

        let mode = self.operating_mode();
        let (idtr, gdtr, ldtr, cpl) = (self.idtr, self.gdtr, self.ldtr_table(), self.cpl);
        let (cs, ss, eip, esp, eflags) = (self.cs, self.ss, self.eip, self.regs.reg32(crate::registers::ESP), self.eflags);
        let stack_is_32bit = self.stack_is_32bit();
        let code_is_32bit = self.code_is_32bit();
        let (tss_base, tss_is_32bit) = (self.tr.base, self.tr.is_32bit);
        let mem = self.mem_ctx();
        let mut ctx = DeliveryContext {
            mem,
            mode,
            idtr,
            gdtr,
            ldtr,
            cpl,
            cs,
            ss,
            eip,
            esp,
            eflags,
            stack_is_32bit,
            code_is_32bit,
            tss_base,
            tss_is_32bit,
        };
        let result = exceptions::raise(&mut ctx, &mut self.fault_tracker, vector, error_code, software_interrupt)?;

        self.cs = result.new_cs;
        self.eip = result.new_eip;
        if let Some(ss) = result.new_ss {
            self.ss = ss;
        }
        self.regs.set_reg32(crate::registers::ESP, result.new_esp);
        self.eflags = result.new_eflags;
        self.cpl = result.new_cpl;
        self.prefetch.flush();
        Ok(())
    }

    fn idt_task_gate_target(&mut self, vector: u8) -> Result<Option<u16>, CpuException> {
        let gate_addr = vector as u32 * 8;
        if gate_addr as u64 + 7 > self.idtr.limit as u64 {
            return Ok(None);
        }
        let mut bytes = [0u8; 8];
        self.bus.read_bytes(self.idtr.base as u64 + gate_addr as u64, &mut bytes);
        match core86_interrupts::decode_gate_descriptor(bytes) {
            Some(gate) if gate.gate_type == core86_interrupts::GateType::Task => Ok(Some(gate.selector)),
            _ => Ok(None),
        }
    }

    /// Software `INT n`/`INT3`/`INTO` (§4.8): resolves the V8086 redirection decision first when
    /// applicable, then delivers.
    pub fn execute_software_interrupt(&mut self, vector: u8) -> Result<(), CpuException> {
        if self.operating_mode() == CpuOperatingMode::V8086 {
            let iopl = ((self.eflags & EFLAG_IOPL) >> 12) as u8;
            let vme_enabled = self.cr4 & CR4_VME != 0;
            let redirection_bit = if vme_enabled { self.vme_redirection_bit(vector) } else { None };
            match v8086_software_interrupt_decision(iopl, vme_enabled, redirection_bit) {
                V8086InterruptDecision::DeliverViaRealModeIvt => {
                    return self.deliver_via_real_ivt(vector);
                }
                V8086InterruptDecision::DeliverViaProtectedIdt => {}
                V8086InterruptDecision::GeneralProtectionFault => {
                    return Err(CpuException::with_error_code(vectors::GP, 0));
                }
            }
        }
        self.raise_exception(vector, None, true)
    }

    fn vme_redirection_bit(&mut self, vector: u8) -> Option<bool> {
        if self.tr.limit < 0x67 + 32 {
            return None;
        }
        let mut bitmap = [0u8; 32];
        self.bus.read_bytes(self.tr.base as u64 + 0x68, &mut bitmap);
        Some(vme_bitmap_bit(&bitmap, vector))
    }

    fn deliver_via_real_ivt(&mut self, vector: u8) -> Result<(), CpuException> {
        let (cs, ss, eip, esp, eflags) = (self.cs, self.ss, self.eip, self.regs.reg32(crate::registers::ESP), self.eflags);
        let mem = self.mem_ctx();
        let mut ctx = DeliveryContext {
            mem,
            mode: CpuOperatingMode::Real,
            idtr: self.idtr,
            gdtr: self.gdtr,
            ldtr: self.ldtr_table(),
            cpl: self.cpl,
            cs,
            ss,
            eip,
            esp,
            eflags,
            stack_is_32bit: false,
            code_is_32bit: false,
            tss_base: self.tr.base,
            tss_is_32bit: self.tr.is_32bit,
        };
        let result = exceptions::deliver_real_mode(&mut ctx, vector)?;
        self.cs = result.new_cs;
        self.eip = result.new_eip;
        self.regs.set_reg32(crate::registers::ESP, result.new_esp);
        self.eflags = (result.new_eflags & !EFLAG_VM) | (self.eflags & EFLAG_VM);
        self.prefetch.flush();
        Ok(())
    }

    /// Samples NMI/external-interrupt state and delivers one if eligible (§4.8): NMI always takes
    /// priority and ignores IF; a maskable interrupt requires IF set and no active shadow from a
    /// `STI`/`MOV SS`/`POP SS` the previous instruction.
    /// Public hook for alternate execution backends (`core86-jit`'s cached-interpreter and
    /// recompiler tiers) that drive their own instruction-retirement loop instead of
    /// `run_cycles`, so every tier samples interrupts at the same instruction-boundary points.
    pub fn service_pending_interrupts(&mut self, controller: Option<&mut dyn InterruptController>) {
        self.service_pending_interrupts_inner(controller)
    }

    fn service_pending_interrupts_inner(&mut self, controller: Option<&mut dyn InterruptController>) {
        if self.inhibit_interrupts_for_one_instruction {
            self.inhibit_interrupts_for_one_instruction = false;
            return;
        }
        if self.nmi_pending {
            self.nmi_pending = false;
            let _ = self.raise_exception(vectors::NMI, None, false);
            return;
        }
        if self.eflags & EFLAG_IF == 0 {
            return;
        }
        if let Some(vector) = self.irq_pending.take() {
            let _ = self.raise_exception(vector, None, false);
            return;
        }
        if let Some(controller) = controller {
            if controller.has_pending() {
                let vector = controller.acknowledge();
                let _ = self.raise_exception(vector, None, false);
            }
        }
    }

    /// Runs instructions until at least `cycles` have been charged to `pending_cycles`, the CPU
    /// halts, or `stop_execution` is observed; commits consumed time to `timing` as it goes
    /// (§4.1's single suspension point).
    pub fn run_cycles(&mut self, cycles: i64, timing: &mut TimingManager, mut controller: Option<&mut dyn InterruptController>) -> RunStop {
        self.stopped = false;
        self.pending_cycles += cycles;

        while self.pending_cycles > 0 {
            if self.stopped {
                return RunStop::Stopped;
            }
            if self.halted {
                let charge = self.pending_cycles;
                self.commit_pending_cycles(timing, charge);
                return RunStop::Halted;
            }

            self.service_pending_interrupts(controller.as_deref_mut());

            match self.execute_one() {
                Ok(charged) => {
                    self.pending_cycles -= charged as i64;
                    self.commit_pending_cycles(timing, charged as i64);
                }
                Err(exception) => {
                    let _ = self.raise_exception(exception.vector, exception.error_code, false);
                    // A minimal charge so a tight fault loop still advances virtual time.
                    self.pending_cycles -= 1;
                    self.commit_pending_cycles(timing, 1);
                }
            }
        }
        RunStop::BudgetExhausted
    }

    fn commit_pending_cycles(&self, timing: &mut TimingManager, cycles: i64) {
        if cycles > 0 {
            timing.add_pending_time(cycles);
        }
    }

    /// Architectural TSC-style cycle counter, derived from the timing manager's own running total
    /// rather than a separate counter (§6.3's supplemented `RDTSC` support).
    pub fn cycles_since_reset(timing: &TimingManager) -> i64 {
        timing.total_emulated_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core86_mem::PhysicalMemory;

    fn make_cpu() -> Cpu {
        let bus = Arc::new(MemoryBus::new(Arc::new(PhysicalMemory::new(0x10_0000).unwrap())));
        Cpu::new(CpuConfig::default(), bus)
    }

    #[test]
    fn reset_lands_on_the_f000_ffff0000_vector() {
        let cpu = make_cpu();
        assert_eq!(cpu.cs.selector, 0xF000);
        assert_eq!(cpu.cs.base, 0xFFFF_0000);
        assert_eq!(cpu.eip, 0x0000_FFF0);
        assert_eq!(cpu.operating_mode(), CpuOperatingMode::Real);
    }

    #[test]
    fn reset_clears_pending_interrupts_and_halt() {
        let mut cpu = make_cpu();
        cpu.halt();
        cpu.signal_nmi();
        cpu.reset(CpuConfig::default());
        assert!(!cpu.is_halted());
    }

    #[test]
    fn irq_state_latches_until_acknowledged_by_service() {
        let mut cpu = make_cpu();
        cpu.set_irq_state(true, 0x20);
        assert_eq!(cpu.external_interrupt_number(), Some(0x20));
        cpu.set_irq_state(false, 0x20);
        assert_eq!(cpu.external_interrupt_number(), None);
    }
}
