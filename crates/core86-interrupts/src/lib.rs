//! Gate classification, fault/double-fault/triple-fault tracking, and the V8086/VME interrupt
//! redirection decision (§4.5–§4.7, §7). This crate holds the *decisions*; `core86-cpu` owns the
//! actual stack pushes, descriptor fetches, and control transfers those decisions drive, since
//! those require bus and segment access this crate deliberately has no dependency on.

use core86_types::{vectors, PrivilegeLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateType {
    Task,
    Interrupt16,
    Interrupt32,
    Trap16,
    Trap32,
    CallGate16,
    CallGate32,
}

impl GateType {
    pub fn is_call_gate(self) -> bool {
        matches!(self, GateType::CallGate16 | GateType::CallGate32)
    }

    pub fn is_32bit(self) -> bool {
        matches!(self, GateType::Interrupt32 | GateType::Trap32 | GateType::CallGate32)
    }

    /// Whether delivering through this gate clears EFLAGS.IF (§7: "cleared for interrupt gates
    /// but not trap gates").
    pub fn clears_interrupt_flag(self) -> bool {
        matches!(self, GateType::Interrupt16 | GateType::Interrupt32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDescriptor {
    pub gate_type: GateType,
    pub selector: u16,
    pub offset: u32,
    pub dpl: PrivilegeLevel,
    pub present: bool,
    /// Call gates only: number of dword/word parameters to copy to the new stack.
    pub param_count: u8,
}

/// Decodes a raw 8-byte IDT/GDT/LDT gate descriptor. Returns `None` for a system-descriptor type
/// byte that isn't one of the gate/task-gate encodings (e.g. an ordinary code/data segment,
/// which the caller should instead interpret as a segment descriptor).
pub fn decode_gate_descriptor(bytes: [u8; 8]) -> Option<GateDescriptor> {
    let offset_low = u16::from_le_bytes([bytes[0], bytes[1]]);
    let selector = u16::from_le_bytes([bytes[2], bytes[3]]);
    let param_count = bytes[4] & 0x1F;
    let type_attr = bytes[5];
    let offset_high = u16::from_le_bytes([bytes[6], bytes[7]]);

    let present = type_attr & 0x80 != 0;
    let dpl = PrivilegeLevel::new((type_attr >> 5) & 0x3);
    let type_field = type_attr & 0x0F;

    let gate_type = match type_field {
        0x5 => GateType::Task,
        0x6 => GateType::Interrupt16,
        0x7 => GateType::Trap16,
        0xC => GateType::CallGate16, // documented as reserved pre-286 but decoded the same shape
        0xE => GateType::Interrupt32,
        0xF => GateType::Trap32,
        0x4 => GateType::CallGate16,
        0xD => GateType::CallGate32,
        _ => return None,
    };

    let offset = if gate_type.is_32bit() {
        (offset_high as u32) << 16 | offset_low as u32
    } else {
        offset_low as u32
    };

    Some(GateDescriptor { gate_type, selector, offset, dpl, present, param_count })
}

/// Decodes a real-mode IVT entry: `(segment, offset)`, 4 bytes, offset first.
pub fn decode_ivt_entry(bytes: [u8; 4]) -> (u16, u16) {
    let offset = u16::from_le_bytes([bytes[0], bytes[1]]);
    let segment = u16::from_le_bytes([bytes[2], bytes[3]]);
    (segment, offset)
}

/// Whether `vector`'s delivery convention includes pushing a (possibly synthetic) error code.
pub fn requires_error_code(vector: u8) -> bool {
    matches!(
        vector,
        vectors::DF | vectors::TS | vectors::NP | vectors::SS | vectors::GP | vectors::PF | vectors::AC
    )
}

/// Tracks nested fault delivery to detect double faults and triple faults (§7): a second
/// exception raised while the first is still being delivered becomes #DF; a second exception
/// raised while #DF itself is being delivered is a triple fault (CPU reset).
#[derive(Debug, Default)]
pub struct FaultTracker {
    delivering: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    Deliver(u8),
    DoubleFault,
    TripleFault,
}

impl FaultTracker {
    pub fn new() -> Self {
        FaultTracker { delivering: None }
    }

    pub fn begin_delivery(&mut self, vector: u8) -> FaultOutcome {
        let outcome = match self.delivering {
            None => FaultOutcome::Deliver(vector),
            Some(vectors::DF) => FaultOutcome::TripleFault,
            Some(_) => FaultOutcome::DoubleFault,
        };
        self.delivering = Some(match outcome {
            FaultOutcome::Deliver(v) => v,
            FaultOutcome::DoubleFault => vectors::DF,
            FaultOutcome::TripleFault => vectors::DF,
        });
        outcome
    }

    /// Called once a delivery completes successfully (§7: "a successful delivery clears
    /// `current_exception`").
    pub fn end_delivery(&mut self) {
        self.delivering = None;
    }

    pub fn is_delivering(&self) -> bool {
        self.delivering.is_some()
    }
}

/// Decision for a software `INT n` executed in V8086 mode (§4.6/glossary "V8086 mode"): whether
/// it runs through the real-mode IVT, is redirected to the protected-mode IDT via the VME
/// bitmap, or is rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V8086InterruptDecision {
    DeliverViaRealModeIvt,
    DeliverViaProtectedIdt,
    GeneralProtectionFault,
}

/// `iopl` is the current EFLAGS.IOPL (0..=3); `redirection_bit` is `Some(bit)` from the TSS's
/// 32-byte interrupt redirection bitmap when VME is enabled and the TSS has one, `None` if VME
/// is enabled but the bitmap doesn't cover this vector (treated as "intercept").
pub fn v8086_software_interrupt_decision(
    iopl: u8,
    vme_enabled: bool,
    redirection_bit: Option<bool>,
) -> V8086InterruptDecision {
    if iopl == 3 {
        return V8086InterruptDecision::DeliverViaRealModeIvt;
    }
    if vme_enabled {
        match redirection_bit {
            Some(false) => V8086InterruptDecision::DeliverViaRealModeIvt,
            _ => V8086InterruptDecision::DeliverViaProtectedIdt,
        }
    } else {
        V8086InterruptDecision::GeneralProtectionFault
    }
}

/// Tests bit `vector` of a 256-bit (32-byte) VME interrupt redirection bitmap.
pub fn vme_bitmap_bit(bitmap: &[u8; 32], vector: u8) -> bool {
    let byte = bitmap[(vector / 8) as usize];
    byte & (1 << (vector % 8)) != 0
}

/// The six IRET sub-cases from §4.5, as a pure classification over already-known CPU state. The
/// caller (`core86-cpu`) still performs the actual stack pops and segment loads; this only picks
/// which algorithm applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IretCase {
    RealMode,
    V8086RequiresGeneralProtectionFault,
    V8086ViaVme,
    NestedTaskReturn,
    ReturnToV8086,
    ReturnToOuterPrivilege,
    ReturnToSamePrivilege,
}

#[derive(Debug, Clone, Copy)]
pub struct IretContext {
    pub real_mode: bool,
    pub v8086_mode: bool,
    pub iopl: u8,
    pub vme_enabled: bool,
    pub nested_task: bool,
    pub target_is_v8086: bool,
    pub target_cpl: PrivilegeLevel,
    pub current_cpl: PrivilegeLevel,
}

pub fn classify_iret(ctx: IretContext) -> IretCase {
    if ctx.real_mode {
        return IretCase::RealMode;
    }
    if ctx.v8086_mode {
        return if ctx.iopl == 3 {
            IretCase::RealMode
        } else if ctx.vme_enabled {
            IretCase::V8086ViaVme
        } else {
            IretCase::V8086RequiresGeneralProtectionFault
        };
    }
    if ctx.nested_task {
        return IretCase::NestedTaskReturn;
    }
    if ctx.target_is_v8086 {
        return IretCase::ReturnToV8086;
    }
    if ctx.target_cpl > ctx.current_cpl {
        IretCase::ReturnToOuterPrivilege
    } else {
        IretCase::ReturnToSamePrivilege
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_32bit_interrupt_gate() {
        // offset_low=0x1000, selector=0x0008, 0 params, type_attr=0x8E (present, dpl0, int32), offset_high=0x0001
        let bytes = [0x00, 0x10, 0x08, 0x00, 0x00, 0x8E, 0x01, 0x00];
        let gate = decode_gate_descriptor(bytes).unwrap();
        assert_eq!(gate.gate_type, GateType::Interrupt32);
        assert_eq!(gate.selector, 0x0008);
        assert_eq!(gate.offset, 0x0001_1000);
        assert!(gate.present);
        assert_eq!(gate.dpl, PrivilegeLevel::KERNEL);
    }

    #[test]
    fn interrupt_gates_clear_if_trap_gates_dont() {
        assert!(GateType::Interrupt32.clears_interrupt_flag());
        assert!(!GateType::Trap32.clears_interrupt_flag());
    }

    #[test]
    fn fault_during_fault_becomes_double_fault_then_triple() {
        let mut tracker = FaultTracker::new();
        assert_eq!(tracker.begin_delivery(vectors::GP), FaultOutcome::Deliver(vectors::GP));
        assert_eq!(tracker.begin_delivery(vectors::GP), FaultOutcome::DoubleFault);
        assert_eq!(tracker.begin_delivery(vectors::GP), FaultOutcome::TripleFault);
    }

    #[test]
    fn end_delivery_resets_tracking() {
        let mut tracker = FaultTracker::new();
        tracker.begin_delivery(vectors::UD);
        tracker.end_delivery();
        assert_eq!(tracker.begin_delivery(vectors::UD), FaultOutcome::Deliver(vectors::UD));
    }

    #[test]
    fn v8086_full_iopl_always_uses_real_mode_ivt() {
        let decision = v8086_software_interrupt_decision(3, false, None);
        assert_eq!(decision, V8086InterruptDecision::DeliverViaRealModeIvt);
    }

    #[test]
    fn v8086_low_iopl_without_vme_faults() {
        let decision = v8086_software_interrupt_decision(0, false, None);
        assert_eq!(decision, V8086InterruptDecision::GeneralProtectionFault);
    }

    #[test]
    fn v8086_low_iopl_with_vme_follows_bitmap() {
        assert_eq!(
            v8086_software_interrupt_decision(0, true, Some(false)),
            V8086InterruptDecision::DeliverViaRealModeIvt
        );
        assert_eq!(
            v8086_software_interrupt_decision(0, true, Some(true)),
            V8086InterruptDecision::DeliverViaProtectedIdt
        );
    }

    #[test]
    fn vme_bitmap_bit_indexes_correctly() {
        let mut bitmap = [0u8; 32];
        bitmap[1] = 0b0000_0010; // vector 9
        assert!(vme_bitmap_bit(&bitmap, 9));
        assert!(!vme_bitmap_bit(&bitmap, 8));
    }

    #[test]
    fn iret_classification_prioritizes_nested_task_over_privilege_change() {
        let ctx = IretContext {
            real_mode: false,
            v8086_mode: false,
            iopl: 0,
            vme_enabled: false,
            nested_task: true,
            target_is_v8086: false,
            target_cpl: PrivilegeLevel::USER,
            current_cpl: PrivilegeLevel::KERNEL,
        };
        assert_eq!(classify_iret(ctx), IretCase::NestedTaskReturn);
    }

    #[test]
    fn iret_classification_picks_outer_privilege_return() {
        let ctx = IretContext {
            real_mode: false,
            v8086_mode: false,
            iopl: 0,
            vme_enabled: false,
            nested_task: false,
            target_is_v8086: false,
            target_cpl: PrivilegeLevel::USER,
            current_cpl: PrivilegeLevel::KERNEL,
        };
        assert_eq!(classify_iret(ctx), IretCase::ReturnToOuterPrivilege);
    }
}
