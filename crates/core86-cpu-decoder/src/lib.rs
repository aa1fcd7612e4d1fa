//! A thin, allocation-free wrapper around `iced-x86`'s decoder (§4.7).
//!
//! The interpreter, cached-interpreter backend, and recompiler all consume the same
//! [`DecodedInstruction`] record, so its representation needs to be cheap to copy (per the
//! dispatch design in the Design Notes) and decoupled from `iced-x86`'s own operand-kind API —
//! downstream code should never need to match on `iced_x86::OpKind` directly. We re-export
//! `iced_x86::Code` as the operation id itself (a plain `Copy` enum, already exactly the "tagged
//! operation descriptor" the dispatch design calls for) and translate operands into
//! [`Operand`], whose register slots describe positions in *our* aliased register file rather
//! than iced's.

use core86_types::{AddressSize, OperandSize, SegmentRegister};
use iced_x86::{Decoder, DecoderOptions, Instruction, Mnemonic, OpKind, Register};

/// Re-exported so callers can match on operations without taking a direct `iced-x86` dependency.
pub use iced_x86::Code as Operation;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("instruction at ip {ip:#x} could not be decoded: {reason}")]
    Invalid { ip: u32, reason: &'static str },
}

/// A general-purpose register slot in the aliased register file (§3.1, §9 Design Notes): `index`
/// is `0..=7` (EAX..EDI ordering), `width` selects which overlapping view is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GprSlot {
    pub index: u8,
    pub width: OperandSize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    Immediate(i64),
    Relative(i64),
    Gpr(GprSlot),
    Segment(SegmentRegister),
    ControlRegister(u8),
    DebugRegister(u8),
    FpuRegister(u8),
    Memory(MemoryOperand),
}

/// A memory operand: `segment:[base + index*scale + displacement]`. `base`/`index` are `None`
/// when absent (e.g. a bare displacement or RIP-relative form, the latter unused outside long
/// mode and thus never produced here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOperand {
    pub segment: SegmentRegister,
    pub base: Option<GprSlot>,
    pub index: Option<GprSlot>,
    pub scale: u8,
    pub displacement: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepPrefix {
    Rep,
    Repe,
    Repne,
}

/// A decoded instruction, normalized for the interpreter/cached-interpreter/recompiler. Cheap to
/// copy: no heap allocation, a fixed-size operand array.
#[derive(Debug, Clone, Copy)]
pub struct DecodedInstruction {
    pub operation: Operation,
    pub operands: [Operand; 4],
    pub operand_count: u8,
    pub length: u8,
    pub segment_override: Option<SegmentRegister>,
    pub rep_prefix: Option<RepPrefix>,
    pub lock_prefix: bool,
    pub operand_size: OperandSize,
    pub address_size: AddressSize,
    pub mnemonic: Mnemonic,
}

impl DecodedInstruction {
    pub fn operand(&self, index: usize) -> Operand {
        self.operands.get(index).copied().unwrap_or(Operand::None)
    }

    /// Whether this instruction is a control-flow exit per §4.9: any branch, any write to
    /// CR0/CR3/CR4, MOV to SS, MOV to a debug register with index >= 3, or INVLPG. Page-boundary
    /// crossing is a property of the *bytes*, not the decode, and is checked by the code cache
    /// itself once it knows the block's physical layout.
    pub fn is_control_flow_exit(&self) -> bool {
        use iced_x86::FlowControl;
        if !matches!(self.operation.flow_control(), FlowControl::Next) {
            return true;
        }
        self.mnemonic == Mnemonic::Invlpg
            || self.writes_cr0_cr3_cr4()
            || self.writes_ss()
            || self.writes_high_debug_register()
    }

    /// Whether this instruction's near-branch target, call, ret, JCXZ/LOOP, Jcc, or INVLPG shape
    /// makes it linkable for direct block chaining (§4.9).
    pub fn is_linkable_exit(&self) -> bool {
        use iced_x86::FlowControl;
        matches!(
            self.operation.flow_control(),
            FlowControl::UnconditionalBranch
                | FlowControl::ConditionalBranch
                | FlowControl::Call
                | FlowControl::Return
        ) || self.mnemonic == Mnemonic::Invlpg
    }

    /// `MOV CRn, reg` writes a control register; `operand(0)` is the destination in this form
    /// (the reverse form, `MOV reg, CRn`, is a read and has `operand(1)` as the control register).
    fn writes_cr0_cr3_cr4(&self) -> bool {
        self.mnemonic == Mnemonic::Mov && matches!(self.operand(0), Operand::ControlRegister(0 | 3 | 4))
    }

    fn writes_ss(&self) -> bool {
        let loads_ss = matches!(self.operand(0), Operand::Segment(SegmentRegister::SS));
        loads_ss && matches!(self.mnemonic, Mnemonic::Mov | Mnemonic::Pop)
    }

    fn writes_high_debug_register(&self) -> bool {
        self.mnemonic == Mnemonic::Mov && matches!(self.operand(0), Operand::DebugRegister(idx) if idx >= 3)
    }
}

fn gpr_slot(register: Register) -> Option<GprSlot> {
    use Register::*;
    let (index, width) = match register {
        AL => (0, OperandSize::Size8),
        CL => (1, OperandSize::Size8),
        DL => (2, OperandSize::Size8),
        BL => (3, OperandSize::Size8),
        AH => (4, OperandSize::Size8),
        CH => (5, OperandSize::Size8),
        DH => (6, OperandSize::Size8),
        BH => (7, OperandSize::Size8),
        AX => (0, OperandSize::Size16),
        CX => (1, OperandSize::Size16),
        DX => (2, OperandSize::Size16),
        BX => (3, OperandSize::Size16),
        SP => (4, OperandSize::Size16),
        BP => (5, OperandSize::Size16),
        SI => (6, OperandSize::Size16),
        DI => (7, OperandSize::Size16),
        EAX => (0, OperandSize::Size32),
        ECX => (1, OperandSize::Size32),
        EDX => (2, OperandSize::Size32),
        EBX => (3, OperandSize::Size32),
        ESP => (4, OperandSize::Size32),
        EBP => (5, OperandSize::Size32),
        ESI => (6, OperandSize::Size32),
        EDI => (7, OperandSize::Size32),
        _ => return None,
    };
    Some(GprSlot { index, width })
}

fn segment_register(register: Register) -> Option<SegmentRegister> {
    match register {
        Register::ES => Some(SegmentRegister::ES),
        Register::CS => Some(SegmentRegister::CS),
        Register::SS => Some(SegmentRegister::SS),
        Register::DS => Some(SegmentRegister::DS),
        Register::FS => Some(SegmentRegister::FS),
        Register::GS => Some(SegmentRegister::GS),
        _ => None,
    }
}

fn control_register_index(register: Register) -> Option<u8> {
    use Register::*;
    Some(match register {
        CR0 => 0,
        CR1 => 1,
        CR2 => 2,
        CR3 => 3,
        CR4 => 4,
        _ => return None,
    })
}

fn debug_register_index(register: Register) -> Option<u8> {
    use Register::*;
    Some(match register {
        DR0 => 0,
        DR1 => 1,
        DR2 => 2,
        DR3 => 3,
        DR4 => 4,
        DR5 => 5,
        DR6 => 6,
        DR7 => 7,
        _ => return None,
    })
}

fn fpu_register_index(register: Register) -> Option<u8> {
    use Register::*;
    Some(match register {
        ST0 => 0,
        ST1 => 1,
        ST2 => 2,
        ST3 => 3,
        ST4 => 4,
        ST5 => 5,
        ST6 => 6,
        ST7 => 7,
        _ => return None,
    })
}

fn memory_operand(instruction: &Instruction) -> MemoryOperand {
    let segment = segment_register(instruction.memory_segment()).unwrap_or(SegmentRegister::DS);
    let base = gpr_slot(instruction.memory_base());
    let index = gpr_slot(instruction.memory_index());
    MemoryOperand {
        segment,
        base,
        index,
        scale: instruction.memory_index_scale() as u8,
        displacement: instruction.memory_displacement64() as i64,
    }
}

fn convert_operand(instruction: &Instruction, op_index: u32) -> Operand {
    match instruction.op_kind(op_index) {
        OpKind::Register => {
            let register = instruction.op_register(op_index);
            if let Some(slot) = gpr_slot(register) {
                Operand::Gpr(slot)
            } else if let Some(segment) = segment_register(register) {
                Operand::Segment(segment)
            } else if let Some(cr) = control_register_index(register) {
                Operand::ControlRegister(cr)
            } else if let Some(dr) = debug_register_index(register) {
                Operand::DebugRegister(dr)
            } else if let Some(st) = fpu_register_index(register) {
                Operand::FpuRegister(st)
            } else {
                Operand::None
            }
        }
        OpKind::Immediate8 => Operand::Immediate(instruction.immediate8() as i64),
        OpKind::Immediate8_2nd => Operand::Immediate(instruction.immediate8_2nd() as i64),
        OpKind::Immediate16 => Operand::Immediate(instruction.immediate16() as i64),
        OpKind::Immediate32 => Operand::Immediate(instruction.immediate32() as i64),
        OpKind::Immediate8to16 => Operand::Immediate(instruction.immediate8to16() as i64),
        OpKind::Immediate8to32 => Operand::Immediate(instruction.immediate8to32() as i64),
        OpKind::NearBranch16 => Operand::Relative(instruction.near_branch16() as i64),
        OpKind::NearBranch32 => Operand::Relative(instruction.near_branch32() as i64),
        OpKind::Memory => Operand::Memory(memory_operand(instruction)),
        _ => Operand::None,
    }
}

/// Decodes exactly one instruction from `bytes`, as if fetched from linear address `ip`.
/// `bitness` is `16` or `32` and selects the default operand/address size before prefix overrides
/// are applied (§4.7: "the working address and operand size from the defaults derived from CS").
pub fn decode_one(bytes: &[u8], ip: u32, bitness: u32) -> Result<DecodedInstruction, DecodeError> {
    let mut decoder = Decoder::with_ip(bitness, bytes, ip as u64, DecoderOptions::NONE);
    if !decoder.can_decode() {
        return Err(DecodeError::Invalid { ip, reason: "no bytes available" });
    }
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return Err(DecodeError::Invalid { ip, reason: "invalid opcode" });
    }

    let mut operands = [Operand::None; 4];
    let operand_count = instruction.op_count().min(4);
    for i in 0..operand_count {
        operands[i as usize] = convert_operand(&instruction, i);
    }

    let segment_override = if instruction.segment_prefix() != Register::None {
        segment_register(instruction.segment_prefix())
    } else {
        None
    };

    let rep_prefix = if instruction.has_repe_prefix() {
        Some(RepPrefix::Repe)
    } else if instruction.has_repne_prefix() {
        Some(RepPrefix::Repne)
    } else if instruction.has_rep_prefix() {
        Some(RepPrefix::Rep)
    } else {
        None
    };

    let operand_size = if instruction.code_size() == iced_x86::CodeSize::Code16 {
        if instruction.has_operand_size_prefix() { OperandSize::Size32 } else { OperandSize::Size16 }
    } else if instruction.has_operand_size_prefix() {
        OperandSize::Size16
    } else {
        OperandSize::Size32
    };

    let default_address_size_32 = bitness != 16;
    let address_size = if default_address_size_32 ^ instruction.has_address_size_prefix() {
        AddressSize::Size32
    } else {
        AddressSize::Size16
    };

    Ok(DecodedInstruction {
        operation: instruction.code(),
        operands,
        operand_count: operand_count as u8,
        length: instruction.len() as u8,
        segment_override,
        rep_prefix,
        lock_prefix: instruction.has_lock_prefix(),
        operand_size,
        address_size,
        mnemonic: instruction.mnemonic(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_simple_mov_reg_imm32() {
        // mov eax, 0x12345678
        let bytes = [0xB8, 0x78, 0x56, 0x34, 0x12];
        let decoded = decode_one(&bytes, 0x1000, 32).unwrap();
        assert_eq!(decoded.length, 5);
        assert_eq!(decoded.operand(0), Operand::Gpr(GprSlot { index: 0, width: OperandSize::Size32 }));
        assert_eq!(decoded.operand(1), Operand::Immediate(0x1234_5678));
    }

    #[test]
    fn decodes_a_memory_operand_with_sib() {
        // mov eax, [ebx + ecx*4 + 0x10]
        let bytes = [0x8B, 0x44, 0x8B, 0x10];
        let decoded = decode_one(&bytes, 0, 32).unwrap();
        match decoded.operand(1) {
            Operand::Memory(mem) => {
                assert_eq!(mem.base, Some(GprSlot { index: 3, width: OperandSize::Size32 }));
                assert_eq!(mem.index, Some(GprSlot { index: 1, width: OperandSize::Size32 }));
                assert_eq!(mem.scale, 4);
                assert_eq!(mem.displacement, 0x10);
            }
            other => panic!("expected memory operand, got {other:?}"),
        }
    }

    #[test]
    fn segment_override_prefix_is_captured() {
        // mov eax, fs:[0]
        let bytes = [0x64, 0xA1, 0x00, 0x00, 0x00, 0x00];
        let decoded = decode_one(&bytes, 0, 32).unwrap();
        assert_eq!(decoded.segment_override, Some(SegmentRegister::FS));
    }

    #[test]
    fn near_conditional_branch_is_a_linkable_control_flow_exit() {
        // jz +2
        let bytes = [0x74, 0x02];
        let decoded = decode_one(&bytes, 0, 32).unwrap();
        assert!(decoded.is_control_flow_exit());
        assert!(decoded.is_linkable_exit());
    }

    #[test]
    fn ordinary_arithmetic_is_not_a_control_flow_exit() {
        // add eax, ecx
        let bytes = [0x01, 0xC8];
        let decoded = decode_one(&bytes, 0, 32).unwrap();
        assert!(!decoded.is_control_flow_exit());
    }

    #[test]
    fn invalid_bytes_report_a_decode_error() {
        let bytes = [0x0F, 0xFF];
        assert!(decode_one(&bytes, 0, 32).is_err());
    }
}
