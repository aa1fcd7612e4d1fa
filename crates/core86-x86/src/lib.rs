//! Model selection (§6.4): everything that differs between a 386, a 486, and a Pentium, without
//! touching the interpreter's control flow. A `CpuModel` (in `core86-types`) picks a row out of
//! every table here; the interpreter and register file only ever consult the table, never branch
//! on the model directly.

use core86_cpu_decoder::DecodedInstruction;
use core86_types::CpuModel;

/// A coarse classification of instructions sharing the same cycle cost (glossary: "cycle
/// group"). The interpreter charges `CYCLE_TABLE[group][mode][operand_kind]` to `pending_cycles`
/// after executing each instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleGroup {
    RegMove,
    Arithmetic,
    Multiply,
    Divide,
    Shift,
    StringOp,
    Branch,
    Call,
    PushPop,
    Interrupt,
    SegmentLoad,
    ProtectionCheck,
    Fpu,
    Misc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    RealOrV86,
    Protected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    Register,
    Memory,
}

/// Cycle counts for `(386, 486, Pentium)`, one row per `(mode, operand_kind)` pair.
#[derive(Debug, Clone, Copy)]
struct CycleRow {
    real_reg: [u32; 3],
    real_mem: [u32; 3],
    pmode_reg: [u32; 3],
    pmode_mem: [u32; 3],
}

const fn uniform(values: [u32; 3]) -> CycleRow {
    CycleRow { real_reg: values, real_mem: values, pmode_reg: values, pmode_mem: values }
}

fn cycle_row(group: CycleGroup) -> CycleRow {
    match group {
        CycleGroup::RegMove => CycleRow {
            real_reg: [2, 1, 1],
            real_mem: [4, 2, 1],
            pmode_reg: [2, 1, 1],
            pmode_mem: [5, 3, 1],
        },
        CycleGroup::Arithmetic => CycleRow {
            real_reg: [2, 1, 1],
            real_mem: [7, 3, 2],
            pmode_reg: [2, 1, 1],
            pmode_mem: [8, 4, 2],
        },
        CycleGroup::Multiply => uniform([13, 13, 10]),
        CycleGroup::Divide => uniform([22, 22, 20]),
        CycleGroup::Shift => CycleRow {
            real_reg: [3, 2, 1],
            real_mem: [7, 3, 2],
            pmode_reg: [3, 2, 1],
            pmode_mem: [8, 4, 2],
        },
        CycleGroup::StringOp => uniform([5, 4, 3]),
        CycleGroup::Branch => uniform([7, 3, 1]),
        CycleGroup::Call => uniform([9, 5, 2]),
        CycleGroup::PushPop => CycleRow {
            real_reg: [5, 1, 1],
            real_mem: [7, 3, 2],
            pmode_reg: [5, 1, 1],
            pmode_mem: [7, 3, 2],
        },
        CycleGroup::Interrupt => uniform([37, 30, 16]),
        CycleGroup::SegmentLoad => uniform([9, 6, 3]),
        CycleGroup::ProtectionCheck => uniform([20, 17, 9]),
        CycleGroup::Fpu => uniform([23, 18, 3]),
        CycleGroup::Misc => uniform([2, 1, 1]),
    }
}

fn model_column(model: CpuModel) -> usize {
    match model {
        CpuModel::I386 => 0,
        CpuModel::I486 => 1,
        CpuModel::Pentium => 2,
    }
}

/// Looks up the cycle cost for executing an instruction in `group`, given the current `mode`,
/// `operand_kind`, and the active `model`.
pub fn cycle_cost(group: CycleGroup, mode: CpuMode, operand_kind: OperandKind, model: CpuModel) -> u32 {
    let row = cycle_row(group);
    let column = model_column(model);
    let values = match (mode, operand_kind) {
        (CpuMode::RealOrV86, OperandKind::Register) => row.real_reg,
        (CpuMode::RealOrV86, OperandKind::Memory) => row.real_mem,
        (CpuMode::Protected, OperandKind::Register) => row.pmode_reg,
        (CpuMode::Protected, OperandKind::Memory) => row.pmode_mem,
    };
    values[column]
}

/// A coarse group classification for a decoded instruction, derived from its mnemonic family.
/// Exhaustive opcode-by-opcode tables live in the interpreter's dispatch; this is the
/// fallback/summary view the cycle accounting uses.
pub fn classify(instruction: &DecodedInstruction) -> CycleGroup {
    use iced_x86::Mnemonic::*;
    match instruction.mnemonic {
        Mov | Movzx | Movsx | Lea | Xchg => CycleGroup::RegMove,
        Add | Sub | Adc | Sbb | And | Or | Xor | Cmp | Test | Inc | Dec | Neg | Not => CycleGroup::Arithmetic,
        Mul | Imul => CycleGroup::Multiply,
        Div | Idiv => CycleGroup::Divide,
        Shl | Shr | Sar | Rol | Ror | Rcl | Rcr | Sal => CycleGroup::Shift,
        Movsb | Movsw | Movsd | Stosb | Stosw | Stosd | Lodsb | Lodsw | Lodsd | Scasb | Scasw | Scasd
        | Cmpsb | Cmpsw | Cmpsd => CycleGroup::StringOp,
        Jmp | Ja | Jae | Jb | Jbe | Je | Jg | Jge | Jl | Jle | Jne | Jno | Jnp | Jns | Jo | Jp | Js
        | Jcxz | Jecxz | Loop | Loope | Loopne => CycleGroup::Branch,
        Call | Ret | Retf => CycleGroup::Call,
        Push | Pop | Pushad | Popad | Pushfd | Popfd => CycleGroup::PushPop,
        Int | Int3 | Into | Iret | Iretd => CycleGroup::Interrupt,
        Lds | Les | Lfs | Lgs | Lss => CycleGroup::SegmentLoad,
        Arpl | Lar | Lsl | Verr | Verw | Lgdt | Lidt | Lldt | Ltr | Sgdt | Sidt | Sldt | Str => {
            CycleGroup::ProtectionCheck
        }
        Fld | Fst | Fstp | Fadd | Fsub | Fmul | Fdiv | Fild | Fist | Fistp | Fsave | Frstor | Fxch => {
            CycleGroup::Fpu
        }
        _ => CycleGroup::Misc,
    }
}

pub struct CpuidLeaf1 {
    pub stepping: u8,
    pub model: u8,
    pub family: u8,
    pub features_edx: u32,
}

/// `CPUID` leaf 0 and leaf 1 results for the active model (§6.4): leaf 0 is `(max_leaf=1,
/// "GenuineIntel")`, leaf 1 carries the model/family/stepping byte and a feature bitmap.
pub fn cpuid_vendor_string() -> [u32; 3] {
    // "Genu" "ineI" "ntel" in EBX:EDX:ECX order, per the Intel CPUID convention.
    [0x756e_6547, 0x4965_6e69, 0x6c65_746e]
}

pub fn cpuid_leaf1(model: CpuModel) -> CpuidLeaf1 {
    const FPU: u32 = 1 << 0;
    const VME: u32 = 1 << 1;
    const PSE: u32 = 1 << 3;
    const TSC: u32 = 1 << 4;
    const MSR: u32 = 1 << 5;
    const CX8: u32 = 1 << 8;

    match model {
        CpuModel::I386 => CpuidLeaf1 { stepping: 0, model: 0, family: 3, features_edx: 0 },
        CpuModel::I486 => CpuidLeaf1 {
            stepping: 0,
            model: 0,
            family: 4,
            features_edx: FPU,
        },
        CpuModel::Pentium => CpuidLeaf1 {
            stepping: 3,
            model: 1,
            family: 5,
            features_edx: FPU | VME | PSE | TSC | MSR | CX8,
        },
    }
}

/// Bits of EFLAGS that software can freely modify, beyond the universally-writable arithmetic
/// flags: ID is Pentium-only (its very writability is how CPUID-presence is probed), AC appears
/// on 486+, and VIP/VIF are Pentium-only (VME support).
pub fn eflags_writable_mask(model: CpuModel) -> u32 {
    const AC: u32 = 1 << 18;
    const VIF: u32 = 1 << 19;
    const VIP: u32 = 1 << 20;
    const ID: u32 = 1 << 21;

    match model {
        CpuModel::I386 => 0,
        CpuModel::I486 => AC,
        CpuModel::Pentium => AC | VIF | VIP | ID,
    }
}

/// Bits of CR0 that exist on the given model beyond the common ones (PE/MP/EM/TS/ET): WP (write
/// protect) appears on 486+.
pub fn cr0_change_mask(model: CpuModel) -> u32 {
    const WP: u32 = 1 << 16;
    match model {
        CpuModel::I386 => 0,
        CpuModel::I486 | CpuModel::Pentium => WP,
    }
}

pub fn has_cr4(model: CpuModel) -> bool {
    model.has_cr4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_cost_scales_down_with_newer_models() {
        let i386 = cycle_cost(CycleGroup::Arithmetic, CpuMode::Protected, OperandKind::Memory, CpuModel::I386);
        let pentium = cycle_cost(CycleGroup::Arithmetic, CpuMode::Protected, OperandKind::Memory, CpuModel::Pentium);
        assert!(pentium <= i386);
    }

    #[test]
    fn eflags_mask_grows_with_model() {
        assert_eq!(eflags_writable_mask(CpuModel::I386), 0);
        assert_ne!(eflags_writable_mask(CpuModel::I486), 0);
        assert!(eflags_writable_mask(CpuModel::Pentium) > eflags_writable_mask(CpuModel::I486));
    }

    #[test]
    fn cr0_wp_only_on_486_and_later() {
        assert_eq!(cr0_change_mask(CpuModel::I386), 0);
        assert_ne!(cr0_change_mask(CpuModel::I486), 0);
    }

    #[test]
    fn cpuid_feature_bits_accumulate_by_generation() {
        let i486 = cpuid_leaf1(CpuModel::I486);
        let pentium = cpuid_leaf1(CpuModel::Pentium);
        assert_eq!(i486.features_edx & 1, 1, "486 has an FPU");
        assert!(pentium.features_edx & i486.features_edx == i486.features_edx, "pentium is a superset");
    }
}
