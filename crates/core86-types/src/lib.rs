//! Fixed-width type aliases and architectural constants shared by every `core86-*` crate.
//!
//! Every emulation quantity has an explicit width: guest data is `u8`/`u16`/`u32`, simulation
//! time is `i64` nanoseconds, and the TSC/block-key space is `u64`. No pointer-width integer
//! should ever leak into architectural state — host pointer width must not change the guest's
//! observable behaviour.

#![forbid(unsafe_code)]

/// Nanoseconds of virtual time. Signed so that late/overrun accounting (see [`CycleCount`] users
/// in `core86-timers`) can go negative without wrapping.
pub type SimulationTime = i64;

/// A count of guest clock cycles, signed for the same reason as [`SimulationTime`].
pub type CycleCount = i64;

/// A physical memory address, as produced by the paging unit or used directly in real mode.
pub type PhysicalAddress = u32;

/// A linear address: the output of segmentation, the input to paging.
pub type LinearAddress = u32;

/// A 64-bit code-cache block key / TSC / MSR value.
pub type Wide = u64;

pub const PAGE_SIZE: u32 = 4096;
pub const PAGE_OFFSET_MASK: u32 = PAGE_SIZE - 1;
pub const PAGE_MASK: u32 = !PAGE_OFFSET_MASK;
pub const PAGE_SHIFT: u32 = 12;

/// The three CPU generations this core can be configured to behave as. Selecting a model drives
/// the CPUID result, the EFLAGS-writable mask, the CR0/CR4 change masks, and the accessed-bit
/// write-elision rule (see the model table in `core86-cpu`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CpuModel {
    I386,
    I486,
    Pentium,
}

impl CpuModel {
    pub fn has_cr4(self) -> bool {
        matches!(self, CpuModel::Pentium)
    }

    pub fn elides_redundant_accessed_bit_write(self) -> bool {
        !matches!(self, CpuModel::I386)
    }
}

/// Index into the six segment selector registers, also used to index descriptor caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentRegister {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
}

pub const SEGMENT_REGISTER_COUNT: usize = 6;

impl SegmentRegister {
    pub const ALL: [SegmentRegister; SEGMENT_REGISTER_COUNT] = [
        SegmentRegister::ES,
        SegmentRegister::CS,
        SegmentRegister::SS,
        SegmentRegister::DS,
        SegmentRegister::FS,
        SegmentRegister::GS,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// A CPL/DPL/RPL privilege level, always in `0..=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PrivilegeLevel(u8);

impl PrivilegeLevel {
    pub const KERNEL: PrivilegeLevel = PrivilegeLevel(0);
    pub const USER: PrivilegeLevel = PrivilegeLevel(3);

    pub fn new(level: u8) -> Self {
        debug_assert!(level <= 3);
        PrivilegeLevel(level & 3)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

/// The three access kinds the segment-limit check and the paging permission vector are both
/// templated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

/// Whether the current privilege mode for a memory access is user or supervisor. Also used to
/// index the TLB's `[user|supervisor]` dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessMode {
    User,
    Supervisor,
}

impl AccessMode {
    pub fn from_cpl(cpl: PrivilegeLevel) -> Self {
        if cpl == PrivilegeLevel::KERNEL {
            AccessMode::Supervisor
        } else {
            AccessMode::User
        }
    }
}

/// Operand width in bits, used throughout the decoder, interpreter, and register cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandSize {
    Size8,
    Size16,
    Size32,
}

impl OperandSize {
    pub fn bits(self) -> u32 {
        match self {
            OperandSize::Size8 => 8,
            OperandSize::Size16 => 16,
            OperandSize::Size32 => 32,
        }
    }

    pub fn bytes(self) -> u32 {
        self.bits() / 8
    }

    pub fn mask(self) -> u32 {
        match self {
            OperandSize::Size8 => 0xFF,
            OperandSize::Size16 => 0xFFFF,
            OperandSize::Size32 => 0xFFFF_FFFF,
        }
    }
}

/// Effective address size, independent of operand size (e.g. `67 66` prefix stacking).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressSize {
    Size16,
    Size32,
}

impl AddressSize {
    pub fn eip_mask(self) -> u32 {
        match self {
            AddressSize::Size16 => 0x0000_FFFF,
            AddressSize::Size32 => 0xFFFF_FFFF,
        }
    }
}

/// Exception vector numbers, named per the Intel SDM.
pub mod vectors {
    pub const DE: u8 = 0; // Divide error
    pub const DB: u8 = 1; // Debug
    pub const NMI: u8 = 2;
    pub const BP: u8 = 3; // Breakpoint
    pub const OF: u8 = 4; // Overflow
    pub const BR: u8 = 5; // BOUND range exceeded
    pub const UD: u8 = 6; // Invalid opcode
    pub const NM: u8 = 7; // Device not available (x87)
    pub const DF: u8 = 8; // Double fault
    pub const TS: u8 = 10; // Invalid TSS
    pub const NP: u8 = 11; // Segment not present
    pub const SS: u8 = 12; // Stack fault
    pub const GP: u8 = 13; // General protection
    pub const PF: u8 = 14; // Page fault
    pub const MF: u8 = 16; // x87 FPU error
    pub const AC: u8 = 17; // Alignment check
    pub const MC: u8 = 18; // Machine check
    pub const XM: u8 = 19; // SIMD FP exception
}

/// The three exception-propagation classes from the spec's error-handling design (§7): faults
/// restart the faulting instruction, traps advance past it first, and aborts are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Fault,
    Trap,
    Abort,
}

pub fn exception_class(vector: u8) -> ExceptionClass {
    match vector {
        vectors::BP | vectors::OF | vectors::DB => ExceptionClass::Trap,
        _ => ExceptionClass::Fault,
    }
}

/// A pending CPU exception: a vector plus an optional error code (pushed for vectors that carry
/// one per the Intel SDM convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuException {
    pub vector: u8,
    pub error_code: Option<u32>,
}

impl CpuException {
    pub fn new(vector: u8) -> Self {
        CpuException {
            vector,
            error_code: None,
        }
    }

    pub fn with_error_code(vector: u8, error_code: u32) -> Self {
        CpuException {
            vector,
            error_code: Some(error_code),
        }
    }

    pub fn class(&self) -> ExceptionClass {
        exception_class(self.vector)
    }
}

/// Page-fault error code bits (pushed as the #PF error code and also used to format CR2 faults).
pub mod pf_error {
    pub const PRESENT: u32 = 1 << 0;
    pub const WRITE: u32 = 1 << 1;
    pub const USER: u32 = 1 << 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn privilege_level_clamps_to_two_bits() {
        assert_eq!(PrivilegeLevel::new(7).value(), 3);
        assert_eq!(PrivilegeLevel::new(0).value(), 0);
    }

    #[test]
    fn operand_size_masks() {
        assert_eq!(OperandSize::Size8.mask(), 0xFF);
        assert_eq!(OperandSize::Size16.mask(), 0xFFFF);
        assert_eq!(OperandSize::Size32.mask(), 0xFFFF_FFFF);
    }

    #[test]
    fn traps_advance_faults_restart() {
        assert_eq!(exception_class(vectors::BP), ExceptionClass::Trap);
        assert_eq!(exception_class(vectors::GP), ExceptionClass::Fault);
    }
}
