//! Descriptor cache, descriptor-table pointers, and the segment loader (§3.1, §4.4).
//!
//! `SegmentCache` is the CPU-private shadow populated by [`load_segment`]; once populated, every
//! subsequent access against that segment register consults only the cache, never re-fetching
//! the descriptor. Real mode and V8086 mode synthesize a cache directly from the selector;
//! protected mode fetches and validates an actual descriptor from the GDT or LDT.

use core86_mem::MemoryBus;
use core86_types::{vectors, AccessType, CpuException, PrivilegeLevel, SegmentRegister};

/// A GDTR/IDTR/LDTR-shaped pointer: a linear base and an inclusive byte limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TablePointer {
    pub base: u32,
    pub limit: u32,
}

impl TablePointer {
    pub fn new(base: u32, limit: u32) -> Self {
        TablePointer { base, limit }
    }

    /// Whether `selector`'s table index fits within this table's limit (8 bytes per descriptor).
    pub fn contains_index(&self, index: u16) -> bool {
        let offset = index as u32 * 8;
        offset + 7 <= self.limit
    }
}

/// Packed access bits for one loaded segment (§3.1): present, DPL, executable, the
/// readable/writable bit (meaning depends on `executable`), conforming, expand-down, and the
/// default operand-size (D/B) bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAccess {
    pub present: bool,
    pub dpl: PrivilegeLevel,
    pub executable: bool,
    /// Readable (code) or writable (data).
    pub readable_or_writable: bool,
    pub conforming: bool,
    pub expand_down: bool,
    pub default_size_32: bool,
    pub is_system_descriptor: bool,
    pub raw_type: u8,
}

impl SegmentAccess {
    /// A synthetic access value for real-mode / V8086-mode segments: present, full access,
    /// 16-bit default size, not conforming or expand-down.
    fn synthetic(dpl: PrivilegeLevel) -> Self {
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

    /// Null-selector placeholder: present but grants no access (§4.4: "a zero-access-mask cache
    /// entry").
    fn null() -> Self {
        SegmentAccess {
            present: false,
            dpl: PrivilegeLevel::KERNEL,
            executable: false,
            readable_or_writable: false,
            conforming: false,
            expand_down: false,
            default_size_32: false,
            is_system_descriptor: false,
            raw_type: 0,
        }
    }
}

/// Precomputed 3-bit mask rejecting reads/writes/executes against a segment in one test (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessTypeMask {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl AccessTypeMask {
    fn from_access(access: &SegmentAccess) -> Self {
        if !access.present {
            return AccessTypeMask::default();
        }
        if access.executable {
            AccessTypeMask {
                read: access.readable_or_writable,
                write: false,
                execute: true,
            }
        } else {
            AccessTypeMask {
                read: true,
                write: access.readable_or_writable,
                execute: false,
            }
        }
    }

    pub fn allows(&self, access_type: AccessType) -> bool {
        match access_type {
            AccessType::Read => self.read,
            AccessType::Write => self.write,
            AccessType::Execute => self.execute,
        }
    }
}

/// The CPU-private shadow of the last descriptor loaded into a segment register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u32,
    /// Inclusive low bound of the valid offset interval.
    pub limit_low: u32,
    /// Inclusive high bound of the valid offset interval.
    pub limit_high: u32,
    pub access: SegmentAccess,
    pub access_mask: AccessTypeMask,
}

impl SegmentCache {
    pub fn null() -> Self {
        SegmentCache {
            selector: 0,
            base: 0,
            limit_low: 0,
            limit_high: 0,
            access: SegmentAccess::null(),
            access_mask: AccessTypeMask::default(),
        }
    }

    /// Whether `offset` falls within `[limit_low, limit_high]`.
    pub fn offset_in_limit(&self, offset: u32) -> bool {
        offset >= self.limit_low && offset <= self.limit_high
    }
}

/// The `TR` cache additionally records the system-segment type (§3.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TssCache {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub is_32bit: bool,
    pub busy: bool,
}

impl TssCache {
    pub fn null() -> Self {
        TssCache { selector: 0, base: 0, limit: 0, is_32bit: true, busy: false }
    }
}

/// Current addressing mode, threaded through `load_segment` so it knows which of the three
/// regimes in §4.4 applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuOperatingMode {
    Real,
    V8086,
    Protected,
}

/// Decodes a raw 8-byte segment descriptor into `(base, limit_raw, granularity, access)`, without
/// yet expanding the limit for expand-down segments (the caller knows whether this is a data
/// segment and must fold that in via [`expand_limit`]).
fn decode_descriptor_raw(bytes: [u8; 8]) -> (u32, u32, bool, SegmentAccess) {
    let limit_low = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
    let base_low = u16::from_le_bytes([bytes[2], bytes[3]]) as u32;
    let base_mid = bytes[4] as u32;
    let type_attr = bytes[5];
    let limit_high_and_flags = bytes[6];
    let base_high = bytes[7] as u32;

    let base = base_low | (base_mid << 16) | (base_high << 24);
    let limit_raw = limit_low | (((limit_high_and_flags & 0x0F) as u32) << 16);
    let granularity = limit_high_and_flags & 0x80 != 0;
    let default_size_32 = limit_high_and_flags & 0x40 != 0;

    let present = type_attr & 0x80 != 0;
    let dpl = PrivilegeLevel::new((type_attr >> 5) & 0x3);
    let is_system_descriptor = type_attr & 0x10 == 0;
    let raw_type = type_attr & 0x0F;
    let executable = raw_type & 0x8 != 0;
    let readable_or_writable = raw_type & 0x2 != 0;
    let conforming = executable && raw_type & 0x4 != 0;
    let expand_down = !executable && raw_type & 0x4 != 0;

    let access = SegmentAccess {
        present,
        dpl,
        executable,
        readable_or_writable,
        conforming,
        expand_down,
        default_size_32,
        is_system_descriptor,
        raw_type,
    };

    (base, limit_raw, granularity, access)
}

/// Expands a raw `(limit, granularity)` pair into the inclusive `[limit_low, limit_high]`
/// interval, orienting the interval for expand-down segments by inverting it (§3.1, property #3
/// in §8).
fn expand_limit(limit_raw: u32, granularity: bool, expand_down: bool, default_size_32: bool) -> (u32, u32) {
    let scaled = if granularity { (limit_raw << 12) | 0xFFF } else { limit_raw };
    if !expand_down {
        (0, scaled)
    } else {
        let segment_max = if default_size_32 { 0xFFFF_FFFF } else { 0x0000_FFFF };
        (scaled.wrapping_add(1), segment_max)
    }
}

fn build_cache(selector: u16, bytes: [u8; 8]) -> SegmentCache {
    let (base, limit_raw, granularity, access) = decode_descriptor_raw(bytes);
    let (limit_low, limit_high) = expand_limit(limit_raw, granularity, access.expand_down, access.default_size_32);
    SegmentCache {
        selector,
        base,
        limit_low,
        limit_high,
        access_mask: AccessTypeMask::from_access(&access),
        access,
    }
}

/// Fetches a raw descriptor from the GDT or LDT. `selector`'s table-indicator bit (bit 2) picks
/// GDT vs LDT; index is bits 3..15.
fn fetch_descriptor(
    bus: &MemoryBus,
    gdtr: TablePointer,
    ldtr: TablePointer,
    selector: u16,
) -> Option<[u8; 8]> {
    let index = selector >> 3;
    let table = if selector & 0x4 != 0 { ldtr } else { gdtr };
    if !table.contains_index(index) {
        return None;
    }
    let addr = table.base as u64 + index as u64 * 8;
    let mut bytes = [0u8; 8];
    if !bus.checked_read_bytes(addr, &mut bytes) {
        return None;
    }
    Some(bytes)
}

/// Which of the six segment registers is being loaded; CS and SS have extra validation/side
/// effects beyond the generic data-segment path (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentRole {
    Code,
    Stack,
    Data,
}

pub fn segment_role(reg: SegmentRegister) -> SegmentRole {
    match reg {
        SegmentRegister::CS => SegmentRole::Code,
        SegmentRegister::SS => SegmentRole::Stack,
        _ => SegmentRole::Data,
    }
}

/// `load_segment` result: the populated cache, plus whether the accessed bit write-back into the
/// backing descriptor table is required (only meaningful in protected mode).
pub struct LoadSegmentOutcome {
    pub cache: SegmentCache,
    pub descriptor_table_write_back: Option<(u64, [u8; 8])>,
}

/// Implements §4.4's three regimes. `role` distinguishes CS/SS (extra checks) from a plain data
/// segment load. `elide_accessed_bit_on_486_plus` mirrors the model-dependent accessed-bit
/// write-elision rule from §6.4.
#[allow(clippy::too_many_arguments)]
pub fn load_segment(
    bus: &MemoryBus,
    mode: CpuOperatingMode,
    role: SegmentRole,
    selector: u16,
    cpl: PrivilegeLevel,
    gdtr: TablePointer,
    ldtr: TablePointer,
    elide_accessed_bit_on_486_plus: bool,
) -> Result<LoadSegmentOutcome, CpuException> {
    match mode {
        CpuOperatingMode::Real => {
            let dpl = if role == SegmentRole::Code { PrivilegeLevel::KERNEL } else { cpl };
            Ok(LoadSegmentOutcome {
                cache: SegmentCache {
                    selector,
                    base: (selector as u32) << 4,
                    limit_low: 0,
                    limit_high: 0xFFFF,
                    access: SegmentAccess::synthetic(dpl),
                    access_mask: AccessTypeMask { read: true, write: true, execute: true },
                },
                descriptor_table_write_back: None,
            })
        }
        CpuOperatingMode::V8086 => Ok(LoadSegmentOutcome {
            cache: SegmentCache {
                selector,
                base: (selector as u32) << 4,
                limit_low: 0,
                limit_high: 0xFFFF,
                access: SegmentAccess::synthetic(PrivilegeLevel::USER),
                access_mask: AccessTypeMask { read: true, write: true, execute: true },
            },
            descriptor_table_write_back: None,
        }),
        CpuOperatingMode::Protected => load_segment_protected(bus, role, selector, cpl, gdtr, ldtr, elide_accessed_bit_on_486_plus),
    }
}

fn load_segment_protected(
    bus: &MemoryBus,
    role: SegmentRole,
    selector: u16,
    cpl: PrivilegeLevel,
    gdtr: TablePointer,
    ldtr: TablePointer,
    elide_accessed_bit_on_486_plus: bool,
) -> Result<LoadSegmentOutcome, CpuException> {
    let is_null = selector & 0xFFFC == 0;
    if is_null {
        return match role {
            SegmentRole::Stack => Err(CpuException::with_error_code(vectors::GP, selector as u32)),
            _ => Ok(LoadSegmentOutcome { cache: SegmentCache::null(), descriptor_table_write_back: None }),
        };
    }

    let bytes = fetch_descriptor(bus, gdtr, ldtr, selector)
        .ok_or_else(|| fault_for_role(role, selector))?;
    let cache = build_cache(selector, bytes);
    let rpl = PrivilegeLevel::new((selector & 0x3) as u8);

    match role {
        SegmentRole::Stack => {
            let valid = cache.access.present
                && !cache.access.is_system_descriptor
                && !cache.access.executable
                && cache.access.readable_or_writable
                && cache.access.dpl == cpl
                && rpl == cpl;
            if !valid {
                return Err(fault_for_role(role, selector));
            }
        }
        SegmentRole::Data => {
            if cache.access.is_system_descriptor || (cache.access.executable && !cache.access.readable_or_writable) {
                return Err(fault_for_role(role, selector));
            }
            if !cache.access.executable || !cache.access.conforming {
                if cache.access.dpl < cpl.max(rpl) {
                    return Err(fault_for_role(role, selector));
                }
            }
            if !cache.access.present {
                return Err(CpuException::with_error_code(vectors::NP, selector as u32));
            }
        }
        SegmentRole::Code => {
            // CS loads are validated by the far-transfer path before this function is invoked
            // (§4.4: "for CS it must already have been validated by the far-transfer path").
        }
    }

    let write_back = if !elide_accessed_bit_on_486_plus || bytes[5] & 0x01 == 0 {
        let index = selector >> 3;
        let table = if selector & 0x4 != 0 { ldtr } else { gdtr };
        let addr = table.base as u64 + index as u64 * 8;
        let mut updated = bytes;
        updated[5] |= 0x01;
        Some((addr, updated))
    } else {
        None
    };

    Ok(LoadSegmentOutcome { cache, descriptor_table_write_back: write_back })
}

fn fault_for_role(role: SegmentRole, selector: u16) -> CpuException {
    let vector = if role == SegmentRole::Stack { vectors::SS } else { vectors::GP };
    CpuException::with_error_code(vector, selector as u32)
}

/// The reference implementation's `TemporaryStack`: a scratch push/pop helper against a segment
/// that need not be (and during a privilege-changing far call, is not yet) the architectural SS.
/// Used by `far_control` for the inner-stack parameter copy and by `task_switch` for writing the
/// outgoing TSS image.
pub struct ScratchStack<'a> {
    bus: &'a MemoryBus,
    pub esp: u32,
    base: u32,
    limit_low: u32,
    limit_high: u32,
    is_32bit: bool,
}

impl<'a> ScratchStack<'a> {
    pub fn new(bus: &'a MemoryBus, esp: u32, cache: &SegmentCache, is_32bit: bool) -> Self {
        ScratchStack { bus, esp, base: cache.base, limit_low: cache.limit_low, limit_high: cache.limit_high, is_32bit }
    }

    fn advance(&mut self, delta: i64) -> u32 {
        let mask = if self.is_32bit { 0xFFFF_FFFFu32 } else { 0x0000_FFFFu32 };
        let new_esp = (self.esp as i64 + delta) as u32 & mask;
        self.esp = new_esp;
        new_esp
    }

    pub fn can_push_bytes(&self, count: u32) -> bool {
        let mask = if self.is_32bit { 0xFFFF_FFFFu32 } else { 0x0000_FFFFu32 };
        let target = (self.esp.wrapping_sub(count)) & mask;
        target >= self.limit_low && target <= self.limit_high
    }

    pub fn push_dword(&mut self, value: u32) {
        let esp = self.advance(-4);
        self.bus.write_u32(self.base.wrapping_add(esp) as u64, value);
    }

    pub fn push_word(&mut self, value: u16) {
        let esp = self.advance(-2);
        self.bus.write_u16(self.base.wrapping_add(esp) as u64, value);
    }

    pub fn pop_dword(&mut self) -> u32 {
        let esp = self.esp;
        let value = self.bus.read_u32(self.base.wrapping_add(esp) as u64);
        self.advance(4);
        value
    }

    pub fn pop_word(&mut self) -> u16 {
        let esp = self.esp;
        let value = self.bus.read_u16(self.base.wrapping_add(esp) as u64);
        self.advance(2);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core86_mem::PhysicalMemory;
    use std::sync::Arc;

    fn make_bus() -> MemoryBus {
        MemoryBus::new(Arc::new(PhysicalMemory::new(0x10_0000).unwrap()))
    }

    fn write_descriptor(bus: &MemoryBus, addr: u64, base: u32, limit_raw: u32, type_attr: u8, flags: u8) {
        let mut bytes = [0u8; 8];
        bytes[0] = limit_raw as u8;
        bytes[1] = (limit_raw >> 8) as u8;
        bytes[2] = base as u8;
        bytes[3] = (base >> 8) as u8;
        bytes[4] = (base >> 16) as u8;
        bytes[5] = type_attr;
        bytes[6] = ((limit_raw >> 16) as u8 & 0x0F) | (flags & 0xF0);
        bytes[7] = (base >> 24) as u8;
        bus.write_bytes(addr, &bytes);
    }

    #[test]
    fn real_mode_load_computes_base_from_selector_times_16() {
        let bus = make_bus();
        let gdtr = TablePointer::default();
        let ldtr = TablePointer::default();
        let outcome = load_segment(
            &bus,
            CpuOperatingMode::Real,
            SegmentRole::Data,
            0x1234,
            PrivilegeLevel::USER,
            gdtr,
            ldtr,
            true,
        )
        .unwrap();
        assert_eq!(outcome.cache.base, 0x1234 * 16);
        assert_eq!(outcome.cache.limit_high, 0xFFFF);
    }

    #[test]
    fn protected_mode_null_selector_is_fine_for_data_but_faults_for_ss() {
        let bus = make_bus();
        let gdtr = TablePointer::new(0x1000, 0xFFFF);
        let ldtr = TablePointer::default();

        let data = load_segment(&bus, CpuOperatingMode::Protected, SegmentRole::Data, 0, PrivilegeLevel::USER, gdtr, ldtr, true).unwrap();
        assert!(!data.cache.access.present);

        let err = load_segment(&bus, CpuOperatingMode::Protected, SegmentRole::Stack, 0, PrivilegeLevel::USER, gdtr, ldtr, true).unwrap_err();
        assert_eq!(err.vector, vectors::GP);
    }

    #[test]
    fn expand_up_limit_matches_property_8_3() {
        let bus = make_bus();
        let gdtr = TablePointer::new(0x2000, 0xFFFF);
        // present, DPL0, data, writable, expand-up (type 0x92), granularity set, limit=0xF (-> 4KB*0x10-1)
        write_descriptor(&bus, 0x2008, 0x3000, 0xF, 0x92, 0x80);

        let outcome = load_segment(&bus, CpuOperatingMode::Protected, SegmentRole::Data, 0x08, PrivilegeLevel::KERNEL, gdtr, TablePointer::default(), true).unwrap();
        assert_eq!(outcome.cache.limit_low, 0);
        assert_eq!(outcome.cache.limit_high, (0xFu32 << 12) | 0xFFF);
    }

    #[test]
    fn expand_down_limit_is_the_complementary_interval() {
        let bus = make_bus();
        let gdtr = TablePointer::new(0x2000, 0xFFFF);
        // type 0x96 = present, data, writable, expand-down; no granularity, not big (16-bit)
        write_descriptor(&bus, 0x2008, 0x3000, 0x200, 0x96, 0x00);

        let outcome = load_segment(&bus, CpuOperatingMode::Protected, SegmentRole::Data, 0x08, PrivilegeLevel::KERNEL, gdtr, TablePointer::default(), true).unwrap();
        assert_eq!(outcome.cache.limit_low, 0x201);
        assert_eq!(outcome.cache.limit_high, 0xFFFF);
    }

    #[test]
    fn stack_segment_requires_matching_dpl_and_rpl() {
        let bus = make_bus();
        let gdtr = TablePointer::new(0x2000, 0xFFFF);
        // present, DPL=3, writable data, expand-up
        write_descriptor(&bus, 0x2008, 0x4000, 0xFFFF, 0x92 | (3 << 5), 0x40);

        let selector_rpl3 = 0x08 | 3;
        let ok = load_segment(&bus, CpuOperatingMode::Protected, SegmentRole::Stack, selector_rpl3, PrivilegeLevel::USER, gdtr, TablePointer::default(), true);
        assert!(ok.is_ok());

        let selector_rpl0 = 0x08;
        let err = load_segment(&bus, CpuOperatingMode::Protected, SegmentRole::Stack, selector_rpl0, PrivilegeLevel::USER, gdtr, TablePointer::default(), true).unwrap_err();
        assert_eq!(err.vector, vectors::SS);
    }

    #[test]
    fn accessed_bit_is_set_on_a_successful_load() {
        let bus = make_bus();
        let gdtr = TablePointer::new(0x2000, 0xFFFF);
        write_descriptor(&bus, 0x2008, 0x3000, 0xFFFF, 0x92, 0x40);

        let outcome = load_segment(&bus, CpuOperatingMode::Protected, SegmentRole::Data, 0x08, PrivilegeLevel::KERNEL, gdtr, TablePointer::default(), false).unwrap();
        let (addr, bytes) = outcome.descriptor_table_write_back.expect("accessed bit write-back expected");
        assert_eq!(addr, 0x2008);
        assert_eq!(bytes[5] & 0x01, 0x01);
    }

    #[test]
    fn scratch_stack_pushes_grow_down_and_wrap_per_operand_size() {
        let bus = make_bus();
        let cache = SegmentCache { selector: 0, base: 0, limit_low: 0, limit_high: 0xFFFF, access: SegmentAccess::synthetic(PrivilegeLevel::KERNEL), access_mask: AccessTypeMask::default() };
        let mut stack = ScratchStack::new(&bus, 0x10, &cache, false);
        stack.push_word(0xBEEF);
        assert_eq!(stack.esp, 0x0E);
        assert_eq!(bus.read_u16(0x0E), 0xBEEF);
    }
}
