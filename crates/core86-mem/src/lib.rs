//! The bus: physical memory plus port I/O dispatch. This is the CPU's only way to touch device
//! state (§4.2, §6.1 of the design) — the CPU never talks to MMIO or port-mapped devices
//! directly, and devices never see a linear or virtual address, only physical/port addresses the
//! bus has already resolved.
//!
//! [`PhysicalMemory`] is sparse: chunks are allocated lazily on first write, so a guest with a
//! handful of populated pages in a large address space doesn't pay for the whole thing up front.
//! [`MemoryBus`] layers MMIO and ROM regions on top of a [`PhysicalMemory`] and adds the bulk/DMA
//! helpers devices and the CPU's paging unit need.

use std::ops::Range;
use std::sync::{Arc, Mutex};

#[cfg(test)]
mod test_util;

#[derive(Debug, thiserror::Error)]
pub enum MemoryBusError {
    #[error("access at {addr:#x} (len {len}) is out of bounds (size {size:#x})")]
    OutOfBounds { addr: u64, len: usize, size: u64 },
    #[error("allocation of {len} bytes would exceed addressable limits")]
    OutOfMemory { len: usize },
    #[error("scatter/gather segment total ({segments}) does not match data length ({data})")]
    LengthMismatch { segments: usize, data: usize },
    #[error("access at {addr:#x} (len {len}) touches an MMIO region and cannot be used for bulk DMA")]
    MmioAccess { addr: u64, len: usize },
    #[error("a region already covers {addr:#x}..{end:#x}")]
    RegionOverlap { addr: u64, end: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct PhysicalMemoryOptions {
    pub chunk_size: usize,
}

impl Default for PhysicalMemoryOptions {
    fn default() -> Self {
        PhysicalMemoryOptions { chunk_size: 4096 }
    }
}

/// Sparse guest RAM: a flat address space backed by lazily-allocated, fixed-size chunks.
pub struct PhysicalMemory {
    size: u64,
    chunk_size: usize,
    chunks: Mutex<Vec<Option<Box<[u8]>>>>,
}

impl PhysicalMemory {
    pub fn with_options(size: u64, options: PhysicalMemoryOptions) -> Result<Self, MemoryBusError> {
        if options.chunk_size == 0 {
            return Err(MemoryBusError::OutOfMemory { len: 0 });
        }
        let chunk_count = size.div_ceil(options.chunk_size as u64) as usize;
        Ok(PhysicalMemory {
            size,
            chunk_size: options.chunk_size,
            chunks: Mutex::new((0..chunk_count).map(|_| None).collect()),
        })
    }

    pub fn new(size: u64) -> Result<Self, MemoryBusError> {
        Self::with_options(size, PhysicalMemoryOptions::default())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn allocated_chunks(&self) -> usize {
        self.chunks.lock().unwrap().iter().filter(|c| c.is_some()).count()
    }

    fn check_bounds(&self, addr: u64, len: usize) -> Result<(), MemoryBusError> {
        let end = addr.checked_add(len as u64).ok_or(MemoryBusError::OutOfMemory { len })?;
        if end > self.size {
            return Err(MemoryBusError::OutOfBounds { addr, len, size: self.size });
        }
        Ok(())
    }

    pub fn try_read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryBusError> {
        self.check_bounds(addr, buf.len())?;
        let chunks = self.chunks.lock().unwrap();
        let mut remaining = buf;
        let mut addr = addr;
        while !remaining.is_empty() {
            let chunk_index = (addr / self.chunk_size as u64) as usize;
            let offset_in_chunk = (addr % self.chunk_size as u64) as usize;
            let take = remaining.len().min(self.chunk_size - offset_in_chunk);
            match &chunks[chunk_index] {
                Some(chunk) => remaining[..take].copy_from_slice(&chunk[offset_in_chunk..offset_in_chunk + take]),
                None => remaining[..take].fill(0),
            }
            remaining = &mut remaining[take..];
            addr += take as u64;
        }
        Ok(())
    }

    pub fn try_write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryBusError> {
        self.check_bounds(addr, data.len())?;
        let mut chunks = self.chunks.lock().unwrap();
        let mut remaining = data;
        let mut addr = addr;
        while !remaining.is_empty() {
            let chunk_index = (addr / self.chunk_size as u64) as usize;
            let offset_in_chunk = (addr % self.chunk_size as u64) as usize;
            let take = remaining.len().min(self.chunk_size - offset_in_chunk);
            let chunk = chunks[chunk_index].get_or_insert_with(|| vec![0u8; self.chunk_size].into_boxed_slice());
            chunk[offset_in_chunk..offset_in_chunk + take].copy_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            addr += take as u64;
        }
        Ok(())
    }

    #[track_caller]
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        self.try_read_bytes(addr, buf).expect("out-of-bounds physical memory read");
    }

    #[track_caller]
    pub fn write_bytes(&self, addr: u64, data: &[u8]) {
        self.try_write_bytes(addr, data).expect("out-of-bounds physical memory write");
    }
}

macro_rules! typed_accessors {
    ($read:ident, $write:ident, $try_read:ident, $try_write:ident, $ty:ty) => {
        impl PhysicalMemory {
            #[track_caller]
            pub fn $read(&self, addr: u64) -> $ty {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                self.read_bytes(addr, &mut buf);
                <$ty>::from_le_bytes(buf)
            }

            #[track_caller]
            pub fn $write(&self, addr: u64, value: $ty) {
                self.write_bytes(addr, &value.to_le_bytes());
            }

            pub fn $try_read(&self, addr: u64) -> Result<$ty, MemoryBusError> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                self.try_read_bytes(addr, &mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }

            pub fn $try_write(&self, addr: u64, value: $ty) -> Result<(), MemoryBusError> {
                self.try_write_bytes(addr, &value.to_le_bytes())
            }
        }
    };
}

typed_accessors!(read_u8, write_u8, try_read_u8, try_write_u8, u8);
typed_accessors!(read_u16, write_u16, try_read_u16, try_write_u16, u16);
typed_accessors!(read_u32, write_u32, try_read_u32, try_write_u32, u32);
typed_accessors!(read_u64, write_u64, try_read_u64, try_write_u64, u64);
typed_accessors!(read_u128, write_u128, try_read_u128, try_write_u128, u128);

/// Handles reads/writes to a single MMIO region registered with a [`MemoryBus`].
pub trait MmioHandler: Send + Sync {
    fn read(&self, offset: u64, data: &mut [u8]);
    fn write(&self, offset: u64, data: &[u8]);
}

/// Handles port-mapped I/O for a range of ports registered with a [`MemoryBus`].
pub trait PortIoHandler: Send + Sync {
    fn read(&self, port: u16, width: u8) -> u32;
    fn write(&self, port: u16, width: u8, value: u32);
}

struct MmioRegion {
    range: Range<u64>,
    handler: Arc<dyn MmioHandler>,
}

struct RomRegion {
    range: Range<u64>,
    bytes: Arc<[u8]>,
}

struct PortRegion {
    ports: Range<u16>,
    handler: Arc<dyn PortIoHandler>,
}

/// Physical memory plus MMIO/ROM region overlays and port I/O dispatch. The CPU's only door to
/// the outside world; see §6.1/§6.2 of the design.
pub struct MemoryBus {
    ram: Arc<PhysicalMemory>,
    mmio: Mutex<Vec<MmioRegion>>,
    rom: Mutex<Vec<RomRegion>>,
    ports: Mutex<Vec<PortRegion>>,
    dirty_pages: Mutex<Vec<bool>>,
    page_size: u64,
}

enum Resolved<'a> {
    Ram,
    Rom(&'a RomRegion),
    Mmio(&'a MmioRegion),
    OutOfBounds,
}

impl MemoryBus {
    pub fn new(ram: Arc<PhysicalMemory>) -> Self {
        let page_size = 4096u64;
        let page_count = ram.size().div_ceil(page_size) as usize;
        MemoryBus {
            ram,
            mmio: Mutex::new(Vec::new()),
            rom: Mutex::new(Vec::new()),
            ports: Mutex::new(Vec::new()),
            dirty_pages: Mutex::new(vec![false; page_count]),
            page_size,
        }
    }

    pub fn ram(&self) -> &Arc<PhysicalMemory> {
        &self.ram
    }

    pub fn register_mmio(&mut self, range: Range<u64>, handler: Arc<dyn MmioHandler>) -> Result<(), MemoryBusError> {
        let mut mmio = self.mmio.lock().unwrap();
        if mmio.iter().any(|r| ranges_overlap(&r.range, &range)) {
            return Err(MemoryBusError::RegionOverlap { addr: range.start, end: range.end });
        }
        mmio.push(MmioRegion { range, handler });
        Ok(())
    }

    pub fn register_rom(&mut self, addr: u64, bytes: Arc<[u8]>) -> Result<(), MemoryBusError> {
        let range = addr..addr + bytes.len() as u64;
        let mut rom = self.rom.lock().unwrap();
        if rom.iter().any(|r| ranges_overlap(&r.range, &range)) {
            return Err(MemoryBusError::RegionOverlap { addr: range.start, end: range.end });
        }
        rom.push(RomRegion { range, bytes });
        Ok(())
    }

    pub fn register_port_range(&mut self, ports: Range<u16>, handler: Arc<dyn PortIoHandler>) -> Result<(), MemoryBusError> {
        let mut regions = self.ports.lock().unwrap();
        if regions.iter().any(|r| r.ports.start < ports.end && ports.start < r.ports.end) {
            return Err(MemoryBusError::RegionOverlap { addr: ports.start as u64, end: ports.end as u64 });
        }
        regions.push(PortRegion { ports, handler });
        Ok(())
    }

    fn resolve<'a>(
        mmio: &'a [MmioRegion],
        rom: &'a [RomRegion],
        ram_size: u64,
        addr: u64,
        len: usize,
    ) -> Resolved<'a> {
        let end = addr + len as u64;
        if let Some(region) = mmio.iter().find(|r| r.range.contains(&addr)) {
            if end <= region.range.end {
                return Resolved::Mmio(region);
            }
        }
        if let Some(region) = rom.iter().find(|r| r.range.contains(&addr)) {
            if end <= region.range.end {
                return Resolved::Rom(region);
            }
        }
        if end <= ram_size {
            Resolved::Ram
        } else {
            Resolved::OutOfBounds
        }
    }

    pub fn try_read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryBusError> {
        let mmio = self.mmio.lock().unwrap();
        let rom = self.rom.lock().unwrap();
        match Self::resolve(&mmio, &rom, self.ram.size(), addr, buf.len()) {
            Resolved::Mmio(region) => {
                region.handler.read(addr - region.range.start, buf);
                Ok(())
            }
            Resolved::Rom(region) => {
                let offset = (addr - region.range.start) as usize;
                buf.copy_from_slice(&region.bytes[offset..offset + buf.len()]);
                Ok(())
            }
            Resolved::Ram => self.ram.try_read_bytes(addr, buf),
            Resolved::OutOfBounds => Err(MemoryBusError::OutOfBounds { addr, len: buf.len(), size: self.ram.size() }),
        }
    }

    pub fn try_write_bytes(&self, addr: u64, data: &[u8]) -> Result<(), MemoryBusError> {
        let mmio = self.mmio.lock().unwrap();
        let rom = self.rom.lock().unwrap();
        match Self::resolve(&mmio, &rom, self.ram.size(), addr, data.len()) {
            Resolved::Mmio(region) => {
                region.handler.write(addr - region.range.start, data);
                Ok(())
            }
            Resolved::Rom(_) => Ok(()), // ROM writes are silently dropped, per real hardware.
            Resolved::Ram => {
                drop(mmio);
                drop(rom);
                self.ram.try_write_bytes(addr, data)?;
                self.mark_dirty_range(addr, data.len());
                Ok(())
            }
            Resolved::OutOfBounds => Err(MemoryBusError::OutOfBounds { addr, len: data.len(), size: self.ram.size() }),
        }
    }

    fn mark_dirty_range(&self, addr: u64, len: usize) {
        if len == 0 {
            return;
        }
        let mut dirty = self.dirty_pages.lock().unwrap();
        let first_page = addr / self.page_size;
        let last_page = (addr + len as u64 - 1) / self.page_size;
        for page in first_page..=last_page {
            if let Some(slot) = dirty.get_mut(page as usize) {
                *slot = true;
            }
        }
    }

    #[track_caller]
    pub fn read_bytes(&self, addr: u64, buf: &mut [u8]) {
        self.try_read_bytes(addr, buf).expect("out-of-bounds bus read");
    }

    #[track_caller]
    pub fn write_bytes(&self, addr: u64, data: &[u8]) {
        self.try_write_bytes(addr, data).expect("out-of-bounds bus write");
    }

    /// Non-trapping read: returns `None` instead of erroring on an unmapped access.
    pub fn checked_read_bytes(&self, addr: u64, buf: &mut [u8]) -> bool {
        self.try_read_bytes(addr, buf).is_ok()
    }

    /// Non-trapping write: returns `false` instead of erroring on an unmapped access.
    pub fn checked_write_bytes(&self, addr: u64, data: &[u8]) -> bool {
        self.try_write_bytes(addr, data).is_ok()
    }

    pub fn read_physical_into(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryBusError> {
        self.try_read_bytes(addr, buf)
    }

    pub fn write_physical_from(&self, addr: u64, data: &[u8]) -> Result<(), MemoryBusError> {
        self.try_write_bytes(addr, data)
    }

    /// Copies `len` bytes starting at `addr` out of the bus. Used by DMA-capable devices; bounds
    /// and allocation size are validated before any allocation is attempted.
    pub fn memcpy_from_guest(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryBusError> {
        if len as u64 > self.ram.size() {
            return Err(MemoryBusError::OutOfMemory { len });
        }
        let mut buf = vec![0u8; len];
        self.try_read_bytes(addr, &mut buf)?;
        Ok(buf)
    }

    /// Reads each `(addr, len)` segment contiguously into `dst`, in order.
    pub fn read_sg(&self, segments: &[(u64, usize)], dst: &mut [u8]) -> Result<(), MemoryBusError> {
        let total: usize = segments.iter().map(|(_, len)| len).sum();
        if total != dst.len() {
            return Err(MemoryBusError::LengthMismatch { segments: total, data: dst.len() });
        }
        let mut offset = 0;
        for &(addr, len) in segments {
            self.try_read_bytes(addr, &mut dst[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    /// Writes `src` out across each `(addr, len)` segment, in order. All-or-nothing with respect
    /// to MMIO: see [`MemoryBus::try_write_sg`] for the atomic variant.
    pub fn write_sg(&self, segments: &[(u64, usize)], src: &[u8]) -> Result<(), MemoryBusError> {
        let total: usize = segments.iter().map(|(_, len)| len).sum();
        if total != src.len() {
            return Err(MemoryBusError::LengthMismatch { segments: total, data: src.len() });
        }
        let mut offset = 0;
        for &(addr, len) in segments {
            self.try_write_bytes(addr, &src[offset..offset + len])?;
            offset += len;
        }
        Ok(())
    }

    /// Like [`MemoryBus::write_sg`], but refuses to touch *any* segment (including RAM writes
    /// already queued ahead of an MMIO one) if any segment in the list targets MMIO — DMA engines
    /// must not leave memory partially written because one segment hit a side-effecting region.
    pub fn try_write_sg(&self, segments: &[(u64, usize)], src: &[u8]) -> Result<(), MemoryBusError> {
        let total: usize = segments.iter().map(|(_, len)| len).sum();
        if total != src.len() {
            return Err(MemoryBusError::LengthMismatch { segments: total, data: src.len() });
        }

        {
            let mmio = self.mmio.lock().unwrap();
            let rom = self.rom.lock().unwrap();
            for &(addr, len) in segments {
                if let Resolved::Mmio(_) = Self::resolve(&mmio, &rom, self.ram.size(), addr, len) {
                    return Err(MemoryBusError::MmioAccess { addr, len });
                }
            }
        }

        self.write_sg(segments, src)
    }

    pub fn try_read_u8(&self, addr: u64) -> Result<u8, MemoryBusError> {
        let mut buf = [0u8; 1];
        self.try_read_bytes(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Code hash over a physical range, used by the code cache to detect self-modified blocks
    /// (§4.9, §8.6). FNV-1a: fast, stable across runs, and collision rates are irrelevant here
    /// since a false negative only costs an extra recompile.
    pub fn code_hash(&self, addr: u64, len: usize) -> u64 {
        let mut buf = vec![0u8; len];
        if self.try_read_bytes(addr, &mut buf).is_err() {
            return 0;
        }
        const FNV_OFFSET: u64 = 0xcbf29ce484222325;
        const FNV_PRIME: u64 = 0x100000001b3;
        let mut hash = FNV_OFFSET;
        for byte in buf {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// A safe stand-in for the reference implementation's raw `get_ram_pointer`: returns an owned
    /// snapshot of `len` bytes if they lie entirely within backed RAM (no MMIO/ROM straddling),
    /// or `None` if the fast path doesn't apply and the caller should fall back to `read_bytes`.
    /// We copy rather than alias because a host pointer has no business in architectural state
    /// (see the Design Notes on fixed-size integer discipline) and because `PhysicalMemory`'s
    /// chunks live behind a mutex.
    pub fn get_ram_pointer(&self, addr: u64, len: usize) -> Option<Box<[u8]>> {
        let mmio = self.mmio.lock().unwrap();
        let rom = self.rom.lock().unwrap();
        match Self::resolve(&mmio, &rom, self.ram.size(), addr, len) {
            Resolved::Ram => {
                let mut buf = vec![0u8; len];
                self.ram.try_read_bytes(addr, &mut buf).ok()?;
                Some(buf.into_boxed_slice())
            }
            _ => None,
        }
    }

    pub fn is_cachable_page(&self, phys_page: u32) -> bool {
        let addr = phys_page as u64 * self.page_size;
        let mmio = self.mmio.lock().unwrap();
        let rom = self.rom.lock().unwrap();
        matches!(
            Self::resolve(&mmio, &rom, self.ram.size(), addr, self.page_size as usize),
            Resolved::Ram
        )
    }

    pub fn is_dirty(&self, phys_page: u32) -> bool {
        self.dirty_pages.lock().unwrap().get(phys_page as usize).copied().unwrap_or(false)
    }

    pub fn clear_page_dirty(&self, phys_page: u32) {
        if let Some(slot) = self.dirty_pages.lock().unwrap().get_mut(phys_page as usize) {
            *slot = false;
        }
    }

    pub fn clear_all_page_dirty(&self) {
        self.dirty_pages.lock().unwrap().iter_mut().for_each(|d| *d = false);
    }

    pub fn read_port(&self, port: u16, width: u8) -> u32 {
        let regions = self.ports.lock().unwrap();
        match regions.iter().find(|r| r.ports.contains(&port)) {
            Some(region) => region.handler.read(port, width),
            None => match width {
                1 => 0xFF,
                2 => 0xFFFF,
                _ => 0xFFFF_FFFF,
            },
        }
    }

    pub fn write_port(&self, port: u16, width: u8, value: u32) {
        let regions = self.ports.lock().unwrap();
        if let Some(region) = regions.iter().find(|r| r.ports.contains(&port)) {
            region.handler.write(port, width, value);
        }
    }
}

fn ranges_overlap(a: &Range<u64>, b: &Range<u64>) -> bool {
    a.start < b.end && b.start < a.end
}

macro_rules! bus_typed_accessors {
    ($read:ident, $write:ident, $ty:ty) => {
        impl MemoryBus {
            #[track_caller]
            pub fn $read(&self, addr: u64) -> $ty {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                self.read_bytes(addr, &mut buf);
                <$ty>::from_le_bytes(buf)
            }

            #[track_caller]
            pub fn $write(&self, addr: u64, value: $ty) {
                self.write_bytes(addr, &value.to_le_bytes());
            }
        }
    };
}

bus_typed_accessors!(read_u8, write_u8, u8);
bus_typed_accessors!(read_u16, write_u16, u16);
bus_typed_accessors!(read_u32, write_u32, u32);
bus_typed_accessors!(read_u64, write_u64, u64);
bus_typed_accessors!(read_u128, write_u128, u128);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TestMmio {
        writes: Mutex<Vec<(u64, Vec<u8>)>>,
    }

    impl MmioHandler for TestMmio {
        fn read(&self, offset: u64, data: &mut [u8]) {
            for (i, b) in data.iter_mut().enumerate() {
                *b = 0xA0u8.wrapping_add(offset as u8).wrapping_add(i as u8);
            }
        }

        fn write(&self, offset: u64, data: &[u8]) {
            self.writes.lock().unwrap().push((offset, data.to_vec()));
        }
    }

    #[derive(Default)]
    struct CountingMmio {
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl MmioHandler for CountingMmio {
        fn read(&self, _offset: u64, data: &mut [u8]) {
            self.reads.fetch_add(1, Ordering::Relaxed);
            data.fill(0xCC);
        }

        fn write(&self, _offset: u64, _data: &[u8]) {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn make_ram(size: u64) -> Arc<PhysicalMemory> {
        Arc::new(PhysicalMemory::with_options(size, PhysicalMemoryOptions { chunk_size: 4096 }).unwrap())
    }

    #[test]
    fn sparse_allocation_only_on_write() {
        let mem = make_ram(0x10_0000);
        assert_eq!(mem.allocated_chunks(), 0);

        let mut buf = [0u8; 16];
        mem.read_bytes(0x2000, &mut buf);
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(mem.allocated_chunks(), 0, "reads must not allocate");

        mem.write_u8(0x2000, 0xAA);
        assert_eq!(mem.allocated_chunks(), 1);

        mem.write_u8(0x3000, 0xCC);
        assert_eq!(mem.allocated_chunks(), 2);
    }

    #[test]
    fn mmio_mapping_boundaries() {
        let ram = make_ram(0x200);
        ram.write_u8(0x7F, 0x11);
        ram.write_u8(0x90, 0x22);

        let mut bus = MemoryBus::new(ram.clone());
        let mmio = Arc::new(TestMmio::default());
        bus.register_mmio(0x80..0x90, mmio.clone()).unwrap();

        assert_eq!(bus.read_u8(0x7F), 0x11);
        assert_eq!(bus.read_u8(0x80), 0xA0);
        assert_eq!(bus.read_u8(0x8F), 0xA0 + 0x0F);
        assert_eq!(bus.read_u8(0x90), 0x22);

        bus.write_u32(0x84, 0x1122_3344);
        let writes = mmio.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 0x04);
        assert_eq!(writes[0].1, vec![0x44, 0x33, 0x22, 0x11]);
        assert_eq!(ram.read_u32(0x84), 0);
    }

    #[test]
    fn rom_writes_are_ignored() {
        let ram = make_ram(0x200);
        let mut bus = MemoryBus::new(ram.clone());
        bus.register_rom(0x40, Arc::from([0xDEu8, 0xAD, 0xBE, 0xEF])).unwrap();

        bus.write_u32(0x40, 0x1122_3344);

        let mut buf = [0u8; 4];
        bus.read_bytes(0x40, &mut buf);
        assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn dma_rejects_mmio_without_side_effects_or_partial_write() {
        let ram = make_ram(0x4000);
        let mut bus = MemoryBus::new(ram.clone());
        let mmio = Arc::new(CountingMmio::default());
        bus.register_mmio(0x2000..0x2100, mmio.clone()).unwrap();

        ram.write_bytes(0x1FF0, &[0xAA; 16]);

        let err = bus.try_write_sg(&[(0x1FF0, 16), (0x2000, 4)], &[0x55; 20]).unwrap_err();
        assert!(matches!(err, MemoryBusError::MmioAccess { .. }));
        assert_eq!(mmio.reads.load(Ordering::Relaxed), 0);

        let mut buf = [0u8; 16];
        ram.read_bytes(0x1FF0, &mut buf);
        assert_eq!(buf, [0xAA; 16]);
    }

    #[test]
    fn smc_dirty_tracking_flags_the_written_page() {
        let ram = make_ram(0x8000);
        let bus = MemoryBus::new(ram);

        assert!(!bus.is_dirty(1));
        bus.write_u8(0x1000, 0x90);
        assert!(bus.is_dirty(1));
        bus.clear_page_dirty(1);
        assert!(!bus.is_dirty(1));
    }

    #[test]
    fn code_hash_changes_after_smc_write() {
        let ram = make_ram(0x8000);
        let bus = MemoryBus::new(ram);
        bus.write_bytes(0x10000 & 0x7FFF, &[0x90, 0x90, 0x90, 0xC3]);
        let before = bus.code_hash(0, 4);
        bus.write_u8(0, 0xEB);
        let after = bus.code_hash(0, 4);
        assert_ne!(before, after);
    }

    #[test]
    fn out_of_bounds_read_panics_at_the_bus_call_site() {
        let ram = make_ram(0x10);
        let bus = MemoryBus::new(ram);
        let (file, _line) = test_util::capture_panic_location(|| {
            let mut buf = [0u8; 4];
            bus.read_bytes(0x20, &mut buf);
        });
        assert!(file.ends_with("lib.rs"));
    }

    #[test]
    fn checked_access_does_not_panic_on_unmapped_memory() {
        let ram = make_ram(0x10);
        let bus = MemoryBus::new(ram);
        let mut buf = [0u8; 4];
        assert!(!bus.checked_read_bytes(0x100, &mut buf));
        assert!(!bus.checked_write_bytes(0x100, &[0u8; 4]));
    }

    #[test]
    fn memcpy_from_guest_allocation_failure_returns_error_instead_of_panicking() {
        let ram = make_ram(0x1000);
        let bus = MemoryBus::new(ram);
        let err = bus.memcpy_from_guest(0, usize::MAX).unwrap_err();
        assert!(matches!(err, MemoryBusError::OutOfMemory { .. }));
    }
}
