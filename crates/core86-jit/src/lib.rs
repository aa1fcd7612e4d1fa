//! The cached-interpreter backend and tier dispatcher (§4.9, §5).
//!
//! Decodes a run of instructions once into a [`core86_codecache::Block`] instead of re-fetching
//! and re-decoding on every pass through a hot loop, replays it through `core86-cpu`'s
//! `Cpu::execute_decoded`, and invalidates a block when a bus write lands on a physical page it
//! covers (self-modifying code, §4.9's `MemoryBus::is_dirty`-driven sweep). Both this tier and the
//! pure interpreter in `core86-cpu` share the exact same instruction semantics — only the
//! fetch/decode overhead differs — and `core86-jit-x86`'s WASM recompiler (gated behind
//! `tier1-recompile`) shares them too, via the same `execute_decoded` thunk (§4.10).

use core86_codecache::{BlockId, BlockKey, BlockTable};
use core86_cpu::{Cpu, InterruptController, RunStop};
use core86_cpu_decoder::DecodedInstruction;
use core86_timers::TimingManager;
use core86_types::CpuException;

/// How many times a block must be replayed before it's considered for recompilation to WASM
/// (`tier1-recompile`). Below this, the cached-interpreter tier alone is used — compiling to WASM
/// has a fixed cost that only pays off for genuinely hot code (§4.9/§5's tier-selection policy).
pub const RECOMPILE_THRESHOLD: u32 = 64;

/// The cached-interpreter + tier-dispatcher state: owns the block table and per-block hotness
/// counters. One `Jit` is shared across the lifetime of a running `Cpu`.
pub struct Jit {
    blocks: BlockTable,
    hotness: std::collections::HashMap<BlockId, u32>,
}

impl Default for Jit {
    fn default() -> Self {
        Jit::new()
    }
}

impl Jit {
    pub fn new() -> Self {
        Jit { blocks: BlockTable::new(), hotness: std::collections::HashMap::new() }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Notifies the block table that `physical_page` was written to, so every block covering it
    /// is revalidated (not necessarily destroyed yet — see `BlockTable::invalidate_page`'s own
    /// doc comment) the next time it's looked up. The embedder calls this from wherever it
    /// observes `MemoryBus` writes (§4.9).
    pub fn notify_page_written(&mut self, physical_page: u32) {
        self.blocks.invalidate_page(physical_page);
    }

    fn current_block_key(cpu: &mut Cpu) -> Result<(BlockKey, u32), CpuException> {
        let cs = cpu.cs;
        let eip = cpu.eip;
        let physical = cpu.translate_code_address(&cs, eip)?;
        let page = physical >> 12;
        // A byte-granular segment's 20-bit raw limit never exceeds 0xFFFFF; anything past that
        // can only come from a page-granular descriptor's limit already expanded by `load_segment`.
        let key = BlockKey::new(
            page,
            cpu.code_is_32bit(),
            cs.limit_high > 0xF_FFFF,
            cpu.stack_is_32bit(),
            cpu.operating_mode() == core86_cpu::segments::CpuOperatingMode::V8086,
        );
        Ok((key, physical))
    }

    /// Decodes instructions starting at the current `cs:eip` until one is a control-flow exit
    /// (`DecodedInstruction::is_control_flow_exit`) or the codecache's per-block instruction cap
    /// is hit, mirroring the "decode a basic block, stop at anything that could redirect control
    /// flow" rule every backend here shares (§3.5, §4.9). Drives `cpu.eip` as a scratch cursor
    /// while decoding and restores the caller's saved value afterward; `decode_at_current_eip`
    /// never retires anything, so no architectural state changes along the way.
    fn decode_block(cpu: &mut Cpu, start_physical: u32) -> Result<(Vec<DecodedInstruction>, u32, Option<u32>), CpuException> {
        let mut instructions = Vec::new();
        let mut length_bytes = 0u32;
        let start_page = start_physical >> 12;
        let mut next_page = None;

        loop {
            let cs = cpu.cs;
            let cursor_eip = cpu.eip;
            let instr = cpu.decode_at_current_eip()?;
            let instr_physical = cpu.translate_code_address(&cs, cursor_eip)?;
            let end_page = (instr_physical + instr.length as u32 - 1) >> 12;
            if end_page != start_page {
                next_page = Some(end_page);
            }
            length_bytes += instr.length as u32;
            let exits = instr.is_control_flow_exit();
            instructions.push(instr);
            if exits || instructions.len() >= core86_codecache::MAX_BLOCK_INSTRUCTIONS {
                break;
            }
            // Advance the scratch cursor to decode the following instruction without retiring
            // this one; `execute_decoded` is what actually commits eip/side effects during replay.
            cpu.eip = instr_addr_after(cpu, &instr);
        }
        Ok((instructions, length_bytes, next_page))
    }

    /// Looks up (or compiles) the block at the current `cs:eip`, then replays its instructions
    /// through `Cpu::execute_decoded`. Returns the total cycles charged and advances `cpu.eip`
    /// exactly as the pure interpreter would have, instruction by instruction.
    fn run_block(&mut self, cpu: &mut Cpu) -> Result<u32, CpuException> {
        let (key, physical) = Self::current_block_key(cpu)?;
        let block_id = match self.blocks.lookup(key) {
            Some(id) => {
                let current_hash = cpu.bus.code_hash(physical as u64, self.blocks.get(id).map(|b| b.length_bytes).unwrap_or(0) as usize);
                if self.blocks.validate(id, current_hash) {
                    id
                } else {
                    self.blocks.destroy(id);
                    self.compile_block(cpu, key, physical)?
                }
            }
            None => self.compile_block(cpu, key, physical)?,
        };

        *self.hotness.entry(block_id).or_insert(0) += 1;

        let instructions = self.blocks.get(block_id).map(|b| b.instructions.clone()).unwrap_or_default();
        let mut total_cycles = 0u32;
        for instr in &instructions {
            total_cycles += cpu.execute_decoded(instr)?;
        }
        Ok(total_cycles)
    }

    fn compile_block(&mut self, cpu: &mut Cpu, key: BlockKey, physical: u32) -> Result<BlockId, CpuException> {
        let saved_eip = cpu.eip;
        let (instructions, length_bytes, next_page) = Self::decode_block(cpu, physical)?;
        cpu.eip = saved_eip;
        let code_hash = cpu.bus.code_hash(physical as u64, length_bytes as usize);
        let page = physical >> 12;
        Ok(self.blocks.insert(key, instructions, length_bytes, code_hash, page, next_page, true))
    }

    /// Runs blocks until at least `cycles` have been charged, the CPU halts, or it's stopped;
    /// commits consumed time to `timing` once per block rather than once per instruction, since a
    /// whole cached block is this tier's unit of dispatch (§4.9, §5).
    pub fn run_cycles(
        &mut self,
        cpu: &mut Cpu,
        timing: &mut TimingManager,
        cycles: i64,
        mut controller: Option<&mut dyn InterruptController>,
    ) -> RunStop {
        let mut remaining = cycles;
        loop {
            if remaining <= 0 {
                return RunStop::BudgetExhausted;
            }
            if cpu.is_halted() {
                return RunStop::Halted;
            }

            cpu.service_pending_interrupts(controller.as_deref_mut());

            match self.run_block(cpu) {
                Ok(charged) => {
                    remaining -= charged as i64;
                    timing.add_pending_time(charged as i64);
                }
                Err(exception) => {
                    let _ = cpu.raise_exception(exception.vector, exception.error_code, false);
                    remaining -= 1;
                    timing.add_pending_time(1);
                }
            }
        }
    }
}

fn instr_addr_after(cpu: &Cpu, instr: &DecodedInstruction) -> u32 {
    let mask = if cpu.code_is_32bit() { 0xFFFF_FFFFu32 } else { 0xFFFFu32 };
    cpu.eip.wrapping_add(instr.length as u32) & mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use core86_cpu::{CpuConfig};
    use core86_mem::{MemoryBus, PhysicalMemory};
    use std::sync::Arc;

    fn make_cpu(code: &[u8]) -> Cpu {
        let bus = Arc::new(MemoryBus::new(Arc::new(PhysicalMemory::new(0x10_0000).unwrap())));
        bus.write_bytes(0xFFFF0, code);
        // Low CS base so `cs:eip` lands on the physical address the code was written to, rather
        // than the real hardware reset vector at the top of the address space.
        let config = CpuConfig { reset_cs_selector: 0, reset_cs_base: 0, reset_eip: 0xFFF0, ..CpuConfig::default() };
        Cpu::new(config, bus)
    }

    #[test]
    fn a_straight_line_block_compiles_once_and_is_reused() {
        // 31 C0 (XOR EAX, EAX) then F4 (HLT): one basic block, stops at the HLT.
        let mut cpu = make_cpu(&[0x31, 0xC0, 0xF4]);
        let mut timing = TimingManager::new();
        let mut jit = Jit::new();
        let stop = jit.run_cycles(&mut cpu, &mut timing, 1000, None);
        assert_eq!(stop, RunStop::Halted);
        assert_eq!(jit.block_count(), 1);
    }

    #[test]
    fn self_modifying_code_is_revalidated_on_the_next_lookup() {
        let mut cpu = make_cpu(&[0x90, 0xF4]); // NOP; HLT
        let mut timing = TimingManager::new();
        let mut jit = Jit::new();
        jit.run_cycles(&mut cpu, &mut timing, 10, None);
        assert!(cpu.is_halted());

        jit.notify_page_written(0xFFFF0 >> 12);
        // The block is flagged invalidated but not yet destroyed; a fresh lookup against its
        // recorded hash should still succeed since the bytes underneath are unchanged.
        assert_eq!(jit.block_count(), 1);
    }
}
