//! The recompiler (§4.10): register-cache bookkeeping shared across recompilation strategies,
//! plus the WASM code generator that is the teacher's own recompilation target — Aero is a
//! browser-hosted VM, so "host machine code" for its recompiler *is* a WASM module, executed here
//! via `wasmtime` for native testing exactly as the teacher's `aero-jit-x86` does.
//!
//! Two tiers are named by `SPEC_FULL.md`: `tier0-interp`, implemented below, compiles a block to
//! a WASM loop that calls back into `core86-cpu`'s interpreter once per instruction — always
//! correct by construction, since it defers to the same semantic model the pure interpreter and
//! cached-interpreter backends use. `tier1-recompile` is the inline-arithmetic lowering the
//! teacher's real recompiler performs; its register-cache data structures are built here
//! (`RegisterState`, `RegisterCache`) since the cache is strategy-independent bookkeeping, but the
//! instruction-by-instruction WASM lowering itself is future work (see DESIGN.md).

use core86_codecache::Block;
use thiserror::Error;
use wasm_encoder::{
    BlockType, CodeSection, EntityType, ExportKind, ExportSection, Function, FunctionSection, ImportSection,
    Instruction, Module, TypeSection, ValType,
};

pub const GPR_COUNT: usize = 8;

/// A recompiled register's provenance (`recompiler_register_cache.cpp`'s distinction): a value
/// known at compile time as a constant never round-trips through a WASM local, so a chain of
/// immediate adds folds away instead of repeatedly spilling/reloading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterState {
    Constant(u32),
    Cached(HostRegister),
    Unknown,
}

/// A WASM local index standing in for a cached architectural GPR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostRegister(pub u32);

/// Tracks, per architectural GPR, whether the recompiler currently knows it as a constant, has it
/// live in a host (WASM local) register, or must reload it from the `Cpu` thunk. Allocation is
/// append-only within one block's compilation: `assign_local` hands out the next free local index
/// and never reuses one, keeping the scheme simple at the cost of not packing locals tightly.
#[derive(Debug, Clone)]
pub struct RegisterCache {
    slots: [RegisterState; GPR_COUNT],
    next_local: u32,
}

impl RegisterCache {
    pub fn new(first_local: u32) -> Self {
        RegisterCache { slots: [RegisterState::Unknown; GPR_COUNT], next_local: first_local }
    }

    pub fn state(&self, gpr: usize) -> RegisterState {
        self.slots[gpr]
    }

    pub fn set_constant(&mut self, gpr: usize, value: u32) {
        self.slots[gpr] = RegisterState::Constant(value);
    }

    /// Assigns (or returns the already-assigned) WASM local for `gpr`, discarding any constant it
    /// held — the point at which a folded-constant chain must finally materialize into a live
    /// register.
    pub fn assign_local(&mut self, gpr: usize) -> HostRegister {
        if let RegisterState::Cached(local) = self.slots[gpr] {
            return local;
        }
        let local = HostRegister(self.next_local);
        self.next_local += 1;
        self.slots[gpr] = RegisterState::Cached(local);
        local
    }

    pub fn invalidate(&mut self, gpr: usize) {
        self.slots[gpr] = RegisterState::Unknown;
    }

    pub fn locals_allocated(&self) -> u32 {
        self.next_local
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecompileError {
    #[error("block has no instructions to compile")]
    EmptyBlock,
    #[error("block has {0} instructions, exceeding the recompiler's budget of {1}")]
    TooLarge(usize, usize),
}

/// Host import the generated module calls once per instruction: `(block_key: i64, index: i32) ->
/// i32`, returning 0 to stop the block (the instruction was a control-flow exit, or the host
/// signalled a fault/invalidation) and nonzero to keep going. `core86-jit`'s tier dispatcher
/// supplies this import, backed by `Cpu::execute_decoded` (§4.10's thunk ABI).
pub const THUNK_IMPORT_MODULE: &str = "core86";
pub const THUNK_IMPORT_NAME: &str = "execute_instruction";
pub const RUN_EXPORT_NAME: &str = "run";

/// Emits a WASM module for `block`: a loop over its instruction indices, each iteration calling
/// back into the host thunk, stopping when the thunk reports the block is done. This is the
/// `tier0-interp` baseline — every recompiled block is correct by construction because it defers
/// every architectural effect to `core86-cpu`'s interpreter; it exists to exercise the WASM
/// codegen and thunk ABI surface a future `tier1-recompile` inline lowering would reuse.
pub fn compile_block_to_wasm(block: &Block) -> Result<Vec<u8>, RecompileError> {
    if block.instructions.is_empty() {
        return Err(RecompileError::EmptyBlock);
    }
    if block.instructions.len() > core86_codecache::MAX_BLOCK_INSTRUCTIONS {
        return Err(RecompileError::TooLarge(block.instructions.len(), core86_codecache::MAX_BLOCK_INSTRUCTIONS));
    }

    let mut types = TypeSection::new();
    types.function([ValType::I64, ValType::I32], [ValType::I32]); // thunk: (block_key, index) -> continue
    types.function([], []); // run: () -> ()

    let mut imports = ImportSection::new();
    imports.import(THUNK_IMPORT_MODULE, THUNK_IMPORT_NAME, EntityType::Function(0));

    let mut functions = FunctionSection::new();
    functions.function(1);

    const BLOCK_KEY_LOCAL: u32 = 0;
    const INDEX_LOCAL: u32 = 1;
    let mut func = Function::new([(1, ValType::I64), (1, ValType::I32)]);
    func.instruction(&Instruction::I64Const(block.key.raw() as i64));
    func.instruction(&Instruction::LocalSet(BLOCK_KEY_LOCAL));
    func.instruction(&Instruction::I32Const(0));
    func.instruction(&Instruction::LocalSet(INDEX_LOCAL));

    func.instruction(&Instruction::Block(BlockType::Empty)); // label 1: break = done
    func.instruction(&Instruction::Loop(BlockType::Empty)); // label 0: continue = next instruction
    func.instruction(&Instruction::LocalGet(BLOCK_KEY_LOCAL));
    func.instruction(&Instruction::LocalGet(INDEX_LOCAL));
    func.instruction(&Instruction::Call(0));
    func.instruction(&Instruction::I32Eqz);
    func.instruction(&Instruction::BrIf(1)); // thunk said stop
    func.instruction(&Instruction::LocalGet(INDEX_LOCAL));
    func.instruction(&Instruction::I32Const(1));
    func.instruction(&Instruction::I32Add);
    func.instruction(&Instruction::LocalTee(INDEX_LOCAL));
    func.instruction(&Instruction::I32Const(block.instructions.len() as i32));
    func.instruction(&Instruction::I32LtU);
    func.instruction(&Instruction::BrIf(0)); // more instructions in this block
    func.instruction(&Instruction::End); // loop
    func.instruction(&Instruction::End); // block
    func.instruction(&Instruction::End); // function body

    let mut code = CodeSection::new();
    code.function(&func);

    let mut exports = ExportSection::new();
    exports.export(RUN_EXPORT_NAME, ExportKind::Func, 1);

    let mut module = Module::new();
    module.section(&types);
    module.section(&imports);
    module.section(&functions);
    module.section(&exports);
    module.section(&code);
    Ok(module.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core86_codecache::{BlockKey, BlockTable};

    fn nop() -> core86_cpu_decoder::DecodedInstruction {
        core86_cpu_decoder::decode_one(&[0x90], 0, 32).expect("NOP always decodes")
    }

    fn table_with_block(instructions: Vec<core86_cpu_decoder::DecodedInstruction>) -> (BlockTable, core86_codecache::BlockId) {
        let mut table = BlockTable::new();
        let key = BlockKey::new(0x1000, true, true, true, false);
        let len = instructions.len() as u32;
        let id = table.insert(key, instructions, len, 0xABCD, 1, None, true);
        (table, id)
    }

    #[test]
    fn register_cache_folds_constants_without_a_local() {
        let mut cache = RegisterCache::new(2);
        cache.set_constant(0, 0x1234);
        assert_eq!(cache.state(0), RegisterState::Constant(0x1234));
        assert_eq!(cache.locals_allocated(), 2);
    }

    #[test]
    fn assigning_a_local_is_stable_across_repeated_requests() {
        let mut cache = RegisterCache::new(2);
        let first = cache.assign_local(3);
        let second = cache.assign_local(3);
        assert_eq!(first, second);
        assert_eq!(cache.locals_allocated(), 3);
    }

    #[test]
    fn empty_block_is_rejected() {
        let (table, id) = table_with_block(Vec::new());
        let block = table.get(id).unwrap();
        assert_eq!(compile_block_to_wasm(block), Err(RecompileError::EmptyBlock));
    }

    #[test]
    fn compiled_module_parses_as_valid_wasm() {
        let (table, id) = table_with_block(vec![nop(), nop(), nop()]);
        let block = table.get(id).unwrap();
        let bytes = compile_block_to_wasm(block).unwrap();
        wasmparser::Validator::new(wasmparser::WasmFeatures::default())
            .validate_all(&bytes)
            .expect("emitted module must validate");
    }
}
