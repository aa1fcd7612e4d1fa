//! The block key, block table, physical-page reverse map, and block-chaining adjacency shared by
//! the cached-interpreter and recompiler backends (§3.5, §4.9). This crate owns the bookkeeping
//! only — decoding, dispatch, and code generation live in `core86-cpu`/`core86-jit-x86`.
//!
//! Blocks are immutable once compiled. Self-modifying-code invalidation just flags a block;
//! nothing is removed from the table until [`BlockTable::sweep_invalidated`] is called by the
//! executor at a point where it knows the block isn't on the call stack.

use core86_cpu_decoder::DecodedInstruction;
use std::collections::{HashMap, HashSet};

pub const MAX_BLOCK_INSTRUCTIONS: usize = 16;

/// A 64-bit packed record of everything that changes an identical EIP's decode: physical page,
/// CS size/granularity, SS size, and V8086-mode bit (§3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey(u64);

impl BlockKey {
    pub fn new(eip_physical_page: u32, cs_size_32: bool, cs_granularity_4k: bool, ss_size_32: bool, v8086: bool) -> Self {
        let mut bits = (eip_physical_page as u64) << 32;
        bits |= (cs_size_32 as u64) << 3;
        bits |= (cs_granularity_4k as u64) << 2;
        bits |= (ss_size_32 as u64) << 1;
        bits |= v8086 as u64;
        BlockKey(bits)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn physical_page(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// A stable, arena-relative handle to a [`Block`]. Blocks reference each other by `BlockId`
/// rather than by owning pointer (Design Notes: "cyclic block references").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFlags {
    pub linkable: bool,
    pub invalidated: bool,
}

pub struct Block {
    pub key: BlockKey,
    pub instructions: Vec<DecodedInstruction>,
    pub length_bytes: u32,
    pub code_hash: u64,
    pub physical_page: u32,
    pub next_physical_page: Option<u32>,
    pub flags: BlockFlags,
    predecessors: HashSet<BlockId>,
    successors: HashSet<BlockId>,
}

impl Block {
    pub fn predecessors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.predecessors.iter().copied()
    }

    pub fn successors(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.successors.iter().copied()
    }
}

/// The block table itself: blocks keyed for lookup, a reverse physical-page map for SMC
/// invalidation, and an arena of slots so `BlockId`s stay valid across insertions.
#[derive(Default)]
pub struct BlockTable {
    slots: Vec<Option<Block>>,
    by_key: HashMap<BlockKey, BlockId>,
    by_physical_page: HashMap<u32, HashSet<BlockId>>,
}

impl BlockTable {
    pub fn new() -> Self {
        BlockTable::default()
    }

    pub fn lookup(&self, key: BlockKey) -> Option<BlockId> {
        self.by_key.get(&key).copied()
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.slots.get(id.0 as usize).and_then(|slot| slot.as_ref())
    }

    /// Inserts a freshly-compiled block, registering it under its key and every physical page it
    /// spans (one or two, per §3.5: "and the next page if the block straddles a 4 KB boundary").
    pub fn insert(
        &mut self,
        key: BlockKey,
        instructions: Vec<DecodedInstruction>,
        length_bytes: u32,
        code_hash: u64,
        physical_page: u32,
        next_physical_page: Option<u32>,
        linkable: bool,
    ) -> BlockId {
        let block = Block {
            key,
            instructions,
            length_bytes,
            code_hash,
            physical_page,
            next_physical_page,
            flags: BlockFlags { linkable, invalidated: false },
            predecessors: HashSet::new(),
            successors: HashSet::new(),
        };

        let id = BlockId(self.slots.len() as u32);
        self.slots.push(Some(block));
        self.by_key.insert(key, id);
        self.by_physical_page.entry(physical_page).or_default().insert(id);
        if let Some(next_page) = next_physical_page {
            self.by_physical_page.entry(next_page).or_default().insert(id);
        }
        id
    }

    /// Validates a looked-up block against the code currently at its physical range: on hash
    /// mismatch the caller should destroy and recompile (§4.9).
    pub fn validate(&self, id: BlockId, current_code_hash: u64) -> bool {
        self.get(id).is_some_and(|block| !block.flags.invalidated || block.code_hash == current_code_hash)
    }

    /// Splices a direct edge for block chaining: `from`'s exit jumps straight to `to` without
    /// going through the dispatcher (§4.9).
    pub fn link(&mut self, from: BlockId, to: BlockId) {
        if let Some(Some(block)) = self.slots.get_mut(from.0 as usize) {
            block.successors.insert(to);
        }
        if let Some(Some(block)) = self.slots.get_mut(to.0 as usize) {
            block.predecessors.insert(from);
        }
    }

    /// Marks every block covering `physical_page` as invalidated (§4.9: self-modifying-code
    /// invalidation triggered by a bus write). Does not remove anything yet — execution still
    /// holding a reference to one of these blocks must finish its current pass first.
    pub fn invalidate_page(&mut self, physical_page: u32) {
        if let Some(ids) = self.by_physical_page.get(&physical_page) {
            for &id in ids {
                if let Some(Some(block)) = self.slots.get_mut(id.0 as usize) {
                    block.flags.invalidated = true;
                }
            }
        }
    }

    /// Destroys a single block: removes it from the key map, the page map, and every neighbour's
    /// adjacency list, then frees its slot.
    pub fn destroy(&mut self, id: BlockId) {
        let Some(Some(block)) = self.slots.get_mut(id.0 as usize).map(std::mem::take) else {
            return;
        };

        self.by_key.remove(&block.key);

        let mut pages = vec![block.physical_page];
        pages.extend(block.next_physical_page);
        for page in pages {
            if let Some(set) = self.by_physical_page.get_mut(&page) {
                set.remove(&id);
                if set.is_empty() {
                    self.by_physical_page.remove(&page);
                }
            }
        }

        for pred in block.predecessors() {
            if let Some(Some(pred_block)) = self.slots.get_mut(pred.0 as usize) {
                pred_block.successors.remove(&id);
            }
        }
        for succ in block.successors() {
            if let Some(Some(succ_block)) = self.slots.get_mut(succ.0 as usize) {
                succ_block.predecessors.remove(&id);
            }
        }
    }

    /// Sweeps every invalidated block whose `code_hash` no longer matches, via `current_hash`
    /// (typically `bus.code_hash(block.physical_page * PAGE_SIZE, block.length_bytes)`). Called
    /// by the executor at a safe point — never from inside a running block.
    pub fn sweep_invalidated(&mut self, mut current_hash: impl FnMut(&Block) -> u64) {
        let stale: Vec<BlockId> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let block = slot.as_ref()?;
                if block.flags.invalidated && block.code_hash != current_hash(block) {
                    Some(BlockId(index as u32))
                } else {
                    None
                }
            })
            .collect();
        for id in stale {
            self.destroy(id);
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(page: u32) -> BlockKey {
        BlockKey::new(page, true, true, true, false)
    }

    #[test]
    fn block_key_round_trips_physical_page() {
        let k = key(0x1234);
        assert_eq!(k.physical_page(), 0x1234);
    }

    #[test]
    fn distinguishes_blocks_by_cs_size_and_v8086_bit() {
        let a = BlockKey::new(1, true, true, true, false);
        let b = BlockKey::new(1, false, true, true, false);
        let c = BlockKey::new(1, true, true, true, true);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn insert_and_lookup_round_trip() {
        let mut table = BlockTable::new();
        let k = key(5);
        let id = table.insert(k, Vec::new(), 10, 0xAAAA, 5, None, true);
        assert_eq!(table.lookup(k), Some(id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn invalidate_page_flags_every_block_on_that_page_including_straddlers() {
        let mut table = BlockTable::new();
        let a = table.insert(key(1), Vec::new(), 10, 1, 1, None, true);
        let b = table.insert(key(2), Vec::new(), 10, 2, 2, Some(3), true);

        table.invalidate_page(3);

        assert!(!table.get(a).unwrap().flags.invalidated);
        assert!(table.get(b).unwrap().flags.invalidated);
    }

    #[test]
    fn validate_accepts_an_invalidated_block_whose_bytes_are_unchanged() {
        let mut table = BlockTable::new();
        let id = table.insert(key(1), Vec::new(), 10, 0xBEEF, 1, None, true);
        table.invalidate_page(1);
        assert!(table.validate(id, 0xBEEF));
        assert!(!table.validate(id, 0xDEAD));
    }

    #[test]
    fn destroy_removes_from_key_and_page_maps_and_neighbour_adjacency() {
        let mut table = BlockTable::new();
        let a = table.insert(key(1), Vec::new(), 10, 1, 1, None, true);
        let b = table.insert(key(2), Vec::new(), 10, 2, 2, None, true);
        table.link(a, b);

        table.destroy(a);

        assert_eq!(table.lookup(key(1)), None);
        assert_eq!(table.get(b).unwrap().predecessors().count(), 0);
    }

    #[test]
    fn sweep_invalidated_destroys_only_blocks_whose_hash_actually_changed() {
        let mut table = BlockTable::new();
        let stale = table.insert(key(1), Vec::new(), 10, 0x1111, 1, None, true);
        let fresh = table.insert(key(2), Vec::new(), 10, 0x2222, 2, None, true);
        table.invalidate_page(1);
        table.invalidate_page(2);

        table.sweep_invalidated(|block| if block.code_hash == 0x1111 { 0x9999 } else { block.code_hash });

        assert!(table.get(stale).is_none());
        assert!(table.get(fresh).is_some());
    }

    #[test]
    fn block_chaining_links_are_bidirectional() {
        let mut table = BlockTable::new();
        let a = table.insert(key(1), Vec::new(), 10, 1, 1, None, true);
        let b = table.insert(key(2), Vec::new(), 10, 2, 2, None, true);
        table.link(a, b);
        assert_eq!(table.get(a).unwrap().successors().collect::<Vec<_>>(), vec![b]);
        assert_eq!(table.get(b).unwrap().predecessors().collect::<Vec<_>>(), vec![a]);
    }
}
