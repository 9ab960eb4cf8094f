//! Process-wide registry mapping a block header's `block_index` to the
//! arena (or MMF allocator) that owns it, so `Free` can dispatch by
//! reading twelve header bytes instead of scanning every allocator
//! instance in the process.

use std::sync::{Arc, Mutex, RwLock};

use crate::block::Block;
use crate::error::{Error, Result};
use crate::segment::MmfId;

/// Anything a `block_index` can resolve to: an SBA/LBA arena, or (via
/// the `mmf_id` path below) an MMF-backed allocator.
pub trait BlockOwner: Send + Sync {
    fn free_block(&self, block: Block) -> Result<bool>;
}

/// Process-local table mapping `MmfId -> owning MmfAllocator`, mirroring
/// `segment::MMF_BASE_TABLE`'s address table but for dispatch instead of
/// pointer resolution. Kept separate from `BlockReferential`'s
/// `block_index` slots since an MMF allocator's identity must resolve
/// the same way in every process that has the file mapped, not just
/// the process that happened to register it first.
static MMF_OWNER_TABLE: RwLock<Vec<Option<Arc<dyn BlockOwner>>>> = RwLock::new(Vec::new());

pub fn register_mmf_owner(id: MmfId, owner: Arc<dyn BlockOwner>) {
    let mut table = MMF_OWNER_TABLE.write().unwrap();
    let idx = id as usize;
    if table.len() <= idx {
        table.resize(idx + 1, None);
    }
    table[idx] = Some(owner);
}

pub fn unregister_mmf_owner(id: MmfId) {
    if let Some(slot) = MMF_OWNER_TABLE.write().unwrap().get_mut(id as usize) {
        *slot = None;
    }
}

fn resolve_mmf_owner(id: MmfId) -> Option<Arc<dyn BlockOwner>> {
    MMF_OWNER_TABLE.read().unwrap().get(id as usize).cloned().flatten()
}

#[derive(Default)]
pub struct BlockReferential {
    slots: RwLock<Vec<Option<Arc<dyn BlockOwner>>>>,
    released: Mutex<Vec<u32>>,
}

impl BlockReferential {
    pub fn new() -> Self {
        BlockReferential::default()
    }

    /// Register an owner, returning the `block_index` it should stamp
    /// into every header it writes. Reuses a released slot if one is
    /// available.
    pub fn register(&self, owner: Arc<dyn BlockOwner>) -> u32 {
        if let Some(id) = self.released.lock().unwrap().pop() {
            self.slots.write().unwrap()[id as usize] = Some(owner);
            return id;
        }
        let mut slots = self.slots.write().unwrap();
        let id = slots.len() as u32;
        slots.push(Some(owner));
        id
    }

    /// Release a previously registered owner's slot for reuse. The
    /// caller must ensure no live block still carries this id.
    pub fn unregister(&self, id: u32) {
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(id as usize) {
            *slot = None;
        }
        drop(slots);
        self.released.lock().unwrap().push(id);
    }

    /// Free `block` by reading its header and dispatching to whichever
    /// allocator owns it. Blocks from an MMF-backed allocator are
    /// dispatched through the segment's `mmf_id`, since an MMF
    /// allocator's identity isn't a slot in this (per-process) table —
    /// it must resolve correctly in every process that has the file
    /// mapped. Returns `Ok(false)` for an empty/sentinel block or an
    /// already-freed one; `Err(UnknownBlock)` only if the header's
    /// `block_index` resolves to nothing, which means the header (or
    /// this registry) is corrupted.
    pub fn free(&self, block: Block) -> Result<bool> {
        if block.is_empty() {
            return Ok(false);
        }
        let header = unsafe { block.header() };
        let Some(header) = header else {
            return Ok(false);
        };
        if header.is_free() {
            return Ok(false);
        }

        if header.is_from_mmf() {
            let mmf_id = block.segment().mmf_id().ok_or(Error::UnknownBlock)?;
            let owner = resolve_mmf_owner(mmf_id).ok_or(Error::UnknownBlock)?;
            return owner.free_block(block);
        }

        let block_index = header.block_index();
        let owner = {
            let slots = self.slots.read().unwrap();
            slots.get(block_index as usize).and_then(|slot| slot.clone())
        }
        .ok_or(Error::UnknownBlock)?;
        owner.free_block(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOwner(AtomicUsize);

    impl BlockOwner for CountingOwner {
        fn free_block(&self, _block: Block) -> Result<bool> {
            self.0.fetch_add(1, Ordering::Relaxed);
            Ok(true)
        }
    }

    #[test]
    fn register_reuses_released_slots() {
        let reg = BlockReferential::new();
        let a = reg.register(Arc::new(CountingOwner(AtomicUsize::new(0))));
        let b = reg.register(Arc::new(CountingOwner(AtomicUsize::new(0))));
        assert_ne!(a, b);
        reg.unregister(a);
        let c = reg.register(Arc::new(CountingOwner(AtomicUsize::new(0))));
        assert_eq!(a, c);
    }

    #[test]
    fn free_of_sentinel_is_noop() {
        let reg = BlockReferential::new();
        assert_eq!(reg.free(Block::EMPTY), Ok(false));
    }
}
