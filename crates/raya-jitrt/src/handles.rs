//! Handle tables
//!
//! A handle is an index into a chain of fixed-size blocks. Released slots are
//! threaded onto a free list and handed out again before the chain grows, so
//! `allocate → free → allocate` returns the same handle. A handle is valid
//! exactly when its slot is live; there is no other bookkeeping.
//!
//! Tables are not synchronized themselves. The runtime keeps its object and
//! metadata tables behind a single lock (see `runtime::HandleTables`).

use crate::error::FatalError;

/// Slots per block
pub const HANDLE_BLOCK_SIZE: usize = 32;

/// Index of a slot in a `HandleTable`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Handle(u32);

impl Handle {
    /// Raw slot index (block * HANDLE_BLOCK_SIZE + offset)
    pub fn index(self) -> u32 {
        self.0
    }

    /// Rebuild a handle from a raw index, e.g. one passed across a boundary
    pub fn from_raw(index: u32) -> Self {
        Handle(index)
    }

    fn block(self) -> usize {
        self.0 as usize / HANDLE_BLOCK_SIZE
    }

    fn offset(self) -> usize {
        self.0 as usize % HANDLE_BLOCK_SIZE
    }
}

enum Slot<T> {
    Live(T),
    Free { next: Option<Handle> },
}

struct Block<T> {
    slots: Vec<Slot<T>>,
}

impl<T> Block<T> {
    fn new() -> Self {
        Block {
            slots: Vec::with_capacity(HANDLE_BLOCK_SIZE),
        }
    }

    fn is_full(&self) -> bool {
        self.slots.len() == HANDLE_BLOCK_SIZE
    }
}

/// Chained block table of cross-domain references
pub struct HandleTable<T> {
    blocks: Vec<Block<T>>,
    free_head: Option<Handle>,
    live: usize,
}

impl<T> HandleTable<T> {
    /// Create an empty table with one block
    pub fn new() -> Self {
        HandleTable {
            blocks: vec![Block::new()],
            free_head: None,
            live: 0,
        }
    }

    /// Store `value` and return its handle
    pub fn allocate(&mut self, value: T) -> Handle {
        self.live += 1;

        if let Some(handle) = self.free_head {
            let slot = &mut self.blocks[handle.block()].slots[handle.offset()];
            if let Slot::Free { next } = slot {
                self.free_head = *next;
            }
            *slot = Slot::Live(value);
            return handle;
        }

        if self.blocks.last().map_or(true, Block::is_full) {
            self.blocks.push(Block::new());
        }
        let block_index = self.blocks.len() - 1;
        let block = &mut self.blocks[block_index];
        let handle = Handle((block_index * HANDLE_BLOCK_SIZE + block.slots.len()) as u32);
        block.slots.push(Slot::Live(value));
        handle
    }

    /// Release a handle, returning the value it held
    pub fn free(&mut self, handle: Handle) -> Result<T, FatalError> {
        let slot = self
            .blocks
            .get_mut(handle.block())
            .and_then(|b| b.slots.get_mut(handle.offset()))
            .ok_or(FatalError::CorruptedHandleTable {
                handle: handle.index(),
                reason: "handle outside of the block chain",
            })?;

        match std::mem::replace(slot, Slot::Free { next: self.free_head }) {
            Slot::Live(value) => {
                self.free_head = Some(handle);
                self.live -= 1;
                Ok(value)
            }
            Slot::Free { next } => {
                // Put the slot back untouched so the free list stays intact
                *slot = Slot::Free { next };
                Err(FatalError::CorruptedHandleTable {
                    handle: handle.index(),
                    reason: "release of a handle that is not live",
                })
            }
        }
    }

    /// Borrow the value behind a live handle
    pub fn get(&self, handle: Handle) -> Option<&T> {
        match self.blocks.get(handle.block())?.slots.get(handle.offset())? {
            Slot::Live(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Whether `handle` names a live slot.
    ///
    /// Walks the block chain; meant for verification, not hot paths.
    pub fn contains(&self, handle: Handle) -> bool {
        self.blocks.iter().enumerate().any(|(i, block)| {
            i == handle.block()
                && matches!(block.slots.get(handle.offset()), Some(Slot::Live(_)))
        })
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.live
    }

    /// Whether no handles are live
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of blocks in the chain
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
