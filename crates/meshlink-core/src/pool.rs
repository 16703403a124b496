//! Fixed-capacity arenas with generation-checked handles.
//!
//! Every slot is allocated when the pool is built and reused in place, so a
//! slot's inner allocations (snapshot byte buffers, queue storage) survive
//! free/alloc cycles. A [`Handle`] stays valid until its slot is freed; after
//! that the slot's generation moves on and the stale handle resolves to
//! nothing.

/// Stable reference to a pool slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    /// Slot index
    #[must_use]
    pub fn index(&self) -> usize {
        self.index as usize
    }

    /// Slot generation at allocation time
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    occupied: bool,
    value: T,
}

/// Preallocated pool of `T`
#[derive(Debug)]
pub struct Pool<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T: Default> Pool<T> {
    /// Create a pool with `capacity` slots
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and(capacity, T::default)
    }
}

impl<T> Pool<T> {
    /// Create a pool with `capacity` slots, each initialized by `init`
    pub fn with_capacity_and(capacity: usize, mut init: impl FnMut() -> T) -> Self {
        let capacity = u32::try_from(capacity).unwrap_or(u32::MAX);
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                occupied: false,
                value: init(),
            })
            .collect();
        // Lowest index is handed out first
        let free = (0..capacity).rev().collect();
        Self { slots, free }
    }

    /// Claim a free slot, letting `fill` overwrite its previous contents.
    ///
    /// Returns `None` when the pool is exhausted.
    pub fn alloc_with(&mut self, fill: impl FnOnce(&mut T)) -> Option<Handle> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.occupied = true;
        fill(&mut slot.value);
        Some(Handle {
            index,
            generation: slot.generation,
        })
    }

    /// Release a slot. Returns `false` for stale or foreign handles.
    pub fn free(&mut self, handle: Handle) -> bool {
        match self.slots.get_mut(handle.index()) {
            Some(slot) if slot.occupied && slot.generation == handle.generation => {
                slot.occupied = false;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(handle.index);
                true
            }
            _ => false,
        }
    }

    /// Resolve a handle
    #[must_use]
    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index())
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &slot.value)
    }

    /// Resolve a handle mutably
    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index())
            .filter(|slot| slot.occupied && slot.generation == handle.generation)
            .map(|slot| &mut slot.value)
    }

    /// Check if `handle` refers to a live slot
    #[must_use]
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    /// Iterate over live slots
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter(|(_, s)| s.occupied).map(|(i, s)| {
            (
                Handle {
                    index: i as u32,
                    generation: s.generation,
                },
                &s.value,
            )
        })
    }

    /// Total number of slots
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of live slots
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Check if no slot is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if every slot is live
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.free.is_empty()
    }
}
