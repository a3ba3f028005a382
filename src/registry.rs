//! Slot registry for per-reactor connection state.
//!
//! Connections are keyed by [`ConnId`], a slot index plus a per-slot
//! generation packed into the `usize` readiness key a reactor registers with
//! its multiplexer. Removing an entry bumps the slot generation, so a stale
//! readiness event carrying a recycled slot fails the generation check
//! instead of reaching the wrong connection.

#[cfg(target_pointer_width = "64")]
type HalfUsize = u32;
#[cfg(target_pointer_width = "32")]
type HalfUsize = u16;

/// Identity of a managed connection within one reactor. Doubles as the
/// readiness key registered with the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    slot: HalfUsize,
    gen: HalfUsize,
}

impl ConnId {
    /// convert to the multiplexer event key
    pub fn to_key(self) -> usize {
        let halfbits = std::mem::size_of::<usize>() * 8 / 2;
        ((self.gen as usize) << halfbits) | (self.slot as usize)
    }
    /// convert from a multiplexer event key
    pub fn from_key(key: usize) -> Self {
        let halfbits = std::mem::size_of::<usize>() * 8 / 2;
        Self {
            slot: key as HalfUsize,
            gen: (key >> halfbits) as HalfUsize,
        }
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.slot, self.gen)
    }
}

const INVALID_SLOT: usize = usize::MAX;

enum Entry<T> {
    Vacant(usize), // next free slot index
    Occupied(T),
}

struct Slot<T> {
    gen: HalfUsize,
    entry: Entry<T>,
}

/// Vec-backed slab with a free list threaded through vacant slots and a
/// generation counter per slot.
pub(crate) struct Registry<T> {
    slots: Vec<Slot<T>>,
    free: usize,
    count: usize,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: INVALID_SLOT,
            count: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Store `val` and return the id under which it is reachable.
    pub fn insert(&mut self, val: T) -> ConnId {
        self.count += 1;
        if self.free == INVALID_SLOT {
            debug_assert!(self.slots.len() < HalfUsize::MAX as usize);
            self.slots.push(Slot {
                gen: 0,
                entry: Entry::Occupied(val),
            });
            return ConnId {
                slot: (self.slots.len() - 1) as HalfUsize,
                gen: 0,
            };
        }
        let key = self.free;
        match self.slots[key].entry {
            Entry::Vacant(next) => self.free = next,
            Entry::Occupied(_) => unreachable!("free list points at occupied slot"),
        }
        self.slots[key].entry = Entry::Occupied(val);
        ConnId {
            slot: key as HalfUsize,
            gen: self.slots[key].gen,
        }
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut T> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.gen != id.gen {
            return None;
        }
        match slot.entry {
            Entry::Occupied(ref mut val) => Some(val),
            Entry::Vacant(_) => None,
        }
    }

    /// Remove the entry, bumping the slot generation so the id (and any
    /// readiness key derived from it) goes stale.
    pub fn remove(&mut self, id: ConnId) -> Option<T> {
        let key = id.slot as usize;
        {
            let slot = self.slots.get(key)?;
            if slot.gen != id.gen {
                return None;
            }
            if let Entry::Vacant(_) = slot.entry {
                return None;
            }
        }
        let slot = &mut self.slots[key];
        slot.gen = slot.gen.wrapping_add(1);
        let prev = std::mem::replace(&mut slot.entry, Entry::Vacant(self.free));
        self.free = key;
        self.count -= 1;
        match prev {
            Entry::Occupied(val) => Some(val),
            Entry::Vacant(_) => unreachable!(),
        }
    }

    /// Snapshot of live ids, for sweeps that may remove entries while
    /// iterating.
    pub fn ids(&self) -> Vec<ConnId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot.entry {
                Entry::Occupied(_) => Some(ConnId {
                    slot: i as HalfUsize,
                    gen: slot.gen,
                }),
                Entry::Vacant(_) => None,
            })
            .collect()
    }
}
