//! Generation-checked arena and the handle types built on it
//!
//! Call-legs live in the manager's registry arena and invite records live in
//! a per-call-leg arena. A slot that is freed bumps its generation, so a
//! handle kept past the lifetime of its object resolves to nothing instead of
//! aliasing whatever reuses the slot.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index plus generation of an arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawHandle {
    index: u32,
    generation: u32,
}

impl RawHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug)]
enum Entry<T> {
    Occupied { generation: u32, value: T },
    Vacant { generation: u32 },
}

/// Slot arena with generation-checked access
#[derive(Debug)]
pub struct Arena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
    capacity_limit: Option<usize>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Create an unbounded arena
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
            capacity_limit: None,
        }
    }

    /// Create an arena refusing inserts beyond `limit` live entries
    pub fn with_limit(limit: usize) -> Self {
        Self {
            capacity_limit: Some(limit),
            ..Self::new()
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.capacity_limit.is_some_and(|limit| self.len >= limit)
    }

    /// Insert a value built from its own handle; `None` when the arena is full
    pub fn insert_with(&mut self, build: impl FnOnce(RawHandle) -> T) -> Option<RawHandle> {
        if self.is_full() {
            return None;
        }

        let handle = match self.free.pop() {
            Some(index) => {
                let generation = match &self.entries[index as usize] {
                    Entry::Vacant { generation } => *generation,
                    Entry::Occupied { generation, .. } => *generation,
                };
                RawHandle { index, generation }
            }
            None => {
                let index = self.entries.len() as u32;
                self.entries.push(Entry::Vacant { generation: 0 });
                RawHandle {
                    index,
                    generation: 0,
                }
            }
        };

        self.entries[handle.index as usize] = Entry::Occupied {
            generation: handle.generation,
            value: build(handle),
        };
        self.len += 1;
        Some(handle)
    }

    pub fn insert(&mut self, value: T) -> Option<RawHandle> {
        self.insert_with(|_| value)
    }

    pub fn get(&self, handle: RawHandle) -> Option<&T> {
        match self.entries.get(handle.index as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: RawHandle) -> Option<&mut T> {
        match self.entries.get_mut(handle.index as usize) {
            Some(Entry::Occupied { generation, value }) if *generation == handle.generation => {
                Some(value)
            }
            _ => None,
        }
    }

    pub fn contains(&self, handle: RawHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Remove a value; the slot's generation moves on
    pub fn remove(&mut self, handle: RawHandle) -> Option<T> {
        let slot = self.entries.get_mut(handle.index as usize)?;
        let generation = match slot {
            Entry::Occupied { generation, .. } if *generation == handle.generation => *generation,
            _ => return None,
        };

        let old = std::mem::replace(
            slot,
            Entry::Vacant {
                generation: generation.wrapping_add(1),
            },
        );
        self.free.push(handle.index);
        self.len -= 1;
        match old {
            Entry::Occupied { value, .. } => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (RawHandle, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    RawHandle {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (RawHandle, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(index, entry)| match entry {
                Entry::Occupied { generation, value } => Some((
                    RawHandle {
                        index: index as u32,
                        generation: *generation,
                    },
                    value,
                )),
                Entry::Vacant { .. } => None,
            })
    }
}

/// Handle of a call-leg owned by the [`DialogManager`](crate::manager::DialogManager)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallLegHandle(pub(crate) RawHandle);

impl fmt::Display for CallLegHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-leg-{}.{}", self.0.index, self.0.generation)
    }
}

/// Handle of an INVITE attempt record inside one call-leg
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InviteHandle(pub(crate) RawHandle);

impl fmt::Display for InviteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invite-{}.{}", self.0.index, self.0.generation)
    }
}
