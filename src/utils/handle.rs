use std::hash::Hash;
use std::marker::PhantomData;

/// Typed index into a [`Pool`]. The generation guards against use of a
/// handle whose slot has been released and reused.
#[derive(Debug)]
pub struct Handle<T> {
    pub slot: u16,
    pub generation: u16,
    phantom: PhantomData<T>,
}

impl<T> Handle<T> {
    pub fn new(slot: u16, generation: u16) -> Self {
        Self {
            slot,
            generation,
            phantom: PhantomData,
        }
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self {
            slot: Default::default(),
            generation: Default::default(),
            phantom: Default::default(),
        }
    }
}

pub struct Pool<T> {
    items: Vec<Option<T>>,
    empty: Vec<usize>,
    generation: Vec<u16>,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        const INITIAL_SIZE: usize = 1024;
        Pool::new(INITIAL_SIZE)
    }
}

impl<T> Pool<T> {
    pub fn new(initial_size: usize) -> Self {
        let mut p = Pool {
            items: Vec::with_capacity(initial_size),
            empty: Vec::with_capacity(initial_size),
            generation: vec![0; initial_size],
        };

        p.empty = (0..initial_size).collect();
        p.items.resize_with(initial_size, || None);
        p
    }

    pub fn insert(&mut self, item: T) -> Option<Handle<T>> {
        let empty_slot = self.empty.pop()?;

        self.items[empty_slot] = Some(item);

        Some(Handle {
            slot: empty_slot as u16,
            generation: self.generation[empty_slot],
            phantom: PhantomData,
        })
    }

    pub fn release(&mut self, item: Handle<T>) {
        let slot = item.slot as usize;
        if self.generation[slot] != item.generation {
            return;
        }
        self.items[slot] = None;
        // Stale handles to this slot must stop resolving.
        self.generation[slot] = self.generation[slot].wrapping_add(1);
        self.empty.push(slot);
    }

    pub fn get_ref(&self, item: Handle<T>) -> Option<&T> {
        let slot = item.slot as usize;
        if self.generation[slot] == item.generation {
            self.items[slot].as_ref()
        } else {
            None
        }
    }

    pub fn get_mut_ref(&mut self, item: Handle<T>) -> Option<&mut T> {
        let slot = item.slot as usize;
        if self.generation[slot] == item.generation {
            self.items[slot].as_mut()
        } else {
            None
        }
    }

    pub fn occupied(&self) -> usize {
        self.items.len() - self.empty.len()
    }
}
