//! Pipelined command queue.
//!
//! Fixed circular buffer of sealed chains in send order. Single owner (the
//! worker), so no locking.

/// Circular FIFO that refuses to overwrite an occupied slot.
pub struct PipelineQueue<T> {
    slots: Vec<Option<T>>,
    read: usize,
    write: usize,
    count: usize,
}

impl<T> PipelineQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            read: 0,
            write: 0,
            count: 0,
        }
    }

    /// Append at the write slot. Hands the item back when that slot is
    /// still occupied.
    pub fn push(&mut self, item: T) -> Result<(), T> {
        let slot = &mut self.slots[self.write];
        if slot.is_some() {
            return Err(item);
        }
        *slot = Some(item);
        self.write = (self.write + 1) % self.slots.len();
        self.count += 1;
        Ok(())
    }

    pub fn peek(&self) -> Option<&T> {
        self.slots[self.read].as_ref()
    }

    pub fn peek_mut(&mut self) -> Option<&mut T> {
        self.slots[self.read].as_mut()
    }

    pub fn pop(&mut self) -> Option<T> {
        let item = self.slots[self.read].take()?;
        self.read = (self.read + 1) % self.slots.len();
        self.count -= 1;
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
