/// Fixed set of slots addressed relative to a moving current position.
///
/// The scheduler keeps one ring of device buffers per group input: connectors
/// accumulate into the slot `delay` positions ahead, the group kernel consumes
/// the current slot, then the ring advances.
#[derive(Debug, Clone)]
pub struct DelayRing<T> {
    slots: Vec<T>,
    current_pos: usize,
}

impl<T: Clone> DelayRing<T> {
    pub fn new(slots: Vec<T>) -> DelayRing<T> {
        DelayRing {
            slots,
            current_pos: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    fn get_target_pos(&self, offset: usize) -> usize {
        let mut target_pos = self.current_pos + offset;

        if target_pos >= self.slots.len() {
            target_pos -= self.slots.len();
        }

        target_pos
    }

    pub fn at_offset(&self, offset: usize) -> Option<&T> {
        if offset < self.slots.len() {
            Some(&self.slots[self.get_target_pos(offset)])
        } else {
            None
        }
    }

    pub fn current(&self) -> Option<&T> {
        self.at_offset(0)
    }

    /// All slots, starting with the current one.
    pub fn from_current(&self) -> Vec<T> {
        (0..self.slots.len())
            .map(|offset| self.slots[self.get_target_pos(offset)].clone())
            .collect()
    }

    pub fn advance(&mut self) {
        if self.slots.is_empty() {
            return;
        }

        self.current_pos += 1;
        if self.current_pos == self.slots.len() {
            self.current_pos -= self.slots.len();
        }
    }

    pub fn rewind(&mut self) {
        self.current_pos = 0;
    }

    /// Appends slots behind the furthest offset, keeping every pending slot at its offset.
    pub fn grow(&mut self, extra_slots: impl IntoIterator<Item = T>) {
        self.slots = self.from_current();
        self.current_pos = 0;
        self.slots.extend(extra_slots);
    }

    pub fn slots(&self) -> &[T] {
        &self.slots
    }
}
