//! The receive ring: one slot per buffered segment, indexed by sequence
//! number modulo our advertised capacity, backed by a single data block
//! allocated at connection setup.
//!
//! `first` is the oldest sequence the application has not released yet,
//! `last` the newest sequence buffered; the advertised window is the
//! capacity minus that span. Slots form an implicit circular chain in
//! sequence order (slot i is followed by slot (i + 1) mod capacity), which
//! is what the ordered-delivery walk follows.

use crate::error::{ArdpError, ArdpResult};
use crate::seq::seq_lt;

#[derive(Debug, Default)]
pub struct RecvSlot {
    pub seq: u32,
    pub len: usize,
    pub fcnt: u16,
    pub som: u32,
    pub in_use: bool,
    pub delivered: bool,
}

#[derive(Debug)]
pub struct RecvRing {
    slots: Vec<RecvSlot>,
    data: Vec<u8>,
    seg_bmax: usize,
    pub first: u32,
    pub last: u32,
    pub window: u16,
}

impl RecvRing {
    /// `segmax` segments of up to `segbmax` bytes each; this is what our SYN
    /// advertises to the peer.
    pub fn new(segmax: u32, segbmax: u32) -> ArdpResult<RecvRing> {
        if segmax == 0 || segbmax == 0 {
            return Err(ArdpError::InvalidData);
        }
        let data_len = (segmax as usize)
            .checked_mul(segbmax as usize)
            .ok_or(ArdpError::OutOfMemory)?;

        let mut slots = Vec::new();
        slots.resize_with(segmax as usize, RecvSlot::default);

        Ok(RecvRing {
            slots,
            data: vec![0; data_len],
            seg_bmax: segbmax as usize,
            first: 0,
            last: 0,
            window: segmax as u16,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn seg_bmax(&self) -> usize {
        self.seg_bmax
    }

    pub fn index(&self, seq: u32) -> usize {
        (seq % self.capacity()) as usize
    }

    pub fn slot(&self, seq: u32) -> &RecvSlot {
        &self.slots[self.index(seq)]
    }

    pub fn slot_mut(&mut self, seq: u32) -> &mut RecvSlot {
        let idx = self.index(seq);
        &mut self.slots[idx]
    }

    pub fn slot_at(&self, idx: usize) -> &RecvSlot {
        &self.slots[idx]
    }

    pub fn slot_at_mut(&mut self, idx: usize) -> &mut RecvSlot {
        &mut self.slots[idx]
    }

    /// Position the ring once the peer's initial sequence is known.
    pub fn post_open(&mut self, cur: u32) {
        self.first = cur.wrapping_add(1);
        self.last = cur.wrapping_add(1);
    }

    /// Copy a segment payload into its slot. The caller has already checked
    /// that the sequence is inside the window and the slot is free.
    pub fn store(&mut self, seq: u32, fcnt: u16, som: u32, payload: &[u8]) -> ArdpResult<()> {
        if payload.len() > self.seg_bmax {
            return Err(ArdpError::Failed);
        }
        if seq_lt(self.last, seq) {
            debug_assert!(seq.wrapping_sub(self.last) < self.capacity());
            self.last = seq;
        }

        let idx = self.index(seq);
        let base = idx * self.seg_bmax;
        self.data[base..base + payload.len()].copy_from_slice(payload);

        let slot = &mut self.slots[idx];
        slot.seq = seq;
        slot.len = payload.len();
        slot.fcnt = fcnt;
        slot.som = som;
        slot.in_use = true;
        slot.delivered = false;
        Ok(())
    }

    pub fn slot_data(&self, seq: u32) -> &[u8] {
        let idx = self.index(seq);
        let base = idx * self.seg_bmax;
        &self.data[base..base + self.slots[idx].len]
    }

    /// Release a delivered fragment group starting at the ring head. The
    /// application must release in sequence order, one group at a time.
    pub fn release(&mut self, seq: u32) -> ArdpResult<()> {
        if seq != self.first {
            return Err(ArdpError::InvalidState);
        }
        let head = self.slot(seq);
        if !head.in_use || !head.delivered || head.seq != seq {
            return Err(ArdpError::InvalidState);
        }
        // a delivered head slot always carries the group's fragment count
        if head.fcnt < 1 {
            return Err(ArdpError::InvalidData);
        }

        let fcnt = head.fcnt;
        for i in 0..fcnt as u32 {
            let s = seq.wrapping_add(i);
            let slot = self.slot_mut(s);
            if !slot.in_use || !slot.delivered {
                return Err(ArdpError::InvalidData);
            }
            slot.in_use = false;
            slot.delivered = false;
            self.first = self.first.wrapping_add(1);
        }

        if seq_lt(self.last, self.first) {
            // ring is empty now
            self.window = self.capacity() as u16;
            self.last = self.first;
        } else {
            self.update_window();
        }
        Ok(())
    }

    pub fn update_window(&mut self) {
        let span = self.last.wrapping_sub(self.first).wrapping_add(1);
        self.window = (self.capacity() - span) as u16;
    }
}
