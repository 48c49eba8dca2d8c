//! Per-thread stack-suffix compression.
//!
//! Successive samples of the same thread usually share most of their
//! root-side frames, so the wire only carries the frames that changed since
//! the previous sample plus the count of frames that did not
//! ([`Delta::previous_frame_count`]).
//!
//! The previous-stack store is one contiguous block of
//! `SLOT_COUNT x MAX_STACK_DEPTH` frames with a free list of slot indices;
//! nothing on the sample path allocates.

use std::collections::HashMap;


/// Stacks are truncated to this many frames before compression.
pub const MAX_STACK_DEPTH: usize = 63;

/// Fixed number of per-thread slots. A thread that cannot get a slot is
/// sent uncompressed until one frees up.
pub const SLOT_COUNT: usize = 512;

/// One compressed stack: the first `previous_frame_count` root-side frames
/// of the previous stack are implicit, `frames` is the changed leaf-side
/// part (leaf first).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Delta<'a> {
    pub previous_frame_count: u32,
    pub frames: &'a [u64],
}

struct Slot {
    index: u16,
    seen_this_tick: bool,
}

pub struct DeltaCodec {
    frames: Box<[u64]>,
    lens: Box<[u8]>,
    free: Vec<u16>,
    slots: HashMap<u64, Slot>,
}

impl Default for DeltaCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaCodec {
    pub fn new() -> Self {
        DeltaCodec {
            frames: vec![0; SLOT_COUNT * MAX_STACK_DEPTH].into_boxed_slice(),
            lens: vec![0; SLOT_COUNT].into_boxed_slice(),
            free: (0..SLOT_COUNT as u16).rev().collect(),
            slots: HashMap::with_capacity(SLOT_COUNT),
        }
    }

    /// Compresses `stack` (leaf first) against the thread's previous stack.
    ///
    /// Returns `None` for an empty stack: no event is emitted for that
    /// thread this tick and the stored stack is left untouched.
    pub fn compress<'a>(&mut self, thread_id: u64, stack: &'a [u64]) -> Option<Delta<'a>> {
        let stack = &stack[..stack.len().min(MAX_STACK_DEPTH)];
        if stack.is_empty() {
            if let Some(slot) = self.slots.get_mut(&thread_id) {
                slot.seen_this_tick = true;
            }
            return None;
        }

        if let Some(slot) = self.slots.get_mut(&thread_id) {
            slot.seen_this_tick = true;
            let index = slot.index as usize;
            let prev_len = self.lens[index] as usize;
            let prev = &self.frames[index * MAX_STACK_DEPTH..index * MAX_STACK_DEPTH + prev_len];

            let mut same = 0;
            let bound = prev_len.min(stack.len());
            while same < bound && prev[prev_len - 1 - same] == stack[stack.len() - 1 - same] {
                same += 1;
            }

            let base = index * MAX_STACK_DEPTH;
            self.frames[base..base + stack.len()].copy_from_slice(stack);
            self.lens[index] = stack.len() as u8;

            Some(Delta {
                previous_frame_count: same as u32,
                frames: &stack[..stack.len() - same],
            })
        } else if let Some(index) = self.free.pop() {
            let base = index as usize * MAX_STACK_DEPTH;
            self.frames[base..base + stack.len()].copy_from_slice(stack);
            self.lens[index as usize] = stack.len() as u8;
            self.slots.insert(
                thread_id,
                Slot {
                    index,
                    seen_this_tick: true,
                },
            );
            Some(Delta {
                previous_frame_count: 0,
                frames: stack,
            })
        } else {
            // Pool exhausted: full stack on the wire, nothing stored.
            Some(Delta {
                previous_frame_count: 0,
                frames: stack,
            })
        }
    }

    /// Marks a thread alive this tick without emitting anything (idle or
    /// skipped threads keep their slots).
    pub fn touch(&mut self, thread_id: u64) {
        if let Some(slot) = self.slots.get_mut(&thread_id) {
            slot.seen_this_tick = true;
        }
    }

    /// Starts a tick; pair with [`Self::end_tick`].
    pub fn begin_tick(&mut self) {
        for slot in self.slots.values_mut() {
            slot.seen_this_tick = false;
        }
    }

    /// Ends a tick, returning the threads that were not seen and whose
    /// slots went back to the pool.
    pub fn end_tick(&mut self) -> Vec<u64> {
        let mut gone = Vec::new();
        let free = &mut self.free;
        self.slots.retain(|&tid, slot| {
            if slot.seen_this_tick {
                true
            } else {
                gone.push(tid);
                free.push(slot.index);
                false
            }
        });
        gone
    }

    /// Drops all state and returns every slot to the pool (stream disable).
    pub fn reset(&mut self) {
        self.slots.clear();
        self.free = (0..SLOT_COUNT as u16).rev().collect();
    }

    #[cfg(test)]
    fn free_slots(&self) -> usize {
        self.free.len()
    }
}

/// Converter-side inverse of [`DeltaCodec`].
#[derive(Default)]
pub struct DeltaDecoder {
    prev: HashMap<u64, Vec<u64>>,
}

impl DeltaDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassembles a full stack (leaf first) from a delta.
    ///
    /// A `previous_frame_count` larger than what we remember is clamped;
    /// this only happens when the producer restarted mid-stream.
    pub fn decode(&mut self, thread_id: u64, previous_frame_count: u32, new: &[u64]) -> Vec<u64> {
        let prev = self.prev.entry(thread_id).or_default();
        let same = (previous_frame_count as usize).min(prev.len());
        let mut full = Vec::with_capacity(new.len() + same);
        full.extend_from_slice(new);
        full.extend_from_slice(&prev[prev.len() - same..]);
        *prev = full.clone();
        full
    }

    pub fn forget(&mut self, thread_id: u64) {
        self.prev.remove(&thread_id);
    }
}
