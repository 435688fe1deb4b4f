//! Circular audio log
//!
//! Keeps the most recent 30 seconds of one direction's audio so the recovery
//! layer can extract the unsent span after an upstream failure. Every chunk
//! written here gets a sequence number before it may be sent anywhere.

use std::time::Instant;

use super::FRAME_MS;

/// 30 s / 20 ms frames.
pub const DEFAULT_CAPACITY_SLOTS: usize = 1500;

#[derive(Debug, Clone)]
pub struct AudioSlot {
    pub data: Vec<u8>,
    pub sequence: u64,
    pub written_at: Option<Instant>,
}

impl AudioSlot {
    fn empty() -> Self {
        Self {
            data: Vec::new(),
            sequence: 0,
            written_at: None,
        }
    }
}

/// Fixed-slot circular buffer with sequence and gap tracking.
///
/// Single writer (media ingress), single reader (sender / recovery). All
/// operations are total; overwriting past capacity is silent.
pub struct AudioRingBuffer {
    slots: Vec<AudioSlot>,
    capacity: usize,
    write_pos: usize,
    total_written: u64,
    last_received_seq: u64,
    last_sent_seq: u64,
}

impl AudioRingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| AudioSlot::empty()).collect(),
            capacity,
            write_pos: 0,
            total_written: 0,
            last_received_seq: 0,
            last_sent_seq: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn total_written(&self) -> u64 {
        self.total_written
    }

    pub fn last_received_seq(&self) -> u64 {
        self.last_received_seq
    }

    pub fn last_sent_seq(&self) -> u64 {
        self.last_sent_seq
    }

    /// Unsent slot count.
    pub fn gap(&self) -> u64 {
        self.last_received_seq - self.last_sent_seq
    }

    /// Unsent audio length in milliseconds.
    pub fn gap_ms(&self) -> u64 {
        self.gap() * FRAME_MS
    }

    /// Record one audio chunk and return its assigned sequence number.
    pub fn write(&mut self, data: &[u8]) -> u64 {
        self.total_written += 1;
        let seq = self.total_written;

        let slot = &mut self.slots[self.write_pos];
        slot.data.clear();
        slot.data.extend_from_slice(data);
        slot.sequence = seq;
        slot.written_at = Some(Instant::now());

        self.last_received_seq = seq;
        self.write_pos = (self.write_pos + 1) % self.capacity;
        seq
    }

    /// Advance the sent watermark. Never regresses.
    pub fn mark_sent(&mut self, sequence: u64) {
        if sequence > self.last_sent_seq {
            self.last_sent_seq = sequence;
        }
    }

    /// Mark everything currently stored as sent (used after catch-up).
    pub fn mark_all_sent(&mut self) {
        self.last_sent_seq = self.last_received_seq;
    }

    /// All stored slots with sequence in `(last_sent, last_received]`, in
    /// sequence order.
    pub fn unsent(&self) -> Vec<&AudioSlot> {
        if self.gap() == 0 {
            return Vec::new();
        }
        let start = self.last_sent_seq + 1;
        let end = self.last_received_seq;

        let mut result: Vec<&AudioSlot> = self
            .slots
            .iter()
            .filter(|s| s.sequence >= start && s.sequence <= end && !s.data.is_empty())
            .collect();
        result.sort_by_key(|s| s.sequence);
        result
    }

    /// Concatenated unsent audio, for batch STT.
    pub fn unsent_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for slot in self.unsent() {
            out.extend_from_slice(&slot.data);
        }
        out
    }

    /// Slots written within the last `duration_ms`, in sequence order.
    pub fn recent(&self, duration_ms: u64) -> Vec<&AudioSlot> {
        let slot_count = ((duration_ms / FRAME_MS) as usize)
            .min(self.capacity)
            .min(self.total_written as usize);
        if slot_count == 0 {
            return Vec::new();
        }

        let window = std::time::Duration::from_millis(duration_ms);
        let now = Instant::now();
        let mut result: Vec<&AudioSlot> = self
            .slots
            .iter()
            .filter(|s| {
                !s.data.is_empty()
                    && s.written_at
                        .map(|t| now.duration_since(t) <= window)
                        .unwrap_or(false)
            })
            .collect();
        result.sort_by_key(|s| s.sequence);
        if result.len() > slot_count {
            result.split_off(result.len() - slot_count)
        } else {
            result
        }
    }

    /// Reset all state.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            slot.data.clear();
            slot.sequence = 0;
            slot.written_at = None;
        }
        self.write_pos = 0;
        self.total_written = 0;
        self.last_received_seq = 0;
        self.last_sent_seq = 0;
    }
}

impl std::fmt::Debug for AudioRingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioRingBuffer")
            .field("capacity", &self.capacity)
            .field("written", &self.total_written)
            .field("gap", &self.gap())
            .field("gap_ms", &self.gap_ms())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8) -> Vec<u8> {
        vec![byte; 160]
    }

    #[test]
    fn test_write_assigns_increasing_sequences() {
        let mut rb = AudioRingBuffer::new(8);
        assert_eq!(rb.write(&frame(1)), 1);
        assert_eq!(rb.write(&frame(2)), 2);
        assert_eq!(rb.write(&frame(3)), 3);
        assert_eq!(rb.last_received_seq(), 3);
        assert_eq!(rb.total_written(), 3);
        assert_eq!(rb.gap(), 3);
        assert_eq!(rb.gap_ms(), 60);
    }

    #[test]
    fn test_mark_sent_never_regresses() {
        let mut rb = AudioRingBuffer::new(8);
        for _ in 0..5 {
            rb.write(&frame(0));
        }
        rb.mark_sent(4);
        assert_eq!(rb.last_sent_seq(), 4);
        rb.mark_sent(2);
        assert_eq!(rb.last_sent_seq(), 4);
        assert_eq!(rb.gap(), 1);
    }

    #[test]
    fn test_unsent_in_sequence_order() {
        let mut rb = AudioRingBuffer::new(8);
        for i in 1..=6u8 {
            rb.write(&frame(i));
        }
        rb.mark_sent(2);
        let unsent = rb.unsent();
        let seqs: Vec<u64> = unsent.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5, 6]);
        assert_eq!(rb.unsent_bytes().len(), 4 * 160);
    }

    #[test]
    fn test_overwrite_past_capacity() {
        let mut rb = AudioRingBuffer::new(4);
        for i in 1..=10u8 {
            rb.write(&frame(i));
        }
        assert_eq!(rb.total_written(), 10);
        assert_eq!(rb.last_received_seq(), 10);
        // Only the newest 4 slots survive; unsent is bounded by capacity.
        let seqs: Vec<u64> = rb.unsent().iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![7, 8, 9, 10]);
    }

    #[test]
    fn test_mark_all_sent_zeroes_gap() {
        let mut rb = AudioRingBuffer::new(8);
        for _ in 0..5 {
            let seq = rb.write(&frame(0));
            rb.mark_sent(seq);
        }
        assert_eq!(rb.gap(), 0);
        rb.write(&frame(0));
        assert_eq!(rb.gap(), 1);
        rb.mark_all_sent();
        assert_eq!(rb.gap(), 0);
    }

    #[test]
    fn test_recent_window() {
        let mut rb = AudioRingBuffer::new(8);
        for _ in 0..3 {
            rb.write(&frame(0));
        }
        // All writes just happened; a generous window sees them all.
        assert_eq!(rb.recent(1000).len(), 3);
        assert!(rb.recent(0).is_empty());
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut rb = AudioRingBuffer::new(8);
        for _ in 0..5 {
            rb.write(&frame(0));
        }
        rb.mark_sent(3);
        rb.clear();
        assert_eq!(rb.total_written(), 0);
        assert_eq!(rb.last_received_seq(), 0);
        assert_eq!(rb.last_sent_seq(), 0);
        assert_eq!(rb.gap(), 0);
        assert!(rb.unsent().is_empty());
    }
}
