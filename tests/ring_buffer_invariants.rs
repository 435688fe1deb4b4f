//! Ring buffer invariants across write/mark/read interleavings.

use lingua_relay::audio::ring_buffer::AudioRingBuffer;

fn frame(byte: u8) -> Vec<u8> {
    vec![byte; 160]
}

#[test]
fn writes_without_reads_track_sequences() {
    for n in [1u64, 7, 100, 1500, 2000] {
        let mut rb = AudioRingBuffer::new(1500);
        for _ in 0..n {
            rb.write(&frame(0));
        }
        assert_eq!(rb.last_received_seq(), n);
        assert_eq!(rb.total_written(), n);
        assert_eq!(rb.gap(), n - rb.last_sent_seq());
        assert_eq!(rb.gap_ms(), rb.gap() * 20);
    }
}

#[test]
fn mark_sent_is_monotonic() {
    let mut rb = AudioRingBuffer::new(64);
    for _ in 0..10 {
        rb.write(&frame(0));
    }
    rb.mark_sent(8);
    let before = rb.last_sent_seq();
    // Regressions are ignored, whatever the value.
    for k in [0u64, 1, 5, 7, 8] {
        rb.mark_sent(k);
        assert_eq!(rb.last_sent_seq(), before);
    }
    rb.mark_sent(9);
    assert_eq!(rb.last_sent_seq(), 9);
}

#[test]
fn write_then_mark_everything_leaves_no_gap() {
    let mut rb = AudioRingBuffer::new(32);
    for i in 0..100u8 {
        let seq = rb.write(&frame(i));
        rb.mark_sent(seq);
    }
    assert_eq!(rb.gap(), 0);
    assert!(rb.unsent().is_empty());
    assert!(rb.unsent_bytes().is_empty());
}

#[test]
fn unsent_respects_overwrite_and_order() {
    let mut rb = AudioRingBuffer::new(4);
    for i in 1..=9u8 {
        rb.write(&frame(i));
    }
    // Slots 1-5 were overwritten; only 6..=9 remain, in order.
    let seqs: Vec<u64> = rb.unsent().iter().map(|s| s.sequence).collect();
    assert_eq!(seqs, vec![6, 7, 8, 9]);

    // The concatenated bytes follow the same order.
    let bytes = rb.unsent_bytes();
    assert_eq!(bytes.len(), 4 * 160);
    assert_eq!(bytes[0], 6);
    assert_eq!(bytes[3 * 160], 9);
}

#[test]
fn clear_is_total_reset() {
    let mut rb = AudioRingBuffer::new(8);
    for _ in 0..20 {
        rb.write(&frame(1));
    }
    rb.mark_sent(15);
    rb.clear();
    assert_eq!(rb.total_written(), 0);
    assert_eq!(rb.gap(), 0);
    assert!(rb.unsent().is_empty());
    // The buffer is immediately reusable.
    assert_eq!(rb.write(&frame(2)), 1);
}
