//! Bounded lock-free SPSC ring buffer between the device callback and the pipeline.
//!
//! Uses `ringbuf::HeapRb<i16>` which provides a wait-free `push_slice`
//! safe to call from the real-time audio callback. The ring never grows:
//! when the pipeline falls behind, the callback drops the newest samples and
//! raises the overrun flag (see [`crate::audio`]).

pub mod block;

use ringbuf::{traits::Split, HeapRb};

pub use ringbuf::traits::{Consumer, Observer, Producer};

/// Type alias for the producer half, held by the audio callback thread.
pub type SampleProducer = ringbuf::HeapProd<i16>;

/// Type alias for the consumer half, held by the pipeline thread.
pub type SampleConsumer = ringbuf::HeapCons<i16>;

/// Smallest ring accepted, in blocks.
pub const MIN_RING_BLOCKS: usize = 2;

/// Create a matched producer/consumer pair holding `ring_blocks` full blocks.
pub fn create_sample_ring(block_len: usize, ring_blocks: usize) -> (SampleProducer, SampleConsumer) {
    let capacity = block_len.max(1) * ring_blocks.max(MIN_RING_BLOCKS);
    HeapRb::<i16>::new(capacity).split()
}
