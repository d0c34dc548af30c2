//! The in-memory unit of archived audio between two rotations.

use crate::buffering::block::AudioBlock;

/// Blocks destined for one archive file, in arrival order.
///
/// A segment only exists once it holds a block. Its start time is the first
/// block's timestamp unless the writer moved it past an earlier segment's
/// start. Flushing consumes it.
#[derive(Debug, Clone)]
pub struct ArchiveSegment {
    start: i64,
    blocks: Vec<AudioBlock>,
}

impl ArchiveSegment {
    pub fn new(first: AudioBlock) -> Self {
        let start = first.timestamp;
        Self::starting_at(first, start)
    }

    /// A segment named `start` rather than after its first block.
    pub fn starting_at(first: AudioBlock, start: i64) -> Self {
        Self {
            start,
            blocks: vec![first],
        }
    }

    pub fn push(&mut self, block: AudioBlock) {
        self.blocks.push(block);
    }

    /// Epoch second naming the destination file.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Number of buffered blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Seconds between the segment start and `now`.
    pub fn span_secs(&self, now: i64) -> i64 {
        now.saturating_sub(self.start)
    }

    pub fn sample_count(&self) -> usize {
        self.blocks.iter().map(AudioBlock::len).sum()
    }

    /// Any block in the segment was captured with device overflow.
    pub fn has_overflow(&self) -> bool {
        self.blocks.iter().any(|b| b.overflow)
    }

    /// All samples, blocks concatenated in arrival order.
    pub fn concat_samples(&self) -> Vec<i16> {
        let mut samples = Vec::with_capacity(self.sample_count());
        for block in &self.blocks {
            samples.extend_from_slice(&block.samples);
        }
        samples
    }
}
