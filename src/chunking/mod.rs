use std::time::Duration;

use crate::PipelineError;

/// A time-range slice of an audio artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Position in playback order, starting at 0
    pub index: usize,

    /// Offset from the start of the audio
    pub start: Duration,

    /// Length of the slice
    pub duration: Duration,
}

impl Chunk {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkingError {
    #[error("maximum chunk duration must be positive")]
    ZeroLimit,
    #[error("audio has no measurable duration")]
    EmptyAudio,
}

impl From<ChunkingError> for PipelineError {
    fn from(err: ChunkingError) -> Self {
        PipelineError::Chunking(err.to_string())
    }
}

/// Splits audio into provider-sized pieces
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkPlanner;

impl ChunkPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Compute contiguous chunks covering `[0, total)`.
    ///
    /// Every chunk but the last is exactly `max` long; the last one is truncated
    /// to what remains. Audio no longer than `max` yields a single chunk spanning
    /// the whole artifact.
    pub fn plan(&self, total: Duration, max: Duration) -> Result<Vec<Chunk>, ChunkingError> {
        if max.is_zero() {
            return Err(ChunkingError::ZeroLimit);
        }
        if total.is_zero() {
            return Err(ChunkingError::EmptyAudio);
        }

        if total <= max {
            return Ok(vec![Chunk {
                index: 0,
                start: Duration::ZERO,
                duration: total,
            }]);
        }

        let mut chunks = Vec::with_capacity(chunk_count(total, max));
        let mut start = Duration::ZERO;
        while start < total {
            let duration = max.min(total - start);
            chunks.push(Chunk {
                index: chunks.len(),
                start,
                duration,
            });
            start += duration;
        }

        Ok(chunks)
    }

    /// Whether audio of length `total` needs a physical split under `max`
    pub fn needs_split(&self, total: Duration, max: Option<Duration>) -> bool {
        matches!(max, Some(max) if total > max)
    }
}

/// ceil(total / max), in nanoseconds to stay exact
fn chunk_count(total: Duration, max: Duration) -> usize {
    let total = total.as_nanos();
    let max = max.as_nanos();
    ((total + max - 1) / max) as usize
}
