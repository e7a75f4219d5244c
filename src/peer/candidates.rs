use std::collections::VecDeque;

use crate::peer::types::IceCandidate;

/// Remote candidates received before a remote description exists.
/// Replayed in arrival order once the description is applied.
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    queue: VecDeque<IceCandidate>,
}

impl CandidateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, candidate: IceCandidate) {
        self.queue.push_back(candidate);
    }

    /// Empties the buffer, oldest first
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drain_preserves_arrival_order_and_empties() {
        let mut buf = CandidateBuffer::new();
        buf.push(IceCandidate::new("a"));
        buf.push(IceCandidate::new("b"));
        buf.push(IceCandidate::new("c"));

        let drained: Vec<_> = buf.drain().into_iter().map(|c| c.candidate).collect();
        assert_eq!(drained, ["a", "b", "c"]);
        assert!(buf.is_empty());
        assert!(buf.drain().is_empty());
    }

    #[test]
    fn clear_drops_everything() {
        let mut buf = CandidateBuffer::new();
        buf.push(IceCandidate::new("a"));
        buf.clear();
        assert_eq!(buf.len(), 0);
    }
}
