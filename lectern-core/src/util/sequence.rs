use std::sync::atomic::{AtomicU64, Ordering};

/// Issues monotonically increasing tickets so overlapping async work can tell
/// whether it is still the most recent attempt.
///
/// A completion whose ticket is no longer current must be discarded instead
/// of applied.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU64);

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws the next ticket, making it the current one.
    pub fn issue(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns true if the ticket is still the most recently issued.
    pub fn is_current(&self, ticket: u64) -> bool {
        self.0.load(Ordering::SeqCst) == ticket
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_only_latest_ticket_is_current() {
        let sequence = Sequence::new();

        let first = sequence.issue();
        assert!(sequence.is_current(first));

        let second = sequence.issue();
        assert!(!sequence.is_current(first));
        assert!(sequence.is_current(second));
    }
}
