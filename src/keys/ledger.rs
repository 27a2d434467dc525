//! Per-stream record of which directions a candidate was offered to.

use super::material::Direction;
use std::collections::HashMap;

/// Whether a candidate has been offered for one stream direction.
/// Moves from `Untested` to `Tested` and never back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TestState {
    #[default]
    Untested,
    Tested,
}

#[derive(Debug, Clone, Copy, Default)]
struct StreamTests {
    receive: TestState,
    send:    TestState,
}

impl StreamTests {
    fn slot(&mut self, direction: Direction) -> &mut TestState {
        match direction {
            Direction::Receive => &mut self.receive,
            Direction::Send => &mut self.send,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestLedger {
    streams: HashMap<u32, StreamTests>,
}

impl TestLedger {
    pub fn state(&self, stream_id: u32, direction: Direction) -> TestState {
        self.streams.get(&stream_id).map_or(TestState::Untested, |t| match direction {
            Direction::Receive => t.receive,
            Direction::Send => t.send,
        })
    }

    /// Marks (stream, direction) as tested. Returns `true` if it was untested.
    pub fn mark(&mut self, stream_id: u32, direction: Direction) -> bool {
        let slot = self.streams.entry(stream_id).or_default().slot(direction);
        let fresh = *slot == TestState::Untested;
        *slot = TestState::Tested;
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directions_are_independent() {
        let mut ledger = TestLedger::default();
        assert!(ledger.mark(3, Direction::Receive));
        assert_eq!(ledger.state(3, Direction::Receive), TestState::Tested);
        assert_eq!(ledger.state(3, Direction::Send), TestState::Untested);
        assert_eq!(ledger.state(4, Direction::Receive), TestState::Untested);
    }

    #[test]
    fn marking_twice_reports_already_tested() {
        let mut ledger = TestLedger::default();
        assert!(ledger.mark(1, Direction::Send));
        assert!(!ledger.mark(1, Direction::Send));
        assert_eq!(ledger.state(1, Direction::Send), TestState::Tested);
    }
}
