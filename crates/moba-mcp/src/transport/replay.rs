//! Bounded replay log for resumable event streams.

use std::collections::VecDeque;

/// One outbound event with its sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayEvent {
    pub seq: u64,
    pub data: String,
}

/// How a resume request was satisfied.
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// Every event after the cursor is still retained.
    Complete(Vec<ReplayEvent>),
    /// The cursor fell out of the window; replay starts at the oldest retained
    /// event and `missed` events are lost.
    Gap { events: Vec<ReplayEvent>, missed: u64 },
}

impl ResumeOutcome {
    pub fn events(&self) -> &[ReplayEvent] {
        match self {
            ResumeOutcome::Complete(events) => events,
            ResumeOutcome::Gap { events, .. } => events,
        }
    }

    pub fn into_events(self) -> Vec<ReplayEvent> {
        match self {
            ResumeOutcome::Complete(events) => events,
            ResumeOutcome::Gap { events, .. } => events,
        }
    }
}

/// Sequence-numbered ring of the most recent outbound events.
///
/// Sequence numbers start at 1 and increase by one per event, so the buffer
/// is always a contiguous range.
#[derive(Debug)]
pub struct ReplayBuffer {
    capacity: usize,
    next_seq: u64,
    events: VecDeque<ReplayEvent>,
}

impl ReplayBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_seq: 1,
            events: VecDeque::new(),
        }
    }

    /// Append an event, evicting the oldest when full.
    pub fn push(&mut self, data: String) -> ReplayEvent {
        let event = ReplayEvent {
            seq: self.next_seq,
            data,
        };
        self.next_seq += 1;
        if self.events.len() == self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event.clone());
        event
    }

    /// Sequence number of the most recent event, or 0 if none was sent.
    pub fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Drop events the client has acknowledged by resuming after them.
    pub fn acknowledge(&mut self, cursor: u64) {
        while self.events.front().is_some_and(|e| e.seq <= cursor) {
            self.events.pop_front();
        }
    }

    /// Events after `cursor`, in order. Acknowledges everything up to it.
    pub fn resume_after(&mut self, cursor: u64) -> ResumeOutcome {
        self.acknowledge(cursor);
        let events: Vec<_> = self.events.iter().cloned().collect();
        match events.first() {
            Some(first) if first.seq > cursor + 1 => ResumeOutcome::Gap {
                missed: first.seq - cursor - 1,
                events,
            },
            None if self.last_seq() > cursor => ResumeOutcome::Gap {
                missed: self.last_seq() - cursor,
                events,
            },
            _ => ResumeOutcome::Complete(events),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_with(capacity: usize, count: usize) -> ReplayBuffer {
        let mut buffer = ReplayBuffer::new(capacity);
        for i in 1..=count {
            buffer.push(format!("m{}", i));
        }
        buffer
    }

    fn seqs(outcome: &ResumeOutcome) -> Vec<u64> {
        outcome.events().iter().map(|e| e.seq).collect()
    }

    #[test]
    fn test_sequence_numbers_are_contiguous() {
        let buffer = buffer_with(8, 3);
        assert_eq!(buffer.last_seq(), 3);
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_resume_replays_after_cursor_in_order() {
        let mut buffer = buffer_with(8, 5);
        let outcome = buffer.resume_after(2);
        assert!(matches!(outcome, ResumeOutcome::Complete(_)));
        assert_eq!(seqs(&outcome), vec![3, 4, 5]);
    }

    #[test]
    fn test_resume_is_exactly_once_per_cursor() {
        let mut buffer = buffer_with(8, 5);
        assert_eq!(seqs(&buffer.resume_after(3)), vec![4, 5]);
        // Acknowledged events are gone; resuming at the same cursor again
        // yields the same tail and nothing before it.
        assert_eq!(seqs(&buffer.resume_after(3)), vec![4, 5]);
        assert_eq!(seqs(&buffer.resume_after(5)), Vec::<u64>::new());
    }

    #[test]
    fn test_resume_up_to_date() {
        let mut buffer = buffer_with(8, 4);
        assert_eq!(buffer.resume_after(4), ResumeOutcome::Complete(vec![]));
    }

    #[test]
    fn test_stale_cursor_reports_gap() {
        let mut buffer = buffer_with(3, 10);
        match buffer.resume_after(2) {
            ResumeOutcome::Gap { events, missed } => {
                assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![8, 9, 10]);
                assert_eq!(missed, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
