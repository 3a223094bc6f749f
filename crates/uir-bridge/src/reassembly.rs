//! Multi-frame reply reassembly
//!
//! Each fragment carries its index and a more-fragments flag in the
//! arbitration ID. A context collects fragments for one [`ReplyKey`] until
//! the last fragment and every index before it have arrived.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use uir_proto::{ReplyKey, SimpleCanFrame, CAN_MAX_DLEN, MAX_FRAGMENTS};

use crate::error::BridgeError;

/// Lifecycle of a reassembly context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyState {
    /// Waiting for the first fragment
    Idle,
    /// Some fragments received
    Accumulating,
    /// Every fragment received and the payload handed out
    Complete,
    /// Deadline passed before completion
    TimedOut,
    /// A fragment violated the sequence rules
    Failed,
}

/// A fully reassembled reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedReply {
    pub key: ReplyKey,
    /// Control word carried by the reply frames
    pub control_word: u8,
    pub data: Bytes,
}

/// Result of feeding one fragment into a context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Accumulating,
    Complete(CompletedReply),
}

#[derive(Debug, Clone, Copy)]
struct Fragment {
    data: [u8; CAN_MAX_DLEN],
    len: u8,
}

/// Collects the fragments of one reply
#[derive(Debug)]
pub struct ReassemblyContext {
    key: ReplyKey,
    fragments: [Option<Fragment>; MAX_FRAGMENTS],
    last_index: Option<u8>,
    received: usize,
    control_word: u8,
    state: ReassemblyState,
    timeout: Duration,
    deadline: Instant,
}

impl ReassemblyContext {
    /// Start an idle context whose deadline runs from now
    pub fn new(key: ReplyKey, timeout: Duration) -> Self {
        Self {
            key,
            fragments: [None; MAX_FRAGMENTS],
            last_index: None,
            received: 0,
            control_word: key.function_code,
            state: ReassemblyState::Idle,
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn key(&self) -> ReplyKey {
        self.key
    }

    pub fn state(&self) -> ReassemblyState {
        self.state
    }

    /// Instant after which the context times out; pushed back by every
    /// accepted fragment
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Feed one frame belonging to this context
    pub fn accept(&mut self, frame: &SimpleCanFrame) -> Result<Progress, BridgeError> {
        match self.state {
            ReassemblyState::Idle | ReassemblyState::Accumulating => {}
            state => {
                return Err(self.overflow(format!("context already {:?}", state)));
            }
        }

        match self.insert(frame) {
            Ok(progress) => Ok(progress),
            Err(e) => {
                self.state = ReassemblyState::Failed;
                Err(e)
            }
        }
    }

    fn insert(&mut self, frame: &SimpleCanFrame) -> Result<Progress, BridgeError> {
        let tag = frame.id().fragment();
        let index = tag.index as usize;

        if index >= MAX_FRAGMENTS {
            return Err(self.overflow(format!("index {} exceeds capacity", index)));
        }
        if let Some(last) = self.last_index {
            if tag.index > last {
                return Err(self.overflow(format!(
                    "index {} after last fragment {}",
                    tag.index, last
                )));
            }
        }
        if self.fragments[index].is_some() {
            return Err(BridgeError::DuplicateFragment {
                key: self.key,
                index: tag.index,
            });
        }

        if tag.is_last() {
            if let Some(last) = self.last_index {
                return Err(self.overflow(format!(
                    "second last marker at {} (first at {})",
                    tag.index, last
                )));
            }
            if let Some(beyond) = self.highest_index().filter(|&i| i > tag.index) {
                return Err(self.overflow(format!(
                    "last marker at {} but fragment {} already received",
                    tag.index, beyond
                )));
            }
            self.last_index = Some(tag.index);
        } else if frame.data().len() != CAN_MAX_DLEN {
            return Err(self.overflow(format!(
                "non-final fragment {} carries {} bytes",
                tag.index,
                frame.data().len()
            )));
        }

        let mut data = [0u8; CAN_MAX_DLEN];
        data[..frame.data().len()].copy_from_slice(frame.data());
        self.fragments[index] = Some(Fragment {
            data,
            len: frame.data().len() as u8,
        });
        self.received += 1;
        self.control_word = frame.id().control_word();
        self.state = ReassemblyState::Accumulating;
        self.deadline = Instant::now() + self.timeout;

        match self.last_index {
            Some(last) if self.received == last as usize + 1 => {
                self.state = ReassemblyState::Complete;
                Ok(Progress::Complete(CompletedReply {
                    key: self.key,
                    control_word: self.control_word,
                    data: self.payload(),
                }))
            }
            _ => Ok(Progress::Accumulating),
        }
    }

    /// Move to `TimedOut` if the deadline has passed
    pub fn check_deadline(&mut self, now: Instant) -> bool {
        let open = matches!(
            self.state,
            ReassemblyState::Idle | ReassemblyState::Accumulating
        );
        if open && now >= self.deadline {
            self.state = ReassemblyState::TimedOut;
            return true;
        }
        false
    }

    /// Tail tracker for this context if its waiter goes away now.
    ///
    /// `None` when nothing has been received yet or the reply is complete,
    /// since no fragments of it can still be in flight.
    pub fn abandon(&self, now: Instant) -> Option<AbandonedReply> {
        if self.received == 0 || self.state == ReassemblyState::Complete {
            return None;
        }
        let seen = self
            .fragments
            .iter()
            .enumerate()
            .filter(|(_, fragment)| fragment.is_some())
            .fold(0u16, |mask, (index, _)| mask | (1 << index));
        Some(AbandonedReply {
            key: self.key,
            seen,
            last_index: self.last_index,
            deadline: now + self.timeout,
        })
    }

    fn highest_index(&self) -> Option<u8> {
        self.fragments
            .iter()
            .rposition(Option::is_some)
            .map(|i| i as u8)
    }

    fn payload(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.received * CAN_MAX_DLEN);
        for fragment in self.fragments.iter().flatten() {
            buf.extend_from_slice(&fragment.data[..fragment.len as usize]);
        }
        buf.freeze()
    }

    fn overflow(&self, reason: String) -> BridgeError {
        BridgeError::OutOfOrderOverflow {
            key: self.key,
            reason,
        }
    }
}

/// What an [`AbandonedReply`] did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Absorb {
    /// Belongs to the abandoned sequence; more of it may follow
    Absorbed,
    /// Belongs to the abandoned sequence, which has now fully arrived
    Drained,
    /// Does not fit the abandoned sequence; a new one has started
    Foreign,
}

/// Remainder of a reply whose waiter went away mid-sequence.
///
/// Fragments still in flight for it are swallowed so they cannot be taken
/// for the start of the next reply under the same key. An index the
/// abandoned sequence already delivered marks the start of a new one.
#[derive(Debug, Clone)]
pub struct AbandonedReply {
    key: ReplyKey,
    seen: u16,
    last_index: Option<u8>,
    deadline: Instant,
}

impl AbandonedReply {
    pub fn key(&self) -> ReplyKey {
        self.key
    }

    /// Instant after which the remainder is no longer expected
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn absorb(&mut self, frame: &SimpleCanFrame) -> Absorb {
        let tag = frame.id().fragment();
        if tag.index as usize >= MAX_FRAGMENTS {
            return Absorb::Foreign;
        }
        let bit = 1u16 << tag.index;
        if self.seen & bit != 0 {
            return Absorb::Foreign;
        }
        match self.last_index {
            Some(last) if tag.index > last || tag.is_last() => return Absorb::Foreign,
            None if tag.is_last() && self.highest_seen() > tag.index => return Absorb::Foreign,
            _ => {}
        }

        self.seen |= bit;
        if tag.is_last() {
            self.last_index = Some(tag.index);
        }
        match self.last_index {
            Some(last) if self.seen.count_ones() == u32::from(last) + 1 => Absorb::Drained,
            _ => Absorb::Absorbed,
        }
    }

    fn highest_seen(&self) -> u8 {
        (u16::BITS - 1).saturating_sub(self.seen.leading_zeros()) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use uir_proto::{FragmentTag, SimpleCanId};

    const KEY: ReplyKey = ReplyKey {
        node: 5,
        function_code: 0x0C,
    };

    fn fragment(index: u8, more: bool, data: &[u8]) -> SimpleCanFrame {
        let id = SimpleCanId::new(5, 4, 0x0C)
            .unwrap()
            .with_fragment(FragmentTag { index, more })
            .unwrap();
        SimpleCanFrame::new(id, data).unwrap()
    }

    fn context() -> ReassemblyContext {
        ReassemblyContext::new(KEY, Duration::from_millis(100))
    }

    #[test]
    fn single_frame_completes_immediately() {
        let mut ctx = context();
        assert_eq!(ctx.state(), ReassemblyState::Idle);

        let progress = ctx.accept(&fragment(0, false, &[1, 2, 3])).unwrap();
        assert_eq!(
            progress,
            Progress::Complete(CompletedReply {
                key: KEY,
                control_word: 0x0C,
                data: Bytes::from_static(&[1, 2, 3]),
            })
        );
        assert_eq!(ctx.state(), ReassemblyState::Complete);
    }

    #[test]
    fn out_of_order_fragments_reassemble_in_index_order() {
        let mut ctx = context();
        assert_eq!(
            ctx.accept(&fragment(2, false, &[0x20])).unwrap(),
            Progress::Accumulating
        );
        assert_eq!(
            ctx.accept(&fragment(0, true, &[0x00; 8])).unwrap(),
            Progress::Accumulating
        );
        assert_eq!(ctx.state(), ReassemblyState::Accumulating);

        let Progress::Complete(reply) = ctx.accept(&fragment(1, true, &[0x11; 8])).unwrap() else {
            panic!("expected completion");
        };
        let mut expected = vec![0x00; 8];
        expected.extend_from_slice(&[0x11; 8]);
        expected.push(0x20);
        assert_eq!(reply.data, Bytes::from(expected));
    }

    #[test]
    fn reverse_order_fragments_reassemble() {
        let mut ctx = context();
        assert_eq!(
            ctx.accept(&fragment(2, false, &[0x22, 0x22])).unwrap(),
            Progress::Accumulating
        );
        assert_eq!(
            ctx.accept(&fragment(1, true, &[0x11; 8])).unwrap(),
            Progress::Accumulating
        );
        let Progress::Complete(reply) = ctx.accept(&fragment(0, true, &[0x00; 8])).unwrap() else {
            panic!("expected completion");
        };

        let mut expected = vec![0x00; 8];
        expected.extend_from_slice(&[0x11; 8]);
        expected.extend_from_slice(&[0x22, 0x22]);
        assert_eq!(reply.data, Bytes::from(expected));
    }

    #[test]
    fn idle_or_complete_context_leaves_nothing_behind() {
        let mut ctx = context();
        assert!(ctx.abandon(Instant::now()).is_none());
        ctx.accept(&fragment(0, false, &[1])).unwrap();
        assert!(ctx.abandon(Instant::now()).is_none());
    }

    #[test]
    fn abandoned_tail_is_absorbed_until_drained() {
        let mut ctx = context();
        ctx.accept(&fragment(0, true, &[0; 8])).unwrap();
        ctx.accept(&fragment(1, true, &[1; 8])).unwrap();

        let mut tail = ctx.abandon(Instant::now()).unwrap();
        assert_eq!(tail.key(), KEY);
        assert_eq!(tail.absorb(&fragment(2, false, &[2, 2])), Absorb::Drained);
    }

    #[test]
    fn repeated_index_starts_a_new_sequence() {
        let mut ctx = context();
        ctx.accept(&fragment(0, true, &[0; 8])).unwrap();

        let mut tail = ctx.abandon(Instant::now()).unwrap();
        assert_eq!(tail.absorb(&fragment(1, true, &[1; 8])), Absorb::Absorbed);
        assert_eq!(tail.absorb(&fragment(0, true, &[9; 8])), Absorb::Foreign);
    }

    #[test]
    fn abandoned_tail_rejects_frames_past_its_end() {
        let mut ctx = context();
        ctx.accept(&fragment(2, false, &[2])).unwrap();

        let mut tail = ctx.abandon(Instant::now()).unwrap();
        assert_eq!(tail.absorb(&fragment(3, true, &[0; 8])), Absorb::Foreign);
        assert_eq!(tail.absorb(&fragment(1, false, &[1])), Absorb::Foreign);
        assert_eq!(tail.absorb(&fragment(0, true, &[0; 8])), Absorb::Absorbed);
        assert_eq!(tail.absorb(&fragment(1, true, &[1; 8])), Absorb::Drained);
    }

    #[test]
    fn duplicate_fragment_fails_context() {
        let mut ctx = context();
        ctx.accept(&fragment(0, true, &[0; 8])).unwrap();
        assert_eq!(
            ctx.accept(&fragment(0, true, &[0; 8])),
            Err(BridgeError::DuplicateFragment { key: KEY, index: 0 })
        );
        assert_eq!(ctx.state(), ReassemblyState::Failed);
    }

    #[test]
    fn index_beyond_last_is_overflow() {
        let mut ctx = context();
        ctx.accept(&fragment(1, false, &[1])).unwrap();
        assert!(matches!(
            ctx.accept(&fragment(2, true, &[0; 8])),
            Err(BridgeError::OutOfOrderOverflow { .. })
        ));
    }

    #[test]
    fn last_marker_below_received_index_is_overflow() {
        let mut ctx = context();
        ctx.accept(&fragment(3, true, &[0; 8])).unwrap();
        assert!(matches!(
            ctx.accept(&fragment(1, false, &[1])),
            Err(BridgeError::OutOfOrderOverflow { .. })
        ));
    }

    #[test]
    fn short_non_final_fragment_is_rejected() {
        let mut ctx = context();
        assert!(matches!(
            ctx.accept(&fragment(0, true, &[1, 2])),
            Err(BridgeError::OutOfOrderOverflow { .. })
        ));
    }

    #[test]
    fn closed_context_rejects_more_input() {
        let mut ctx = context();
        ctx.accept(&fragment(0, false, &[])).unwrap();
        assert!(ctx.accept(&fragment(1, false, &[])).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_resets_on_each_fragment() {
        let mut ctx = context();
        let first_deadline = ctx.deadline();

        tokio::time::advance(Duration::from_millis(60)).await;
        ctx.accept(&fragment(0, true, &[0; 8])).unwrap();
        assert!(ctx.deadline() > first_deadline);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(!ctx.check_deadline(Instant::now()));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(ctx.check_deadline(Instant::now()));
        assert_eq!(ctx.state(), ReassemblyState::TimedOut);
    }
}
