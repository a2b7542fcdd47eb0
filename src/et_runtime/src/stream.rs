//! FIFO queues of actions.

use crate::action::{Action, ActionKind};
use crate::error::Error;
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Handle of a stream on one device.
pub struct StreamId(usize);

impl From<usize> for StreamId {
    fn from(id: usize) -> Self {
        StreamId(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Creation flags of a stream.
pub enum StreamFlags {
    /// Work is funnelled through the default stream.
    Blocking,
    /// Work runs on the stream's own queue.
    NonBlocking,
}

pub(crate) struct Stream {
    blocking: bool,
    queue: VecDeque<Action>,
    deferred: Option<Error>,
}

impl Stream {
    pub fn new(flags: StreamFlags) -> Self {
        Stream {
            blocking: flags == StreamFlags::Blocking,
            queue: VecDeque::new(),
            deferred: None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn push(&mut self, action: Action) {
        self.queue.push_back(action);
    }

    /// Pop the front action if it is ready. An `EventMark` picks up the deferred error
    /// here, taking it when the mark consumes it.
    pub fn pop_ready(&mut self) -> Option<Action> {
        if !self.queue.front()?.ready_for_execution() {
            return None;
        }
        let mut action = self.queue.pop_front()?;
        if let ActionKind::EventMark { consume, carried, .. } = &mut action.kind {
            *carried = if *consume {
                self.deferred.take()
            } else {
                self.deferred.clone()
            };
        }
        Some(action)
    }

    /// Record the first failure on this stream.
    pub fn defer_error(&mut self, error: Error) {
        if self.deferred.is_none() {
            self.deferred = Some(error);
        }
    }

    /// Remove every queued action, releasing their waiters.
    pub fn abandon_all(&mut self) -> usize {
        let count = self.queue.len();
        for action in self.queue.drain(..) {
            action.abandon();
        }
        count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::action::Marker;

    fn mark(id: u64, consume: bool) -> (Action, std::sync::Arc<Marker>) {
        let marker = Marker::new();
        let action = Action {
            id,
            kind: ActionKind::EventMark {
                marker: marker.clone(),
                consume,
                carried: None,
            },
        };
        (action, marker)
    }

    #[test]
    fn fifo_and_blocked_front() {
        let mut stream = Stream::new(StreamFlags::NonBlocking);
        let gate = Marker::new();
        stream.push(Action {
            id: 0,
            kind: ActionKind::EventWait(gate.clone()),
        });
        stream.push(mark(1, true).0);
        assert!(stream.pop_ready().is_none());
        gate.fire(None);
        assert_eq!(stream.pop_ready().map(|a| a.id), Some(0));
        assert_eq!(stream.pop_ready().map(|a| a.id), Some(1));
        assert!(stream.pop_ready().is_none());
    }

    #[test]
    fn marks_pick_up_deferred_error() {
        let mut stream = Stream::new(StreamFlags::Blocking);
        assert!(stream.is_blocking());
        stream.defer_error(Error::NotReady);
        stream.defer_error(Error::DeviceFault("second".to_string()));
        let (peek, peek_marker) = mark(1, false);
        let (take, take_marker) = mark(2, true);
        let (clean, clean_marker) = mark(3, true);
        stream.push(peek);
        stream.push(take);
        stream.push(clean);
        let ctx_free = |mut a: Action| {
            if let ActionKind::EventMark { marker, carried, .. } = &mut a.kind {
                marker.fire(carried.take());
            }
        };
        while let Some(a) = stream.pop_ready() {
            ctx_free(a);
        }
        assert_eq!(peek_marker.wait(), Err(Error::NotReady));
        assert_eq!(take_marker.wait(), Err(Error::NotReady));
        assert_eq!(clean_marker.wait(), Ok(()));
    }

    #[test]
    fn abandon_releases_marks() {
        let mut stream = Stream::new(StreamFlags::NonBlocking);
        let (a, marker) = mark(1, true);
        stream.push(a);
        assert_eq!(stream.abandon_all(), 1);
        assert!(stream.pop_ready().is_none());
        assert!(marker.wait().is_err());
    }
}
