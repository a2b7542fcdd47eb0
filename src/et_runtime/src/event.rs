//! Events observe the position of an `EventMark` in a stream.

use crate::action::Marker;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Handle of an event on one device.
pub struct EventId(usize);

impl From<usize> for EventId {
    fn from(id: usize) -> Self {
        EventId(id)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Creation flags of an event.
pub struct EventFlags {
    /// Skip recording execution instants; `elapsed_time` is then rejected.
    pub disable_timing: bool,
}

pub(crate) struct Event {
    pub flags: EventFlags,
    /// Marker of the latest record, `None` until recorded.
    pub marker: Option<Arc<Marker>>,
}

impl Event {
    pub fn new(flags: EventFlags) -> Self {
        Event { flags, marker: None }
    }
}
