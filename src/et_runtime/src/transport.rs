//! Virtual queues between the host and the device master thread.
//!
//! Status codes follow the device mailbox: `push_command` returns 0 on success,
//! `pop_command` the element length, 0 when empty, negative on failure.

use crate::utils::{VQ_DISCONNECTED, VQ_FULL, VQ_OVERSIZED, VQ_TRUNCATED};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};

/// Message transport to and from the device.
pub trait Transport: Send + Sync {
    /// Queue one element. 0 on success.
    fn push_command(&self, element: &[u8]) -> i8;
    /// Take one element without blocking: its length, 0 if none, negative on failure.
    fn pop_command(&self, buf: &mut [u8]) -> i32;
    /// Take one element, blocking until there is one.
    fn wait_command(&self, buf: &mut [u8]) -> i32;
    /// Largest element accepted.
    fn max_element_size(&self) -> usize;
}

/// Bounded queue of byte elements.
pub struct VirtQueue {
    slot_size: usize,
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl VirtQueue {
    /// Create a queue of `depth` slots holding up to `slot_size` bytes each.
    pub fn new(depth: usize, slot_size: usize) -> Self {
        let (tx, rx) = channel::bounded(depth);
        VirtQueue { slot_size, tx, rx }
    }

    fn deliver(element: Vec<u8>, buf: &mut [u8]) -> i32 {
        if element.len() > buf.len() {
            return VQ_TRUNCATED;
        }
        buf[..element.len()].copy_from_slice(&element);
        element.len() as i32
    }
}

impl Transport for VirtQueue {
    fn push_command(&self, element: &[u8]) -> i8 {
        if element.len() > self.slot_size {
            return VQ_OVERSIZED as i8;
        }
        match self.tx.try_send(element.to_vec()) {
            Ok(()) => 0,
            Err(TrySendError::Full(_)) => VQ_FULL as i8,
            Err(TrySendError::Disconnected(_)) => VQ_DISCONNECTED as i8,
        }
    }

    fn pop_command(&self, buf: &mut [u8]) -> i32 {
        match self.rx.try_recv() {
            Ok(element) => Self::deliver(element, buf),
            Err(TryRecvError::Empty) => 0,
            Err(TryRecvError::Disconnected) => VQ_DISCONNECTED,
        }
    }

    fn wait_command(&self, buf: &mut [u8]) -> i32 {
        match self.rx.recv() {
            Ok(element) => Self::deliver(element, buf),
            Err(_) => VQ_DISCONNECTED,
        }
    }

    fn max_element_size(&self) -> usize {
        self.slot_size
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::utils::ToResult;

    #[test]
    fn statuses() {
        let vq = VirtQueue::new(1, 8);
        let mut buf = [0u8; 8];
        assert_eq!(vq.pop_command(&mut buf), 0);
        assert_eq!(vq.push_command(&[1, 2, 3]), 0);
        assert_eq!(vq.push_command(&[4]), VQ_FULL as i8);
        assert_eq!(vq.push_command(&[0; 9]), VQ_OVERSIZED as i8);
        assert_eq!(vq.pop_command(&mut buf), 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert!(vq.push_command(&[5; 8]).to_result().is_ok());
        assert_eq!(vq.wait_command(&mut buf[..4]), VQ_TRUNCATED);
        assert_eq!(vq.max_element_size(), 8);
    }
}
