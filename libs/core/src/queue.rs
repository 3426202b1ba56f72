//! Unbounded FIFO queue of PDUs.
//!
//! Used for the two outbound directions of every connection and by
//! interceptors that hold PDUs for later re-injection.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::pdu::Pdu;

#[derive(Debug, Default)]
struct State {
    items: VecDeque<Pdu>,
    closed: bool,
}

/// Unbounded multi-producer, multi-consumer PDU queue.
#[derive(Debug, Default)]
pub struct PduQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl PduQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a PDU and wake one waiter.
    ///
    /// Returns `false` (dropping the PDU) if the queue is closed.
    pub fn add(&self, pdu: Pdu) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.items.push_back(pdu);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next PDU.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn take(&self) -> Option<Pdu> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(pdu) = state.items.pop_front() {
                    return Some(pdu);
                }
            }

            notified.await;
        }
    }

    /// Take the next PDU without waiting.
    pub fn poll(&self) -> Option<Pdu> {
        self.lock().items.pop_front()
    }

    /// Close the queue, waking every waiter. Queued PDUs are discarded.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.items.clear();
        }
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Drop every queued PDU.
    pub fn clear(&self) {
        self.lock().items.clear();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
