//! STARTTLS state machines.
//!
//! The client leg upgrades passively: the client reader notices a TLS
//! handshake record and wraps its own socket. The server leg is shared by two
//! tasks, so its upgrade is a handshake between the server writer (which
//! performs the TLS connect) and the server reader (which must stop reading
//! plaintext first):
//!
//! ```text
//! writer: PlainText -> Transition1          (request)
//! reader: Transition1 -> Transition2        (plaintext stream vacated)
//! writer: Transition2 -> Encrypted          (TLS established)
//! ```
//!
//! Waiting happens on a watch channel raced against the connection's
//! shutdown signal, never on a lock.

use std::sync::Mutex;

use tokio::sync::watch;

/// Client to proxy leg state. One-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum C2pState {
    PlainText,
    Encrypted,
}

/// Proxy to server leg state. Strictly monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum P2sState {
    PlainText,
    Transition1,
    Transition2,
    Encrypted,
}

impl P2sState {
    fn successor(self) -> Option<Self> {
        match self {
            P2sState::PlainText => Some(P2sState::Transition1),
            P2sState::Transition1 => Some(P2sState::Transition2),
            P2sState::Transition2 => Some(P2sState::Encrypted),
            P2sState::Encrypted => None,
        }
    }
}

/// Client leg state holder.
#[derive(Debug)]
pub struct C2pGate {
    state: watch::Sender<C2pState>,
}

impl C2pGate {
    pub fn new() -> Self {
        Self {
            state: watch::channel(C2pState::PlainText).0,
        }
    }

    pub fn state(&self) -> C2pState {
        *self.state.borrow()
    }

    /// Switch to `Encrypted`. Returns `false` if already encrypted.
    pub fn encrypt(&self) -> bool {
        self.state.send_if_modified(|state| {
            std::mem::replace(state, C2pState::Encrypted) == C2pState::PlainText
        })
    }
}

impl Default for C2pGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Server leg state holder shared by the server reader and writer.
#[derive(Debug)]
pub struct P2sGate {
    state: watch::Sender<P2sState>,
    history: Mutex<Vec<P2sState>>,
}

impl P2sGate {
    pub fn new() -> Self {
        Self {
            state: watch::channel(P2sState::PlainText).0,
            history: Mutex::new(vec![P2sState::PlainText]),
        }
    }

    pub fn state(&self) -> P2sState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<P2sState> {
        self.state.subscribe()
    }

    /// Move to `next` if it is the direct successor of the current state.
    ///
    /// Skips and reversals are refused and return `false`.
    pub fn advance(&self, next: P2sState) -> bool {
        self.state.send_if_modified(|state| {
            if state.successor() != Some(next) {
                return false;
            }
            *state = next;
            self.history
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(next);
            true
        })
    }

    /// Wait until the state reaches `target` (or a later state).
    ///
    /// Returns `false` if `shutdown` fires first.
    pub async fn wait_for(&self, target: P2sState, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut state = self.state.subscribe();
        tokio::select! {
            reached = state.wait_for(|state| *state >= target) => reached.is_ok(),
            _ = shutdown.wait_for(|stop| *stop) => false,
        }
    }

    /// Every state this gate has been in, in order.
    pub fn history(&self) -> Vec<P2sState> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for P2sGate {
    fn default() -> Self {
        Self::new()
    }
}
