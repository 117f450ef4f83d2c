pub(crate) mod dtls_transport;
pub(crate) mod ice_transport;
pub mod ice_udp_mux;
pub(crate) mod mux;
pub(crate) mod sctp_transport;
pub(crate) mod srtp_transport;

use portable_atomic::{AtomicU8, Ordering};

/// Uniform lifecycle shared by every transport layer.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum TransportState {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Completed = 3,
    Failed = 4,
}

impl From<u8> for TransportState {
    fn from(v: u8) -> Self {
        match v {
            1 => TransportState::Connecting,
            2 => TransportState::Connected,
            3 => TransportState::Completed,
            4 => TransportState::Failed,
            _ => TransportState::Disconnected,
        }
    }
}

/// Callback invoked on transport state changes; implementations enqueue
/// onto the connection's processor rather than doing work inline.
pub(crate) type OnTransportStateFn = Box<dyn Fn(TransportState) + Send + Sync>;

/// State cell with change notification, embedded in each transport.
pub(crate) struct StateCell {
    state: AtomicU8,
    on_change: OnTransportStateFn,
}

impl StateCell {
    pub(crate) fn new(on_change: OnTransportStateFn) -> Self {
        StateCell {
            state: AtomicU8::new(TransportState::Disconnected as u8),
            on_change,
        }
    }

    pub(crate) fn get(&self) -> TransportState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Stores and notifies when the value changed. Failed is terminal other
    /// than a fresh Connecting (retry).
    pub(crate) fn set(&self, next: TransportState) {
        let previous: TransportState = self.state.swap(next as u8, Ordering::SeqCst).into();
        if previous != next {
            (self.on_change)(next);
        }
    }
}

#[cfg(test)]
mod transport_test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;

    #[test]
    fn test_state_cell_notifies_on_change_only() {
        let notifications = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&notifications);
        let cell = StateCell::new(Box::new(move |_| {
            seen.fetch_add(1, StdOrdering::SeqCst);
        }));

        cell.set(TransportState::Connecting);
        cell.set(TransportState::Connecting);
        cell.set(TransportState::Connected);
        assert_eq!(cell.get(), TransportState::Connected);
        assert_eq!(notifications.load(StdOrdering::SeqCst), 2);
    }
}
