use bytes::Bytes;

/// How a peer that is denied admission is turned away
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AdmissionPolicy {
    /// Abort the connection attempt right away without exchanging any data. Where the transport
    ///  completes the handshake before the application sees the peer, this degrades to a reset.
    #[default]
    RejectBeforeHandshake,
    /// Complete the handshake, optionally write a short refusal, then close gracefully. This
    ///  costs one transient handle but gives the peer something to diagnose.
    RejectAfterConnect {
        refusal: Option<Bytes>,
    },
}

impl AdmissionPolicy {
    pub fn reject_after_connect(refusal: &'static [u8]) -> AdmissionPolicy {
        AdmissionPolicy::RejectAfterConnect {
            refusal: Some(Bytes::from_static(refusal)),
        }
    }
}

/// Capacity gate for new connections. It owns no state of its own: the active count it checks
///  and bumps lives in the registry and is only ever passed in while the registry lock is held,
///  which is what makes the check-and-increment atomic.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionController {
    max_connections: usize,
}

impl AdmissionController {
    pub fn new(max_connections: usize) -> AdmissionController {
        AdmissionController { max_connections }
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Admits a connection and increments `active_count` iff there is spare capacity, leaving
    ///  `active_count` unchanged otherwise.
    pub fn try_admit(&self, active_count: &mut usize) -> bool {
        if *active_count < self.max_connections {
            *active_count += 1;
            true
        }
        else {
            false
        }
    }
}
