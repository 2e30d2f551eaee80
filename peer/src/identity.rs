//! Identity generation and the rendezvous claim lifecycle

use crate::error::ClaimError;
use crate::transport::Transport;
use log::debug;
use rand::Rng;
use shared::{PeerId, TransportError, PEER_ID_PREFIX};

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const IDENTITY_SUFFIX_LEN: usize = 10;
const MESSAGE_SUFFIX_LEN: usize = 9;

/// Creates a fresh process identity such as `ChainNode-k3j9x0q2ma`
pub fn generate_identity() -> PeerId {
    generate_identity_with(&mut rand::thread_rng())
}

pub fn generate_identity_with<R: Rng + ?Sized>(rng: &mut R) -> PeerId {
    PeerId::new(format!(
        "{}{}",
        PEER_ID_PREFIX,
        random_suffix(rng, IDENTITY_SUFFIX_LEN)
    ))
}

/// Builds a chat entry id of the form `<sender>_<millis>_<random>`
pub fn message_id(sender: &PeerId, timestamp: u64) -> String {
    let suffix = random_suffix(&mut rand::thread_rng(), MESSAGE_SUFFIX_LEN);
    format!("{}_{}_{}", sender, timestamp, suffix)
}

fn random_suffix<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Released,
    Pending,
    Held,
}

/// Proof that this process owns the rendezvous identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ownership {
    pub identity: PeerId,
}

/// Tracks the process's own identity and its claim on the rendezvous identity
///
/// The transport's single-owner guarantee decides elections: whoever gets a
/// `Listening` answer for the rendezvous identity is the host. The registry
/// makes sure a failed or abandoned claim never leaves a listener behind.
#[derive(Debug)]
pub struct IdentityRegistry {
    local: PeerId,
    rendezvous: PeerId,
    registered: bool,
    claim: ClaimState,
    /// Answers still owed for listens abandoned while pending
    stale_answers: u32,
}

impl IdentityRegistry {
    pub fn new(local: PeerId, rendezvous: PeerId) -> Self {
        Self {
            local,
            rendezvous,
            registered: false,
            claim: ClaimState::Released,
            stale_answers: 0,
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn rendezvous(&self) -> &PeerId {
        &self.rendezvous
    }

    pub fn claim_state(&self) -> ClaimState {
        self.claim
    }

    pub fn holds_rendezvous(&self) -> bool {
        self.claim == ClaimState::Held
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Starts listening on the process's own identity
    pub fn register_local<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        transport.listen(&self.local);
    }

    pub fn mark_registered(&mut self) {
        self.registered = true;
    }

    /// Asks the transport for the rendezvous identity.
    ///
    /// The answer arrives later and must be fed to [`resolve_claim`](Self::resolve_claim).
    pub fn claim_rendezvous<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
    ) -> Result<(), ClaimError> {
        if self.claim != ClaimState::Released {
            return Err(ClaimError::Busy);
        }
        self.claim = ClaimState::Pending;
        transport.listen(&self.rendezvous);
        Ok(())
    }

    /// Applies the transport's answer to a rendezvous listen.
    ///
    /// Every listen gets exactly one answer, in order. Answers to listens
    /// abandoned by [`release`](Self::release) are consumed first and
    /// return `None`; the unlisten sent on release already undid them.
    pub fn resolve_claim<T: Transport + ?Sized>(
        &mut self,
        transport: &mut T,
        result: Result<(), TransportError>,
    ) -> Option<Result<Ownership, ClaimError>> {
        if self.stale_answers > 0 {
            self.stale_answers -= 1;
            debug!(
                "Discarding answer for abandoned claim on {} ({:?})",
                self.rendezvous, result
            );
            return None;
        }
        if self.claim != ClaimState::Pending {
            debug!("Unexpected listen answer for {}", self.rendezvous);
            return None;
        }

        match result {
            Ok(()) => {
                self.claim = ClaimState::Held;
                Some(Ok(Ownership {
                    identity: self.rendezvous.clone(),
                }))
            }
            Err(error) => {
                // Nothing may linger from a failed claim
                transport.unlisten(&self.rendezvous);
                self.claim = ClaimState::Released;
                Some(Err(ClaimError::from(error)))
            }
        }
    }

    /// Drops a pending or held claim. Returns whether anything was released.
    pub fn release<T: Transport + ?Sized>(&mut self, transport: &mut T) -> bool {
        if self.claim == ClaimState::Released {
            return false;
        }
        if self.claim == ClaimState::Pending {
            self.stale_answers += 1;
        }
        transport.unlisten(&self.rendezvous);
        self.claim = ClaimState::Released;
        true
    }
}
