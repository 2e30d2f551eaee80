//! Host-side lobby membership and the connection table
//!
//! The host keeps an ordered list of identities, itself first, that never
//! grows past the target lobby size. Once the list reaches the target the
//! lobby is sealed and further joins are turned away until someone leaves.

use crate::transport::ConnId;
use shared::PeerId;

/// Result of offering an identity to the lobby
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Admitted; the lobby is still filling
    Added { current: usize, total: usize },
    /// Admitted as the last member; carries the sealed member list
    Sealed { members: Vec<PeerId> },
    /// Already a member; nothing changed
    Duplicate { current: usize, total: usize },
    /// Lobby is full
    Rejected { current: usize, total: usize },
}

#[derive(Debug, Clone)]
pub struct LobbyMembership {
    members: Vec<PeerId>,
    target: usize,
    full: bool,
}

impl LobbyMembership {
    pub fn new(target: usize) -> Self {
        Self {
            members: Vec::with_capacity(target),
            target,
            full: false,
        }
    }

    /// Starts a fresh lobby with the host as its only member
    pub fn seed(&mut self, host: PeerId) {
        self.members.clear();
        self.members.push(host);
        self.full = false;
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.full = false;
    }

    pub fn admit(&mut self, peer: PeerId) -> Admission {
        let current = self.members.len();
        // A member asking again is answered even when the lobby is sealed
        if self.members.contains(&peer) {
            return Admission::Duplicate {
                current,
                total: self.target,
            };
        }
        if self.full || current >= self.target {
            return Admission::Rejected {
                current,
                total: self.target,
            };
        }

        self.members.push(peer);
        if self.members.len() == self.target {
            self.full = true;
            Admission::Sealed {
                members: self.members.clone(),
            }
        } else {
            Admission::Added {
                current: self.members.len(),
                total: self.target,
            }
        }
    }

    /// Removes a non-host member.
    ///
    /// Returns `Some(true)` when the removal reopened a sealed lobby,
    /// `Some(false)` for an ordinary removal and `None` if `peer` was not a
    /// removable member.
    pub fn remove(&mut self, peer: &PeerId) -> Option<bool> {
        let index = self.members.iter().position(|m| m == peer)?;
        if index == 0 {
            return None;
        }
        self.members.remove(index);

        let reopened = self.full && self.members.len() < self.target;
        if reopened {
            self.full = false;
        }
        Some(reopened)
    }

    pub fn members(&self) -> &[PeerId] {
        &self.members
    }

    /// Members other than the host
    pub fn guests(&self) -> &[PeerId] {
        self.members.get(1..).unwrap_or(&[])
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn remaining(&self) -> usize {
        self.target.saturating_sub(self.members.len())
    }

    pub fn is_full(&self) -> bool {
        self.full
    }
}

/// Maps lobby identities to the live connection used to reach them
///
/// A host holds one entry per guest, a client holds at most one entry: its
/// host. Entries keep insertion order so broadcasts are deterministic.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    entries: Vec<(PeerId, ConnId)>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `conn` for `peer`, returning the connection it replaces
    pub fn insert(&mut self, peer: PeerId, conn: ConnId) -> Option<ConnId> {
        if let Some(entry) = self.entries.iter_mut().find(|(p, _)| *p == peer) {
            return Some(std::mem::replace(&mut entry.1, conn));
        }
        self.entries.push((peer, conn));
        None
    }

    pub fn remove_conn(&mut self, conn: ConnId) -> Option<PeerId> {
        let index = self.entries.iter().position(|(_, c)| *c == conn)?;
        Some(self.entries.remove(index).0)
    }

    pub fn conn_of(&self, peer: &PeerId) -> Option<ConnId> {
        self.entries
            .iter()
            .find(|(p, _)| p == peer)
            .map(|(_, c)| *c)
    }

    pub fn peer_of(&self, conn: ConnId) -> Option<&PeerId> {
        self.entries
            .iter()
            .find(|(_, c)| *c == conn)
            .map(|(p, _)| p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerId, ConnId)> {
        self.entries.iter().map(|(p, c)| (p, *c))
    }

    pub fn drain(&mut self) -> Vec<(PeerId, ConnId)> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(name: &str) -> PeerId {
        PeerId::from(name)
    }

    fn hosted(target: usize) -> LobbyMembership {
        let mut membership = LobbyMembership::new(target);
        membership.seed(id("H"));
        membership
    }

    #[test]
    fn test_fill_and_seal() {
        let mut membership = hosted(3);

        assert_eq!(
            membership.admit(id("A")),
            Admission::Added {
                current: 2,
                total: 3
            }
        );
        assert_eq!(
            membership.admit(id("B")),
            Admission::Sealed {
                members: vec![id("H"), id("A"), id("B")]
            }
        );
        assert!(membership.is_full());
        assert_eq!(membership.remaining(), 0);
        assert_eq!(membership.guests(), &[id("A"), id("B")]);
    }

    #[test]
    fn test_rejects_after_seal() {
        let mut membership = hosted(2);
        membership.admit(id("A"));

        assert_eq!(
            membership.admit(id("C")),
            Admission::Rejected {
                current: 2,
                total: 2
            }
        );
        assert_eq!(membership.len(), 2);
    }

    #[test]
    fn test_duplicate_join_is_idempotent() {
        let mut membership = hosted(3);
        membership.admit(id("A"));

        assert_eq!(
            membership.admit(id("A")),
            Admission::Duplicate {
                current: 2,
                total: 3
            }
        );
        assert_eq!(membership.members(), &[id("H"), id("A")]);
    }

    #[test]
    fn test_member_asking_again_after_seal_is_duplicate() {
        let mut membership = hosted(2);
        membership.admit(id("A"));

        assert_eq!(
            membership.admit(id("A")),
            Admission::Duplicate {
                current: 2,
                total: 2
            }
        );
        assert!(membership.is_full());
        assert_eq!(membership.len(), 2);
    }

    #[test]
    fn test_shrink_reopens_sealed_lobby() {
        let mut membership = hosted(3);
        membership.admit(id("A"));
        membership.admit(id("B"));

        assert_eq!(membership.remove(&id("A")), Some(true));
        assert!(!membership.is_full());
        assert_eq!(membership.len(), 2);

        assert!(matches!(
            membership.admit(id("C")),
            Admission::Sealed { .. }
        ));
    }

    #[test]
    fn test_host_cannot_be_removed() {
        let mut membership = hosted(3);
        assert_eq!(membership.remove(&id("H")), None);
        assert_eq!(membership.remove(&id("nobody")), None);
        assert_eq!(membership.members().first(), Some(&id("H")));
    }

    #[test]
    fn test_connection_table_lookups() {
        let mut table = ConnectionTable::new();
        assert_eq!(table.insert(id("A"), ConnId(1)), None);
        assert_eq!(table.insert(id("B"), ConnId(2)), None);
        assert_eq!(table.insert(id("A"), ConnId(3)), Some(ConnId(1)));

        assert_eq!(table.conn_of(&id("A")), Some(ConnId(3)));
        assert_eq!(table.peer_of(ConnId(2)), Some(&id("B")));
        assert_eq!(table.peer_of(ConnId(1)), None);

        assert_eq!(table.remove_conn(ConnId(2)), Some(id("B")));
        assert_eq!(table.remove_conn(ConnId(3)), Some(id("A")));
        assert!(table.is_empty());
    }

    #[derive(Debug, Clone)]
    enum Step {
        Join(u8),
        Leave(u8),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..8).prop_map(Step::Join),
            (0u8..8).prop_map(Step::Leave),
        ]
    }

    proptest! {
        #[test]
        fn test_membership_never_exceeds_target(
            target in 2usize..6,
            steps in proptest::collection::vec(step(), 0..64),
        ) {
            let mut membership = hosted(target);

            for step in steps {
                let was_full = membership.is_full();
                match step {
                    Step::Join(n) => {
                        let peer = id(&format!("P{}", n));
                        let member = membership.contains(&peer);
                        let admission = membership.admit(peer);
                        if member {
                            let duplicate = matches!(admission, Admission::Duplicate { .. });
                            prop_assert!(duplicate);
                        } else if was_full {
                            let rejected = matches!(admission, Admission::Rejected { .. });
                            prop_assert!(rejected);
                        }
                    }
                    Step::Leave(n) => {
                        membership.remove(&id(&format!("P{}", n)));
                    }
                }

                prop_assert!(membership.len() <= target);
                prop_assert_eq!(membership.is_full(), membership.len() == target);
                prop_assert_eq!(membership.members().first(), Some(&id("H")));
            }
        }
    }
}
