use bit_set::BitSet;
use rustc_hash::FxHashMap;

use crate::protocol::ids::MemberId;


/// Acknowledgement bookkeeping for a single outgoing message: for each member that must receive
///  the message, the set of fragments it did not acknowledge yet.
#[derive(Debug)]
pub struct AckTable {
    total: u32,
    unacked: FxHashMap<MemberId, BitSet>,
}

impl AckTable {
    pub fn new(members: &[MemberId], total: u32) -> AckTable {
        let all_fragments = (0..total as usize).collect::<BitSet>();
        AckTable {
            total,
            unacked: members.iter()
                .map(|&m| (m, all_fragments.clone()))
                .collect(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// returns `true` if this ack was new
    pub fn acknowledge(&mut self, member: MemberId, sequence: u32) -> bool {
        match self.unacked.get_mut(&member) {
            Some(unacked) => unacked.remove(sequence as usize),
            None => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.unacked.values().all(|s| s.is_empty())
    }

    /// Stops waiting for members that are no longer part of the group
    pub fn retain_members(&mut self, mut predicate: impl FnMut(MemberId) -> bool) {
        self.unacked.retain(|&m, _| predicate(m));
    }

    pub fn members(&self) -> Vec<MemberId> {
        self.unacked.keys().copied().collect()
    }

    /// The fragments that at least one member is still missing
    pub fn unacked_sequences(&self) -> BitSet {
        let mut result = BitSet::new();
        for unacked in self.unacked.values() {
            result.union_with(unacked);
        }
        result
    }

    pub fn missing_members(&self) -> Vec<MemberId> {
        let mut result = self.unacked.iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(&m, _)| m)
            .collect::<Vec<_>>();
        result.sort();
        result
    }
}
