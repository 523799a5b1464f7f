use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::config::GroupsConfig;
use crate::membership::membership_events::{MembershipEvent, MembershipEventNotifier};
use crate::protocol::ids::MemberId;
use crate::util::clock::LocalClock;


#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemberInfo {
    pub member_id: MemberId,
    pub is_local: bool,
    /// `true` if the member announced itself recently enough. Local members are always alive.
    pub is_alive: bool,
}

#[derive(Debug)]
struct MemberEntry {
    is_local: bool,
    /// local time in millis; for remote members, when their last announcement was received
    last_heard_millis: i64,
}

/// The members of a single group that this process knows about, local and remote.
///
/// Liveness is tracked in local time rather than net time: net time may jump when the time
///  master changes, and such a jump must not expire (or resurrect) members.
pub struct MemberRegistry {
    group: String,
    clock: Arc<dyn LocalClock>,
    member_timeout_millis: i64,
    members: RwLock<BTreeMap<MemberId, MemberEntry>>,
    events: MembershipEventNotifier,
}

impl MemberRegistry {
    pub fn new(group: &str, config: &GroupsConfig, clock: Arc<dyn LocalClock>) -> MemberRegistry {
        MemberRegistry {
            group: group.to_string(),
            clock,
            member_timeout_millis: config.member_timeout().as_millis().try_into().unwrap_or(i64::MAX),
            members: Default::default(),
            events: MembershipEventNotifier::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub async fn add_local_member(&self, member_id: MemberId) {
        let now = self.clock.now_millis();
        self.members.write().await
            .insert(member_id, MemberEntry { is_local: true, last_heard_millis: now });
        info!("local member {:?} joined group {:?}", member_id, self.group);
        self.events.send_event(MembershipEvent::MemberJoined(member_id));
    }

    /// returns `true` if the member was known
    pub async fn remove_member(&self, member_id: MemberId) -> bool {
        let removed = self.members.write().await
            .remove(&member_id);
        match removed {
            Some(_) => {
                info!("member {:?} left group {:?}", member_id, self.group);
                self.events.send_event(MembershipEvent::MemberLeft(member_id));
                true
            }
            None => false,
        }
    }

    /// Records that a remote member announced itself, adding it if it was unknown so far
    pub async fn touch(&self, member_id: MemberId) {
        let now = self.clock.now_millis();
        let is_new = match self.members.write().await.entry(member_id) {
            Entry::Occupied(mut e) => {
                e.get_mut().last_heard_millis = now;
                false
            }
            Entry::Vacant(e) => {
                e.insert(MemberEntry { is_local: false, last_heard_millis: now });
                true
            }
        };

        if is_new {
            info!("discovered member {:?} in group {:?}", member_id, self.group);
            self.events.send_event(MembershipEvent::MemberJoined(member_id));
        }
    }

    /// Removes all remote members that did not announce themselves within the member timeout,
    ///  returning their ids
    pub async fn expire_stale(&self) -> Vec<MemberId> {
        let now = self.clock.now_millis();

        let mut members = self.members.write().await;
        let expired = members.iter()
            .filter(|(_, entry)| !self.is_still_kicking(entry, now))
            .map(|(&id, _)| id)
            .collect::<Vec<_>>();
        for id in &expired {
            members.remove(id);
        }
        drop(members);

        for &id in &expired {
            debug!("member {:?} of group {:?} expired", id, self.group);
            self.events.send_event(MembershipEvent::MemberExpired(id));
        }
        expired
    }

    fn is_still_kicking(&self, entry: &MemberEntry, now: i64) -> bool {
        entry.is_local || now.saturating_sub(entry.last_heard_millis) < self.member_timeout_millis
    }

    pub async fn snapshot(&self) -> Vec<MemberInfo> {
        let now = self.clock.now_millis();
        self.members.read().await
            .iter()
            .map(|(&member_id, entry)| MemberInfo {
                member_id,
                is_local: entry.is_local,
                is_alive: self.is_still_kicking(entry, now),
            })
            .collect()
    }

    /// The live members that a message sent by `member_id` must reach
    pub async fn snapshot_excluding(&self, member_id: MemberId) -> Vec<MemberId> {
        let now = self.clock.now_millis();
        self.members.read().await
            .iter()
            .filter(|(&id, entry)| id != member_id && self.is_still_kicking(entry, now))
            .map(|(&id, _)| id)
            .collect()
    }

    pub async fn contains(&self, member_id: MemberId) -> bool {
        self.members.read().await
            .contains_key(&member_id)
    }

    pub async fn is_local(&self, member_id: MemberId) -> bool {
        self.members.read().await
            .get(&member_id)
            .map(|e| e.is_local)
            .unwrap_or(false)
    }

    pub async fn local_members(&self) -> Vec<MemberId> {
        self.members.read().await
            .iter()
            .filter(|(_, entry)| entry.is_local)
            .map(|(&id, _)| id)
            .collect()
    }

    /// The time master is the member with the smallest id
    pub async fn time_master(&self) -> Option<MemberId> {
        self.members.read().await
            .keys()
            .next()
            .copied()
    }

    /// A member may act as a time source if no known member has a smaller id
    pub async fn is_eligible_time_source(&self, member_id: MemberId) -> bool {
        match self.time_master().await {
            Some(master) => member_id <= master,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::time;
    use crate::test_util::clock::ManualClock;
    use crate::test_util::test_config;
    use super::*;

    fn id(n: u128) -> MemberId {
        MemberId::from_u128(n)
    }

    /// announce interval 100ms, tolerance factor 3
    fn registry() -> MemberRegistry {
        MemberRegistry::new("g", &test_config(), Arc::new(ManualClock::new(1_000_000)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_discovers_unknown_member() {
        let registry = registry();
        let mut events = registry.subscribe();

        registry.touch(id(5)).await;
        registry.touch(id(5)).await;

        assert_eq!(registry.snapshot().await, vec![MemberInfo { member_id: id(5), is_local: false, is_alive: true }]);
        assert_eq!(events.try_recv().unwrap(), MembershipEvent::MemberJoined(id(5)));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let registry = registry();
        registry.add_local_member(id(1)).await;
        registry.touch(id(2)).await;
        registry.touch(id(3)).await;

        time::sleep(Duration::from_millis(200)).await;
        registry.touch(id(3)).await;
        time::sleep(Duration::from_millis(100)).await;

        // member 2 was last heard exactly 300ms ago, i.e. it is no longer kicking
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot, vec![
            MemberInfo { member_id: id(1), is_local: true, is_alive: true },
            MemberInfo { member_id: id(2), is_local: false, is_alive: false },
            MemberInfo { member_id: id(3), is_local: false, is_alive: true },
        ]);
        assert_eq!(registry.snapshot_excluding(id(1)).await, vec![id(3)]);

        let mut events = registry.subscribe();
        assert_eq!(registry.expire_stale().await, vec![id(2)]);
        assert_eq!(events.try_recv().unwrap(), MembershipEvent::MemberExpired(id(2)));
        assert!(!registry.contains(id(2)).await);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(registry.expire_stale().await, vec![id(3)]);
        assert_eq!(registry.local_members().await, vec![id(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_member() {
        let registry = registry();
        registry.add_local_member(id(1)).await;
        let mut events = registry.subscribe();

        assert!(registry.remove_member(id(1)).await);
        assert!(!registry.remove_member(id(1)).await);
        assert_eq!(events.try_recv().unwrap(), MembershipEvent::MemberLeft(id(1)));
        assert!(events.try_recv().is_err());
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_excluding_includes_other_local_members() {
        let registry = registry();
        registry.add_local_member(id(1)).await;
        registry.add_local_member(id(2)).await;
        registry.touch(id(3)).await;

        assert_eq!(registry.snapshot_excluding(id(2)).await, vec![id(1), id(3)]);
        assert!(registry.is_local(id(2)).await);
        assert!(!registry.is_local(id(3)).await);
        assert!(!registry.is_local(id(4)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_master() {
        let registry = registry();
        assert_eq!(registry.time_master().await, None);
        assert!(registry.is_eligible_time_source(id(9)).await);

        registry.add_local_member(id(5)).await;
        registry.touch(id(3)).await;
        assert_eq!(registry.time_master().await, Some(id(3)));
        assert!(registry.is_eligible_time_source(id(3)).await);
        assert!(registry.is_eligible_time_source(id(2)).await);
        assert!(!registry.is_eligible_time_source(id(4)).await);
    }
}
