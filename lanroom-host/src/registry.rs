use std::collections::BTreeMap;

use lanroom_core::{HOST_SUFFIX, USER_LIST_SEPARATOR};
use tokio::sync::mpsc;

/// Connection identity. Assigned in accept order, so iterating the
/// registry (a BTreeMap) walks participants in join order.
pub type ParticipantId = u64;

/// Encoded frames queued to a participant's writer task.
pub type OutboundSender = mpsc::UnboundedSender<String>;

#[derive(Debug)]
pub(crate) struct Participant {
    pub nick: String,
    pub tx: OutboundSender,
}

/// The shared participant registry. Not internally locked: it lives
/// inside the host's single `RwLock` together with the offer table,
/// so registry reads-for-broadcast never race join/leave mutation.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    participants: BTreeMap<ParticipantId, Participant>,
}

impl Registry {
    pub fn add(&mut self, id: ParticipantId, nick: String, tx: OutboundSender) {
        self.participants.insert(id, Participant { nick, tx });
    }

    pub fn remove(&mut self, id: ParticipantId) -> Option<Participant> {
        self.participants.remove(&id)
    }

    /// Renames in place and returns the previous nickname.
    pub fn rename(&mut self, id: ParticipantId, new_nick: &str) -> Option<String> {
        let participant = self.participants.get_mut(&id)?;
        Some(std::mem::replace(&mut participant.nick, new_nick.to_owned()))
    }

    pub fn nick_of(&self, id: ParticipantId) -> Option<&str> {
        self.participants.get(&id).map(|p| p.nick.as_str())
    }

    pub fn sender_of(&self, id: ParticipantId) -> Option<OutboundSender> {
        self.participants.get(&id).map(|p| p.tx.clone())
    }

    /// First match in join order. Nicknames are not unique; among
    /// duplicates the earliest-joined participant wins.
    pub fn lookup_nick(&self, nick: &str) -> Option<(ParticipantId, OutboundSender)> {
        self.participants
            .iter()
            .find(|(_, p)| p.nick == nick)
            .map(|(id, p)| (*id, p.tx.clone()))
    }

    /// Outbound senders for every participant except `exclude`.
    pub fn senders_except(&self, exclude: Option<ParticipantId>) -> Vec<OutboundSender> {
        self.participants
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .map(|(_, p)| p.tx.clone())
            .collect()
    }

    /// Nicknames in join order, host first with its " (host)" suffix.
    pub fn snapshot(&self, host_nick: &str) -> Vec<String> {
        let mut users = Vec::with_capacity(self.participants.len() + 1);
        users.push(format!("{host_nick}{HOST_SUFFIX}"));
        users.extend(self.participants.values().map(|p| p.nick.clone()));
        users
    }

    pub fn user_list_text(&self, host_nick: &str) -> String {
        self.snapshot(host_nick).join(USER_LIST_SEPARATOR)
    }

    pub fn clear(&mut self) -> Vec<Participant> {
        std::mem::take(&mut self.participants).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> OutboundSender {
        mpsc::unbounded_channel().0
    }

    #[test]
    fn snapshot_is_join_ordered_with_host_first() {
        let mut registry = Registry::default();
        registry.add(2, "carol".to_owned(), sender());
        registry.add(1, "bob".to_owned(), sender());
        assert_eq!(
            registry.user_list_text("alice"),
            "alice (host), bob, carol"
        );
    }

    #[test]
    fn rename_returns_old_nick() {
        let mut registry = Registry::default();
        registry.add(1, "bob".to_owned(), sender());
        assert_eq!(registry.rename(1, "bobby").as_deref(), Some("bob"));
        assert_eq!(registry.nick_of(1), Some("bobby"));
        assert!(registry.rename(9, "ghost").is_none());
    }

    #[test]
    fn duplicate_nicks_resolve_to_first_joined() {
        let mut registry = Registry::default();
        let (tx_first, mut rx_first) = mpsc::unbounded_channel();
        registry.add(1, "bob".to_owned(), tx_first);
        registry.add(2, "bob".to_owned(), sender());

        let (id, tx) = registry.lookup_nick("bob").unwrap();
        assert_eq!(id, 1);
        tx.send("frame".to_owned()).unwrap();
        assert_eq!(rx_first.try_recv().unwrap(), "frame");
    }

    #[test]
    fn senders_except_excludes_only_that_connection() {
        let mut registry = Registry::default();
        registry.add(1, "bob".to_owned(), sender());
        registry.add(2, "bob".to_owned(), sender());
        // Same nickname, different connection: the duplicate still
        // receives broadcasts from its twin.
        assert_eq!(registry.senders_except(Some(1)).len(), 1);
        assert_eq!(registry.senders_except(None).len(), 2);
    }
}
