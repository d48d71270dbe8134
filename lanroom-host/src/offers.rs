use std::collections::HashMap;

use crate::registry::ParticipantId;

/// Where an offer originated. The host's own offers go through the
/// same table so a client's FileAccept correlates back to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OfferSender {
    Host,
    Peer(ParticipantId),
}

/// One outstanding file offer awaiting an accept/reject decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOffer {
    pub sender: OfferSender,
    pub sender_nick: String,
    pub filename: String,
    /// Empty means the offer was broadcast to everyone.
    pub recipient_nick: String,
}

/// Pending offers keyed by sender nickname. A new offer from the same
/// sender silently overwrites an unresolved prior one; there is no
/// queueing. Offers orphaned by a recipient disconnect stay until
/// overwritten. Not internally locked: mutated only under the host's
/// state lock, alongside the registry.
#[derive(Debug, Default)]
pub(crate) struct OfferTable {
    offers: HashMap<String, PendingOffer>,
}

impl OfferTable {
    pub fn record(&mut self, offer: PendingOffer) {
        self.offers.insert(offer.sender_nick.clone(), offer);
    }

    /// Removes and returns the offer, if any.
    pub fn resolve(&mut self, sender_nick: &str) -> Option<PendingOffer> {
        self.offers.remove(sender_nick)
    }

    pub fn peek(&self, sender_nick: &str) -> Option<&PendingOffer> {
        self.offers.get(sender_nick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(sender_nick: &str, filename: &str) -> PendingOffer {
        PendingOffer {
            sender: OfferSender::Peer(1),
            sender_nick: sender_nick.to_owned(),
            filename: filename.to_owned(),
            recipient_nick: String::new(),
        }
    }

    #[test]
    fn resolve_removes_the_offer() {
        let mut table = OfferTable::default();
        table.record(offer("alice", "notes.txt"));
        assert!(table.peek("alice").is_some());
        assert_eq!(table.resolve("alice").unwrap().filename, "notes.txt");
        assert!(table.resolve("alice").is_none());
    }

    #[test]
    fn second_offer_from_same_sender_overwrites() {
        let mut table = OfferTable::default();
        table.record(offer("alice", "first.txt"));
        table.record(offer("alice", "second.txt"));
        assert_eq!(table.resolve("alice").unwrap().filename, "second.txt");
        // The first offer must not be double-resolvable.
        assert!(table.resolve("alice").is_none());
    }
}
