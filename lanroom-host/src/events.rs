use crate::offers::PendingOffer;

/// Events the relay engine surfaces to whatever presents the room
/// (a UI, the CLI, tests). All methods default to no-ops so an
/// implementor only picks the events it cares about.
pub trait HostObserver: Send + Sync {
    fn chat_received(&self, _from: &str, _text: &str) {}
    fn system_notice(&self, _text: &str) {}
    fn user_list_changed(&self, _users: &[String]) {}
    /// An offer addressed to (or visible to) the host is pending.
    fn file_offer(&self, _offer: &PendingOffer, _size: &str) {}
    fn file_accepted(&self, _by: &str, _filename: &str) {}
    fn file_rejected(&self, _by: &str, _filename: &str) {}
    fn file_received(&self, _filename: &str, _from: &str, _bytes: usize) {}
    fn connection_lost(&self, _nick: &str) {}
}

/// Media-signaling collaborator. Payloads are opaque to the relay;
/// this is only called when a SignalRelay frame targets the host.
pub trait SignalHandler: Send + Sync {
    fn deliver_signal(&self, _from: &str, _payload: &str) {}
}

/// Discovery collaborator hook, called around the listener lifetime.
/// The relay does not care how rooms get advertised (mDNS, nothing).
pub trait RoomAdvertiser: Send + Sync {
    fn advertise(&self, _port: u16) {}
    fn stop_advertising(&self) {}
}

/// Default no-op collaborator for all three capability sets.
pub struct NullObserver;

impl HostObserver for NullObserver {}
impl SignalHandler for NullObserver {}
impl RoomAdvertiser for NullObserver {}
