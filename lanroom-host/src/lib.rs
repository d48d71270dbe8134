mod events;
mod offers;
mod registry;
mod relay;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use lanroom_core::{MAX_FILE_BYTES, Message, encode_file_payload, format_size, sanitize_filename};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};

pub use events::{HostObserver, NullObserver, RoomAdvertiser, SignalHandler};
pub use offers::{OfferSender, PendingOffer};
pub use registry::ParticipantId;

use offers::OfferTable;
use registry::Registry;

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub nick: String,
    /// Where broadcast/host-addressed file payloads are persisted.
    pub download_dir: PathBuf,
}

impl HostConfig {
    pub fn new(nick: &str) -> Self {
        HostConfig {
            nick: nick.to_owned(),
            download_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("file exceeds the {} byte offer ceiling ({size} bytes)", MAX_FILE_BYTES)]
    FileTooLarge { size: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything mutable the relay shares across sessions: the registry
/// and the offer bookkeeping live under one lock so join/leave,
/// renames and offer resolution never race each other.
pub(crate) struct RoomState {
    pub registry: Registry,
    pub offers: OfferTable,
    pub host_nick: String,
    /// Offer currently awaiting the host's own accept/reject.
    pub host_pending: Option<PendingOffer>,
    /// Path behind the host's outstanding outbound offer, sent
    /// automatically once someone accepts.
    pub outgoing: Option<PathBuf>,
}

pub(crate) struct HostShared {
    pub state: RwLock<RoomState>,
    pub observer: Arc<dyn HostObserver>,
    pub signals: Arc<dyn SignalHandler>,
    pub advertiser: Arc<dyn RoomAdvertiser>,
    pub download_dir: PathBuf,
    pub next_id: AtomicU64,
    pub shutdown: watch::Sender<bool>,
}

/// Handle to a running (or about-to-run) room. Cheap to clone; all
/// clones share the same room.
#[derive(Clone)]
pub struct Host {
    shared: Arc<HostShared>,
}

impl Host {
    pub fn new(config: HostConfig) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(NullObserver),
            Arc::new(NullObserver),
            Arc::new(NullObserver),
        )
    }

    pub fn with_collaborators(
        config: HostConfig,
        observer: Arc<dyn HostObserver>,
        signals: Arc<dyn SignalHandler>,
        advertiser: Arc<dyn RoomAdvertiser>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Host {
            shared: Arc::new(HostShared {
                state: RwLock::new(RoomState {
                    registry: Registry::default(),
                    offers: OfferTable::default(),
                    host_nick: config.nick,
                    host_pending: None,
                    outgoing: None,
                }),
                observer,
                signals,
                advertiser,
                download_dir: config.download_dir,
                next_id: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    /// Accepts connections until `shutdown` is called, then runs the
    /// closing broadcast and releases the listening socket.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!("hosting room on {addr}");
            self.shared.advertiser.advertise(addr.port());
        }
        let mut shutdown_rx = self.shared.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(relay::run_session(Arc::clone(&self.shared), stream));
                    }
                    Err(err) => warn!("accept failed: {err}"),
                },
                _ = shutdown_rx.changed() => break,
            }
        }
        self.shared.advertiser.stop_advertising();
        close_room(&self.shared).await;
        Ok(())
    }

    /// Signals the accept loop to stop. The room-closed broadcast and
    /// the mass disconnect happen inside `serve` before it returns.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown.send(true);
    }

    /// Broadcasts a chat line from the host to every participant.
    pub async fn send_chat(&self, text: &str) {
        let nick = self.nick().await;
        relay::broadcast(&self.shared, &Message::chat(&nick, text), None).await;
    }

    pub async fn nick(&self) -> String {
        self.shared.state.read().await.host_nick.clone()
    }

    pub async fn change_nick(&self, new_nick: &str) {
        let (old, users) = {
            let mut state = self.shared.state.write().await;
            let old = std::mem::replace(&mut state.host_nick, new_nick.to_owned());
            (old, state.registry.snapshot(&state.host_nick))
        };
        let notice = format!("{old} is now known as {new_nick}");
        relay::broadcast(&self.shared, &Message::system(&notice), None).await;
        self.shared.observer.user_list_changed(&users);
    }

    pub async fn user_list(&self) -> Vec<String> {
        let state = self.shared.state.read().await;
        state.registry.snapshot(&state.host_nick)
    }

    /// Offers a file to one participant, or to everyone when `target`
    /// is empty. The payload is only sent once an accept comes back.
    pub async fn offer_file(&self, path: &Path, target: &str) -> Result<(), HostError> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.len() > MAX_FILE_BYTES {
            return Err(HostError::FileTooLarge { size: meta.len() });
        }
        let filename = sanitize_filename(&path.to_string_lossy());
        let size = format_size(meta.len());

        let nick = {
            let mut state = self.shared.state.write().await;
            let nick = state.host_nick.clone();
            state.offers.record(PendingOffer {
                sender: OfferSender::Host,
                sender_nick: nick.clone(),
                filename: filename.clone(),
                recipient_nick: target.to_owned(),
            });
            state.outgoing = Some(path.to_owned());
            nick
        };

        let frame = Message::file_offer(&nick, &filename, &size, target);
        if target.is_empty() {
            relay::broadcast(&self.shared, &frame, None).await;
        } else {
            relay::unicast(&self.shared, target, &frame).await;
        }
        Ok(())
    }

    /// Sends a file payload immediately, skipping the offer handshake.
    pub async fn send_file(&self, path: &Path, target: &str) -> Result<(), HostError> {
        send_file_inner(&self.shared, path, target).await
    }

    /// The offer currently awaiting the host's decision, if any.
    pub async fn pending_offer(&self) -> Option<PendingOffer> {
        self.shared.state.read().await.host_pending.clone()
    }

    /// Accepts the host-local pending offer; returns false when there
    /// is none. The sender answers with the FileData payload.
    pub async fn accept_pending(&self) -> bool {
        self.decide_pending(true).await
    }

    pub async fn reject_pending(&self) -> bool {
        self.decide_pending(false).await
    }

    async fn decide_pending(&self, accepted: bool) -> bool {
        let (offer, nick, sender_tx) = {
            let mut state = self.shared.state.write().await;
            let Some(offer) = state.host_pending.take() else {
                return false;
            };
            // A broadcast offer is dual-recorded; resolving it here
            // keeps a later client accept from double-resolving it.
            if state
                .offers
                .peek(&offer.sender_nick)
                .is_some_and(|shared_offer| shared_offer.filename == offer.filename)
            {
                state.offers.resolve(&offer.sender_nick);
            }
            let tx = match offer.sender {
                OfferSender::Peer(id) => state.registry.sender_of(id),
                OfferSender::Host => None,
            };
            (offer, state.host_nick.clone(), tx)
        };
        let Some(tx) = sender_tx else {
            return false;
        };
        let kind = if accepted {
            lanroom_core::MessageKind::FileAccept
        } else {
            lanroom_core::MessageKind::FileReject
        };
        relay::send_frame(
            &tx,
            &Message {
                kind,
                nick,
                text: offer.filename,
                ..Default::default()
            },
        );
        true
    }

    /// Emits an opaque signaling payload toward a named participant.
    pub async fn send_signal(&self, target: &str, payload: &str) {
        let nick = self.nick().await;
        relay::unicast(&self.shared, target, &Message::signal(&nick, payload, target)).await;
    }
}

pub(crate) async fn send_file_inner(
    shared: &Arc<HostShared>,
    path: &Path,
    target: &str,
) -> Result<(), HostError> {
    let bytes = tokio::fs::read(path).await?;
    if bytes.len() as u64 > MAX_FILE_BYTES {
        return Err(HostError::FileTooLarge {
            size: bytes.len() as u64,
        });
    }
    let filename = sanitize_filename(&path.to_string_lossy());
    let nick = { shared.state.read().await.host_nick.clone() };
    let frame = Message::file_data(&nick, &filename, encode_file_payload(&bytes), target);
    if target.is_empty() {
        relay::broadcast(shared, &frame, None).await;
    } else {
        relay::unicast(shared, target, &frame).await;
    }
    Ok(())
}

/// Final act of `serve`: tell everyone the room is closing, then drop
/// every outbound queue so the writer tasks drain and close their
/// connections.
async fn close_room(shared: &HostShared) {
    let departing = {
        let mut state = shared.state.write().await;
        state.registry.clear()
    };
    if departing.is_empty() {
        return;
    }
    if let Ok(frame) = lanroom_core::encode_frame(&Message::system("Room closed by host")) {
        for participant in &departing {
            let _ = participant.tx.send(frame.clone());
        }
    }
    info!("room closed, {} participant(s) disconnected", departing.len());
}
