use std::sync::Arc;
use std::sync::atomic::Ordering;

use lanroom_core::{
    Message, MessageKind, decode_file_payload, decode_frame, encode_frame, sanitize_filename,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::HostShared;
use crate::offers::{OfferSender, PendingOffer};
use crate::registry::{OutboundSender, ParticipantId};

/// Runs one participant session to completion: join handshake, read
/// loop, removal. Any read or decode failure ends only this session;
/// other connections and the shared state are untouched beyond this
/// participant's removal.
pub(crate) async fn run_session(shared: Arc<HostShared>, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_owned());
    let (read_half, write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(write_loop(write_half, outbound_rx));

    // Connecting: the only legal first frame is Join. Anything else
    // closes the connection without ever registering it.
    let join = match lines.next_line().await {
        Ok(Some(line)) => match decode_frame(&line) {
            Ok(message) if message.kind == MessageKind::Join => message,
            Ok(message) => {
                warn!("{peer}: first frame was {:?}, closing", message.kind);
                return;
            }
            Err(err) => {
                warn!("{peer}: undecodable first frame: {err}");
                return;
            }
        },
        Ok(None) | Err(_) => return,
    };

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let nick = join.nick;
    let (users, joined_notice) = {
        let mut state = shared.state.write().await;
        state.registry.add(id, nick.clone(), outbound_tx);
        (
            state.registry.snapshot(&state.host_nick),
            format!("{nick} joined"),
        )
    };
    info!("{nick} joined from {peer}");
    broadcast(&shared, &Message::system(&joined_notice), Some(id)).await;
    shared.observer.system_notice(&joined_notice);
    shared.observer.user_list_changed(&users);

    // Active: one blocking read per frame until the peer goes away.
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_frame(&line) {
                Ok(message) => handle_frame(&shared, id, message).await,
                Err(err) => {
                    // A corrupt stream is not safely resumable.
                    warn!("{nick}: dropping connection on bad frame: {err}");
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                debug!("{nick}: read error: {err}");
                break;
            }
        }
    }

    // Closed: remove, then tell everyone who is left. The removal can
    // lose the race against shutdown; in that case there is nothing
    // left to announce.
    let departed = {
        let mut state = shared.state.write().await;
        state.registry.remove(id).map(|participant| {
            (
                participant.nick,
                state.registry.snapshot(&state.host_nick),
            )
        })
    };
    if let Some((nick, users)) = departed {
        let notice = format!("{nick} left");
        info!("{notice}");
        broadcast(&shared, &Message::system(&notice), None).await;
        shared.observer.system_notice(&notice);
        shared.observer.user_list_changed(&users);
        shared.observer.connection_lost(&nick);
    }
}

/// Drains one participant's outbound queue onto its write half. The
/// queue serializes concurrent broadcasters so frames never interleave.
async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = rx.recv().await {
        if writer.write_all(frame.as_bytes()).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// The dispatch table: one inbound frame from one participant becomes
/// zero or more outbound frames plus registry/offer-table effects.
async fn handle_frame(shared: &Arc<HostShared>, id: ParticipantId, message: Message) {
    match message.kind {
        // Join is only legal as a connection's first frame.
        MessageKind::Join => debug!("ignoring repeat join from connection {id}"),

        MessageKind::Chat => {
            let Some(nick) = sender_nick(shared, id).await else {
                return;
            };
            shared.observer.chat_received(&nick, &message.text);
            broadcast(shared, &Message::chat(&nick, &message.text), Some(id)).await;
        }

        MessageKind::NickChange => {
            let renamed = {
                let mut state = shared.state.write().await;
                state.registry.rename(id, &message.text).map(|old| {
                    (old, state.registry.snapshot(&state.host_nick))
                })
            };
            if let Some((old, users)) = renamed {
                let notice = format!("{old} is now known as {}", message.text);
                broadcast(shared, &Message::system(&notice), Some(id)).await;
                shared.observer.system_notice(&notice);
                shared.observer.user_list_changed(&users);
            }
        }

        MessageKind::Ping => {
            reply(shared, id, &Message::new(MessageKind::Pong)).await;
        }

        MessageKind::UserListRequest => {
            let users = {
                let state = shared.state.read().await;
                state.registry.user_list_text(&state.host_nick)
            };
            reply(shared, id, &Message::user_list_reply(&users)).await;
        }

        MessageKind::FileOffer => handle_file_offer(shared, id, message).await,
        MessageKind::FileAccept => handle_offer_decision(shared, id, message, true).await,
        MessageKind::FileReject => handle_offer_decision(shared, id, message, false).await,
        MessageKind::FileData => handle_file_data(shared, id, message).await,

        MessageKind::SignalRelay => {
            let Some(nick) = sender_nick(shared, id).await else {
                return;
            };
            let host_nick = { shared.state.read().await.host_nick.clone() };
            if message.target == host_nick {
                shared.signals.deliver_signal(&nick, &message.payload);
            } else {
                // Relay verbatim, but with the sender rewritten to the
                // true origin so targets cannot be fooled by a spoofed
                // nick field.
                let forward = Message::signal(&nick, &message.payload, &message.target);
                unicast(shared, &message.target, &forward).await;
            }
        }

        // Host-originated kinds; a client has no business sending them.
        MessageKind::System | MessageKind::Pong | MessageKind::UserListReply => {
            debug!("ignoring {:?} from connection {id}", message.kind)
        }
    }
}

async fn handle_file_offer(shared: &Arc<HostShared>, id: ParticipantId, message: Message) {
    let (offer, for_host) = {
        let mut state = shared.state.write().await;
        let Some(nick) = state.registry.nick_of(id).map(str::to_owned) else {
            return;
        };
        let offer = PendingOffer {
            sender: OfferSender::Peer(id),
            sender_nick: nick,
            filename: message.text.clone(),
            recipient_nick: message.target.clone(),
        };
        let for_host = message.target.is_empty() || message.target == state.host_nick;
        if message.target.is_empty() {
            // A broadcast offer is acceptable by anyone, the host
            // included, so it is recorded both ways.
            state.offers.record(offer.clone());
            state.host_pending = Some(offer.clone());
        } else if message.target == state.host_nick {
            state.host_pending = Some(offer.clone());
        } else {
            state.offers.record(offer.clone());
        }
        (offer, for_host)
    };

    if offer.recipient_nick.is_empty() {
        let frame = Message::file_offer(
            &offer.sender_nick,
            &offer.filename,
            &message.payload,
            "",
        );
        broadcast(shared, &frame, Some(id)).await;
    } else if !for_host {
        let frame = Message::file_offer(
            &offer.sender_nick,
            &offer.filename,
            &message.payload,
            &offer.recipient_nick,
        );
        unicast(shared, &offer.recipient_nick, &frame).await;
        shared.observer.system_notice(&format!(
            "{} offers {} to {}",
            offer.sender_nick, offer.filename, offer.recipient_nick
        ));
    }
    if for_host {
        shared.observer.file_offer(&offer, &message.payload);
    }
}

/// FileAccept/FileReject both carry the *original sender's* nickname
/// in `text`; resolve the pending offer by that key and answer the
/// offerer. No matching offer means the frame is silently dropped.
async fn handle_offer_decision(
    shared: &Arc<HostShared>,
    id: ParticipantId,
    message: Message,
    accepted: bool,
) {
    let (offer, decider, sender_tx, outgoing) = {
        let mut state = shared.state.write().await;
        let Some(decider) = state.registry.nick_of(id).map(str::to_owned) else {
            return;
        };
        let Some(offer) = state.offers.resolve(&message.text) else {
            debug!(
                "{decider}: decision for {:?} matches no pending offer",
                message.text
            );
            return;
        };
        let sender_tx = match offer.sender {
            OfferSender::Peer(sender_id) => state.registry.sender_of(sender_id),
            OfferSender::Host => None,
        };
        let outgoing = if offer.sender == OfferSender::Host && accepted {
            state.outgoing.take()
        } else {
            if offer.sender == OfferSender::Host {
                state.outgoing = None;
            }
            None
        };
        (offer, decider, sender_tx, outgoing)
    };

    match offer.sender {
        OfferSender::Peer(_) => {
            let Some(tx) = sender_tx else {
                // Offerer vanished before the decision arrived.
                return;
            };
            let kind = if accepted {
                MessageKind::FileAccept
            } else {
                MessageKind::FileReject
            };
            let answer = Message {
                kind,
                nick: decider.clone(),
                text: offer.filename.clone(),
                ..Default::default()
            };
            send_frame(&tx, &answer);
            shared.observer.system_notice(&format!(
                "{decider} {} file from {}",
                if accepted { "accepted" } else { "rejected" },
                offer.sender_nick
            ));
        }
        OfferSender::Host => {
            // Our own offer came back decided: notify, and on accept
            // send the payload straight to whoever said yes.
            if accepted {
                shared.observer.file_accepted(&decider, &offer.filename);
                if let Some(path) = outgoing {
                    let shared = Arc::clone(shared);
                    let recipient = decider;
                    tokio::spawn(async move {
                        if let Err(err) = crate::send_file_inner(&shared, &path, &recipient).await {
                            warn!("failed to send accepted file: {err}");
                        }
                    });
                }
            } else {
                shared.observer.file_rejected(&decider, &offer.filename);
            }
        }
    }
}

async fn handle_file_data(shared: &Arc<HostShared>, id: ParticipantId, message: Message) {
    let (nick, host_nick) = {
        let state = shared.state.read().await;
        let Some(nick) = state.registry.nick_of(id).map(str::to_owned) else {
            return;
        };
        (nick, state.host_nick.clone())
    };

    if message.target.is_empty() {
        save_file(shared, &message.text, &message.payload, &nick).await;
        let frame = Message::file_data(&nick, &message.text, message.payload.clone(), "");
        broadcast(shared, &frame, Some(id)).await;
        shared
            .observer
            .system_notice(&format!("{nick} shared file {}", message.text));
    } else if message.target == host_nick {
        save_file(shared, &message.text, &message.payload, &nick).await;
    } else {
        // Pass-through; the host never persists a payload that is not
        // addressed to it, and never checks its size.
        let frame = Message::file_data(
            &nick,
            &message.text,
            message.payload.clone(),
            &message.target,
        );
        unicast(shared, &message.target, &frame).await;
    }
}

/// Decodes and persists a payload under the download directory.
/// Failures are logged, never fatal: a bad payload is the sender's
/// problem, not the room's.
async fn save_file(shared: &Arc<HostShared>, filename: &str, payload: &str, from: &str) {
    let bytes = match decode_file_payload(payload) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("discarding file {filename:?} from {from}: {err}");
            return;
        }
    };
    let safe_name = sanitize_filename(filename);
    let path = shared.download_dir.join(&safe_name);
    match tokio::fs::write(&path, &bytes).await {
        Ok(()) => {
            info!("received {safe_name} from {from} ({} bytes)", bytes.len());
            shared.observer.file_received(&safe_name, from, bytes.len());
        }
        Err(err) => warn!("failed to save {safe_name}: {err}"),
    }
}

async fn sender_nick(shared: &Arc<HostShared>, id: ParticipantId) -> Option<String> {
    shared
        .state
        .read()
        .await
        .registry
        .nick_of(id)
        .map(str::to_owned)
}

/// Relay to every registered participant except the originating
/// connection. The recipient list is snapshotted under the lock and
/// the lock released before any frame is queued, so a stalled peer
/// cannot hold up registry operations.
pub(crate) async fn broadcast(
    shared: &HostShared,
    message: &Message,
    exclude: Option<ParticipantId>,
) {
    let recipients = {
        let state = shared.state.read().await;
        state.registry.senders_except(exclude)
    };
    let frame = match encode_frame(message) {
        Ok(frame) => frame,
        Err(err) => {
            warn!("failed to serialize broadcast: {err}");
            return;
        }
    };
    for tx in recipients {
        let _ = tx.send(frame.clone());
    }
}

/// Relay to the first participant registered under `nick`. An unknown
/// nickname is a silent no-op.
pub(crate) async fn unicast(shared: &HostShared, nick: &str, message: &Message) -> bool {
    let target = {
        let state = shared.state.read().await;
        state.registry.lookup_nick(nick)
    };
    match target {
        Some((_, tx)) => {
            send_frame(&tx, message);
            true
        }
        None => {
            debug!("no participant named {nick:?}; frame dropped");
            false
        }
    }
}

async fn reply(shared: &HostShared, id: ParticipantId, message: &Message) {
    let tx = {
        let state = shared.state.read().await;
        state.registry.sender_of(id)
    };
    if let Some(tx) = tx {
        send_frame(&tx, message);
    }
}

pub(crate) fn send_frame(tx: &OutboundSender, message: &Message) {
    match encode_frame(message) {
        // A closed receiver just means the peer is already gone.
        Ok(frame) => {
            let _ = tx.send(frame);
        }
        Err(err) => warn!("failed to serialize frame: {err}"),
    }
}
