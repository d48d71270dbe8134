pub mod commands;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lanroom_core::{
    MAX_FILE_BYTES, Message, MessageKind, USER_LIST_SEPARATOR, WireError, decode_file_payload,
    decode_frame, encode_file_payload, encode_frame, format_size, sanitize_filename,
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Events the receive loop surfaces to the presentation layer. All
/// methods default to no-ops.
pub trait ClientObserver: Send + Sync {
    fn chat_received(&self, _from: &str, _text: &str) {}
    fn system_notice(&self, _text: &str) {}
    fn user_list(&self, _users: &[String]) {}
    fn pong(&self, _latency: Duration) {}
    fn file_offer(&self, _offer: &IncomingOffer) {}
    fn file_accepted(&self, _by: &str) {}
    fn file_rejected(&self, _by: &str) {}
    fn file_received(&self, _filename: &str, _from: &str, _bytes: usize) {}
    /// Opaque media-signaling payload addressed to this participant.
    fn signal(&self, _from: &str, _payload: &str) {}
    /// The session is over; rejoin from scratch if desired.
    fn connection_lost(&self) {}
}

/// A file offer waiting for this participant's accept/reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingOffer {
    pub from: String,
    pub filename: String,
    pub size: String,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("file exceeds the {} byte offer ceiling ({size} bytes)", MAX_FILE_BYTES)]
    FileTooLarge { size: u64 },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Wire(#[from] WireError),
}

struct ClientState {
    nick: String,
    /// Inbound offer awaiting our decision.
    pending: Option<IncomingOffer>,
    /// Path behind our outstanding outbound offer; sent automatically
    /// when the accept comes back.
    outgoing: Option<PathBuf>,
    ping_started: Option<Instant>,
}

struct ClientShared {
    tx: mpsc::UnboundedSender<String>,
    state: Mutex<ClientState>,
    observer: Arc<dyn ClientObserver>,
    download_dir: PathBuf,
    closed: watch::Sender<bool>,
}

/// One participant session over a single TCP connection. Cheap to
/// clone. A dropped connection ends the session permanently; connect
/// again for a brand-new join.
#[derive(Clone)]
pub struct ChatClient {
    shared: Arc<ClientShared>,
}

impl ChatClient {
    /// Dials the host, performs the Join handshake and starts the
    /// receive loop.
    pub async fn connect(
        addr: &str,
        nick: &str,
        download_dir: PathBuf,
        observer: Arc<dyn ClientObserver>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let (closed, closed_rx) = watch::channel(false);
        tokio::spawn(write_loop(write_half, rx, closed_rx));

        let client = ChatClient {
            shared: Arc::new(ClientShared {
                tx,
                state: Mutex::new(ClientState {
                    nick: nick.to_owned(),
                    pending: None,
                    outgoing: None,
                    ping_started: None,
                }),
                observer,
                download_dir,
                closed,
            }),
        };
        client.send(&Message::join(nick))?;
        tokio::spawn(receive_loop(Arc::clone(&client.shared), read_half));
        info!("joined room at {addr} as {nick}");
        Ok(client)
    }

    pub fn nick(&self) -> String {
        self.shared.state.lock().unwrap().nick.clone()
    }

    pub fn send_chat(&self, text: &str) -> Result<(), ClientError> {
        self.send(&Message::chat(&self.nick(), text))
    }

    pub fn change_nick(&self, new_nick: &str) -> Result<(), ClientError> {
        let old = {
            let mut state = self.shared.state.lock().unwrap();
            std::mem::replace(&mut state.nick, new_nick.to_owned())
        };
        self.send(&Message::nick_change(&old, new_nick))
    }

    pub fn request_user_list(&self) -> Result<(), ClientError> {
        self.send(&Message::new(MessageKind::UserListRequest))
    }

    /// Sends a ping; the round-trip time arrives via the pong event.
    pub fn ping(&self) -> Result<(), ClientError> {
        self.shared.state.lock().unwrap().ping_started = Some(Instant::now());
        self.send(&Message::new(MessageKind::Ping))
    }

    /// Offers a file to `target` (empty = everyone). Only the offer
    /// goes out now; the payload follows once an accept comes back.
    pub async fn offer_file(&self, path: &Path, target: &str) -> Result<(), ClientError> {
        let meta = tokio::fs::metadata(path).await?;
        if meta.len() > MAX_FILE_BYTES {
            return Err(ClientError::FileTooLarge { size: meta.len() });
        }
        let filename = sanitize_filename(&path.to_string_lossy());
        let size = format_size(meta.len());
        let nick = {
            let mut state = self.shared.state.lock().unwrap();
            state.outgoing = Some(path.to_owned());
            state.nick.clone()
        };
        self.send(&Message::file_offer(&nick, &filename, &size, target))
    }

    /// Accepts the pending inbound offer, if any; the host relays the
    /// decision back to the offerer, who then sends the payload.
    pub fn accept_pending(&self) -> Result<Option<IncomingOffer>, ClientError> {
        self.decide_pending(MessageKind::FileAccept)
    }

    pub fn reject_pending(&self) -> Result<Option<IncomingOffer>, ClientError> {
        self.decide_pending(MessageKind::FileReject)
    }

    fn decide_pending(&self, kind: MessageKind) -> Result<Option<IncomingOffer>, ClientError> {
        let (offer, nick) = {
            let mut state = self.shared.state.lock().unwrap();
            let Some(offer) = state.pending.take() else {
                return Ok(None);
            };
            (offer, state.nick.clone())
        };
        // `text` names the original sender so the host can correlate
        // the decision with the pending offer.
        self.send(&Message {
            kind,
            nick,
            text: offer.from.clone(),
            ..Default::default()
        })?;
        Ok(Some(offer))
    }

    pub fn pending_offer(&self) -> Option<IncomingOffer> {
        self.shared.state.lock().unwrap().pending.clone()
    }

    /// Sends a file payload immediately, without the offer handshake.
    pub async fn send_file(&self, path: &Path, target: &str) -> Result<(), ClientError> {
        send_file_to(&self.shared, path, target).await
    }

    /// Wraps an opaque signaling payload into an outbound frame.
    pub fn send_signal(&self, target: &str, payload: &str) -> Result<(), ClientError> {
        self.send(&Message::signal(&self.nick(), payload, target))
    }

    /// Hangs up. The pending read unblocks once the host closes the
    /// other side; the observer then sees `connection_lost`.
    pub fn close(&self) {
        let _ = self.shared.closed.send(true);
    }

    fn send(&self, message: &Message) -> Result<(), ClientError> {
        send_message(&self.shared, message)
    }
}

fn send_message(shared: &ClientShared, message: &Message) -> Result<(), ClientError> {
    let frame = encode_frame(message)?;
    shared
        .tx
        .send(frame)
        .map_err(|_| ClientError::ConnectionClosed)
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<String>,
    mut closed: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if writer.write_all(frame.as_bytes()).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = closed.changed() => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn receive_loop(shared: Arc<ClientShared>, read_half: OwnedReadHalf) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_frame(&line) {
                Ok(message) => handle_inbound(&shared, message).await,
                Err(err) => {
                    // Corrupt stream, same policy as the host: bail.
                    warn!("undecodable frame from host: {err}");
                    break;
                }
            },
            Ok(None) => break,
            Err(err) => {
                debug!("read error: {err}");
                break;
            }
        }
    }
    shared.observer.connection_lost();
}

async fn handle_inbound(shared: &Arc<ClientShared>, message: Message) {
    match message.kind {
        MessageKind::Chat => shared.observer.chat_received(&message.nick, &message.text),
        MessageKind::System => shared.observer.system_notice(&message.text),

        MessageKind::Pong => {
            let started = shared.with_state(|state| state.ping_started.take());
            if let Some(started) = started {
                shared.observer.pong(started.elapsed());
            }
        }

        MessageKind::UserListReply => {
            let users: Vec<String> = message
                .text
                .split(USER_LIST_SEPARATOR)
                .map(str::to_owned)
                .collect();
            shared.observer.user_list(&users);
        }

        MessageKind::FileOffer => {
            let offer = IncomingOffer {
                from: message.nick,
                filename: message.text,
                size: message.payload,
            };
            shared.with_state(|state| state.pending = Some(offer.clone()));
            shared.observer.file_offer(&offer);
        }

        // Our outstanding offer was accepted: `nick` is the acceptor,
        // send them the payload.
        MessageKind::FileAccept => {
            let outgoing = shared.with_state(|state| state.outgoing.take());
            if let Some(path) = outgoing {
                if let Err(err) = send_file_to(shared, &path, &message.nick).await {
                    warn!("failed to send accepted file: {err}");
                }
                shared.observer.file_accepted(&message.nick);
            }
        }

        MessageKind::FileReject => {
            shared.with_state(|state| state.outgoing = None);
            shared.observer.file_rejected(&message.nick);
        }

        MessageKind::FileData => save_file(shared, message).await,

        MessageKind::SignalRelay => shared.observer.signal(&message.nick, &message.payload),

        // Host-bound kinds; nothing sensible to do with them here.
        MessageKind::Join
        | MessageKind::NickChange
        | MessageKind::Ping
        | MessageKind::UserListRequest => {
            debug!("ignoring {:?} from host", message.kind)
        }
    }
}

async fn send_file_to(shared: &ClientShared, path: &Path, target: &str) -> Result<(), ClientError> {
    let bytes = tokio::fs::read(path).await?;
    if bytes.len() as u64 > MAX_FILE_BYTES {
        return Err(ClientError::FileTooLarge {
            size: bytes.len() as u64,
        });
    }
    let filename = sanitize_filename(&path.to_string_lossy());
    let nick = shared.with_state(|state| state.nick.clone());
    send_message(
        shared,
        &Message::file_data(&nick, &filename, encode_file_payload(&bytes), target),
    )
}

async fn save_file(shared: &Arc<ClientShared>, message: Message) {
    let bytes = match decode_file_payload(&message.payload) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!("discarding file {:?} from {}: {err}", message.text, message.nick);
            return;
        }
    };
    let safe_name = sanitize_filename(&message.text);
    let path = shared.download_dir.join(&safe_name);
    match tokio::fs::write(&path, &bytes).await {
        Ok(()) => {
            shared
                .observer
                .file_received(&safe_name, &message.nick, bytes.len());
        }
        Err(err) => warn!("failed to save {safe_name}: {err}"),
    }
}

impl ClientShared {
    /// Short, never held across an await.
    fn with_state<T>(&self, f: impl FnOnce(&mut ClientState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }
}
