use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use lanroom_host::{Host, HostConfig, HostObserver, NullObserver, PendingOffer};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "lanroom-host")]
struct HostArgs {
    #[arg(long, default_value = "0.0.0.0:7645")]
    bind_address: String,
    #[arg(long, default_value = "host")]
    nick: String,
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,
}

/// Prints room activity to the log; a GUI would implement the same
/// trait instead.
struct LogObserver;

impl HostObserver for LogObserver {
    fn chat_received(&self, from: &str, text: &str) {
        info!("<{from}> {text}");
    }

    fn system_notice(&self, text: &str) {
        info!("* {text}");
    }

    fn user_list_changed(&self, users: &[String]) {
        info!("online: {}", users.join(", "));
    }

    fn file_offer(&self, offer: &PendingOffer, size: &str) {
        info!(
            "{} offers {} ({size}) -- /accept or /reject",
            offer.sender_nick, offer.filename
        );
    }

    fn file_accepted(&self, by: &str, filename: &str) {
        info!("{by} accepted {filename}, sending");
    }

    fn file_rejected(&self, by: &str, filename: &str) {
        info!("{by} rejected {filename}");
    }

    fn file_received(&self, filename: &str, from: &str, bytes: usize) {
        info!("received {filename} from {from} ({bytes} bytes)");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = HostArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("failed to bind {}: {}", args.bind_address, err);
            std::process::exit(1);
        }
    };

    let mut config = HostConfig::new(&args.nick);
    config.download_dir = args.download_dir;
    let host = Host::with_collaborators(
        config,
        Arc::new(LogObserver),
        Arc::new(NullObserver),
        Arc::new(NullObserver),
    );

    let server = host.clone();
    let serve_task = tokio::spawn(async move {
        if let Err(err) = server.serve(listener).await {
            warn!("room server exited: {err}");
        }
    });

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = input.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ') {
            _ if line == "/quit" => break,
            _ if line == "/users" => info!("online: {}", host.user_list().await.join(", ")),
            _ if line == "/accept" => {
                if !host.accept_pending().await {
                    info!("no pending file to accept");
                }
            }
            _ if line == "/reject" => {
                if !host.reject_pending().await {
                    info!("no pending file to reject");
                }
            }
            Some(("/nick", new_nick)) => host.change_nick(new_nick.trim()).await,
            Some(("/send", rest)) => {
                let (path, target) = match rest.trim().split_once(' ') {
                    Some((path, target)) => (path, target.trim()),
                    None => (rest.trim(), ""),
                };
                if let Err(err) = host.offer_file(PathBuf::from(path).as_path(), target).await {
                    warn!("cannot offer {path}: {err}");
                }
            }
            _ => host.send_chat(line).await,
        }
    }

    host.shutdown();
    let _ = serve_task.await;
}
