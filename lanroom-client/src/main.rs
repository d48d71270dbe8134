use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use lanroom_client::commands::{CommandAction, parse};
use lanroom_client::{ChatClient, ClientObserver, IncomingOffer};
use lanroom_core::DEFAULT_PORT;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

#[derive(Parser, Debug)]
#[command(name = "lanroom")]
struct ClientArgs {
    /// Room host to dial.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[arg(long, default_value = "guest")]
    nick: String,
    #[arg(long, default_value = ".")]
    download_dir: PathBuf,
}

struct ConsoleObserver;

impl ClientObserver for ConsoleObserver {
    fn chat_received(&self, from: &str, text: &str) {
        println!("<{from}> {text}");
    }

    fn system_notice(&self, text: &str) {
        println!("* {text}");
    }

    fn user_list(&self, users: &[String]) {
        println!("Online: {}", users.join(", "));
    }

    fn pong(&self, latency: Duration) {
        println!("Pong! {}ms", latency.as_millis());
    }

    fn file_offer(&self, offer: &IncomingOffer) {
        println!(
            "{} offers {} ({}) -- /accept or /reject",
            offer.from, offer.filename, offer.size
        );
    }

    fn file_accepted(&self, by: &str) {
        println!("* {by} accepted your file, sending");
    }

    fn file_rejected(&self, by: &str) {
        println!("* {by} rejected your file");
    }

    fn file_received(&self, filename: &str, from: &str, bytes: usize) {
        println!("* received {filename} from {from} ({bytes} bytes)");
    }

    fn connection_lost(&self) {
        println!("* connection lost");
        std::process::exit(0);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = ClientArgs::parse();
    let addr = format!("{}:{}", args.host, args.port);
    let client = match ChatClient::connect(
        &addr,
        &args.nick,
        args.download_dir,
        Arc::new(ConsoleObserver),
    )
    .await
    {
        Ok(client) => client,
        Err(err) => {
            error!("failed to join {addr}: {err}");
            std::process::exit(1);
        }
    };
    println!("* joined {addr} as {} (type /help for commands)", args.nick);

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = input.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let result = match parse(&line, &client.nick()) {
            CommandAction::NotACommand => client.send_chat(line.trim()),
            CommandAction::Say(text) => client.send_chat(&text),
            CommandAction::Local(text) => {
                println!("{text}");
                Ok(())
            }
            CommandAction::ChangeNick(new_nick) => client.change_nick(&new_nick),
            CommandAction::ListUsers => client.request_user_list(),
            CommandAction::Ping => client.ping(),
            CommandAction::OfferFile { path, target } => {
                match client.offer_file(PathBuf::from(&path).as_path(), &target).await {
                    Ok(()) => {
                        println!("Offering file: {path}");
                        Ok(())
                    }
                    Err(err) => {
                        println!("Cannot offer {path}: {err}");
                        Ok(())
                    }
                }
            }
            CommandAction::Accept => match client.accept_pending() {
                Ok(Some(offer)) => {
                    println!("Accepted file from {}", offer.from);
                    Ok(())
                }
                Ok(None) => {
                    println!("No pending file to accept");
                    Ok(())
                }
                Err(err) => Err(err),
            },
            CommandAction::Reject => match client.reject_pending() {
                Ok(Some(offer)) => {
                    println!("Rejected file from {}", offer.from);
                    Ok(())
                }
                Ok(None) => {
                    println!("No pending file to reject");
                    Ok(())
                }
                Err(err) => Err(err),
            },
            // No media engine is wired into the CLI; the library still
            // relays signaling for collaborators that have one.
            CommandAction::Call(_) | CommandAction::Share(_) => {
                println!("Calls and screen sharing need a media-capable frontend");
                Ok(())
            }
            CommandAction::Quit => {
                println!("Leaving...");
                break;
            }
        };
        if let Err(err) = result {
            println!("* {err}");
            break;
        }
    }

    client.close();
    // Give the goodbye a moment to flush before the process exits.
    tokio::time::sleep(Duration::from_millis(50)).await;
}
