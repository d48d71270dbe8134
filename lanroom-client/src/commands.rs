//! Slash-command parsing for the input line. The parser only decides
//! what the input means; acting on it is the caller's job.

const MAX_NICK_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    /// Plain chat text, send as-is.
    NotACommand,
    /// Print locally, nothing goes on the wire.
    Local(String),
    Quit,
    ChangeNick(String),
    ListUsers,
    Ping,
    OfferFile { path: String, target: String },
    Accept,
    Reject,
    /// Pre-formatted chat text (emotes and friends).
    Say(String),
    /// Media-signaling session requests, handed to the collaborator.
    Call(String),
    Share(String),
}

pub fn parse(input: &str, nick: &str) -> CommandAction {
    let input = input.trim();
    if !input.starts_with('/') {
        return CommandAction::NotACommand;
    }

    let (command, args) = match input.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (input, ""),
    };

    match command.to_ascii_lowercase().as_str() {
        "/help" | "/?" => CommandAction::Local(help_text().to_owned()),

        "/me" => {
            if args.is_empty() {
                CommandAction::Local("Usage: /me <action>".to_owned())
            } else {
                CommandAction::Say(format!("* {nick} {args}"))
            }
        }

        "/shrug" => CommandAction::Say(r"¯\_(ツ)_/¯".to_owned()),

        "/nick" => {
            if args.is_empty() {
                CommandAction::Local("Usage: /nick <newnickname>".to_owned())
            } else if args.len() > MAX_NICK_LEN {
                CommandAction::Local(format!("Nickname too long (max {MAX_NICK_LEN} chars)"))
            } else {
                CommandAction::ChangeNick(args.to_owned())
            }
        }

        "/users" | "/who" | "/list" => CommandAction::ListUsers,

        "/ping" => CommandAction::Ping,

        "/send" => {
            if args.is_empty() {
                return CommandAction::Local(
                    "Usage: /send <filepath> [nick]".to_owned(),
                );
            }
            let (path, target) = match args.split_once(' ') {
                Some((path, target)) => (path.to_owned(), target.trim().to_owned()),
                None => (args.to_owned(), String::new()),
            };
            CommandAction::OfferFile { path, target }
        }

        "/accept" | "/y" | "/yes" => CommandAction::Accept,
        "/reject" | "/n" | "/no" | "/decline" => CommandAction::Reject,

        "/call" => {
            if args.is_empty() {
                CommandAction::Local("Usage: /call <nick>".to_owned())
            } else {
                CommandAction::Call(args.to_owned())
            }
        }

        "/share" => {
            if args.is_empty() {
                CommandAction::Local("Usage: /share <nick>".to_owned())
            } else {
                CommandAction::Share(args.to_owned())
            }
        }

        "/quit" | "/exit" | "/q" => CommandAction::Quit,

        other => CommandAction::Local(format!("Unknown command: {other} (try /help)")),
    }
}

fn help_text() -> &'static str {
    "Commands:\n\
     \x20 /nick <name>         change your nickname\n\
     \x20 /users               list who is in the room\n\
     \x20 /send <file> [nick]  offer a file (to everyone, or one person)\n\
     \x20 /accept, /reject     answer a pending file offer\n\
     \x20 /call <nick>         start a call\n\
     \x20 /share <nick>        share your screen\n\
     \x20 /ping                measure round-trip time\n\
     \x20 /me <action>         action message\n\
     \x20 /quit                leave the room"
}
