//! Line input for the terminal front end.
//!
//! Plain text is a relayed chat line. A leading `/` introduces a command:
//!
//! | Input                 | Effect                                  |
//! |-----------------------|-----------------------------------------|
//! | `/ping`               | probe the relay round trip              |
//! | `/ping <peer>`        | probe the direct channel to `peer`      |
//! | `/dm <peer> <text>`   | send `text` over the direct channel     |
//! | `/connect <peer>`     | negotiate a direct channel              |
//! | `/disconnect <peer>`  | close the direct channel                |
//! | `/who`                | ask every client to announce itself     |
//! | `/p2p on\|off`        | toggle automatic negotiation            |
//! | `/peers`              | list peers and link states              |
//! | `/help`               | list commands                           |
//! | `/quit`               | exit                                    |

use crate::client::ClientCommand;
use crate::peers::PeerId;

/// Usage text printed by `/help` and after a bad command.
pub const HELP: &str = "\
commands:
  /ping [peer]         measure latency via the relay or a direct channel
  /dm <peer> <text>    send over a direct channel
  /connect <peer>      open a direct channel
  /disconnect <peer>   close a direct channel
  /who                 ask peers to announce themselves
  /p2p on|off          toggle automatic direct channels
  /peers               list peers and links
  /quit                exit";

/// A parsed input line.
#[derive(Debug)]
pub enum Input {
    /// Forward to the client task.
    Command(ClientCommand),
    /// Print peers and links.
    Peers,
    /// Print [`HELP`].
    Help,
    /// Exit.
    Quit,
    /// Blank line.
    Empty,
}

/// Why a line could not be parsed.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum InputError {
    /// The command name is not recognized.
    #[error("unknown command /{0}")]
    Unknown(String),
    /// A required argument is missing.
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parses one line of user input.
///
/// # Errors
///
/// Returns [`InputError`] for an unknown command or missing arguments.
pub fn parse(line: &str) -> Result<Input, InputError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Empty);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Command(ClientCommand::Chat(line.to_string())));
    };

    let (name, rest) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(name, rest)| (name, rest.trim()));

    let input = match name {
        "ping" => match first_word(rest) {
            Some(peer) => ClientCommand::PeerProbe(PeerId::from(peer)),
            None => ClientCommand::RelayProbe,
        },
        "dm" => {
            let (peer, text) = rest
                .split_once(char::is_whitespace)
                .map(|(peer, text)| (peer, text.trim()))
                .filter(|(_, text)| !text.is_empty())
                .ok_or(InputError::Usage("/dm <peer> <text>"))?;
            ClientCommand::DirectChat {
                peer: PeerId::from(peer),
                text: text.to_string(),
            }
        }
        "connect" => ClientCommand::Connect(PeerId::from(
            first_word(rest).ok_or(InputError::Usage("/connect <peer>"))?,
        )),
        "disconnect" => ClientCommand::Disconnect(PeerId::from(
            first_word(rest).ok_or(InputError::Usage("/disconnect <peer>"))?,
        )),
        "who" => ClientCommand::RequestPresence,
        "p2p" => match first_word(rest) {
            Some("on") => ClientCommand::SetP2p(true),
            Some("off") => ClientCommand::SetP2p(false),
            _ => return Err(InputError::Usage("/p2p on|off")),
        },
        "peers" => return Ok(Input::Peers),
        "help" => return Ok(Input::Help),
        "quit" | "exit" => return Ok(Input::Quit),
        other => return Err(InputError::Unknown(other.to_string())),
    };
    Ok(Input::Command(input))
}

fn first_word(rest: &str) -> Option<&str> {
    rest.split_whitespace().next()
}
