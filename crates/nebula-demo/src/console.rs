//! Console commands and the stdin reader that feeds them.

use std::io::BufRead;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, unbounded};

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Host a session, on the configured port unless one is given.
    Host { port: Option<u16> },
    /// Join the host at `address`, or the configured address.
    Join { address: Option<String> },
    Disconnect,
    /// Set simulated latency; `max` defaults to `min`.
    SimLag { min: Duration, max: Duration },
    SimLoss { rate: f32 },
    SetTickRate { hz: f32 },
    SetSendRate { index: u8, hz: f32 },
    Status,
    Ping { address: String, text: String },
    Say { text: String },
    Spawn,
    /// Run a command on the remote console at `index`.
    Remote { index: usize, command: String },
    /// Run a command on every remote console.
    RemoteAll { command: String },
    Help,
    Quit,
}

/// Why a console line could not be parsed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid value '{value}' for {what}")]
    InvalidValue { what: &'static str, value: String },
}

/// One line per command, shown by `help`.
pub const HELP: &[&str] = &[
    "host [port]                 host a session",
    "join [addr]                 join a host",
    "disconnect                  leave or close the session",
    "net_sim_lag <min> [max]     simulated latency in ms",
    "net_sim_loss <fraction>     simulated packet loss",
    "net_set_tick_rate <hz>      session tick rate",
    "net_set_send_rate <i> <hz>  send rate of connection i",
    "net_status                  connection table",
    "ping <addr> [text]          connectionless ping",
    "say <text>                  chat with every peer",
    "spawn                       host only: spawn a replicated ship",
    "rc <i> <command>            run a command on remote console i",
    "rca <command>               run a command on every remote console",
    "quit",
];

fn parse_value<T: std::str::FromStr>(what: &'static str, value: &str) -> Result<T, CommandError> {
    value.parse().map_err(|_| CommandError::InvalidValue {
        what,
        value: value.to_string(),
    })
}

/// Split off the first whitespace-separated word.
fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (text, ""),
    }
}

/// Parse one console line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let (name, rest) = split_word(line);
    if name.is_empty() {
        return Ok(None);
    }
    let args: Vec<&str> = rest.split_whitespace().collect();

    let command = match name {
        "host" => Command::Host {
            port: args.first().map(|p| parse_value("port", p)).transpose()?,
        },
        "join" => Command::Join {
            address: args.first().map(|a| a.to_string()),
        },
        "disconnect" => Command::Disconnect,
        "net_sim_lag" => {
            let min: u64 = args
                .first()
                .ok_or(CommandError::Usage("net_sim_lag <min_ms> [max_ms]"))
                .and_then(|v| parse_value("latency", v))?;
            let max: u64 = args
                .get(1)
                .map(|v| parse_value("latency", v))
                .transpose()?
                .unwrap_or(min);
            Command::SimLag {
                min: Duration::from_millis(min),
                max: Duration::from_millis(max.max(min)),
            }
        }
        "net_sim_loss" => {
            let rate: f32 = args
                .first()
                .ok_or(CommandError::Usage("net_sim_loss <fraction>"))
                .and_then(|v| parse_value("loss rate", v))?;
            if !(0.0..=1.0).contains(&rate) {
                return Err(CommandError::InvalidValue {
                    what: "loss rate",
                    value: rate.to_string(),
                });
            }
            Command::SimLoss { rate }
        }
        "net_set_tick_rate" => Command::SetTickRate {
            hz: args
                .first()
                .ok_or(CommandError::Usage("net_set_tick_rate <hz>"))
                .and_then(|v| parse_value("tick rate", v))?,
        },
        "net_set_send_rate" => match args.as_slice() {
            [index, hz, ..] => Command::SetSendRate {
                index: parse_value("connection index", index)?,
                hz: parse_value("send rate", hz)?,
            },
            _ => return Err(CommandError::Usage("net_set_send_rate <index> <hz>")),
        },
        "net_status" => Command::Status,
        "ping" => {
            let (address, text) = split_word(rest);
            if address.is_empty() {
                return Err(CommandError::Usage("ping <addr> [text]"));
            }
            Command::Ping {
                address: address.to_string(),
                text: if text.is_empty() { "ping" } else { text }.to_string(),
            }
        }
        "say" => {
            if rest.is_empty() {
                return Err(CommandError::Usage("say <text>"));
            }
            Command::Say {
                text: rest.to_string(),
            }
        }
        "spawn" => Command::Spawn,
        "rc" => {
            let (index, command) = split_word(rest);
            if command.is_empty() {
                return Err(CommandError::Usage("rc <index> <command>"));
            }
            Command::Remote {
                index: parse_value("remote index", index)?,
                command: command.to_string(),
            }
        }
        "rca" => {
            if rest.is_empty() {
                return Err(CommandError::Usage("rca <command>"));
            }
            Command::RemoteAll {
                command: rest.to_string(),
            }
        }
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Read stdin lines on a background thread.
///
/// The channel disconnects when stdin reaches end of file.
pub fn spawn_stdin_reader() -> std::io::Result<Receiver<String>> {
    let (tx, rx) = unbounded();
    thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
            tracing::debug!("stdin closed");
        })?;
    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        parse_command(line).unwrap().unwrap()
    }

    #[test]
    fn test_blank_line_is_ignored() {
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn test_host_and_join() {
        assert_eq!(parse("host"), Command::Host { port: None });
        assert_eq!(parse("host 9999"), Command::Host { port: Some(9999) });
        assert_eq!(
            parse("join 10.0.0.2:10084"),
            Command::Join {
                address: Some("10.0.0.2:10084".into())
            }
        );
        assert!(matches!(
            parse_command("host banana"),
            Err(CommandError::InvalidValue { what: "port", .. })
        ));
    }

    #[test]
    fn test_sim_lag_max_defaults_to_min() {
        assert_eq!(
            parse("net_sim_lag 50"),
            Command::SimLag {
                min: Duration::from_millis(50),
                max: Duration::from_millis(50),
            }
        );
        assert_eq!(
            parse("net_sim_lag 100 20"),
            Command::SimLag {
                min: Duration::from_millis(100),
                max: Duration::from_millis(100),
            }
        );
        assert_eq!(
            parse_command("net_sim_lag"),
            Err(CommandError::Usage("net_sim_lag <min_ms> [max_ms]"))
        );
    }

    #[test]
    fn test_sim_loss_range_checked() {
        assert_eq!(parse("net_sim_loss 0.25"), Command::SimLoss { rate: 0.25 });
        assert!(parse_command("net_sim_loss 1.5").is_err());
    }

    #[test]
    fn test_send_rate_needs_index_and_rate() {
        assert_eq!(
            parse("net_set_send_rate 2 30"),
            Command::SetSendRate { index: 2, hz: 30.0 }
        );
        assert!(parse_command("net_set_send_rate 2").is_err());
    }

    #[test]
    fn test_free_text_commands_keep_spacing() {
        assert_eq!(
            parse("say  hello   there"),
            Command::Say {
                text: "hello   there".into()
            }
        );
        assert_eq!(
            parse("ping 127.0.0.1:10084 are you there"),
            Command::Ping {
                address: "127.0.0.1:10084".into(),
                text: "are you there".into(),
            }
        );
        assert_eq!(
            parse("rc 1 net_sim_loss 0.1"),
            Command::Remote {
                index: 1,
                command: "net_sim_loss 0.1".into(),
            }
        );
        assert_eq!(
            parse("rca net_status"),
            Command::RemoteAll {
                command: "net_status".into()
            }
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            parse_command("warp 9"),
            Err(CommandError::Unknown("warp".into()))
        );
    }
}
