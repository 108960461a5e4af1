//! Operator console commands, one per line on stdin.

use std::path::PathBuf;

use toxpup_core::{PeerIdentity, ToxAddress};

pub const HELP: &str = "\
acceptfriend <puppet> <key>
addfriend <puppet> <address> [message...]
removefriend <puppet> <key>
msg <puppet> <key> <text...>
me <puppet> <key> <text...>
file <puppet> <key> <path>
name <puppet> <name...>
avatar <puppet> <url>
friends <puppet>
whoami <puppet>
connect <puppet>
disconnect <puppet>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    AcceptFriend { puppet: String, key: PeerIdentity },
    AddFriend { puppet: String, address: ToxAddress, message: String },
    RemoveFriend { puppet: String, key: PeerIdentity },
    Message { puppet: String, key: PeerIdentity, text: String, is_action: bool },
    File { puppet: String, key: PeerIdentity, path: PathBuf },
    Name { puppet: String, name: String },
    Avatar { puppet: String, url: String },
    Friends { puppet: String },
    WhoAmI { puppet: String },
    Connect { puppet: String },
    Disconnect { puppet: String },
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid key or address: {0}")]
    BadKey(String),
}

/// First whitespace-separated word and the trimmed remainder.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(i) => (&s[..i], s[i..].trim()),
        None => (s, ""),
    }
}

fn key(s: &str) -> Result<PeerIdentity, ParseError> {
    s.to_lowercase()
        .parse()
        .map_err(|e: toxpup_core::IdentityError| ParseError::BadKey(e.to_string()))
}

fn address(s: &str) -> Result<ToxAddress, ParseError> {
    s.to_lowercase()
        .parse()
        .map_err(|e: toxpup_core::IdentityError| ParseError::BadKey(e.to_string()))
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<Result<Command, ParseError>> {
    let (verb, rest) = split_word(line);
    if verb.is_empty() {
        return None;
    }
    Some(parse_verb(verb, rest))
}

fn parse_verb(verb: &str, rest: &str) -> Result<Command, ParseError> {
    let (puppet, args) = split_word(rest);
    let puppet = puppet.to_string();
    let need = |usage: &'static str, ok: bool| {
        if ok && !puppet.is_empty() {
            Ok(())
        } else {
            Err(ParseError::Usage(usage))
        }
    };

    match verb.to_ascii_lowercase().as_str() {
        "help" => Ok(Command::Help),
        "acceptfriend" => {
            let (k, extra) = split_word(args);
            need("acceptfriend <puppet> <key>", !k.is_empty() && extra.is_empty())?;
            Ok(Command::AcceptFriend { key: key(k)?, puppet })
        }
        "removefriend" => {
            let (k, extra) = split_word(args);
            need("removefriend <puppet> <key>", !k.is_empty() && extra.is_empty())?;
            Ok(Command::RemoveFriend { key: key(k)?, puppet })
        }
        "addfriend" => {
            let (a, message) = split_word(args);
            need("addfriend <puppet> <address> [message...]", !a.is_empty())?;
            Ok(Command::AddFriend {
                address: address(a)?,
                message: message.to_string(),
                puppet,
            })
        }
        "msg" => {
            let (k, text) = split_word(args);
            need("msg <puppet> <key> <text...>", !k.is_empty() && !text.is_empty())?;
            Ok(Command::Message {
                key: key(k)?,
                text: text.to_string(),
                is_action: false,
                puppet,
            })
        }
        "me" => {
            let (k, text) = split_word(args);
            need("me <puppet> <key> <text...>", !k.is_empty() && !text.is_empty())?;
            Ok(Command::Message {
                key: key(k)?,
                text: text.to_string(),
                is_action: true,
                puppet,
            })
        }
        "file" => {
            let (k, path) = split_word(args);
            need("file <puppet> <key> <path>", !k.is_empty() && !path.is_empty())?;
            Ok(Command::File {
                key: key(k)?,
                path: PathBuf::from(path),
                puppet,
            })
        }
        "name" => {
            need("name <puppet> <name...>", !args.is_empty())?;
            Ok(Command::Name {
                name: args.to_string(),
                puppet,
            })
        }
        "avatar" => {
            let (url, extra) = split_word(args);
            need("avatar <puppet> <url>", !url.is_empty() && extra.is_empty())?;
            Ok(Command::Avatar {
                url: url.to_string(),
                puppet,
            })
        }
        "friends" => {
            need("friends <puppet>", args.is_empty())?;
            Ok(Command::Friends { puppet })
        }
        "whoami" => {
            need("whoami <puppet>", args.is_empty())?;
            Ok(Command::WhoAmI { puppet })
        }
        "connect" => {
            need("connect <puppet>", args.is_empty())?;
            Ok(Command::Connect { puppet })
        }
        "disconnect" => {
            need("disconnect <puppet>", args.is_empty())?;
            Ok(Command::Disconnect { puppet })
        }
        _ => Err(ParseError::Unknown(verb.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_hex(b: u8) -> String {
        hex::encode([b; 32])
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(parse(""), None);
        assert_eq!(parse("   \t"), None);
    }

    #[test]
    fn accept_lowercases_key() {
        let line = format!("acceptfriend alice {}", key_hex(0xab).to_uppercase());
        assert_eq!(
            parse(&line),
            Some(Ok(Command::AcceptFriend {
                puppet: "alice".into(),
                key: PeerIdentity::from_bytes([0xab; 32]),
            }))
        );
    }

    #[test]
    fn message_keeps_inner_spacing() {
        let line = format!("msg alice {}   hello   there ", key_hex(1));
        let Some(Ok(Command::Message { text, is_action, .. })) = parse(&line) else {
            panic!("not a message");
        };
        assert_eq!(text, "hello   there");
        assert!(!is_action);

        let line = format!("me alice {} waves", key_hex(1));
        assert!(matches!(
            parse(&line),
            Some(Ok(Command::Message { is_action: true, .. }))
        ));
    }

    #[test]
    fn addfriend_verifies_checksum() {
        let address = ToxAddress::new(PeerIdentity::from_bytes([7; 32]), 0x0102_0304);
        let line = format!("addfriend bob {} hey, it's me", address.to_hex().to_uppercase());
        assert_eq!(
            parse(&line),
            Some(Ok(Command::AddFriend {
                puppet: "bob".into(),
                address,
                message: "hey, it's me".into(),
            }))
        );

        let mut bad = address.to_hex();
        bad.replace_range(72.., "0000");
        assert!(matches!(
            parse(&format!("addfriend bob {bad}")),
            Some(Err(ParseError::BadKey(_)))
        ));
    }

    #[test]
    fn single_argument_commands() {
        assert_eq!(
            parse("whoami alice"),
            Some(Ok(Command::WhoAmI {
                puppet: "alice".into()
            }))
        );
        assert_eq!(
            parse("DISCONNECT alice"),
            Some(Ok(Command::Disconnect {
                puppet: "alice".into()
            }))
        );
        assert_eq!(
            parse("friends"),
            Some(Err(ParseError::Usage("friends <puppet>")))
        );
        assert_eq!(
            parse("connect alice now"),
            Some(Err(ParseError::Usage("connect <puppet>")))
        );
    }

    #[test]
    fn name_and_avatar() {
        assert_eq!(
            parse("name alice Alice Liddell"),
            Some(Ok(Command::Name {
                puppet: "alice".into(),
                name: "Alice Liddell".into()
            }))
        );
        assert_eq!(
            parse("avatar alice https://example.org/a.png"),
            Some(Ok(Command::Avatar {
                puppet: "alice".into(),
                url: "https://example.org/a.png".into()
            }))
        );
    }

    #[test]
    fn errors() {
        assert_eq!(parse("frobnicate x"), Some(Err(ParseError::Unknown("frobnicate".into()))));
        assert_eq!(
            parse("removefriend alice"),
            Some(Err(ParseError::Usage("removefriend <puppet> <key>")))
        );
        assert!(matches!(
            parse("removefriend alice abc"),
            Some(Err(ParseError::BadKey(_)))
        ));
        assert!(matches!(
            parse(&format!("file alice {}", key_hex(2))),
            Some(Err(ParseError::Usage(_)))
        ));
    }
}
