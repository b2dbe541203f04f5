mod ipmask;

pub use ipmask::{IpMask, MaskParseError};

use std::fmt;

pub const DEFAULT_PORT: u16 = 42068;

/// Datagram sent to registered game hosts; any reply counts as a pong.
pub const PING_PROBE: [u8; 3] = [0xFF, 0xFF, 0x01];

/// Splits a protocol line into whitespace-separated tokens.
///
/// A trailing carriage return and surrounding whitespace are ignored.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.trim_end_matches(['\r', '\n']).split_whitespace().collect()
}

/// Commands a client may send to the master, one per line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    /// The port is kept wide so out-of-range values can be reported back.
    RegServ {
        port: i64,
    },
    ReqAuth {
        id: u32,
        name: String,
    },
    ConfAuth {
        id: u32,
        value: String,
    },
}

impl Command {
    /// Parses one line. Unknown verbs, wrong arity and malformed numbers
    /// yield `None` so callers can skip the line.
    pub fn parse(line: &str) -> Option<Command> {
        match tokenize(line).as_slice() {
            ["list"] => Some(Command::List),
            ["regserv", port] => parse_port(port).map(|port| Command::RegServ { port }),
            ["reqauth", id, name] => id.parse().ok().map(|id| Command::ReqAuth {
                id,
                name: name.to_string(),
            }),
            ["confauth", id, value] => id.parse().ok().map(|id| Command::ConfAuth {
                id,
                value: value.to_string(),
            }),
            _ => None,
        }
    }
}

/// Parses a signed decimal port. Numbers too large for `i64` saturate, so
/// they still read as out of range rather than as garbage.
fn parse_port(text: &str) -> Option<i64> {
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match text.parse() {
        Ok(port) => Some(port),
        Err(_) if text.starts_with('-') => Some(i64::MIN),
        Err(_) => Some(i64::MAX),
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::List => write!(f, "list"),
            Command::RegServ { port } => write!(f, "regserv {}", port),
            Command::ReqAuth { id, name } => write!(f, "reqauth {} {}", id, name),
            Command::ConfAuth { id, value } => write!(f, "confauth {} {}", id, value),
        }
    }
}

/// Lines the master sends back to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    AddServer { ip: String, port: u16 },
    SuccReg,
    FailReg(String),
    ChalAuth { id: u32, challenge: String },
    SuccAuth(u32),
    FailAuth(u32),
    ClearGbans,
    AddGban(IpMask),
}

impl Reply {
    pub fn parse(line: &str) -> Option<Reply> {
        let line = line.trim_end_matches(['\r', '\n']).trim();
        let (verb, rest) = match line.split_once(' ') {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let args: Vec<&str> = rest.split_whitespace().collect();

        match (verb, args.as_slice()) {
            ("addserver", [ip, port]) => port.parse().ok().map(|port| Reply::AddServer {
                ip: ip.to_string(),
                port,
            }),
            ("succreg", []) => Some(Reply::SuccReg),
            ("failreg", _) => Some(Reply::FailReg(rest.to_string())),
            ("chalauth", [id, challenge]) => id.parse().ok().map(|id| Reply::ChalAuth {
                id,
                challenge: challenge.to_string(),
            }),
            ("succauth", [id]) => id.parse().ok().map(Reply::SuccAuth),
            ("failauth", [id]) => id.parse().ok().map(Reply::FailAuth),
            ("cleargbans", []) => Some(Reply::ClearGbans),
            ("addgban", [mask]) => mask.parse().ok().map(Reply::AddGban),
            _ => None,
        }
    }

    /// The reply as a newline-terminated protocol line.
    pub fn line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::AddServer { ip, port } => write!(f, "addserver {} {}", ip, port),
            Reply::SuccReg => write!(f, "succreg"),
            Reply::FailReg(reason) => write!(f, "failreg {}", reason),
            Reply::ChalAuth { id, challenge } => write!(f, "chalauth {} {}", id, challenge),
            Reply::SuccAuth(id) => write!(f, "succauth {}", id),
            Reply::FailAuth(id) => write!(f, "failauth {}", id),
            Reply::ClearGbans => write!(f, "cleargbans"),
            Reply::AddGban(mask) => write!(f, "addgban {}", mask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_tolerates_whitespace_and_cr() {
        assert_eq!(tokenize("  regserv   28800 \r"), vec!["regserv", "28800"]);
        assert_eq!(tokenize("list\r\n"), vec!["list"]);
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_parse_list() {
        assert_eq!(Command::parse("list"), Some(Command::List));
        assert_eq!(Command::parse(" list\r"), Some(Command::List));
        assert_eq!(Command::parse("list servers"), None);
        assert_eq!(Command::parse("listing"), None);
    }

    #[test]
    fn test_parse_regserv() {
        assert_eq!(Command::parse("regserv 28800"), Some(Command::RegServ { port: 28800 }));
        assert_eq!(Command::parse("regserv -1"), Some(Command::RegServ { port: -1 }));
        assert_eq!(Command::parse("regserv 70000"), Some(Command::RegServ { port: 70000 }));
        assert_eq!(
            Command::parse("regserv 99999999999999999999"),
            Some(Command::RegServ { port: i64::MAX })
        );
        assert_eq!(Command::parse("regserv +80"), None);
        assert_eq!(Command::parse("regserv"), None);
        assert_eq!(Command::parse("regserv port"), None);
    }

    #[test]
    fn test_parse_auth_commands() {
        assert_eq!(
            Command::parse("reqauth 7 alice"),
            Some(Command::ReqAuth { id: 7, name: "alice".to_string() })
        );
        assert_eq!(
            Command::parse("confauth 7 deadbeef"),
            Some(Command::ConfAuth { id: 7, value: "deadbeef".to_string() })
        );
        assert_eq!(Command::parse("reqauth x alice"), None);
        assert_eq!(Command::parse("confauth 7"), None);
    }

    #[test]
    fn test_unknown_verbs_are_ignored() {
        assert_eq!(Command::parse("hello world"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_command_display_parses_back() {
        let commands = vec![
            Command::List,
            Command::RegServ { port: 28785 },
            Command::ReqAuth { id: 1, name: "bob".to_string() },
            Command::ConfAuth { id: 1, value: "abc".to_string() },
        ];
        for command in commands {
            assert_eq!(Command::parse(&command.to_string()), Some(command));
        }
    }

    #[test]
    fn test_reply_lines() {
        assert_eq!(
            Reply::AddServer { ip: "1.2.3.4".to_string(), port: 28785 }.line(),
            "addserver 1.2.3.4 28785\n"
        );
        assert_eq!(
            Reply::FailReg("too many servers on ip".to_string()).line(),
            "failreg too many servers on ip\n"
        );
        assert_eq!(Reply::ClearGbans.line(), "cleargbans\n");
        let mask: IpMask = "10.0.0.0/24".parse().unwrap();
        assert_eq!(Reply::AddGban(mask).line(), "addgban 10.0.0.0/24\n");
    }

    #[test]
    fn test_reply_parse() {
        assert_eq!(Reply::parse("succreg\n"), Some(Reply::SuccReg));
        assert_eq!(
            Reply::parse("failreg failed pinging server"),
            Some(Reply::FailReg("failed pinging server".to_string()))
        );
        assert_eq!(
            Reply::parse("addserver 10.1.1.1 28785"),
            Some(Reply::AddServer { ip: "10.1.1.1".to_string(), port: 28785 })
        );
        assert_eq!(Reply::parse("failauth 3"), Some(Reply::FailAuth(3)));
        assert_eq!(Reply::parse("addgban 10.0"), Some(Reply::AddGban("10.0".parse().unwrap())));
        assert_eq!(Reply::parse("garbage"), None);
    }

    #[test]
    fn test_ping_probe_bytes() {
        assert_eq!(PING_PROBE, [0xFF, 0xFF, 0x01]);
        assert_eq!(DEFAULT_PORT, 42068);
    }
}
