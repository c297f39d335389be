//! Control socket protocol (§4.5, privileged UNIX-domain socket).
//!
//! Three one-line commands: `-path` removes a device, `+path` adds one,
//! `!path=hex` sends raw bytes to an already-open device. Every command
//! gets exactly one reply line, `OK\n` or `ERROR\n`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Remove { path: String },
    Add { path: String },
    Send { path: String, bytes: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlParseError;

pub fn parse_control_line(line: &str) -> Result<ControlCommand, ControlParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(ControlParseError);
    }
    let (tag, rest) = line.split_at(1);
    match tag {
        "-" => {
            if rest.is_empty() {
                Err(ControlParseError)
            } else {
                Ok(ControlCommand::Remove { path: rest.to_string() })
            }
        }
        "+" => {
            if rest.is_empty() {
                Err(ControlParseError)
            } else {
                Ok(ControlCommand::Add { path: rest.to_string() })
            }
        }
        "!" => {
            let mut parts = rest.splitn(2, '=');
            let path = parts.next().filter(|p| !p.is_empty()).ok_or(ControlParseError)?;
            let hex = parts.next().ok_or(ControlParseError)?;
            let bytes = decode_hex(hex).ok_or(ControlParseError)?;
            Ok(ControlCommand::Send {
                path: path.to_string(),
                bytes,
            })
        }
        _ => Err(ControlParseError),
    }
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

pub const REPLY_OK: &str = "OK\n";
pub const REPLY_ERROR: &str = "ERROR\n";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remove_command() {
        assert_eq!(
            parse_control_line("-/dev/ttyUSB0\n"),
            Ok(ControlCommand::Remove { path: "/dev/ttyUSB0".into() })
        );
    }

    #[test]
    fn parses_add_command() {
        assert_eq!(
            parse_control_line("+/dev/ttyUSB1"),
            Ok(ControlCommand::Add { path: "/dev/ttyUSB1".into() })
        );
    }

    #[test]
    fn parses_send_command_with_hex_payload() {
        assert_eq!(
            parse_control_line("!/dev/ttyUSB0=deadbeef"),
            Ok(ControlCommand::Send {
                path: "/dev/ttyUSB0".into(),
                bytes: vec![0xde, 0xad, 0xbe, 0xef],
            })
        );
    }

    #[test]
    fn rejects_malformed_hex_payload() {
        assert!(parse_control_line("!/dev/ttyUSB0=zz").is_err());
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(parse_control_line("?/dev/ttyUSB0").is_err());
    }
}
