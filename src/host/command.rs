//! Wire format for the command channel.
//!
//! A command is one newline-free line of text: the command name followed by
//! whitespace-separated, percent-encoded arguments. The reply is exactly one
//! compact JSON object `{type, value?, error?}` whose `type` echoes the
//! command name. Argument decoding happens here so the dispatcher only ever
//! sees clean strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed command: name plus decoded arguments, immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name, taken verbatim from the first token.
    pub name: String,
    /// Decoded arguments in wire order.
    pub args: Vec<String>,
}

/// Parse failure carrying the best-effort command name for the error reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParseError {
    /// Name to echo in the response `type`; `"unknown"` when even the name
    /// could not be read.
    pub name: String,
    /// Human-readable description of what went wrong.
    pub detail: String,
}

impl Command {
    /// Parse a single command line.
    ///
    /// The name is the first whitespace-separated token; every following
    /// token is percent-decoded. `+` is not treated as a space.
    pub fn parse(line: &str) -> std::result::Result<Command, CommandParseError> {
        let mut tokens = line.split_whitespace();

        let name = match tokens.next() {
            Some(token) => token.to_string(),
            None => {
                return Err(CommandParseError {
                    name: "unknown".to_string(),
                    detail: "empty command".to_string(),
                });
            }
        };

        let mut args = Vec::new();
        for token in tokens {
            match decode_argument(token) {
                Ok(arg) => args.push(arg),
                Err(detail) => {
                    return Err(CommandParseError {
                        name: name.clone(),
                        detail,
                    });
                }
            }
        }

        Ok(Command { name, args })
    }
}

/// Percent-decode one argument token.
pub fn decode_argument(token: &str) -> std::result::Result<String, String> {
    let bytes = token.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = bytes.get(i + 1).copied().and_then(hex_value);
            let lo = bytes.get(i + 2).copied().and_then(hex_value);
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    out.push(hi * 16 + lo);
                    i += 3;
                }
                _ => return Err(format!("malformed percent escape in '{token}'")),
            }
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    String::from_utf8(out).map_err(|_| format!("argument '{token}' is not valid UTF-8"))
}

/// Percent-encode one argument for the wire.
///
/// Escapes `%`, whitespace, control bytes, and everything outside printable
/// ASCII, so the encoded token is newline-free ASCII and survives
/// whitespace tokenization on the host side.
pub fn encode_argument(arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    for byte in arg.bytes() {
        if byte == b'%' || byte <= b' ' || byte >= 0x7f {
            out.push_str(&format!("%{byte:02X}"));
        } else {
            out.push(byte as char);
        }
    }
    out
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// One reply per command, serialized as a single compact JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Echoes the originating command name (`"unknown"` if parsing failed).
    #[serde(rename = "type")]
    pub kind: String,

    /// Payload for successful value-producing commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    /// Error message for failed commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    /// Successful response carrying a value.
    pub fn success(kind: impl Into<String>, value: Value) -> Self {
        Response {
            kind: kind.into(),
            value: Some(value),
            error: None,
        }
    }

    /// Successful response without a payload.
    pub fn empty(kind: impl Into<String>) -> Self {
        Response {
            kind: kind.into(),
            value: None,
            error: None,
        }
    }

    /// Failed response with an error message.
    pub fn failure(kind: impl Into<String>, error: impl Into<String>) -> Self {
        Response {
            kind: kind.into(),
            value: None,
            error: Some(error.into()),
        }
    }

    /// Whether the command reported an error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_plain_arguments() {
        let cmd = Command::parse("set_setting languageCode en").unwrap();
        assert_eq!(cmd.name, "set_setting");
        assert_eq!(cmd.args, vec!["languageCode", "en"]);
    }

    #[test]
    fn encoded_space_decodes_to_one_argument() {
        let encoded = encode_argument("is visible");
        let cmd = Command::parse(&format!("property deviceListButton {encoded}")).unwrap();
        assert_eq!(cmd.args, vec!["deviceListButton", "is visible"]);
    }

    #[test]
    fn non_ascii_arguments_survive_the_wire() {
        let encoded = encode_argument("Bonjour é ✓");
        assert!(encoded.is_ascii());
        let cmd = Command::parse(&format!("set_setting greeting {encoded}")).unwrap();
        assert_eq!(cmd.args[1], "Bonjour é ✓");
    }

    #[test]
    fn plus_is_not_a_space() {
        let cmd = Command::parse("set_setting key a+b").unwrap();
        assert_eq!(cmd.args[1], "a+b");
    }

    #[test]
    fn malformed_escape_reports_command_name() {
        let err = Command::parse("click bad%2").unwrap_err();
        assert_eq!(err.name, "click");

        let err = Command::parse("click bad%zz").unwrap_err();
        assert_eq!(err.name, "click");
    }

    #[test]
    fn empty_line_is_unknown() {
        let err = Command::parse("   ").unwrap_err();
        assert_eq!(err.name, "unknown");
    }

    #[test]
    fn response_serializes_without_empty_fields() {
        let text = serde_json::to_string(&Response::empty("reset")).unwrap();
        assert_eq!(text, r#"{"type":"reset"}"#);

        let text =
            serde_json::to_string(&Response::failure("unknown", "invalid command")).unwrap();
        assert_eq!(text, r#"{"type":"unknown","error":"invalid command"}"#);
    }
}
