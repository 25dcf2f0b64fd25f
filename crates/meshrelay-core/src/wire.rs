//! Mesh event datagram format: small, unreliable UDP payloads exchanged
//! directly between peers (distinct from the admin-service codec in
//! [`crate::bencode`], which only talks to the local overlay daemon).
//!
//! Every datagram is `<1-byte tag><null-separated string fields>`. Fields
//! are plain bytes; the last field in a greeting is repeated zero or more
//! times (one per joined channel).

use thiserror::Error;

/// Tag byte values, carried over from the original mesh protocol.
pub mod tag {
    pub const GREETING: u8 = 1;
    pub const MSG: u8 = 2;
    pub const NOTICE: u8 = 3;
    pub const JOIN: u8 = 4;
    pub const PART: u8 = 5;
    pub const NICK: u8 = 6;
}

/// Total size cap for a single mesh datagram, matching the original
/// implementation's packet budget.
pub const PACKET_LEN: usize = 1400;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("empty datagram")]
    Empty,
    #[error("unrecognized tag byte {0:#04x}")]
    UnknownTag(u8),
    #[error("field missing terminator before end of datagram")]
    Truncated,
}

/// A decoded mesh event. Fields borrow nothing from the input; decoding a
/// datagram copies its string fields into owned `String`s, replacing
/// invalid UTF-8 with the replacement character (mesh peers are untrusted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    Greeting { nick: String, channels: Vec<String> },
    Msg { channel: String, text: String },
    Notice { channel: String, text: String },
    Join { channel: String, nick: String },
    Part { channel: String, reason: String },
    Nick { new_nick: String },
}

impl WireEvent {
    /// Encodes this event as a mesh datagram payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            WireEvent::Greeting { nick, channels } => {
                out.push(tag::GREETING);
                push_field(&mut out, nick);
                for channel in channels {
                    push_field(&mut out, channel);
                }
            }
            WireEvent::Msg { channel, text } => {
                out.push(tag::MSG);
                push_field(&mut out, channel);
                push_field(&mut out, text);
            }
            WireEvent::Notice { channel, text } => {
                out.push(tag::NOTICE);
                push_field(&mut out, channel);
                push_field(&mut out, text);
            }
            WireEvent::Join { channel, nick } => {
                out.push(tag::JOIN);
                push_field(&mut out, channel);
                push_field(&mut out, nick);
            }
            WireEvent::Part { channel, reason } => {
                out.push(tag::PART);
                push_field(&mut out, channel);
                push_field(&mut out, reason);
            }
            WireEvent::Nick { new_nick } => {
                out.push(tag::NICK);
                push_field(&mut out, new_nick);
            }
        }
        out
    }

    /// Decodes a complete mesh datagram. Unrecognized tags and datagrams
    /// with a field truncated before its null terminator are rejected;
    /// callers are expected to drop the datagram on error and continue.
    pub fn decode(datagram: &[u8]) -> Result<WireEvent, WireError> {
        let (&tag, rest) = datagram.split_first().ok_or(WireError::Empty)?;
        match tag {
            tag::GREETING => {
                let mut fields = split_fields(rest);
                let nick = fields.next().ok_or(WireError::Truncated)??;
                let channels = fields.collect::<Result<Vec<_>, _>>()?;
                Ok(WireEvent::Greeting { nick, channels })
            }
            tag::MSG => {
                let (channel, text) = two_fields(rest)?;
                Ok(WireEvent::Msg { channel, text })
            }
            tag::NOTICE => {
                let (channel, text) = two_fields(rest)?;
                Ok(WireEvent::Notice { channel, text })
            }
            tag::JOIN => {
                let (channel, nick) = two_fields(rest)?;
                Ok(WireEvent::Join { channel, nick })
            }
            tag::PART => {
                let (channel, reason) = two_fields(rest)?;
                Ok(WireEvent::Part { channel, reason })
            }
            tag::NICK => {
                let mut fields = split_fields(rest);
                let new_nick = fields.next().ok_or(WireError::Truncated)??;
                Ok(WireEvent::Nick { new_nick })
            }
            other => Err(WireError::UnknownTag(other)),
        }
    }

    /// Best-effort greeting parse used when a datagram's channel list may
    /// run past the end of the buffer: parsing stops at the last complete
    /// null-terminated field rather than failing the whole greeting,
    /// matching the original implementation's tolerance for overrun
    /// channel lists. Returns `None` if even the nick field is incomplete.
    pub fn decode_greeting_lenient(datagram: &[u8]) -> Option<WireEvent> {
        let (&t, rest) = datagram.split_first()?;
        if t != tag::GREETING {
            return None;
        }
        let mut offset = 0;
        let nick = take_field_lenient(rest, &mut offset)?;
        let mut channels = Vec::new();
        while let Some(channel) = take_field_lenient(rest, &mut offset) {
            channels.push(channel);
        }
        Some(WireEvent::Greeting { nick, channels })
    }
}

fn push_field(out: &mut Vec<u8>, field: &str) {
    out.extend_from_slice(field.as_bytes());
    out.push(0);
}

fn two_fields(rest: &[u8]) -> Result<(String, String), WireError> {
    let mut fields = split_fields(rest);
    let a = fields.next().ok_or(WireError::Truncated)??;
    let b = fields.next().ok_or(WireError::Truncated)??;
    Ok((a, b))
}

/// Splits `rest` on null bytes, yielding one `Result` per field. Yields
/// `Truncated` once if the final segment has no terminating null (i.e. the
/// datagram ended mid-field); a perfectly terminated buffer (every field,
/// including the last, followed by a null) yields no trailing empty field.
fn split_fields(rest: &[u8]) -> impl Iterator<Item = Result<String, WireError>> + '_ {
    let mut offset = 0;
    std::iter::from_fn(move || {
        if offset >= rest.len() {
            return None;
        }
        match rest[offset..].iter().position(|&b| b == 0) {
            Some(pos) => {
                let field = String::from_utf8_lossy(&rest[offset..offset + pos]).into_owned();
                offset += pos + 1;
                Some(Ok(field))
            }
            None => {
                offset = rest.len();
                Some(Err(WireError::Truncated))
            }
        }
    })
}

fn take_field_lenient(rest: &[u8], offset: &mut usize) -> Option<String> {
    if *offset >= rest.len() {
        return None;
    }
    let pos = rest[*offset..].iter().position(|&b| b == 0)?;
    let field = String::from_utf8_lossy(&rest[*offset..*offset + pos]).into_owned();
    *offset += pos + 1;
    Some(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_greeting() {
        let event = WireEvent::Greeting {
            nick: "a".into(),
            channels: vec!["#x".into(), "#y".into()],
        };
        let bytes = event.encode();
        assert_eq!(bytes, b"\x01a\0#x\0#y\0");
        assert_eq!(WireEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn roundtrip_greeting_no_channels() {
        let event = WireEvent::Greeting {
            nick: "a".into(),
            channels: vec![],
        };
        let bytes = event.encode();
        assert_eq!(bytes, b"\x01a\0");
        assert_eq!(WireEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn roundtrip_msg_matches_scenario_s4_s5() {
        // S5: \x02#x\0hi\0
        let bytes = b"\x02#x\0hi\0";
        let event = WireEvent::decode(bytes).unwrap();
        assert_eq!(
            event,
            WireEvent::Msg {
                channel: "#x".into(),
                text: "hi".into()
            }
        );
        assert_eq!(event.encode(), bytes);
    }

    #[test]
    fn roundtrip_join() {
        let event = WireEvent::Join {
            channel: "#x".into(),
            nick: "bob".into(),
        };
        let bytes = event.encode();
        assert_eq!(WireEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn roundtrip_part() {
        let event = WireEvent::Part {
            channel: "#x".into(),
            reason: "bye".into(),
        };
        assert_eq!(WireEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn roundtrip_nick() {
        let event = WireEvent::Nick {
            new_nick: "carol".into(),
        };
        assert_eq!(WireEvent::decode(&event.encode()).unwrap(), event);
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert_eq!(WireEvent::decode(&[9, b'x']), Err(WireError::UnknownTag(9)));
    }

    #[test]
    fn empty_datagram_is_rejected() {
        assert_eq!(WireEvent::decode(&[]), Err(WireError::Empty));
    }

    #[test]
    fn truncated_field_is_rejected() {
        // MSG with a channel field but no terminator at all.
        let mut bytes = vec![tag::MSG];
        bytes.extend_from_slice(b"#x");
        assert_eq!(WireEvent::decode(&bytes), Err(WireError::Truncated));
    }

    #[test]
    fn truncated_second_field_is_rejected() {
        let mut bytes = vec![tag::MSG];
        bytes.extend_from_slice(b"#x\0incomplete");
        assert_eq!(WireEvent::decode(&bytes), Err(WireError::Truncated));
    }

    #[test]
    fn greeting_channel_list_overrun_stops_at_last_complete_field() {
        // Greeting with nick, one full channel, and a dangling partial
        // channel name with no terminator before the datagram ends.
        let mut bytes = vec![tag::GREETING];
        bytes.extend_from_slice(b"a\0#x\0#partial-no-term");
        assert_eq!(WireEvent::decode(&bytes), Err(WireError::Truncated));

        let lenient = WireEvent::decode_greeting_lenient(&bytes).unwrap();
        assert_eq!(
            lenient,
            WireEvent::Greeting {
                nick: "a".into(),
                channels: vec!["#x".into()],
            }
        );
    }

    #[test]
    fn packet_len_bounds_a_realistic_greeting() {
        let channels: Vec<String> = (0..20).map(|i| format!("#channel{i}")).collect();
        let event = WireEvent::Greeting {
            nick: "someone".into(),
            channels,
        };
        assert!(event.encode().len() < PACKET_LEN);
    }
}
