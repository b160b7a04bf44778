//! Application messages exchanged between the base station and bUEs.

use std::fmt;

/// Protocol message tags, in wire spelling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// bUE → base: request to join, body `hostname,id`
    Req,
    /// base → bUE: confirm join, body `base_id`
    Con,
    /// bUE → base: connection acknowledged
    Ack,
    /// bUE → base: liveness, body `state,lat,lon`
    Ping,
    /// base → bUE: liveness response
    Pingr,
    /// base → bUE: scheduled job, body `script,start_ts,params`
    Test,
    /// bUE → base: job accepted, body `start_ts`
    Prepr,
    /// base → bUE: cancel the running job
    Canc,
    /// bUE → base: job cancelled
    Cancd,
    /// bUE → base: position and captured output, body `lat,lon,line`
    Upd,
    Done,
    Fail,
    Reload,
    Restart,
    /// bUE → base: free-form timeout report
    Tout,
    /// Anything else seen on the wire
    Unknown(String),
}

impl MessageType {
    pub fn parse(tag: &str) -> Self {
        match tag {
            "REQ" => Self::Req,
            "CON" => Self::Con,
            "ACK" => Self::Ack,
            "PING" => Self::Ping,
            "PINGR" => Self::Pingr,
            "TEST" => Self::Test,
            "PREPR" => Self::Prepr,
            "CANC" => Self::Canc,
            "CANCD" => Self::Cancd,
            "UPD" => Self::Upd,
            "DONE" => Self::Done,
            "FAIL" => Self::Fail,
            "RELOAD" => Self::Reload,
            "RESTART" => Self::Restart,
            "TOUT" => Self::Tout,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Req => "REQ",
            Self::Con => "CON",
            Self::Ack => "ACK",
            Self::Ping => "PING",
            Self::Pingr => "PINGR",
            Self::Test => "TEST",
            Self::Prepr => "PREPR",
            Self::Canc => "CANC",
            Self::Cancd => "CANCD",
            Self::Upd => "UPD",
            Self::Done => "DONE",
            Self::Fail => "FAIL",
            Self::Reload => "RELOAD",
            Self::Restart => "RESTART",
            Self::Tout => "TOUT",
            Self::Unknown(tag) => tag,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated message decoded from one wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source_id: u16,
    pub kind: MessageType,
    pub body: Option<String>,
}

impl Message {
    /// Splits `payload` into type and body on the first `:`.
    pub fn from_payload(source_id: u16, payload: &str) -> Self {
        let (tag, body) = match payload.split_once(':') {
            Some((tag, body)) => (tag, Some(body.to_string())),
            None => (payload, None),
        };
        Self {
            source_id,
            kind: MessageType::parse(tag),
            body,
        }
    }

    /// Body text, empty when the frame carried none.
    pub fn body(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }
}

/// Builds the `type[":" body]` payload that gets checksummed.
pub fn payload(kind: &MessageType, body: Option<&str>) -> String {
    match body {
        Some(body) => format!("{kind}:{body}"),
        None => kind.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_round_trip() {
        for tag in ["REQ", "CON", "ACK", "PING", "PINGR", "TEST", "PREPR", "CANC", "CANCD", "UPD", "DONE", "FAIL", "RELOAD", "RESTART", "TOUT"] {
            let kind = MessageType::parse(tag);
            assert!(!matches!(kind, MessageType::Unknown(_)), "{tag} should be known");
            assert_eq!(kind.as_str(), tag);
        }
        assert_eq!(MessageType::parse("HELLO"), MessageType::Unknown("HELLO".into()));
    }

    #[test]
    fn test_body_splits_on_first_colon() {
        let msg = Message::from_payload(10, "UPD:40.0,-111.0,STDOUT: [job STDOUT] rx msg: hi");
        assert_eq!(msg.kind, MessageType::Upd);
        assert_eq!(msg.body(), "40.0,-111.0,STDOUT: [job STDOUT] rx msg: hi");

        let bare = Message::from_payload(1, "PINGR");
        assert_eq!(bare.kind, MessageType::Pingr);
        assert_eq!(bare.body, None);
    }

    #[test]
    fn test_payload_formatting() {
        assert_eq!(payload(&MessageType::Ack, None), "ACK");
        assert_eq!(payload(&MessageType::Con, Some("1")), "CON:1");
        assert_eq!(payload(&MessageType::Upd, Some("")), "UPD:");
    }
}
