//! Frame building and parsing. One compact JSON object per line,
//! CRLF-terminated.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};

use super::{Command, Frame, PROTOCOL_VERSION};
use crate::error::{Error, ProtocolError, Result};

/// Returns the next sequence token: wall-clock milliseconds as a decimal
/// string. Only a correlation token — millisecond resolution is good enough
/// because commands are issued one at a time per client.
pub fn next_sn() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .to_string()
}

/// Builds an outgoing frame for `cmd`, assigning a fresh sequence token.
/// Returns the wire bytes and the token (for reply correlation).
///
/// Only `Info`, `Query`, and `Set` are valid outgoing commands; anything
/// else is a programming error reported as `UnsupportedCommand`.
pub fn encode(cmd: Command, payload: &HashMap<String, i64>) -> Result<(Vec<u8>, String)> {
    let sn = next_sn();
    let bytes = encode_with_sn(cmd, payload, &sn)?;
    Ok((bytes, sn))
}

pub(crate) fn encode_with_sn(
    cmd: Command,
    payload: &HashMap<String, i64>,
    sn: &str,
) -> Result<Vec<u8>> {
    let msg = match cmd {
        Command::Info => json!({}),
        // Wildcard query: attr [0] asks for every data point.
        Command::Query => json!({ "attr": [0] }),
        Command::Set => {
            let mut attr: Vec<u32> = payload.keys().filter_map(|k| k.parse().ok()).collect();
            attr.sort_unstable();
            json!({ "attr": attr, "data": payload })
        }
        Command::Push => return Err(Error::UnsupportedCommand(cmd.code())),
    };

    let frame = json!({
        "cmd": cmd.code(),
        "pv": PROTOCOL_VERSION,
        "sn": sn,
        "msg": msg,
    });

    let mut bytes = serde_json::to_vec(&frame).map_err(ProtocolError::MalformedFrame)?;
    bytes.extend_from_slice(b"\r\n");
    Ok(bytes)
}

/// Position of the first CRLF in `buf`, if a complete line is buffered.
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Parses one received line into a [`Frame`].
///
/// Malformed input never panics: invalid JSON is `MalformedFrame`, a JSON
/// object lacking `cmd` or `sn` is `MissingField`, so the listener can log
/// the line and continue.
pub fn decode(line: &str) -> std::result::Result<Frame, ProtocolError> {
    let value: Value = serde_json::from_str(line.trim())?;

    let cmd = value
        .get("cmd")
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::MissingField("cmd"))?;
    let sn = value
        .get("sn")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingField("sn"))?
        .to_string();
    let pv = value.get("pv").and_then(Value::as_u64).unwrap_or(0);
    let res = value.get("res").and_then(Value::as_i64);
    let msg = value.get("msg").cloned().unwrap_or_else(|| json!({}));

    Ok(Frame {
        cmd: cmd as u8,
        pv: pv as u8,
        sn,
        msg,
        res,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn roundtrip(cmd: Command, payload: &HashMap<String, i64>) -> Frame {
        let bytes = encode_with_sn(cmd, payload, "1636463553873").unwrap();
        let line = String::from_utf8(bytes).unwrap();
        assert!(line.ends_with("\r\n"));
        decode(&line).unwrap()
    }

    #[test]
    fn info_roundtrip() {
        let frame = roundtrip(Command::Info, &HashMap::new());
        assert_eq!(frame.cmd, Command::Info.code());
        assert_eq!(frame.pv, 0);
        assert_eq!(frame.sn, "1636463553873");
        assert_eq!(frame.msg, json!({}));
    }

    #[test]
    fn query_roundtrip_is_wildcard() {
        let frame = roundtrip(Command::Query, &HashMap::new());
        assert_eq!(frame.cmd, Command::Query.code());
        assert_eq!(frame.msg, json!({ "attr": [0] }));
    }

    #[test]
    fn set_roundtrip_carries_attr_and_data() {
        let payload = HashMap::from([("4".to_string(), 1000), ("1".to_string(), 255)]);
        let frame = roundtrip(Command::Set, &payload);
        assert_eq!(frame.cmd, Command::Set.code());
        assert_eq!(frame.msg.get("attr"), Some(&json!([1, 4])));
        assert_eq!(frame.data(), Some(payload));
    }

    #[test]
    fn push_cannot_be_encoded() {
        let err = encode(Command::Push, &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedCommand(10)));
    }

    #[test]
    fn decode_rejects_invalid_json() {
        assert!(matches!(
            decode("not json at all"),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn decode_reports_missing_fields() {
        assert!(matches!(
            decode(r#"{"pv":0,"sn":"1"}"#),
            Err(ProtocolError::MissingField("cmd"))
        ));
        assert!(matches!(
            decode(r#"{"cmd":2,"pv":0}"#),
            Err(ProtocolError::MissingField("sn"))
        ));
    }

    #[test]
    fn decode_push_with_data() {
        let line = r#"{"cmd":10,"pv":0,"sn":"1636463664000","res":0,"msg":{"attr":[1,2],"data":{"1":0,"2":500}}}"#;
        let frame = decode(line).unwrap();
        assert_eq!(frame.cmd, Command::Push.code());
        assert_eq!(frame.res, Some(0));
        let data = frame.data().unwrap();
        assert_eq!(data.get("1"), Some(&0));
        assert_eq!(data.get("2"), Some(&500));
    }

    #[test]
    fn data_skips_non_integer_values() {
        let line = r#"{"cmd":2,"pv":0,"sn":"1","msg":{"attr":[1,2],"data":{"1":7,"2":"red"}}}"#;
        let data = decode(line).unwrap().data().unwrap();
        assert_eq!(data, HashMap::from([("1".to_string(), 7)]));
    }

    #[test]
    fn find_crlf_positions() {
        assert_eq!(find_crlf(b"abc\r\ndef"), Some(3));
        assert_eq!(find_crlf(b"\r\n"), Some(0));
        assert_eq!(find_crlf(b"abc\rdef\n"), None);
    }

    #[test]
    fn sequence_token_is_millisecond_decimal() {
        let sn = next_sn();
        let millis: u128 = sn.parse().unwrap();
        // Past 2020, single-digit-trillions range.
        assert!(millis > 1_577_836_800_000);
    }
}
