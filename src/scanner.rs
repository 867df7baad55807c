//! One-shot network scanner. Shares the wire format with the client but
//! keeps no state: connect, send one info frame, read one reply, report.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::codec::find_crlf;
use crate::protocol::{Command, codec};

/// Connect/send bound per probed host.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// How long to wait for the info reply once connected.
const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Refuse to expand a target expression past this many addresses.
const MAX_TARGETS: u64 = 65_536;

/// Info reported by one discovered device. Fields absent from the reply
/// read "unknown".
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub ip: Ipv4Addr,
    pub device_id: String,
    pub type_code: String,
    pub product_id: String,
    pub model: String,
    pub mac: String,
    pub sw_version: String,
    pub hw_version: String,
}

pub fn type_name(code: &str) -> &'static str {
    match code {
        "00" => "Switch/Plug",
        "01" => "Light",
        "02" => "Energy Storage",
        _ => "Unknown",
    }
}

/// Expands a target expression into concrete addresses. Accepts a CIDR
/// block (`192.168.1.0/24`, host addresses only), a dash range
/// (`192.168.1.100-192.168.1.200`), or a single IPv4 address.
pub fn parse_targets(expr: &str) -> Result<Vec<Ipv4Addr>, String> {
    let expr = expr.trim();

    if let Some((base, prefix)) = expr.split_once('/') {
        let base: Ipv4Addr = base
            .trim()
            .parse()
            .map_err(|e| format!("invalid CIDR base address: {e}"))?;
        let prefix: u32 = prefix
            .trim()
            .parse()
            .map_err(|e| format!("invalid CIDR prefix: {e}"))?;
        if prefix > 32 {
            return Err(format!("invalid CIDR prefix: /{prefix}"));
        }
        if prefix < 16 {
            return Err(format!(
                "/{prefix} expands past {MAX_TARGETS} addresses; /16 is the widest allowed block"
            ));
        }
        let base = u32::from(base);
        if prefix == 32 {
            return Ok(vec![Ipv4Addr::from(base)]);
        }
        let mask = u32::MAX << (32 - prefix);
        let network = base & mask;
        let broadcast = network | !mask;
        if prefix >= 31 {
            // Point-to-point block, no network/broadcast addresses.
            return Ok((network..=broadcast).map(Ipv4Addr::from).collect());
        }
        return Ok(((network + 1)..broadcast).map(Ipv4Addr::from).collect());
    }

    if let Some((start, end)) = expr.split_once('-') {
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|e| format!("invalid range start: {e}"))?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|e| format!("invalid range end: {e}"))?;
        let (start, end) = (u32::from(start), u32::from(end));
        if start > end {
            return Err("range start is after range end".to_string());
        }
        let count = u64::from(end - start) + 1;
        if count > MAX_TARGETS {
            return Err(format!("range expands to {count} addresses (max {MAX_TARGETS})"));
        }
        return Ok((start..=end).map(Ipv4Addr::from).collect());
    }

    Ok(vec![
        expr.parse().map_err(|e| format!("invalid IP address: {e}"))?,
    ])
}

/// Probes one host: short-lived connection, one info exchange. `None` on
/// any failure — a silent port is the common case when sweeping a subnet.
pub async fn probe(ip: Ipv4Addr, port: u16, connect_timeout: Duration) -> Option<ScanResult> {
    let addr = SocketAddr::from((ip, port));
    let mut stream = timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .ok()?
        .ok()?;

    let (bytes, _sn) = codec::encode(Command::Info, &HashMap::new()).ok()?;
    timeout(connect_timeout, stream.write_all(&bytes))
        .await
        .ok()?
        .ok()?;

    let line = read_reply_line(&mut stream).await?;
    let frame = codec::decode(&line)
        .inspect_err(|e| debug!("undecodable reply from {ip}: {e}"))
        .ok()?;
    if frame.cmd != Command::Info.code() {
        debug!("unexpected cmd {} from {ip}", frame.cmd);
        return None;
    }
    let msg = frame.msg.as_object()?;
    let field = |key: &str| {
        msg.get(key)
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string()
    };

    Some(ScanResult {
        ip,
        device_id: field("did"),
        type_code: field("dtp"),
        product_id: field("pid"),
        model: field("model"),
        mac: field("mac"),
        sw_version: field("sv"),
        hw_version: field("hv"),
    })
}

async fn read_reply_line(stream: &mut TcpStream) -> Option<String> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(pos) = find_crlf(&buf) {
            return Some(String::from_utf8_lossy(&buf[..pos]).into_owned());
        }
        let n = timeout(REPLY_TIMEOUT, stream.read(&mut chunk)).await.ok()?.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn single_ip() {
        assert_eq!(
            parse_targets("192.168.1.50"),
            Ok(vec![Ipv4Addr::new(192, 168, 1, 50)])
        );
    }

    #[test]
    fn cidr_excludes_network_and_broadcast() {
        let ips = parse_targets("192.168.1.0/30").unwrap();
        assert_eq!(
            ips,
            vec![Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(192, 168, 1, 2)]
        );

        let ips = parse_targets("192.168.1.0/24").unwrap();
        assert_eq!(ips.len(), 254);
        assert_eq!(ips.first(), Some(&Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(ips.last(), Some(&Ipv4Addr::new(192, 168, 1, 254)));
    }

    #[test]
    fn narrow_cidr_blocks() {
        assert_eq!(
            parse_targets("10.0.0.7/32"),
            Ok(vec![Ipv4Addr::new(10, 0, 0, 7)])
        );
        assert_eq!(
            parse_targets("10.0.0.0/31"),
            Ok(vec![Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(10, 0, 0, 1)])
        );
    }

    #[test]
    fn dash_range_is_inclusive() {
        let ips = parse_targets("192.168.1.100-192.168.1.102").unwrap();
        assert_eq!(ips.len(), 3);
        assert_eq!(ips[0], Ipv4Addr::new(192, 168, 1, 100));
        assert_eq!(ips[2], Ipv4Addr::new(192, 168, 1, 102));
    }

    #[test]
    fn rejects_bad_targets() {
        assert!(parse_targets("not-an-ip").is_err());
        assert!(parse_targets("192.168.1.0/33").is_err());
        assert!(parse_targets("10.0.0.0/8").is_err());
        assert!(parse_targets("192.168.1.5-192.168.1.1").is_err());
        assert!(parse_targets("10.0.0.0-10.255.255.255").is_err());
    }

    #[tokio::test]
    async fn probe_reports_device_fields() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            let request: Value = serde_json::from_slice(&buf[..n - 2]).unwrap();
            assert_eq!(request["cmd"], 0);
            let reply = json!({
                "cmd": 0, "pv": 0, "sn": request["sn"],
                "msg": {"did": "629168", "dtp": "01", "pid": "e2s64v", "mac": "7cb9", "sv": "1.0.0", "hv": "0.0.1"},
                "res": 0,
            });
            let mut bytes = serde_json::to_vec(&reply).unwrap();
            bytes.extend_from_slice(b"\r\n");
            stream.write_all(&bytes).await.unwrap();
        });

        let result = probe(Ipv4Addr::LOCALHOST, port, PROBE_TIMEOUT).await.unwrap();
        assert_eq!(result.device_id, "629168");
        assert_eq!(result.type_code, "01");
        assert_eq!(result.product_id, "e2s64v");
        assert_eq!(result.model, "unknown");
        assert_eq!(result.sw_version, "1.0.0");
    }

    #[tokio::test]
    async fn probe_silent_port_is_none() {
        // Bind then drop, so the port is closed.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert_eq!(
            probe(Ipv4Addr::LOCALHOST, port, Duration::from_millis(500)).await,
            None
        );
    }
}
