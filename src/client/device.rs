//! The device client: connection lifecycle, background listener, cached
//! state, and the `control`/`query` facade.
//!
//! One client owns one TCP connection plus two background tasks: a
//! connect/reconnect task that retries forever with a fixed delay, and a
//! listener task that keeps the state cache fresh from query replies and
//! unsolicited pushes. Operational failures never reach the caller; they
//! show up as stale or missing cache entries until the link recovers.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::ProductCatalog;
use crate::error::{Error, Result};
use crate::protocol::codec::find_crlf;
use crate::protocol::{Command, Frame, PORT, codec};

use super::{DeviceIdentity, default_model_name};

/// Bound on every socket operation, including connect.
const IO_TIMEOUT: Duration = Duration::from_secs(10);
/// Fixed delay between failed connection attempts.
const RETRY_DELAY: Duration = Duration::from_secs(10);
/// How long teardown waits for the listener to exit before aborting it.
const LISTENER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 1024;

/// Client for one CozyLife device. Cheap to clone via the facade methods;
/// construct inside a tokio runtime (background tasks are spawned
/// immediately).
pub struct DeviceClient {
    inner: Arc<Inner>,
}

struct ListenerHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    addr: SocketAddr,
    catalog: Arc<dyn ProductCatalog>,
    /// Replaced wholesale on each successful handshake.
    identity: RwLock<Option<Arc<DeviceIdentity>>>,
    /// Last-known value per DPID. Written by the listener (authoritative)
    /// and by `control` (optimistic); read as a snapshot by `query`.
    state: Mutex<HashMap<String, i64>>,
    /// Token of the outstanding wildcard query, matched exactly against
    /// the `sn` of incoming query replies.
    pending_query: Mutex<Option<String>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    listener: tokio::sync::Mutex<Option<ListenerHandle>>,
    /// Guard: at most one connect/reconnect task in flight.
    reconnecting: AtomicBool,
}

impl DeviceClient {
    pub fn new(host: IpAddr, catalog: Arc<dyn ProductCatalog>) -> Self {
        Self::new_with_port(host, PORT, catalog)
    }

    pub fn new_with_port(host: IpAddr, port: u16, catalog: Arc<dyn ProductCatalog>) -> Self {
        let inner = Arc::new(Inner {
            addr: SocketAddr::new(host, port),
            catalog,
            identity: RwLock::new(None),
            state: Mutex::new(HashMap::new()),
            pending_query: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            listener: tokio::sync::Mutex::new(None),
            reconnecting: AtomicBool::new(false),
        });
        inner.spawn_reconnect();
        Self { inner }
    }

    /// Requests a (re)connect. No-op while a connect task is already
    /// running.
    pub fn reconnect(&self) {
        self.inner.spawn_reconnect();
    }

    /// Stops the listener, drops the socket, and cancels any in-flight
    /// retry loop. The client stays usable: a later [`reconnect`] starts
    /// over from scratch.
    ///
    /// [`reconnect`]: Self::reconnect
    pub async fn close(&self) {
        self.inner.reconnecting.store(false, Ordering::SeqCst);
        self.inner.stop_listener().await;
        self.inner.drop_connection().await;
        info!(addr = %self.inner.addr, "client closed");
    }

    /// Writes the given DPID values, fire-and-forget.
    ///
    /// The cache is updated optimistically before the device confirms;
    /// the listener overwrites the entry if the device's ack or a later
    /// push disagrees. Transport failures are swallowed (close + reconnect),
    /// so this always reports acceptance.
    pub async fn control(&self, payload: HashMap<String, i64>) -> bool {
        if let Err(e) = self.inner.send_frame(Command::Set, &payload).await {
            warn!(addr = %self.inner.addr, "set command failed ({e}), reconnecting");
            self.inner.stop_listener().await;
            self.inner.drop_connection().await;
            self.inner.spawn_reconnect();
        }

        self.inner.lock_state().extend(payload);
        true
    }

    /// Snapshot of the last-known device state. Never touches the network;
    /// empty until the first query reply or push has been observed. Missing
    /// keys mean "unknown", not zero.
    pub fn query(&self) -> HashMap<String, i64> {
        self.inner.lock_state().clone()
    }

    /// Identity established by the handshake; `None` until it completes.
    pub fn identity(&self) -> Option<Arc<DeviceIdentity>> {
        self.inner
            .identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn device_id(&self) -> Option<String> {
        self.identity().map(|i| i.device_id.clone())
    }

    pub fn device_type_code(&self) -> Option<String> {
        self.identity().map(|i| i.type_code.clone())
    }

    pub fn device_model_name(&self) -> Option<String> {
        self.identity().map(|i| i.model_name.clone())
    }

    pub fn icon(&self) -> Option<String> {
        self.identity().and_then(|i| i.icon.clone())
    }

    pub fn dpids(&self) -> Vec<u32> {
        self.identity().map(|i| i.dpids.clone()).unwrap_or_default()
    }

    pub fn ip(&self) -> IpAddr {
        self.inner.addr.ip()
    }
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, HashMap<String, i64>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, Option<String>> {
        self.pending_query.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawns the connect task unless one is already running. The loop
    /// retries forever with a fixed delay and exits early if `close`
    /// clears the guard flag.
    fn spawn_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!(addr = %self.addr, "reconnect already in progress, skipping");
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if !inner.reconnecting.load(Ordering::SeqCst) {
                    debug!(addr = %inner.addr, "reconnect cancelled");
                    return;
                }
                match inner.connect_and_handshake().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(
                            addr = %inner.addr,
                            "connection attempt failed ({e}), retrying in {RETRY_DELAY:?}"
                        );
                        sleep(RETRY_DELAY).await;
                    }
                }
            }
            inner.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn connect_and_handshake(self: &Arc<Self>) -> Result<()> {
        info!(addr = %self.addr, "connecting");
        let mut stream = timeout(IO_TIMEOUT, TcpStream::connect(self.addr))
            .await
            .map_err(|_| Error::timed_out("connect"))??;

        let (bytes, _sn) = codec::encode(Command::Info, &HashMap::new())?;
        timeout(IO_TIMEOUT, stream.write_all(&bytes))
            .await
            .map_err(|_| Error::timed_out("handshake send"))??;

        let line = read_handshake_line(&mut stream).await?;
        let frame = codec::decode(&line)?;
        let identity = build_identity(&frame, self.catalog.as_ref())?;
        info!(
            addr = %self.addr,
            device_id = %identity.device_id,
            type_code = %identity.type_code,
            model = %identity.model_name,
            "handshake complete"
        );
        *self.identity.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(identity));

        // Replace any previous connection's listener before wiring up the
        // new socket.
        self.stop_listener().await;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        self.start_listener(read_half).await;

        // Initial wildcard query; the reply is handled by the listener.
        self.send_frame(Command::Query, &HashMap::new()).await?;
        Ok(())
    }

    /// Encodes and sends one frame. Silently drops the frame when not
    /// connected (the caller observes stale cache state instead).
    async fn send_frame(&self, cmd: Command, payload: &HashMap<String, i64>) -> Result<()> {
        let (bytes, sn) = codec::encode(cmd, payload)?;

        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            debug!(addr = %self.addr, "not connected, dropping {cmd:?} frame");
            return Ok(());
        };
        timeout(IO_TIMEOUT, stream.write_all(&bytes))
            .await
            .map_err(|_| Error::timed_out("send"))??;

        if cmd == Command::Query {
            *self.lock_pending() = Some(sn);
        }
        Ok(())
    }

    async fn start_listener(self: &Arc<Self>, socket: OwnedReadHalf) {
        let stop = CancellationToken::new();
        let inner = Arc::clone(self);
        let token = stop.clone();
        let task = tokio::spawn(async move { inner.run_listener(socket, token).await });
        *self.listener.lock().await = Some(ListenerHandle { stop, task });
    }

    /// Signals the listener to stop and joins it within a bounded window;
    /// aborts it past that.
    async fn stop_listener(&self) {
        let Some(handle) = self.listener.lock().await.take() else {
            return;
        };
        handle.stop.cancel();
        let mut task = handle.task;
        if timeout(LISTENER_JOIN_TIMEOUT, &mut task).await.is_err() {
            warn!(addr = %self.addr, "listener did not stop in time, aborting");
            task.abort();
        }
    }

    async fn drop_connection(&self) {
        *self.writer.lock().await = None;
        *self.lock_pending() = None;
    }

    /// Background read loop: grows a buffer, splits on CRLF, routes each
    /// decoded frame. Read timeouts keep the loop responsive to the stop
    /// token on an idle link. EOF or an I/O error tears the connection
    /// down and triggers reconnection.
    async fn run_listener(self: Arc<Self>, mut socket: OwnedReadHalf, stop: CancellationToken) {
        info!(addr = %self.addr, "listener started");
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        let failed = loop {
            tokio::select! {
                _ = stop.cancelled() => break false,
                read = timeout(IO_TIMEOUT, socket.read(&mut chunk)) => match read {
                    // Idle link; go around and poll the stop token again.
                    Err(_) => continue,
                    Ok(Ok(0)) => {
                        warn!(addr = %self.addr, "socket closed by device");
                        break true;
                    }
                    Ok(Ok(n)) => {
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some(pos) = find_crlf(&buf) {
                            let line: Vec<u8> = buf.drain(..pos + 2).take(pos).collect();
                            if line.is_empty() {
                                continue;
                            }
                            self.process_line(&String::from_utf8_lossy(&line));
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(addr = %self.addr, "listener read error: {e}");
                        break true;
                    }
                }
            }
        };

        info!(addr = %self.addr, "listener stopped");
        if failed {
            // Disown our own handle so teardown never joins the current
            // task, then recover.
            self.listener.lock().await.take();
            self.drop_connection().await;
            self.spawn_reconnect();
        }
    }

    /// Routes one received line. An undecodable line is logged and
    /// discarded; it never tears down the connection.
    fn process_line(&self, line: &str) {
        let frame = match codec::decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(addr = %self.addr, "discarding invalid line ({e}): {line:.100}");
                return;
            }
        };

        match Command::from_code(frame.cmd) {
            Some(Command::Query) => {
                // Exact-match correlation against the outstanding query.
                // Pushes interleaved around the reply are routed by cmd, so
                // arrival order does not matter.
                let mut pending = self.lock_pending();
                if pending.as_deref() == Some(frame.sn.as_str()) {
                    debug!(addr = %self.addr, sn = %frame.sn, "query reply matched");
                    *pending = None;
                }
                drop(pending);
                self.apply_data(&frame);
            }
            Some(Command::Push) => self.apply_data(&frame),
            // A set ack echoes the values the device accepted; treat it as
            // authoritative confirmation of the optimistic write.
            Some(Command::Set) => self.apply_data(&frame),
            Some(Command::Info) | None => {
                debug!(addr = %self.addr, cmd = frame.cmd, "ignoring frame");
            }
        }
    }

    fn apply_data(&self, frame: &Frame) {
        let Some(data) = frame.data() else {
            debug!(addr = %self.addr, cmd = frame.cmd, "frame carries no data map");
            return;
        };
        debug!(addr = %self.addr, "state update: {data:?}");
        self.lock_state().extend(data);
    }
}

/// Reads exactly one CRLF-terminated line during the handshake (the socket
/// has not been split yet; everything after the first line is left to the
/// listener's own reads).
async fn read_handshake_line(stream: &mut TcpStream) -> Result<String> {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some(pos) = find_crlf(&buf) {
            return Ok(String::from_utf8_lossy(&buf[..pos]).into_owned());
        }
        let n = timeout(IO_TIMEOUT, stream.read(&mut chunk))
            .await
            .map_err(|_| Error::timed_out("handshake read"))??;
        if n == 0 {
            return Err(Error::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            )));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Builds the identity from an info reply. `did` and `pid` are required;
/// the type code prefers the device's own `dtp` report over the catalog,
/// and the model name falls back to a built-in per-type default when the
/// catalog has no entry.
fn build_identity(frame: &Frame, catalog: &dyn ProductCatalog) -> Result<DeviceIdentity> {
    let msg = frame
        .msg
        .as_object()
        .ok_or_else(|| Error::Handshake("info reply has no msg object".into()))?;
    let device_id = msg
        .get("did")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Handshake("info reply missing device id".into()))?
        .to_string();
    let product_id = msg
        .get("pid")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Handshake("info reply missing product id".into()))?
        .to_string();
    let reported_type = msg.get("dtp").and_then(Value::as_str).map(str::to_string);

    let (type_code, icon, model_name, dpids) = match catalog.lookup(&product_id) {
        Some(product) => (
            reported_type.unwrap_or(product.type_code),
            product.icon,
            product.model_name,
            product.dpids,
        ),
        None => (reported_type.unwrap_or_default(), None, String::new(), Vec::new()),
    };

    let model_name = if model_name.is_empty() {
        default_model_name(&type_code).to_string()
    } else {
        model_name
    };

    Ok(DeviceIdentity {
        device_id,
        product_id,
        type_code,
        model_name,
        icon,
        dpids,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EmptyCatalog, ProductMatch};
    use pretty_assertions::assert_eq;

    struct OneProduct;

    impl ProductCatalog for OneProduct {
        fn lookup(&self, pid: &str) -> Option<ProductMatch> {
            (pid == "e2s64v").then(|| ProductMatch {
                type_code: "01".to_string(),
                icon: Some("icon_bulb".to_string()),
                model_name: "RGBCW Bulb".to_string(),
                dpids: vec![1, 2, 3, 4, 5, 6],
            })
        }
    }

    fn info_frame(msg: &str) -> Frame {
        codec::decode(&format!(r#"{{"cmd":0,"pv":0,"sn":"1","msg":{msg},"res":0}}"#)).unwrap()
    }

    #[test]
    fn identity_from_catalog_match() {
        let frame = info_frame(r#"{"did":"629168","dtp":"01","pid":"e2s64v","mac":"7cb9"}"#);
        let identity = build_identity(&frame, &OneProduct).unwrap();
        assert_eq!(identity.device_id, "629168");
        assert_eq!(identity.product_id, "e2s64v");
        assert_eq!(identity.type_code, "01");
        assert_eq!(identity.model_name, "RGBCW Bulb");
        assert_eq!(identity.icon.as_deref(), Some("icon_bulb"));
        assert_eq!(identity.dpids, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn identity_falls_back_to_builtin_name() {
        let frame = info_frame(r#"{"did":"abc123","dtp":"00","pid":"xyz"}"#);
        let identity = build_identity(&frame, &EmptyCatalog).unwrap();
        assert_eq!(identity.device_id, "abc123");
        assert_eq!(identity.type_code, "00");
        assert_eq!(identity.model_name, "Switch");
        assert_eq!(identity.icon, None);
        assert!(identity.dpids.is_empty());
    }

    #[test]
    fn catalog_type_code_used_when_device_omits_dtp() {
        let frame = info_frame(r#"{"did":"629168","pid":"e2s64v"}"#);
        let identity = build_identity(&frame, &OneProduct).unwrap();
        assert_eq!(identity.type_code, "01");
    }

    #[test]
    fn unknown_type_code_gets_generic_name() {
        let frame = info_frame(r#"{"did":"abc","dtp":"7f","pid":"zzz"}"#);
        let identity = build_identity(&frame, &EmptyCatalog).unwrap();
        assert_eq!(identity.model_name, "CozyLife Device");
    }

    #[test]
    fn missing_did_or_pid_is_handshake_error() {
        let no_did = info_frame(r#"{"pid":"xyz"}"#);
        assert!(matches!(
            build_identity(&no_did, &EmptyCatalog),
            Err(Error::Handshake(_))
        ));

        let no_pid = info_frame(r#"{"did":"abc"}"#);
        assert!(matches!(
            build_identity(&no_pid, &EmptyCatalog),
            Err(Error::Handshake(_))
        ));

        let no_msg = codec::decode(r#"{"cmd":0,"pv":0,"sn":"1","msg":null}"#).unwrap();
        assert!(matches!(
            build_identity(&no_msg, &EmptyCatalog),
            Err(Error::Handshake(_))
        ));
    }
}
