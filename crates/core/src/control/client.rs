//! Control-port client over TCP
//!
//! Commands share one authenticated connection behind a mutex so replies
//! can never interleave. Stream events use a second connection whose
//! reader task forwards parsed events onto an mpsc channel.

use super::error::ControlError;
use super::parse::{
    parse_circuit_status, parse_extended, parse_ip_to_country, parse_relay_info,
    parse_router_status, parse_stream_event, ReplyLine,
};
use super::types::{
    CircuitState, CircuitStatus, ExtendCircuitOptions, Relay, RelayInfo, StreamEvent,
};
use super::{ControlChannel, ControlResult};
use anonroute_common::{control, CircuitId, ControlAuth, CountryCode, Fingerprint};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// GETINFO keys per ip-to-country request
const COUNTRY_BATCH: usize = 64;

/// One authenticated control connection
struct ControlConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ControlConnection {
    async fn open(addr: &str) -> ControlResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            let err = ControlError::from(e);
            ControlError::new(err.kind, format!("failed to connect to control port {}: {}", addr, err))
        })?;

        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        })
    }

    async fn read_line(&mut self) -> ControlResult<String> {
        let mut line = String::new();
        let read = self.reader.read_line(&mut line).await?;
        if read == 0 {
            return Err(ControlError::connection_lost(
                "Connection refused: connection closed by control port",
            ));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn command(&mut self, cmd: &str) -> ControlResult<Vec<String>> {
        self.writer.write_all(format!("{}\r\n", cmd).as_bytes()).await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    /// Read one complete reply, data blocks included
    async fn read_reply(&mut self) -> ControlResult<Vec<String>> {
        let mut lines = Vec::new();
        let mut failure: Option<ControlError> = None;

        loop {
            let raw = self.read_line().await?;
            if raw.trim().is_empty() {
                continue;
            }

            let line = ReplyLine::parse(&raw)?;
            if line.is_async_event() {
                continue;
            }

            if line.starts_data() {
                lines.push(line.text);
                loop {
                    let data = self.read_line().await?;
                    if data == "." {
                        break;
                    }
                    // Leading dots are escaped by doubling
                    let data = data.strip_prefix('.').filter(|d| d.starts_with('.')).unwrap_or(&data);
                    lines.push(data.to_string());
                }
                continue;
            }

            let is_final = line.is_final();
            if !line.is_success() && failure.is_none() {
                failure = Some(ControlError::rejected(format!("{} {}", line.code, line.text)));
            } else if line.is_success() {
                lines.push(line.text);
            }

            if is_final {
                break;
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(lines),
        }
    }

    async fn authenticate(&mut self, auth: &ControlAuth) -> ControlResult<()> {
        let cmd = match auth {
            ControlAuth::None => "AUTHENTICATE".to_string(),
            ControlAuth::Password(password) => {
                format!("AUTHENTICATE \"{}\"", escape_control_string(password))
            }
            ControlAuth::Cookie(path) => cookie_command(path).await?,
            ControlAuth::Auto => self.auto_auth_command().await?,
        };

        self.command(&cmd).await?;
        Ok(())
    }

    async fn auto_auth_command(&mut self) -> ControlResult<String> {
        let lines = self.command("PROTOCOLINFO 1").await?;

        let mut methods: Vec<String> = Vec::new();
        let mut cookie_file: Option<String> = None;

        for line in &lines {
            let Some(auth_part) = line.strip_prefix("AUTH ") else {
                continue;
            };
            if let Some(start) = auth_part.find("METHODS=") {
                let after = &auth_part[start + 8..];
                let end = after.find(' ').unwrap_or(after.len());
                methods = after[..end].split(',').map(String::from).collect();
            }
            if let Some(start) = auth_part.find("COOKIEFILE=\"") {
                let after = &auth_part[start + 12..];
                if let Some(end) = after.find('"') {
                    cookie_file = Some(after[..end].to_string());
                }
            }
        }

        debug!(?methods, ?cookie_file, "control port auth methods");

        let cookie_allowed = methods.iter().any(|m| m == "COOKIE" || m == "SAFECOOKIE");
        if cookie_allowed {
            if let Some(path) = cookie_file {
                return cookie_command(Path::new(&path)).await;
            }
        }
        if methods.iter().any(|m| m == "NULL") {
            return Ok("AUTHENTICATE".to_string());
        }

        Err(ControlError::rejected(format!(
            "no usable authentication method among {:?}; configure control_auth explicitly",
            methods
        )))
    }

    /// Forward `650 STREAM` events until the receiver or the socket goes away
    async fn forward_stream_events(mut self, tx: mpsc::Sender<StreamEvent>) {
        loop {
            let raw = match self.read_line().await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!("Stream event connection ended: {}", e);
                    break;
                }
            };

            let line = match ReplyLine::parse(&raw) {
                Ok(line) => line,
                Err(e) => {
                    debug!("Skipping event line: {}", e);
                    continue;
                }
            };
            if !line.is_async_event() || !line.text.starts_with("STREAM ") {
                continue;
            }

            match parse_stream_event(&line.text) {
                Ok(event) => {
                    if tx.send(event).await.is_err() {
                        debug!("Stream event receiver dropped");
                        break;
                    }
                }
                Err(e) => debug!("Unparseable stream event: {}", e),
            }
        }
    }
}

async fn cookie_command(path: &Path) -> ControlResult<String> {
    let cookie = tokio::fs::read(path).await.map_err(|e| {
        ControlError::rejected(format!("failed to read cookie file {}: {}", path.display(), e))
    })?;
    Ok(format!("AUTHENTICATE {}", hex::encode(cookie)))
}

fn escape_control_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Control-port client for the network client process
pub struct TorControlClient {
    addr: String,
    auth: ControlAuth,
    command_timeout: Duration,
    connection: Mutex<Option<ControlConnection>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl TorControlClient {
    /// Create an unconnected client; call `authenticate` before use
    pub fn new(addr: impl Into<String>, auth: ControlAuth) -> Self {
        Self {
            addr: addr.into(),
            auth,
            command_timeout: Duration::from_secs(control::COMMAND_TIMEOUT_SECS),
            connection: Mutex::new(None),
            event_task: Mutex::new(None),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Connect and authenticate
    pub async fn connect(addr: impl Into<String>, auth: ControlAuth) -> ControlResult<Self> {
        let client = Self::new(addr, auth);
        client.authenticate().await?;
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn command(&self, cmd: &str) -> ControlResult<Vec<String>> {
        let mut guard = self.connection.lock().await;
        let conn = guard.as_mut().ok_or_else(|| {
            ControlError::connection_lost("Connection refused: control connection not established")
        })?;

        let verb = cmd.split_whitespace().next().unwrap_or(cmd);
        let result = match tokio::time::timeout(self.command_timeout, conn.command(cmd)).await {
            Ok(result) => result,
            Err(_) => Err(ControlError::timeout(format!(
                "{} did not complete within {} seconds",
                verb,
                self.command_timeout.as_secs()
            ))),
        };

        match &result {
            // Reply framing is unknown after these; force a reconnect
            Err(e) if e.is_connection_lost() || e.is_timeout() || e.is_malformed() => {
                *guard = None;
            }
            _ => {}
        }

        result
    }

    async fn wait_for_build(&self, circuit_id: CircuitId) -> ControlResult<()> {
        let deadline = tokio::time::Instant::now() + self.command_timeout;

        loop {
            let circuits = self.circuit_status().await?;
            match circuits.iter().find(|c| c.circuit_id == circuit_id) {
                Some(c) if c.state == CircuitState::Built => return Ok(()),
                Some(c) if c.state.is_terminal() => {
                    return Err(ControlError::rejected(format!(
                        "circuit {} {:?} while building",
                        circuit_id, c.state
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(ControlError::rejected(format!(
                        "circuit {} disappeared while building",
                        circuit_id
                    )));
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ControlError::timeout(format!(
                    "circuit {} did not build within {} seconds",
                    circuit_id,
                    self.command_timeout.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_millis(control::BUILD_POLL_INTERVAL_MS)).await;
        }
    }
}

#[async_trait]
impl ControlChannel for TorControlClient {
    async fn authenticate(&self) -> ControlResult<()> {
        let mut conn = ControlConnection::open(&self.addr).await?;
        match tokio::time::timeout(self.command_timeout, conn.authenticate(&self.auth)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ControlError::timeout(format!(
                    "AUTHENTICATE did not complete within {} seconds",
                    self.command_timeout.as_secs()
                )))
            }
        }

        *self.connection.lock().await = Some(conn);
        info!(addr = %self.addr, "Authenticated with control port");
        Ok(())
    }

    async fn get_relays(&self) -> ControlResult<Vec<Relay>> {
        let lines = self.command("GETINFO ns/all").await?;
        parse_router_status(&lines)
    }

    async fn circuit_status(&self) -> ControlResult<Vec<CircuitStatus>> {
        let lines = self.command("GETINFO circuit-status").await?;
        parse_circuit_status(&lines)
    }

    async fn get_relay_info(&self, fingerprint: &Fingerprint) -> ControlResult<RelayInfo> {
        let lines = self
            .command(&format!("GETINFO ns/id/{}", fingerprint.to_hex()))
            .await?;
        parse_relay_info(&lines)
    }

    async fn extend_circuit(&self, options: ExtendCircuitOptions) -> ControlResult<CircuitId> {
        if options.server_specs.is_empty() {
            return Err(ControlError::rejected("cannot extend a circuit with an empty path"));
        }

        let path = options
            .server_specs
            .iter()
            .map(|fp| format!("${}", fp.to_hex()))
            .collect::<Vec<_>>()
            .join(",");
        let lines = self
            .command(&format!(
                "EXTENDCIRCUIT 0 {} purpose={}",
                path,
                options.purpose.as_keyword()
            ))
            .await?;
        let circuit_id = parse_extended(&lines)?;
        debug!(circuit_id = %circuit_id, path = %path, "Circuit launched");

        if options.await_build {
            self.wait_for_build(circuit_id).await?;
        }

        Ok(circuit_id)
    }

    async fn close_circuit(&self, circuit_id: CircuitId) -> ControlResult<()> {
        self.command(&format!("CLOSECIRCUIT {}", circuit_id)).await?;
        Ok(())
    }

    async fn attach_stream(&self, stream_id: &str, circuit_id: CircuitId) -> ControlResult<()> {
        self.command(&format!("ATTACHSTREAM {} {}", stream_id, circuit_id))
            .await?;
        Ok(())
    }

    async fn disable_stream_attachment(&self) -> ControlResult<()> {
        self.command("SETCONF __LeaveStreamsUnattached=1").await?;
        Ok(())
    }

    async fn enable_stream_attachment(&self) -> ControlResult<()> {
        self.command("SETCONF __LeaveStreamsUnattached=0").await?;
        Ok(())
    }

    async fn subscribe_stream_events(&self) -> ControlResult<mpsc::Receiver<StreamEvent>> {
        let mut conn = ControlConnection::open(&self.addr).await?;
        conn.authenticate(&self.auth).await?;
        conn.command("SETEVENTS STREAM").await?;

        let (tx, rx) = mpsc::channel(control::EVENT_CHANNEL_CAPACITY);
        let handle = tokio::spawn(conn.forward_stream_events(tx));

        if let Some(previous) = self.event_task.lock().await.replace(handle) {
            previous.abort();
        }

        info!("Subscribed to stream events");
        Ok(rx)
    }

    async fn unsubscribe_stream_events(&self) -> ControlResult<()> {
        if let Some(handle) = self.event_task.lock().await.take() {
            handle.abort();
            info!("Unsubscribed from stream events");
        }
        Ok(())
    }

    async fn populate_countries(&self, relays: &mut [Relay]) -> ControlResult<()> {
        let mut ips: Vec<IpAddr> = relays.iter().map(|r| r.ip).collect();
        ips.sort();
        ips.dedup();

        let mut countries: HashMap<String, Option<CountryCode>> = HashMap::new();
        for chunk in ips.chunks(COUNTRY_BATCH) {
            let keys = chunk
                .iter()
                .map(|ip| format!("ip-to-country/{}", ip))
                .collect::<Vec<_>>()
                .join(" ");
            let lines = self.command(&format!("GETINFO {}", keys)).await?;
            countries.extend(parse_ip_to_country(&lines));
        }

        for relay in relays.iter_mut() {
            relay.country = countries.get(&relay.ip.to_string()).cloned().flatten();
        }

        Ok(())
    }
}

impl Drop for TorControlClient {
    fn drop(&mut self) {
        if let Ok(mut task) = self.event_task.try_lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    /// Serve scripted replies, one per received command line
    async fn scripted_server(replies: Vec<&'static str>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = socket.into_split();
            let mut reader = BufReader::new(read_half);
            let mut received = Vec::new();

            for reply in replies {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap() == 0 {
                    break;
                }
                received.push(line.trim_end().to_string());
                write_half.write_all(reply.as_bytes()).await.unwrap();
            }
            received
        });

        (addr, handle)
    }

    #[test]
    fn test_escape_control_string() {
        assert_eq!(escape_control_string("hello"), "hello");
        assert_eq!(escape_control_string("a\"b"), "a\\\"b");
        assert_eq!(escape_control_string("a\\b"), "a\\\\b");
    }

    #[tokio::test]
    async fn test_authenticate_and_circuit_status() {
        let fp = "C".repeat(40);
        let status: &'static str = Box::leak(
            format!(
                "250+circuit-status=\r\n5 BUILT ${0}~a,${0}~b,${0}~c PURPOSE=GENERAL\r\n.\r\n250 OK\r\n",
                fp
            )
            .into_boxed_str(),
        );
        let (addr, server) = scripted_server(vec!["250 OK\r\n", status]).await;

        let client = TorControlClient::connect(addr, ControlAuth::None).await.unwrap();
        let circuits = client.circuit_status().await.unwrap();

        assert_eq!(circuits.len(), 1);
        assert_eq!(circuits[0].circuit_id, CircuitId(5));
        assert_eq!(circuits[0].relays.len(), 3);

        let received = server.await.unwrap();
        assert_eq!(received, vec!["AUTHENTICATE", "GETINFO circuit-status"]);
    }

    #[tokio::test]
    async fn test_error_reply_is_rejected() {
        let (addr, _server) =
            scripted_server(vec!["250 OK\r\n", "552 Unknown circuit \"99\"\r\n"]).await;

        let client = TorControlClient::connect(addr, ControlAuth::None).await.unwrap();
        let err = client.close_circuit(CircuitId(99)).await.unwrap_err();

        assert_eq!(err.kind, anonroute_common::ControlErrorKind::Rejected);
        assert!(err.message.starts_with("552"));
    }

    #[tokio::test]
    async fn test_multiline_reply_ends_on_final_line() {
        let fp = "D".repeat(40);
        let relay: &'static str = Box::leak(
            format!(
                "650 STREAM 4 NEW 0 a.com:443\r\n250-ns/id/{0}=\r\n250-r relay9 {1} AAAA 2024-01-01 00:00:00 10.0.0.9 9001 0\r\n250 OK\r\n",
                fp,
                "3t3t3t3t3t3t3t3t3t3t3t3t3tM",
            )
            .into_boxed_str(),
        );
        let (addr, _server) = scripted_server(vec![
            "250 OK\r\n",
            "250-SETCONF partial\r\n553 Unable to set option\r\n",
            relay,
        ])
        .await;

        let client = TorControlClient::connect(addr, ControlAuth::None).await.unwrap();

        // The error line is final; the reply stops there and the connection stays usable
        let err = client.disable_stream_attachment().await.unwrap_err();
        assert!(err.message.starts_with("553"));

        let lines = client.command(&format!("GETINFO ns/id/{}", fp)).await.unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2], "OK");
    }

    #[tokio::test]
    async fn test_extend_without_waiting() {
        let (addr, server) = scripted_server(vec!["250 OK\r\n", "250 EXTENDED 17\r\n"]).await;

        let client = TorControlClient::connect(addr, ControlAuth::None).await.unwrap();
        let mut options = ExtendCircuitOptions::general(vec![
            Fingerprint::from_bytes([0xAA; 20]),
            Fingerprint::from_bytes([0xBB; 20]),
        ]);
        options.await_build = false;

        let id = client.extend_circuit(options).await.unwrap();
        assert_eq!(id, CircuitId(17));

        let received = server.await.unwrap();
        assert_eq!(
            received[1],
            format!(
                "EXTENDCIRCUIT 0 ${},${} purpose=general",
                "AA".repeat(20),
                "BB".repeat(20)
            )
        );
    }

    #[tokio::test]
    async fn test_closed_socket_is_connection_lost() {
        let (addr, _server) = scripted_server(vec!["250 OK\r\n"]).await;

        let client = TorControlClient::connect(addr, ControlAuth::None).await.unwrap();
        let err = client.circuit_status().await.unwrap_err();
        assert!(err.is_connection_lost());

        // The dead connection is dropped until the next authenticate
        let err = client.circuit_status().await.unwrap_err();
        assert!(err.message.contains("Connection refused"));
    }

    #[tokio::test]
    async fn test_populate_countries_batches_lookups() {
        let (addr, server) = scripted_server(vec![
            "250 OK\r\n",
            "250-ip-to-country/10.0.0.1=us\r\n250-ip-to-country/10.0.0.2=??\r\n250 OK\r\n",
        ])
        .await;

        let client = TorControlClient::connect(addr, ControlAuth::None).await.unwrap();
        let mut relays = vec![
            Relay::new(Fingerprint::from_bytes([1; 20]), "a", "10.0.0.1".parse().unwrap()),
            Relay::new(Fingerprint::from_bytes([2; 20]), "b", "10.0.0.2".parse().unwrap()),
            Relay::new(Fingerprint::from_bytes([3; 20]), "c", "10.0.0.1".parse().unwrap()),
        ];
        client.populate_countries(&mut relays).await.unwrap();

        assert_eq!(relays[0].country, Some(CountryCode::new("us")));
        assert_eq!(relays[1].country, None);
        assert_eq!(relays[2].country, Some(CountryCode::new("us")));

        let received = server.await.unwrap();
        assert_eq!(
            received[1],
            "GETINFO ip-to-country/10.0.0.1 ip-to-country/10.0.0.2"
        );
    }
}
