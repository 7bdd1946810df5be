//! Best-effort delivery of one alert as one HTTP POST.
//!
//! The network stack is completion-driven: operations are started, and their
//! outcome arrives later as a [`NetEvent`] from [`NetStack::poll`]. The
//! dispatcher walks an explicit state machine over those events and gives up at
//! a fixed deadline, so a hung peer cannot stall the caller indefinitely.

use core::fmt;
use std::net::{IpAddr, SocketAddr};

use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;

use crate::{
    config::NetworkConfig,
    types::{AlertPayload, AlertRequest},
};

/// Wait between two empty polls.
const POLL_INTERVAL_MS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    Resolved(IpAddr),
    ResolveFailed,
    Connected,
    ConnectFailed,
    Sent,
    Received(Vec<u8>),
    Closed,
    Error(String),
}

/// A wireless link plus a single TCP connection, driven by polling.
pub trait NetStack {
    fn link_up(&mut self) -> bool;

    /// Associates with the access point, blocking for at most `timeout_ms`.
    fn join(&mut self, ssid: &str, pass: &str, timeout_ms: u64) -> bool;

    fn resolve(&mut self, host: &str);

    fn connect(&mut self, addr: SocketAddr);

    /// Queues `data` as a single write on the open connection.
    fn write(&mut self, data: &[u8]);

    fn close(&mut self);

    fn poll(&mut self) -> Option<NetEvent>;

    fn sleep_ms(&mut self, ms: u32);

    fn now_ms(&mut self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Resolving,
    Connecting,
    Sending,
    AwaitingResponse,
    Done,
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::Connecting => "connecting",
            Self::Sending => "sending",
            Self::AwaitingResponse => "awaiting response",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("wireless link is not associated")]
    LinkDisconnected,
    #[error("alert body could not be encoded: {0}")]
    Encode(String),
    #[error("could not resolve {0}")]
    DnsFailure(String),
    #[error("TCP connect to {0} failed")]
    TcpConnectFailure(SocketAddr),
    #[error("request write failed")]
    SendFailure,
    #[error("server answered `{0}`")]
    HttpNon200(String),
    #[error("connection closed without a response")]
    NoResponse,
    #[error("deadline expired while {phase}")]
    Timeout { phase: DispatchPhase },
}

pub struct AlertDispatcher<N> {
    net: N,
    config: NetworkConfig,
    sent: u64,
    failed: u64,
}

impl<N: NetStack> AlertDispatcher<N> {
    pub fn new(net: N, config: NetworkConfig) -> Self {
        Self {
            net,
            config,
            sent: 0,
            failed: 0,
        }
    }

    pub fn net_mut(&mut self) -> &mut N {
        &mut self.net
    }

    pub fn alerts_sent(&self) -> u64 {
        self.sent
    }

    pub fn alerts_failed(&self) -> u64 {
        self.failed
    }

    /// Initial association at boot. Failure is not fatal; `send` rejoins on demand.
    pub fn join_link(&mut self) -> bool {
        if self.config.wifi_ssid.is_empty() {
            warn!("no WiFi SSID configured; skipping join");
            return false;
        }

        info!("joining WiFi network '{}'", self.config.wifi_ssid);
        let joined = self.net.join(
            &self.config.wifi_ssid,
            &self.config.wifi_pass,
            self.config.join_timeout_ms,
        );
        if joined {
            info!("WiFi connected");
        } else {
            warn!(
                "WiFi join timed out after {} ms; continuing offline",
                self.config.join_timeout_ms
            );
        }
        joined
    }

    /// Delivers `request`, logging any failure. Returns whether the server accepted it.
    pub fn send(&mut self, request: &AlertRequest) -> bool {
        match self.try_send(request) {
            Ok(()) => {
                self.sent += 1;
                info!("alert delivered for {}", request.device_id.as_str());
                true
            }
            Err(err) => {
                self.failed += 1;
                warn!("alert not delivered: {err}");
                false
            }
        }
    }

    pub fn try_send(&mut self, request: &AlertRequest) -> Result<(), DispatchError> {
        self.ensure_link()?;

        let payload = AlertPayload::detected(request, &self.config.sensor_identifier);
        let body = encode_body(&payload)?;
        let message = build_request(&self.config, &body);

        let result = self.exchange(message.as_bytes());
        self.net.close();
        result
    }

    fn ensure_link(&mut self) -> Result<(), DispatchError> {
        if self.net.link_up() {
            return Ok(());
        }

        for attempt in 1..=self.config.rejoin_attempts {
            debug!(
                "link down, rejoin attempt {attempt}/{}",
                self.config.rejoin_attempts
            );
            let joined = self.net.join(
                &self.config.wifi_ssid,
                &self.config.wifi_pass,
                self.config.rejoin_timeout_ms,
            );
            if joined && self.net.link_up() {
                return Ok(());
            }
        }

        Err(DispatchError::LinkDisconnected)
    }

    fn exchange(&mut self, message: &[u8]) -> Result<(), DispatchError> {
        let deadline_ms = self
            .net
            .now_ms()
            .saturating_add(self.config.dispatch_deadline_ms);

        let mut exchange = Exchange::start(
            &mut self.net,
            &self.config.alert_host,
            self.config.alert_port,
        );

        loop {
            let Some(event) = self.net.poll() else {
                if self.net.now_ms() >= deadline_ms {
                    return Err(DispatchError::Timeout {
                        phase: exchange.phase,
                    });
                }
                self.net.sleep_ms(POLL_INTERVAL_MS);
                continue;
            };

            if let Some(outcome) = exchange.on_event(&mut self.net, event, message) {
                debug!("exchange {}", DispatchPhase::Done);
                return outcome;
            }
        }
    }
}

/// Progress of one request/response exchange.
struct Exchange {
    phase: DispatchPhase,
    host: String,
    target: SocketAddr,
    response: Vec<u8>,
}

impl Exchange {
    fn start<N: NetStack>(net: &mut N, host: &str, port: u16) -> Self {
        let mut exchange = Self {
            phase: DispatchPhase::Resolving,
            host: host.to_string(),
            target: SocketAddr::from(([0, 0, 0, 0], port)),
            response: Vec::new(),
        };

        match host.parse::<IpAddr>() {
            Ok(ip) => exchange.connect(net, ip),
            Err(_) => {
                debug!("resolving {host}");
                net.resolve(host);
            }
        }
        exchange
    }

    fn connect<N: NetStack>(&mut self, net: &mut N, ip: IpAddr) {
        self.target.set_ip(ip);
        debug!("connecting to {}", self.target);
        net.connect(self.target);
        self.phase = DispatchPhase::Connecting;
    }

    /// Advances on one event. `Some` carries the final outcome.
    fn on_event<N: NetStack>(
        &mut self,
        net: &mut N,
        event: NetEvent,
        message: &[u8],
    ) -> Option<Result<(), DispatchError>> {
        use DispatchPhase::{AwaitingResponse, Connecting, Resolving, Sending};

        match (self.phase, event) {
            (Resolving, NetEvent::Resolved(ip)) => {
                self.connect(net, ip);
                None
            }
            (Resolving, NetEvent::ResolveFailed | NetEvent::Error(_) | NetEvent::Closed) => {
                Some(Err(DispatchError::DnsFailure(self.host.clone())))
            }
            (Connecting, NetEvent::Connected) => {
                debug!("connected, writing {} bytes", message.len());
                net.write(message);
                self.phase = Sending;
                None
            }
            (Connecting, NetEvent::ConnectFailed | NetEvent::Error(_) | NetEvent::Closed) => {
                Some(Err(DispatchError::TcpConnectFailure(self.target)))
            }
            (Sending, NetEvent::Sent) => {
                debug!("request written, awaiting response");
                self.phase = AwaitingResponse;
                None
            }
            (Sending, NetEvent::Error(err)) => {
                debug!("write failed: {err}");
                Some(Err(DispatchError::SendFailure))
            }
            (Sending | AwaitingResponse, NetEvent::Received(bytes)) => {
                self.phase = AwaitingResponse;
                self.response.extend_from_slice(&bytes);
                status_line(&self.response, false).map(check_status)
            }
            (Sending | AwaitingResponse, NetEvent::Closed) => {
                Some(match status_line(&self.response, true) {
                    Some(line) => check_status(line),
                    None => Err(DispatchError::NoResponse),
                })
            }
            (AwaitingResponse, NetEvent::Error(err)) => {
                debug!("connection error before response: {err}");
                Some(Err(DispatchError::NoResponse))
            }
            (phase, event) => {
                debug!("ignoring {event:?} while {phase}");
                None
            }
        }
    }
}

fn encode_body<T: Serialize>(payload: &T) -> Result<String, DispatchError> {
    serde_json::to_string(payload).map_err(|err| DispatchError::Encode(err.to_string()))
}

/// One HTTP/1.1 POST, complete with headers, sent in a single write.
pub fn build_request(config: &NetworkConfig, body: &str) -> String {
    let host = if config.alert_port == 80 {
        config.alert_host.clone()
    } else {
        format!("{}:{}", config.alert_host, config.alert_port)
    };

    format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {len}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        path = config.alert_path,
        len = body.len(),
    )
}

/// Extracts the first response line once it is complete (or at end of stream).
fn status_line(buffer: &[u8], at_eof: bool) -> Option<&str> {
    let end = match buffer.windows(2).position(|pair| pair == b"\r\n") {
        Some(end) => end,
        None if at_eof && !buffer.is_empty() => buffer.len(),
        None => return None,
    };
    Some(std::str::from_utf8(&buffer[..end]).unwrap_or("<binary>").trim())
}

/// A response is accepted only when its status code token is exactly `200`.
pub fn status_code(line: &str) -> Option<u16> {
    let mut parts = line.split_whitespace();
    let version = parts.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

fn check_status(line: &str) -> Result<(), DispatchError> {
    match status_code(line) {
        Some(200) => Ok(()),
        _ => Err(DispatchError::HttpNon200(line.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::types::DeviceIdentity;

    #[derive(Default)]
    struct ScriptedNet {
        link: bool,
        join_succeeds: bool,
        dns: Option<IpAddr>,
        connect_ok: bool,
        response: Option<&'static str>,
        now: u64,
        queue: VecDeque<NetEvent>,
        joins: Vec<u64>,
        resolves: Vec<String>,
        connects: Vec<SocketAddr>,
        written: Vec<u8>,
        closes: u32,
    }

    impl ScriptedNet {
        fn healthy(response: &'static str) -> Self {
            Self {
                link: true,
                join_succeeds: true,
                dns: Some(IpAddr::from([10, 0, 0, 7])),
                connect_ok: true,
                response: Some(response),
                ..Self::default()
            }
        }
    }

    impl NetStack for ScriptedNet {
        fn link_up(&mut self) -> bool {
            self.link
        }

        fn join(&mut self, _ssid: &str, _pass: &str, timeout_ms: u64) -> bool {
            self.joins.push(timeout_ms);
            self.link = self.join_succeeds;
            self.join_succeeds
        }

        fn resolve(&mut self, host: &str) {
            self.resolves.push(host.to_string());
            self.queue.push_back(match self.dns {
                Some(ip) => NetEvent::Resolved(ip),
                None => NetEvent::ResolveFailed,
            });
        }

        fn connect(&mut self, addr: SocketAddr) {
            self.connects.push(addr);
            self.queue.push_back(if self.connect_ok {
                NetEvent::Connected
            } else {
                NetEvent::ConnectFailed
            });
        }

        fn write(&mut self, data: &[u8]) {
            self.written.extend_from_slice(data);
            self.queue.push_back(NetEvent::Sent);
            if let Some(response) = self.response {
                self.queue
                    .push_back(NetEvent::Received(response.as_bytes().to_vec()));
                self.queue.push_back(NetEvent::Closed);
            }
        }

        fn close(&mut self) {
            self.closes += 1;
        }

        fn poll(&mut self) -> Option<NetEvent> {
            self.queue.pop_front()
        }

        fn sleep_ms(&mut self, ms: u32) {
            self.now += u64::from(ms);
        }

        fn now_ms(&mut self) -> u64 {
            self.now
        }
    }

    fn config() -> NetworkConfig {
        NetworkConfig {
            wifi_ssid: "lab".to_string(),
            wifi_pass: "secret".to_string(),
            alert_host: "alerts.example.com".to_string(),
            ..NetworkConfig::default()
        }
    }

    fn request() -> AlertRequest {
        AlertRequest {
            device_id: DeviceIdentity::new("thermal-test"),
            temperature: 33,
            threshold_max: 32,
            threshold_min: -8,
        }
    }

    #[test]
    fn delivers_one_post_and_closes() {
        let mut dispatcher =
            AlertDispatcher::new(ScriptedNet::healthy("HTTP/1.1 200 OK\r\n\r\n"), config());

        assert!(dispatcher.send(&request()));
        assert_eq!(dispatcher.alerts_sent(), 1);

        let net = dispatcher.net_mut();
        assert_eq!(net.resolves, vec!["alerts.example.com".to_string()]);
        assert_eq!(net.connects, vec![SocketAddr::from(([10, 0, 0, 7], 80))]);
        assert_eq!(net.closes, 1);

        let text = String::from_utf8(net.written.clone()).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("POST /alerts HTTP/1.1\r\n"));
        assert!(head.contains("Host: alerts.example.com\r\n"));
        assert!(head.contains("Content-Type: application/json"));
        assert!(head.contains(&format!("Content-Length: {}", body.len())));
        assert!(head.ends_with("Connection: close"));

        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(json["status"], "DETECTED");
        assert_eq!(json["sensorIdentifier"], "S01");
        assert_eq!(json["deviceId"], "thermal-test");
    }

    #[test]
    fn numeric_host_skips_dns() {
        let config = NetworkConfig {
            alert_host: "192.168.1.100".to_string(),
            alert_port: 8080,
            ..config()
        };
        let mut dispatcher =
            AlertDispatcher::new(ScriptedNet::healthy("HTTP/1.0 200 OK\r\n"), config);

        assert_eq!(dispatcher.try_send(&request()), Ok(()));
        let net = dispatcher.net_mut();
        assert!(net.resolves.is_empty());
        assert_eq!(net.connects, vec![SocketAddr::from(([192, 168, 1, 100], 8080))]);
        assert!(String::from_utf8_lossy(&net.written).contains("Host: 192.168.1.100:8080\r\n"));
    }

    #[test]
    fn only_status_code_200_counts_as_success() {
        for (response, accepted) in [
            ("HTTP/1.1 200 OK\r\n", true),
            ("HTTP/1.0 200 OK\r\n", true),
            ("HTTP/1.1 404 Not Found\r\n", false),
            ("HTTP/1.1 500 Error 200\r\n", false),
            ("HTTP/1.1 2000 Odd\r\n", false),
        ] {
            let mut dispatcher = AlertDispatcher::new(ScriptedNet::healthy(response), config());
            assert_eq!(dispatcher.send(&request()), accepted, "{response:?}");
        }
    }

    #[test]
    fn dns_failure_is_reported() {
        let mut net = ScriptedNet::healthy("HTTP/1.1 200 OK\r\n");
        net.dns = None;
        let mut dispatcher = AlertDispatcher::new(net, config());

        assert_eq!(
            dispatcher.try_send(&request()),
            Err(DispatchError::DnsFailure("alerts.example.com".to_string()))
        );
        assert!(dispatcher.net_mut().connects.is_empty());
        assert_eq!(dispatcher.net_mut().closes, 1);
    }

    #[test]
    fn refused_connection_is_reported() {
        let mut net = ScriptedNet::healthy("HTTP/1.1 200 OK\r\n");
        net.connect_ok = false;
        let mut dispatcher = AlertDispatcher::new(net, config());

        assert_eq!(
            dispatcher.try_send(&request()),
            Err(DispatchError::TcpConnectFailure(SocketAddr::from((
                [10, 0, 0, 7],
                80
            ))))
        );
        assert!(dispatcher.net_mut().written.is_empty());
    }

    /// Peer hangs up right after the request is written.
    struct HangUp(ScriptedNet);

    impl NetStack for HangUp {
        fn link_up(&mut self) -> bool {
            self.0.link_up()
        }

        fn join(&mut self, ssid: &str, pass: &str, timeout_ms: u64) -> bool {
            self.0.join(ssid, pass, timeout_ms)
        }

        fn resolve(&mut self, host: &str) {
            self.0.resolve(host)
        }

        fn connect(&mut self, addr: SocketAddr) {
            self.0.connect(addr)
        }

        fn write(&mut self, data: &[u8]) {
            self.0.write(data);
            self.0.queue.push_back(NetEvent::Closed);
        }

        fn close(&mut self) {
            self.0.close()
        }

        fn poll(&mut self) -> Option<NetEvent> {
            self.0.poll()
        }

        fn sleep_ms(&mut self, ms: u32) {
            self.0.sleep_ms(ms)
        }

        fn now_ms(&mut self) -> u64 {
            self.0.now_ms()
        }
    }

    #[test]
    fn close_without_response_fails() {
        let mut net = ScriptedNet::healthy("");
        net.response = None;
        let mut dispatcher = AlertDispatcher::new(HangUp(net), config());

        assert_eq!(
            dispatcher.try_send(&request()),
            Err(DispatchError::NoResponse)
        );
        assert_eq!(dispatcher.net_mut().0.closes, 1);
    }

    #[test]
    fn stalled_peer_hits_the_deadline() {
        let mut net = ScriptedNet::healthy("");
        net.response = None;
        let config = NetworkConfig {
            dispatch_deadline_ms: 3_000,
            ..config()
        };
        let mut dispatcher = AlertDispatcher::new(net, config);

        assert_eq!(
            dispatcher.try_send(&request()),
            Err(DispatchError::Timeout {
                phase: DispatchPhase::AwaitingResponse
            })
        );
        let net = dispatcher.net_mut();
        assert!(net.now >= 3_000 && net.now < 3_000 + 2 * u64::from(POLL_INTERVAL_MS));
        assert_eq!(net.closes, 1);
    }

    #[test]
    fn down_link_is_rejoined_with_short_timeout() {
        let mut net = ScriptedNet::healthy("HTTP/1.1 200 OK\r\n");
        net.link = false;
        let mut dispatcher = AlertDispatcher::new(net, config());

        assert!(dispatcher.send(&request()));
        assert_eq!(dispatcher.net_mut().joins, vec![1_000]);
    }

    #[test]
    fn failed_rejoin_skips_the_exchange() {
        let mut net = ScriptedNet::healthy("HTTP/1.1 200 OK\r\n");
        net.link = false;
        net.join_succeeds = false;
        let mut dispatcher = AlertDispatcher::new(net, config());

        assert_eq!(
            dispatcher.try_send(&request()),
            Err(DispatchError::LinkDisconnected)
        );
        assert!(!dispatcher.send(&request()));
        assert_eq!(dispatcher.alerts_failed(), 1);
        assert!(dispatcher.net_mut().resolves.is_empty());
    }

    #[test]
    fn unencodable_body_is_an_error_not_an_empty_post() {
        use std::collections::BTreeMap;

        let mut body = BTreeMap::new();
        body.insert((1_u8, 2_u8), "tuple keys have no JSON form");

        assert!(matches!(encode_body(&body), Err(DispatchError::Encode(_))));
    }

    #[test]
    fn alert_payload_encodes_as_json() {
        let request = request();
        let payload = AlertPayload::detected(&request, "S01");
        let body = encode_body(&payload).unwrap();

        assert!(body.starts_with('{'));
        assert!(body.contains("\"sensorIdentifier\":\"S01\""));
    }

    #[test]
    fn status_code_parsing() {
        assert_eq!(status_code("HTTP/1.1 200 OK"), Some(200));
        assert_eq!(status_code("HTTP/1.0 503"), Some(503));
        assert_eq!(status_code("200 OK"), None);
        assert_eq!(status_code(""), None);
    }
}
