//! `NetStack` over `std::net`. On ESP-IDF these are lwIP sockets, on the host
//! the OS stack; either way each operation completes synchronously and its
//! outcome is queued for the dispatcher's next poll.

use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    thread,
    time::{Duration, Instant},
};

use log::debug;

use thermal_alarm_common::{NetEvent, NetStack};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 512;

/// Association with the wireless access point.
pub trait LinkControl {
    fn is_up(&mut self) -> bool;

    fn join(&mut self, ssid: &str, pass: &str, timeout: Duration) -> bool;
}

pub struct StdNetStack<L> {
    link: L,
    stream: Option<TcpStream>,
    events: VecDeque<NetEvent>,
    started: Instant,
}

impl<L: LinkControl> StdNetStack<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            stream: None,
            events: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn push(&mut self, event: NetEvent) {
        self.events.push_back(event);
    }
}

impl<L: LinkControl> NetStack for StdNetStack<L> {
    fn link_up(&mut self) -> bool {
        self.link.is_up()
    }

    fn join(&mut self, ssid: &str, pass: &str, timeout_ms: u64) -> bool {
        self.link.join(ssid, pass, Duration::from_millis(timeout_ms))
    }

    fn resolve(&mut self, host: &str) {
        let resolved = (host, 0_u16)
            .to_socket_addrs()
            .map(|mut addrs| addrs.next().map(|addr| addr.ip()));

        match resolved {
            Ok(Some(ip)) => self.push(NetEvent::Resolved(ip)),
            Ok(None) => {
                debug!("no addresses for {host}");
                self.push(NetEvent::ResolveFailed);
            }
            Err(err) => {
                debug!("lookup of {host} failed: {err}");
                self.push(NetEvent::ResolveFailed);
            }
        }
    }

    fn connect(&mut self, addr: SocketAddr) {
        self.events.clear();
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                let _ = stream.set_write_timeout(Some(WRITE_TIMEOUT));
                self.stream = Some(stream);
                self.push(NetEvent::Connected);
            }
            Err(err) => {
                debug!("connect to {addr} failed: {err}");
                self.push(NetEvent::ConnectFailed);
            }
        }
    }

    fn write(&mut self, data: &[u8]) {
        let Some(stream) = self.stream.as_mut() else {
            self.push(NetEvent::Error("not connected".to_string()));
            return;
        };

        let result = stream
            .write_all(data)
            .and_then(|()| stream.flush())
            .and_then(|()| stream.set_nonblocking(true));
        match result {
            Ok(()) => self.push(NetEvent::Sent),
            Err(err) => self.push(NetEvent::Error(err.to_string())),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.events.clear();
    }

    fn poll(&mut self) -> Option<NetEvent> {
        if let Some(event) = self.events.pop_front() {
            return Some(event);
        }

        let stream = self.stream.as_mut()?;
        let mut buffer = [0_u8; READ_CHUNK];
        match stream.read(&mut buffer) {
            Ok(0) => {
                self.stream = None;
                Some(NetEvent::Closed)
            }
            Ok(len) => Some(NetEvent::Received(buffer[..len].to_vec())),
            Err(err) if err.kind() == ErrorKind::WouldBlock => None,
            Err(err) if err.kind() == ErrorKind::Interrupted => None,
            Err(err) => {
                self.stream = None;
                Some(NetEvent::Error(err.to_string()))
            }
        }
    }

    fn sleep_ms(&mut self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    fn now_ms(&mut self) -> u64 {
        self.started
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}
