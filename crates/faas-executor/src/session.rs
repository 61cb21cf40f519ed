//! Invocation Session (C2): drives one `/init` + `/run` HTTP exchange with a
//! single instance over a dedicated TCP connection.
//!
//! Grounded on the framing style of `firecracker/communication/vsock.rs` and
//! `faas-guest-agent/src/main.rs`, adapted from vsock-framed RPC to plain
//! HTTP/1.0-over-TCP per the wire format in `wire.rs`.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{instrument, warn};

use crate::error::EngineError;
use crate::wire;

/// One step of the wire-level exchange, recorded for tests that assert on
/// presence/absence of `/init` in a session's trace (see spec scenarios
/// S1-S3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireEvent {
    Connected,
    Init,
    Initialized,
    Run,
    Executed,
    Closed,
    Aborted,
}

/// Drives one session against a single VM instance's loopback HTTP endpoint.
pub struct InvocationSession {
    transaction_id: String,
    remote: SocketAddr,
    local_port: u16,
    connect_timeout: Duration,
    invocation_timeout: Duration,
    stream: Option<TcpStream>,
    is_initialized: bool,
    last_reply: String,
    trace: Vec<WireEvent>,
    finished: Option<bool>,
    init_sent_at: Option<Instant>,
    run_sent_at: Option<Instant>,
    init_time_ms: u64,
    run_time_ms: u64,
}

pub enum ResponseKind {
    Initialized,
    Executed,
}

impl InvocationSession {
    pub fn new(
        transaction_id: impl Into<String>,
        remote: SocketAddr,
        local_port: u16,
        connect_timeout: Duration,
        invocation_timeout: Duration,
    ) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            remote,
            local_port,
            connect_timeout,
            invocation_timeout,
            stream: None,
            is_initialized: false,
            last_reply: String::new(),
            trace: Vec::new(),
            finished: None,
            init_sent_at: None,
            run_sent_at: None,
            init_time_ms: 0,
            run_time_ms: 0,
        }
    }

    /// `connect()`: TCP SYN bound to this session's reserved source port,
    /// deadline = `CONNECT_TIMEOUT_MS`.
    #[instrument(skip(self), fields(transaction_id = %self.transaction_id, port = self.local_port))]
    pub async fn connect(&mut self) -> Result<(), EngineError> {
        let connect_fut = async {
            let socket = match self.remote.ip() {
                IpAddr::V4(_) => TcpSocket::new_v4(),
                IpAddr::V6(_) => TcpSocket::new_v6(),
            }
            .map_err(|e| EngineError::Transport {
                transaction_id: self.transaction_id.clone(),
                source: e,
            })?;
            let local_addr = SocketAddr::new(
                if self.remote.is_ipv4() {
                    IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
                } else {
                    IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
                },
                self.local_port,
            );
            socket.bind(local_addr).map_err(|e| EngineError::Transport {
                transaction_id: self.transaction_id.clone(),
                source: e,
            })?;
            socket
                .connect(self.remote)
                .await
                .map_err(|e| EngineError::Transport {
                    transaction_id: self.transaction_id.clone(),
                    source: e,
                })
        };

        match timeout(self.connect_timeout, connect_fut).await {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                self.trace.push(WireEvent::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                self.trace.push(WireEvent::Aborted);
                Err(e)
            }
            Err(_) => {
                self.trace.push(WireEvent::Aborted);
                Err(EngineError::Timeout {
                    phase: "connect",
                    transaction_id: self.transaction_id.clone(),
                })
            }
        }
    }

    /// `send(path, payload, keep_alive)`.
    #[instrument(skip(self, payload), fields(transaction_id = %self.transaction_id, path = path))]
    pub async fn send(&mut self, path: &str, payload: &str, keep_alive: bool) -> Result<(), EngineError> {
        if payload.is_empty() {
            return Err(EngineError::InvalidArgument(format!(
                "empty payload for {path}"
            )));
        }
        let body = match path {
            "/init" => wire::init_body(payload),
            _ => wire::run_body(payload),
        };
        let request = wire::http_request(path, &body, keep_alive);

        let now = Instant::now();
        if path == "/init" {
            self.init_sent_at = Some(now);
            self.trace.push(WireEvent::Init);
        } else {
            self.run_sent_at = Some(now);
            self.trace.push(WireEvent::Run);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::Protocol {
                transaction_id: self.transaction_id.clone(),
                detail: "send() called before connect()".to_string(),
            })?;
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| EngineError::Transport {
                transaction_id: self.transaction_id.clone(),
                source: e,
            })
    }

    /// Awaits the next well-formed response, classifying it as `initialized`
    /// or `executed` per §4.1, enforcing the invocation-phase deadline.
    #[instrument(skip(self), fields(transaction_id = %self.transaction_id))]
    pub async fn await_response(&mut self) -> Result<ResponseKind, EngineError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::Protocol {
                transaction_id: self.transaction_id.clone(),
                detail: "await_response() called before connect()".to_string(),
            })?;

        let read_fut = wire::read_http_response(stream);
        match timeout(self.invocation_timeout, read_fut).await {
            Ok(Ok(resp)) if resp.ok => {
                if !self.is_initialized && resp.body == r#"{"OK":true}"# {
                    self.is_initialized = true;
                    if let Some(sent) = self.init_sent_at {
                        self.init_time_ms = sent.elapsed().as_millis() as u64;
                    }
                    self.trace.push(WireEvent::Initialized);
                    Ok(ResponseKind::Initialized)
                } else {
                    self.last_reply = resp.body;
                    if let Some(sent) = self.run_sent_at {
                        self.run_time_ms = sent.elapsed().as_millis() as u64;
                    }
                    self.trace.push(WireEvent::Executed);
                    Ok(ResponseKind::Executed)
                }
            }
            Ok(Ok(resp)) => {
                self.last_reply = resp.body;
                self.trace.push(WireEvent::Aborted);
                Err(EngineError::Protocol {
                    transaction_id: self.transaction_id.clone(),
                    detail: "non-200 response".to_string(),
                })
            }
            Ok(Err(e)) => {
                self.trace.push(WireEvent::Aborted);
                Err(EngineError::Transport {
                    transaction_id: self.transaction_id.clone(),
                    source: e,
                })
            }
            Err(_) => {
                self.trace.push(WireEvent::Aborted);
                Err(EngineError::Timeout {
                    phase: "invocation",
                    transaction_id: self.transaction_id.clone(),
                })
            }
        }
    }

    /// Local `close()`: shuts the write half down; idempotent with abort.
    pub async fn close(&mut self) {
        if let Some(stream) = self.stream.as_mut() {
            if let Err(e) = stream.shutdown().await {
                warn!(transaction_id = %self.transaction_id, error = %e, "error shutting down session stream");
            }
        }
        self.trace.push(WireEvent::Closed);
    }

    /// `finish(success)`: idempotent terminal signal.
    pub fn finish(&mut self, success: bool) -> bool {
        if self.finished.is_some() {
            return false;
        }
        self.finished = Some(success);
        true
    }

    pub fn reply(&self) -> &str {
        &self.last_reply
    }

    pub fn timings(&self) -> (u64, u64) {
        (self.init_time_ms, self.run_time_ms)
    }

    pub fn trace(&self) -> &[WireEvent] {
        &self.trace
    }

    pub fn sent_init(&self) -> bool {
        self.trace.iter().any(|e| matches!(e, WireEvent::Init))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_is_idempotent() {
        let mut session = InvocationSession::new(
            "t1",
            "127.0.0.1:8080".parse().unwrap(),
            20_000,
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        assert!(session.finish(true));
        assert!(!session.finish(false));
    }

    #[tokio::test]
    async fn send_rejects_empty_payload() {
        let mut session = InvocationSession::new(
            "t1",
            "127.0.0.1:8080".parse().unwrap(),
            20_001,
            Duration::from_millis(100),
            Duration::from_millis(100),
        );
        let err = session.send("/run", "", false).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }
}
