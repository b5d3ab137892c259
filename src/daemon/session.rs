// src/daemon/session.rs
//
// Session bookkeeping for the daemon socket. Nothing here touches I/O: the
// channel actor feeds bytes and connection outcomes in and forwards whatever
// events come out.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::{debug, error, warn};

use super::protocol::{DaemonMessage, StatusReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Unknown,
    Initializing,
    Ready,
    /// The daemon went away after we were Ready. Connectable again, but not
    /// re-initialized on its own.
    Detached,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    StateChanged(DaemonState),
    Initialized { connected: bool, since: Option<DateTime<Utc>> },
    InitializationFailed { attempts: u32 },
    Status(StatusReport),
    Connected { pubkey: String },
    Disconnected,
    BackendFailure,
    Logs(String),
    TransportClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    GiveUp { attempts: u32 },
}

pub struct DaemonSession {
    state: DaemonState,
    retries: u32,
    max_retries: u32,
    buffer: BytesMut,
    codec: LinesCodec,
}

impl DaemonSession {
    pub fn new(max_retries: u32, max_line_length: usize) -> Self {
        Self {
            state: DaemonState::Unknown,
            retries: 0,
            max_retries,
            buffer: BytesMut::new(),
            codec: LinesCodec::new_with_max_length(max_line_length),
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    /// Returns false when a connection attempt is already running or done.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            DaemonState::Unknown | DaemonState::Detached => {
                self.state = DaemonState::Initializing;
                self.retries = 0;
                self.reset_framing();
                true
            }
            DaemonState::Initializing | DaemonState::Ready => false,
        }
    }

    // The codec keeps a scan offset into the buffer; both go together.
    fn reset_framing(&mut self) {
        self.buffer.clear();
        self.codec = LinesCodec::new_with_max_length(self.codec.max_length());
    }

    pub fn on_connect_failed(&mut self) -> RetryDecision {
        if self.retries < self.max_retries {
            self.retries += 1;
            warn!(attempt = self.retries, max = self.max_retries, "daemon not reachable, retrying");
            RetryDecision::Retry
        } else {
            let attempts = self.retries + 1;
            self.retries = 0;
            self.state = DaemonState::Unknown;
            RetryDecision::GiveUp { attempts }
        }
    }

    /// Returns the state the session was in before the transport closed.
    pub fn on_transport_closed(&mut self) -> DaemonState {
        let previous = self.state;
        if previous == DaemonState::Ready {
            self.state = DaemonState::Detached;
        }
        self.reset_framing();
        previous
    }

    /// Appends raw socket bytes and returns events for every complete line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DaemonEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(line)) => events.extend(self.handle_line(&line)),
                Ok(None) => break,
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(max = self.codec.max_length(), "oversized daemon line dropped");
                }
                // The codec has already consumed the offending line.
                Err(LinesCodecError::Io(err)) => {
                    warn!(%err, "undecodable daemon line dropped");
                }
            }
        }
        events
    }

    fn handle_line(&mut self, line: &str) -> Option<DaemonEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let message: DaemonMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, line, "malformed daemon line dropped");
                return None;
            }
        };
        debug!(?message, "daemon message");

        match (self.state, message) {
            (DaemonState::Initializing, DaemonMessage::Status(report)) => {
                self.state = DaemonState::Ready;
                self.retries = 0;
                Some(DaemonEvent::Initialized {
                    connected: report.connected,
                    since: report.date.as_deref().and_then(parse_date),
                })
            }
            (DaemonState::Ready, DaemonMessage::Status(report)) => Some(DaemonEvent::Status(report)),
            (DaemonState::Ready, DaemonMessage::Connected { pubkey }) => Some(DaemonEvent::Connected { pubkey }),
            (DaemonState::Ready, DaemonMessage::Disconnected) => Some(DaemonEvent::Disconnected),
            (DaemonState::Ready, DaemonMessage::BackendFailure) => {
                error!("daemon reported a backend failure");
                Some(DaemonEvent::BackendFailure)
            }
            (DaemonState::Ready, DaemonMessage::Logs { logs }) => {
                Some(DaemonEvent::Logs(logs.unwrap_or_default().replace('|', "\n")))
            }
            (state, message) => {
                warn!(?state, ?message, "daemon message ignored in this state");
                None
            }
        }
    }
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(value) {
        Ok(date) => Some(date.with_timezone(&Utc)),
        Err(err) => {
            warn!(%err, value, "daemon reported an unreadable connection date");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> DaemonSession {
        let mut session = DaemonSession::new(10, 1024);
        assert!(session.begin_connect());
        session.feed(b"{\"type\":\"status\",\"connected\":false}\n");
        assert_eq!(session.state(), DaemonState::Ready);
        session
    }

    #[test]
    fn first_status_completes_initialization() {
        let mut session = DaemonSession::new(10, 1024);
        session.begin_connect();
        let events = session.feed(b"{\"type\":\"status\",\"connected\":true,\"date\":\"2026-01-02T03:04:05Z\"}\n");
        assert_eq!(session.state(), DaemonState::Ready);
        match &events[..] {
            [DaemonEvent::Initialized { connected: true, since: Some(since) }] => {
                assert_eq!(since.to_rfc3339(), "2026-01-02T03:04:05+00:00");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fragmented_line_yields_one_message() {
        let mut session = ready();
        assert!(session.feed(b"{\"type\":\"sta").is_empty());
        assert!(session.feed(b"tus\",\"connected\":fa").is_empty());
        let events = session.feed(b"lse}\n");
        assert_eq!(events, vec![DaemonEvent::Status(StatusReport::default())]);
    }

    #[test]
    fn several_lines_in_one_read() {
        let mut session = ready();
        let events = session.feed(b"{\"type\":\"connected\",\"pubkey\":\"k\"}\r\n\n{\"type\":\"disconnected\"}\n");
        assert_eq!(
            events,
            vec![DaemonEvent::Connected { pubkey: "k".into() }, DaemonEvent::Disconnected]
        );
    }

    #[test]
    fn malformed_and_unknown_lines_are_dropped() {
        let mut session = ready();
        let events = session.feed(b"not json\n{\"type\":\"reboot\"}\n{\"type\":\"backendFailure\"}\n");
        assert_eq!(events, vec![DaemonEvent::BackendFailure]);
        assert_eq!(session.state(), DaemonState::Ready);
    }

    #[test]
    fn oversized_line_is_skipped() {
        let mut session = DaemonSession::new(10, 32);
        session.begin_connect();
        let mut bytes = vec![b'x'; 64];
        bytes.extend_from_slice(b"\n{\"type\":\"status\"}\n");
        let events = session.feed(&bytes);
        assert!(matches!(events[..], [DaemonEvent::Initialized { connected: false, .. }]));
    }

    #[test]
    fn invalid_utf8_line_does_not_stall_the_handshake() {
        let mut session = DaemonSession::new(10, 1024);
        session.begin_connect();
        let events = session.feed(b"\xff\xfe\n{\"type\":\"status\",\"connected\":false}\n");
        assert!(matches!(events[..], [DaemonEvent::Initialized { connected: false, .. }]));
        assert_eq!(session.state(), DaemonState::Ready);
    }

    #[test]
    fn messages_before_status_are_ignored() {
        let mut session = DaemonSession::new(10, 1024);
        session.begin_connect();
        assert!(session.feed(b"{\"type\":\"connected\",\"pubkey\":\"k\"}\n").is_empty());
        assert_eq!(session.state(), DaemonState::Initializing);
    }

    #[test]
    fn logs_restore_newlines() {
        let mut session = ready();
        let events = session.feed(b"{\"type\":\"logs\",\"logs\":\"one|two\"}\n");
        assert_eq!(events, vec![DaemonEvent::Logs("one\ntwo".into())]);
    }

    #[test]
    fn retries_are_bounded() {
        let mut session = DaemonSession::new(2, 1024);
        session.begin_connect();
        assert_eq!(session.on_connect_failed(), RetryDecision::Retry);
        assert_eq!(session.on_connect_failed(), RetryDecision::Retry);
        assert_eq!(session.on_connect_failed(), RetryDecision::GiveUp { attempts: 3 });
        assert_eq!(session.state(), DaemonState::Unknown);
    }

    #[test]
    fn losing_a_ready_daemon_detaches() {
        let mut session = ready();
        assert!(!session.begin_connect());
        assert_eq!(session.on_transport_closed(), DaemonState::Ready);
        assert_eq!(session.state(), DaemonState::Detached);
        assert!(session.begin_connect());
        assert_eq!(session.state(), DaemonState::Initializing);
    }
}
