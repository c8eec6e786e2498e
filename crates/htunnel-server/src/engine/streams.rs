//! Stream manager: the TCP sockets of one session.
//!
//! Streams move through `Connecting → Active → removed`. A `Connect` starts
//! a background connect task (resolution + TCP handshake, bounded by the
//! connect timeout) and registers the stream as Connecting; the engine never
//! blocks on it. [`StreamManager::poll`] waits, for at most one poll
//! interval, until a connect task finishes or an active socket turns
//! readable, then converts whatever is ready into outbound messages.
//!
//! Every failure is local to its stream: the stream is removed and the
//! client learns about it through a `Status` message.

use super::policy::PolicyEnforcer;
use super::resolver::Resolve;
use super::EngineConfig;
use futures_util::stream::{FuturesUnordered, StreamExt};
use htunnel_core::{status, Message, StreamId};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tracing::{debug, info, trace, warn};

/// Lifecycle state of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Connect in flight.
    Connecting,
    /// Connected; payloads flow both ways.
    Active,
    /// Not tracked. Closed streams are removed, never retained.
    Closed,
}

/// Why a connect task failed.
#[derive(Debug)]
enum ConnectFailure {
    Unresolved(String),
    Io(io::Error),
    TimedOut,
}

impl ConnectFailure {
    /// Status code reported to the client.
    fn code(&self) -> i32 {
        match self {
            ConnectFailure::Unresolved(_) => status::ERROR,
            ConnectFailure::TimedOut => status::TIMED_OUT,
            ConnectFailure::Io(e) => match e.kind() {
                io::ErrorKind::ConnectionRefused => status::CONNECTION_REFUSED,
                io::ErrorKind::TimedOut => status::TIMED_OUT,
                io::ErrorKind::AddrNotAvailable => status::HOST_UNREACHABLE,
                _ => status::GENERAL_FAILURE,
            },
        }
    }
}

impl std::fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectFailure::Unresolved(reason) => write!(f, "{reason}"),
            ConnectFailure::Io(e) => write!(f, "{e}"),
            ConnectFailure::TimedOut => write!(f, "connect timed out"),
        }
    }
}

/// Outcome of a connect task: stream id, ticket, result.
type ConnectResult = (StreamId, u64, Result<TcpStream, ConnectFailure>);

/// A stream whose connect task is still running.
struct PendingConnect {
    /// Distinguishes this attempt from an earlier one under the same id.
    ticket: u64,
    abort: AbortHandle,
}

/// Owns every socket of one session.
pub struct StreamManager<R> {
    resolver: Arc<R>,
    policy: PolicyEnforcer,
    connecting: BTreeMap<StreamId, PendingConnect>,
    connects: JoinSet<ConnectResult>,
    active: BTreeMap<StreamId, TcpStream>,
    next_ticket: u64,
    read_buf: Vec<u8>,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl<R: Resolve> StreamManager<R> {
    pub fn new(config: &EngineConfig, resolver: Arc<R>) -> Self {
        Self {
            resolver,
            policy: PolicyEnforcer::new(&config.policy),
            connecting: BTreeMap::new(),
            connects: JoinSet::new(),
            active: BTreeMap::new(),
            next_ticket: 0,
            read_buf: vec![0u8; config.read_chunk.max(1)],
            connect_timeout: config.connect_timeout,
            write_timeout: config.write_timeout,
        }
    }

    /// Current state of stream `id`.
    pub fn state(&self, id: StreamId) -> StreamState {
        if self.active.contains_key(&id) {
            StreamState::Active
        } else if self.connecting.contains_key(&id) {
            StreamState::Connecting
        } else {
            StreamState::Closed
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    /// Connecting + Active streams.
    pub fn tracked(&self) -> usize {
        self.active.len() + self.connecting.len()
    }

    /// Handle a `Connect` message: policy check, then start a background
    /// connect registered as Connecting.
    ///
    /// Returns a `Status` to send right away when the stream is refused
    /// before any socket exists.
    pub fn handle_connect(&mut self, id: StreamId, host: &str, port: u16) -> Option<Message> {
        if self.state(id) != StreamState::Closed {
            warn!(stream_id = id, "connect for a stream id already in use, ignoring");
            return None;
        }

        if let Err(reason) = self.policy.check_connect(host, port, self.tracked()) {
            warn!(stream_id = id, host = %host, port, reason = %reason, "connect denied");
            return Some(Message::status(id, status::NOT_ALLOWED));
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let resolver = self.resolver.clone();
        let host = host.to_string();
        let timeout = self.connect_timeout;
        debug!(stream_id = id, host = %host, port, "connecting");

        let abort = self.connects.spawn(async move {
            let result = match tokio::time::timeout(timeout, open_stream(&*resolver, &host, port)).await
            {
                Ok(result) => result,
                Err(_) => Err(ConnectFailure::TimedOut),
            };
            (id, ticket, result)
        });
        self.connecting.insert(id, PendingConnect { ticket, abort });
        None
    }

    /// Handle an inbound `Sync` message: write the whole payload to the
    /// stream's socket.
    ///
    /// Partial writes are continued until the payload is sent, the socket
    /// fails, or the write timeout elapses. A failure removes the stream and
    /// returns the `Status` to report; the payload is not retried later.
    pub async fn handle_sync_in(&mut self, id: StreamId, payload: &[u8]) -> Option<Message> {
        let Some(stream) = self.active.get_mut(&id) else {
            debug!(stream_id = id, len = payload.len(), "payload for unknown stream, dropped");
            return None;
        };

        let error = match tokio::time::timeout(self.write_timeout, write_fully(stream, payload)).await
        {
            Ok(Ok(())) => return None,
            Ok(Err(e)) => e,
            Err(_) => io::Error::new(io::ErrorKind::TimedOut, "write timed out"),
        };

        warn!(stream_id = id, error = %error, "stream write failed");
        self.active.remove(&id);
        Some(Message::status(id, status::ERROR))
    }

    /// The client side of stream `id` went away: close it without reply.
    pub fn handle_client_close(&mut self, id: StreamId) {
        if let Some(pending) = self.connecting.remove(&id) {
            pending.abort.abort();
            debug!(stream_id = id, "pending connect cancelled by client");
        } else if self.active.remove(&id).is_some() {
            debug!(stream_id = id, "stream closed by client");
        }
    }

    /// Wait up to `timeout` for socket activity and return the resulting
    /// messages: connect results as `Status`, received data as `Sync`, and a
    /// `Status` error for every stream that hit EOF or a read error.
    pub async fn poll(&mut self, timeout: Duration) -> Vec<Message> {
        let finished = {
            let mut readable: FuturesUnordered<_> = self
                .active
                .iter()
                .map(|(id, stream)| async move {
                    let _ = stream.readable().await;
                    *id
                })
                .collect();

            tokio::select! {
                Some(joined) = self.connects.join_next() => Some(joined),
                Some(_) = readable.next() => None,
                _ = tokio::time::sleep(timeout) => None,
            }
        };

        let mut events = Vec::new();
        if let Some(joined) = finished {
            self.finish_connect(joined, &mut events);
        }
        while let Some(joined) = self.connects.try_join_next() {
            self.finish_connect(joined, &mut events);
        }
        self.read_ready(&mut events);
        events
    }

    /// Close every stream, pending or active. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let closed = self.tracked();
        self.connects.abort_all();
        self.connecting.clear();
        self.active.clear();
        if closed > 0 {
            info!(count = closed, "closed all streams");
        }
        closed
    }

    fn finish_connect(&mut self, joined: Result<ConnectResult, JoinError>, events: &mut Vec<Message>) {
        let (id, ticket, result) = match joined {
            Ok(done) => done,
            Err(e) if e.is_cancelled() => return,
            Err(e) => {
                warn!(error = %e, "connect task failed");
                return;
            }
        };

        match self.connecting.get(&id) {
            Some(pending) if pending.ticket == ticket => {
                self.connecting.remove(&id);
            }
            _ => {
                debug!(stream_id = id, "connect finished for a stream no longer pending");
                return;
            }
        }

        match result {
            Ok(stream) => {
                info!(stream_id = id, peer = ?stream.peer_addr().ok(), "stream connected");
                self.active.insert(id, stream);
                events.push(Message::status(id, status::OK));
            }
            Err(failure) => {
                let code = failure.code();
                warn!(stream_id = id, code, error = %failure, "stream connect failed");
                events.push(Message::status(id, code));
            }
        }
    }

    fn read_ready(&mut self, events: &mut Vec<Message>) {
        let ids: Vec<StreamId> = self.active.keys().copied().collect();

        for id in ids {
            let Some(stream) = self.active.get(&id) else {
                continue;
            };
            match stream.try_read(&mut self.read_buf) {
                Ok(0) => {
                    debug!(stream_id = id, "remote closed stream");
                    self.active.remove(&id);
                    events.push(Message::status(id, status::ERROR));
                }
                Ok(n) => {
                    trace!(stream_id = id, len = n, "stream data");
                    events.push(Message::sync(id, &self.read_buf[..n]));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    warn!(stream_id = id, error = %e, "stream read failed");
                    self.active.remove(&id);
                    events.push(Message::status(id, status::ERROR));
                }
            }
        }
    }
}

/// Resolve `host` and open a TCP connection to it.
async fn open_stream<R: Resolve>(
    resolver: &R,
    host: &str,
    port: u16,
) -> Result<TcpStream, ConnectFailure> {
    let ip = resolver
        .resolve(host)
        .await
        .map_err(ConnectFailure::Unresolved)?;
    TcpStream::connect((ip, port))
        .await
        .map_err(ConnectFailure::Io)
}

/// Write all of `payload`, continuing after partial writes.
async fn write_fully(stream: &mut TcpStream, payload: &[u8]) -> io::Result<()> {
    let mut written = 0;
    while written < payload.len() {
        let n = stream.write(&payload[written..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
        if written < payload.len() {
            trace!(written, total = payload.len(), "partial write");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::resolver::StaticResolver;
    use crate::engine::DestinationPolicy;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn manager() -> StreamManager<StaticResolver> {
        manager_with(EngineConfig::default())
    }

    fn manager_with(config: EngineConfig) -> StreamManager<StaticResolver> {
        let resolver = StaticResolver::default().with("local.test", LOCALHOST);
        StreamManager::new(&config, Arc::new(resolver))
    }

    /// Poll until `done` holds for the collected events or 5s pass.
    async fn poll_until<F>(mgr: &mut StreamManager<StaticResolver>, done: F) -> Vec<Message>
    where
        F: Fn(&[Message]) -> bool,
    {
        let mut events = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !done(&events) && tokio::time::Instant::now() < deadline {
            events.extend(mgr.poll(Duration::from_millis(50)).await);
        }
        events
    }

    async fn connected(
        mgr: &mut StreamManager<StaticResolver>,
        id: StreamId,
    ) -> (TcpStream, Vec<Message>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(mgr.handle_connect(id, "local.test", port).is_none());
        assert_eq!(mgr.state(id), StreamState::Connecting);

        let (peer, _) = listener.accept().await.unwrap();
        let events = poll_until(mgr, |ev| !ev.is_empty()).await;
        (peer, events)
    }

    #[tokio::test]
    async fn connect_success_promotes_to_active() {
        let mut mgr = manager();
        let (_peer, events) = connected(&mut mgr, 7).await;
        assert_eq!(events, vec![Message::status(7, status::OK)]);
        assert_eq!(mgr.state(7), StreamState::Active);
        assert_eq!(mgr.connecting_count(), 0);
    }

    #[tokio::test]
    async fn refused_connect_reports_once_and_adds_nothing() {
        let mut mgr = manager();
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };

        mgr.handle_connect(3, "local.test", port);
        let events = poll_until(&mut mgr, |ev| !ev.is_empty()).await;
        assert_eq!(events, vec![Message::status(3, status::CONNECTION_REFUSED)]);

        // nothing more arrives for it
        let more = mgr.poll(Duration::from_millis(50)).await;
        assert!(more.is_empty());
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(mgr.state(3), StreamState::Closed);
    }

    #[tokio::test]
    async fn unresolvable_host_reports_error() {
        let mut mgr = manager();
        mgr.handle_connect(4, "nowhere.test", 80);
        let events = poll_until(&mut mgr, |ev| !ev.is_empty()).await;
        assert_eq!(events, vec![Message::status(4, status::ERROR)]);
        assert_eq!(mgr.tracked(), 0);
    }

    #[tokio::test]
    async fn denied_destination_reports_immediately() {
        let mut mgr = manager_with(EngineConfig {
            policy: DestinationPolicy {
                allowed_destinations: vec!["other.test".into()],
                max_streams: 8,
            },
            ..EngineConfig::default()
        });
        assert_eq!(
            mgr.handle_connect(5, "local.test", 80),
            Some(Message::status(5, status::NOT_ALLOWED))
        );
        assert_eq!(mgr.tracked(), 0);
    }

    #[tokio::test]
    async fn duplicate_connect_is_ignored() {
        let mut mgr = manager();
        let (_peer, _) = connected(&mut mgr, 1).await;
        assert!(mgr.handle_connect(1, "local.test", 9).is_none());
        assert_eq!(mgr.tracked(), 1);
        assert_eq!(mgr.state(1), StreamState::Active);
    }

    #[tokio::test]
    async fn data_flows_both_ways() {
        let mut mgr = manager();
        let (mut peer, _) = connected(&mut mgr, 2).await;

        assert!(mgr.handle_sync_in(2, b"ping").await.is_none());
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        let events = poll_until(&mut mgr, |ev| !ev.is_empty()).await;
        assert_eq!(events, vec![Message::sync(2, b"pong".to_vec())]);
    }

    #[tokio::test]
    async fn reads_are_bounded_by_chunk() {
        let mut mgr = manager_with(EngineConfig {
            read_chunk: 4,
            ..EngineConfig::default()
        });
        let (mut peer, _) = connected(&mut mgr, 2).await;
        peer.write_all(b"abcdefghij").await.unwrap();

        let events = poll_until(&mut mgr, |ev| {
            ev.iter()
                .map(|m| match m {
                    Message::Sync { payload, .. } => payload.len(),
                    _ => 0,
                })
                .sum::<usize>()
                == 10
        })
        .await;
        assert!(events.len() >= 3);
        for event in &events {
            match event {
                Message::Sync { payload, .. } => assert!(payload.len() <= 4),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn large_payload_survives_partial_writes() {
        let mut mgr = manager();
        let (mut peer, _) = connected(&mut mgr, 9).await;

        let payload: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let mut received = vec![0u8; expected.len()];
            peer.read_exact(&mut received).await.unwrap();
            received == expected
        });

        assert!(mgr.handle_sync_in(9, &payload).await.is_none());
        assert!(reader.await.unwrap());
        assert_eq!(mgr.state(9), StreamState::Active);
    }

    #[tokio::test]
    async fn failed_write_reports_once_and_removes() {
        let mut mgr = manager_with(EngineConfig {
            write_timeout: Duration::from_millis(200),
            ..EngineConfig::default()
        });
        // peer never reads, so the socket buffers fill up
        let (_peer, _) = connected(&mut mgr, 6).await;

        let payload = vec![0u8; 64 * 1024 * 1024];
        assert_eq!(
            mgr.handle_sync_in(6, &payload).await,
            Some(Message::status(6, status::ERROR))
        );
        assert_eq!(mgr.state(6), StreamState::Closed);
        assert!(mgr.handle_sync_in(6, b"more").await.is_none());
    }

    #[tokio::test]
    async fn remote_eof_reports_error_and_removes() {
        let mut mgr = manager();
        let (peer, _) = connected(&mut mgr, 8).await;
        drop(peer);

        let events = poll_until(&mut mgr, |ev| !ev.is_empty()).await;
        assert_eq!(events, vec![Message::status(8, status::ERROR)]);
        assert_eq!(mgr.state(8), StreamState::Closed);
    }

    #[tokio::test]
    async fn sync_to_unknown_stream_is_dropped() {
        let mut mgr = manager();
        assert!(mgr.handle_sync_in(42, b"lost").await.is_none());
    }

    #[tokio::test]
    async fn client_close_and_close_all() {
        let mut mgr = manager();
        let (mut peer_a, _) = connected(&mut mgr, 1).await;
        let (mut peer_b, _) = connected(&mut mgr, 2).await;

        mgr.handle_client_close(1);
        assert_eq!(mgr.state(1), StreamState::Closed);
        let mut buf = [0u8; 1];
        assert_eq!(peer_a.read(&mut buf).await.unwrap(), 0);

        assert_eq!(mgr.close_all(), 1);
        assert_eq!(mgr.tracked(), 0);
        assert_eq!(peer_b.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_connect_never_reports() {
        let mut mgr = manager();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        mgr.handle_connect(11, "local.test", port);
        mgr.handle_client_close(11);
        let events = mgr.poll(Duration::from_millis(100)).await;
        assert!(events.is_empty());
        assert_eq!(mgr.tracked(), 0);
    }
}
