//! The per-session engine loop.

use super::resolver::Resolve;
use super::streams::StreamManager;
use super::EngineConfig;
use crate::store::{SessionCell, SessionId};
use htunnel_core::Message;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Drives the streams of one session until the session stops.
///
/// The engine never holds the session lock while it waits on sockets. Each
/// iteration takes the lock once, in [`exchange`](Self::exchange), to pick up
/// inbound messages and hand over the messages produced since the last
/// iteration.
pub struct TunnelEngine<R> {
    session_id: SessionId,
    cell: SessionCell,
    streams: StreamManager<R>,
    /// Inbound messages taken from the session, not yet applied.
    incoming: Vec<Message>,
    /// Messages produced locally, not yet in the session's outgoing queue.
    outgoing: Vec<Message>,
    stop_requested: bool,
    poll_interval: Duration,
}

impl<R: Resolve> TunnelEngine<R> {
    pub fn new(
        session_id: SessionId,
        cell: SessionCell,
        config: &EngineConfig,
        resolver: Arc<R>,
    ) -> Self {
        Self {
            session_id,
            cell,
            streams: StreamManager::new(config, resolver),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            stop_requested: false,
            poll_interval: config.poll_interval,
        }
    }

    /// Run until the session is stopped or destroyed. Every socket is closed
    /// before this returns. Returns the number of iterations.
    pub async fn run(mut self) -> u64 {
        info!(session_id = %self.session_id, "engine running");
        let mut iterations = 0u64;

        loop {
            iterations += 1;
            if !self.exchange().await {
                break;
            }

            self.apply_incoming().await;

            if !self.stop_requested {
                let events = self.streams.poll(self.poll_interval).await;
                trace!(
                    session_id = %self.session_id,
                    active = self.streams.active_count(),
                    connecting = self.streams.connecting_count(),
                    events = events.len(),
                    "engine iteration"
                );
                self.outgoing.extend(events);
            }
        }

        let closed = self.streams.close_all();
        info!(
            session_id = %self.session_id,
            iterations,
            closed_streams = closed,
            "engine stopped"
        );
        iterations
    }

    /// One exclusive section with the session: take inbound messages, flush
    /// outbound ones, record liveness. Returns whether the session still runs.
    async fn exchange(&mut self) -> bool {
        let mut session = self.cell.lock().await;

        self.incoming.extend(session.take_incoming());
        session.push_outgoing(self.outgoing.drain(..));
        session.beat();
        if self.stop_requested {
            session.stop();
        }
        session.is_running()
    }

    async fn apply_incoming(&mut self) {
        for msg in std::mem::take(&mut self.incoming) {
            match msg {
                Message::Connect { id, host, port } => {
                    if let Some(reply) = self.streams.handle_connect(id, &host, port) {
                        self.outgoing.push(reply);
                    }
                }
                Message::Sync { id, payload } => {
                    if let Some(reply) = self.streams.handle_sync_in(id, &payload).await {
                        self.outgoing.push(reply);
                    }
                }
                Message::Status { id, code } => {
                    debug!(session_id = %self.session_id, stream_id = id, code, "client closed stream");
                    self.streams.handle_client_close(id);
                }
                Message::Stop => {
                    info!(session_id = %self.session_id, "stop requested in batch");
                    self.stop_requested = true;
                }
                Message::Unknown => {
                    debug!(session_id = %self.session_id, "unknown message dropped");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::resolver::StaticResolver;
    use crate::store::SessionStore;
    use htunnel_core::{status, Submission};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    fn config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(20),
            ..EngineConfig::default()
        }
    }

    async fn spawn_engine(store: &SessionStore, id: &str) -> (SessionCell, JoinHandle<u64>) {
        let cell = store.create(id).await.unwrap();
        let resolver = StaticResolver::default().with("local.test", IpAddr::V4(Ipv4Addr::LOCALHOST));
        let engine = TunnelEngine::new(id.to_string(), cell.clone(), &config(), Arc::new(resolver));
        (cell, tokio::spawn(engine.run()))
    }

    /// Wait until the outgoing queue holds at least `n` messages.
    async fn wait_outgoing(cell: &SessionCell, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while cell.lock().await.outgoing_len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("outgoing messages never arrived");
    }

    async fn finished(handle: JoinHandle<u64>) -> u64 {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("engine did not stop")
            .unwrap()
    }

    #[tokio::test]
    async fn connect_then_drain_then_stale_retry() {
        let store = SessionStore::new(4);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (cell, handle) = spawn_engine(&store, "s").await;

        let connect = Message::Connect {
            id: 7,
            host: "local.test".into(),
            port,
        };
        cell.lock().await.submit_inbound(0, vec![connect]);
        let _peer = listener.accept().await.unwrap();
        wait_outgoing(&cell, 1).await;

        {
            let mut session = cell.lock().await;
            assert_eq!(
                session.submit_inbound(1, vec![]),
                Submission::Applied { batches: 1 }
            );
            let page = session.drain_outbound(64);
            assert_eq!(page.seq, 0);
            assert_eq!(page.msgs, vec![Message::status(7, status::OK)]);

            assert_eq!(
                session.submit_inbound(1, vec![]),
                Submission::Stale { expected: 2 }
            );
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cell.lock().await.outgoing_len(), 0);

        cell.lock().await.stop();
        finished(handle).await;
    }

    #[tokio::test]
    async fn relays_payloads_both_ways() {
        let store = SessionStore::new(4);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (cell, handle) = spawn_engine(&store, "s").await;

        cell.lock().await.submit_inbound(
            0,
            vec![Message::Connect {
                id: 1,
                host: "local.test".into(),
                port,
            }],
        );
        let (mut peer, _) = listener.accept().await.unwrap();
        wait_outgoing(&cell, 1).await;

        cell.lock()
            .await
            .submit_inbound(1, vec![Message::sync(1, b"hello".to_vec())]);
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        peer.write_all(b"world").await.unwrap();
        wait_outgoing(&cell, 2).await;
        let page = cell.lock().await.drain_outbound(64);
        assert_eq!(
            page.msgs,
            vec![
                Message::status(1, status::OK),
                Message::sync(1, b"world".to_vec())
            ]
        );

        cell.lock().await.stop();
        finished(handle).await;
    }

    #[tokio::test]
    async fn stop_closes_every_socket() {
        let store = SessionStore::new(4);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (cell, handle) = spawn_engine(&store, "s").await;

        cell.lock().await.submit_inbound(
            0,
            vec![Message::Connect {
                id: 3,
                host: "local.test".into(),
                port,
            }],
        );
        let (mut peer, _) = listener.accept().await.unwrap();
        wait_outgoing(&cell, 1).await;

        cell.lock().await.stop();
        assert!(finished(handle).await > 0);

        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stop_message_in_batch_stops_session() {
        let store = SessionStore::new(4);
        let (cell, handle) = spawn_engine(&store, "s").await;

        cell.lock().await.submit_inbound(0, vec![Message::Stop]);
        finished(handle).await;
        assert!(!cell.lock().await.is_running());
    }

    #[tokio::test]
    async fn destroy_stops_engine() {
        let store = SessionStore::new(4);
        let (_cell, handle) = spawn_engine(&store, "s").await;

        store.destroy("s").await.unwrap();
        finished(handle).await;
    }

    #[tokio::test]
    async fn client_status_closes_stream_silently() {
        let store = SessionStore::new(4);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (cell, handle) = spawn_engine(&store, "s").await;

        cell.lock().await.submit_inbound(
            0,
            vec![Message::Connect {
                id: 4,
                host: "local.test".into(),
                port,
            }],
        );
        let (mut peer, _) = listener.accept().await.unwrap();
        wait_outgoing(&cell, 1).await;
        cell.lock().await.drain_outbound(64);

        cell.lock()
            .await
            .submit_inbound(1, vec![Message::status(4, status::ERROR), Message::Unknown]);
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(cell.lock().await.outgoing_len(), 0);

        cell.lock().await.stop();
        finished(handle).await;
    }

    #[tokio::test]
    async fn heartbeat_advances_while_idle() {
        let store = SessionStore::new(4);
        let (cell, handle) = spawn_engine(&store, "s").await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cell.lock().await.heartbeat() >= 2);

        cell.lock().await.stop();
        finished(handle).await;
    }
}
