//! Agent → controller event stream.
//!
//! One listener, one reader task per agent connection. A reader decodes
//! fixed-size frames until the agent hangs up; malformed frames are counted
//! and dropped, never forwarded.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use buildscope_common::{OperationEvent, EVENT_FRAME_LEN};
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// Consumes decoded events. Called from tokio worker threads.
pub trait EventHandler: Send + Sync + 'static {
    fn on_event(&self, event: OperationEvent);
}

impl<F> EventHandler for F
where
    F: Fn(OperationEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: OperationEvent) {
        self(event);
    }
}

/// Running counters; read any time, final after [`EventReceiver::shutdown`].
#[derive(Debug, Default)]
pub struct ReceiverStats {
    connections: AtomicU64,
    open: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl ReceiverStats {
    #[must_use]
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Connections whose reader has not finished yet
    #[must_use]
    pub fn open(&self) -> u64 {
        self.open.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

pub struct EventReceiver {
    local_addr: SocketAddr,
    stop_accepting: CancellationToken,
    abort_reads: CancellationToken,
    task: Option<JoinHandle<()>>,
    stats: Arc<ReceiverStats>,
}

impl EventReceiver {
    /// Bind `addr` and start accepting agent connections.
    ///
    /// # Errors
    /// Returns the bind error.
    pub async fn bind(addr: SocketAddr, handler: Arc<dyn EventHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let stop_accepting = CancellationToken::new();
        let abort_reads = CancellationToken::new();
        let stats = Arc::new(ReceiverStats::default());

        let task = tokio::spawn(accept_loop(
            listener,
            handler,
            Arc::clone(&stats),
            stop_accepting.clone(),
            abort_reads.clone(),
        ));

        debug!("Event receiver listening on {local_addr}");
        Ok(Self { local_addr, stop_accepting, abort_reads, task: Some(task), stats })
    }

    /// Address agents should connect to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[must_use]
    pub fn stats(&self) -> &ReceiverStats {
        &self.stats
    }

    /// Wait, at most `limit`, for in-flight events to be handled.
    ///
    /// With `until_disconnected` the wait ends once every agent has hung up;
    /// otherwise it ends after `quiet` passes without a new event.
    pub async fn settle(&self, until_disconnected: bool, quiet: Duration, limit: Duration) {
        let wait = async {
            loop {
                let before = self.stats.accepted();
                tokio::time::sleep(quiet).await;
                let quiet_now = self.stats.accepted() == before;
                let done = quiet_now && (!until_disconnected || self.stats.open() == 0);
                if done {
                    break;
                }
            }
        };
        if tokio::time::timeout(limit, wait).await.is_err() {
            debug!("Event stream on {} did not settle within {limit:?}", self.local_addr);
        }
    }

    /// Stop accepting, give open connections `grace` to drain, then cut them.
    ///
    /// Idempotent; every event handed to the handler has been handled when
    /// this returns.
    pub async fn shutdown(&mut self, grace: Duration) {
        let Some(mut task) = self.task.take() else {
            return;
        };
        self.stop_accepting.cancel();

        if tokio::time::timeout(grace, &mut task).await.is_err() {
            debug!("Event connections still open after {grace:?}, closing them");
            self.abort_reads.cancel();
            if let Err(e) = task.await {
                warn!("Event receiver task failed: {e}");
            }
        }
        debug!(
            "Event receiver on {} closed: {} connections, {} accepted, {} rejected",
            self.local_addr,
            self.stats.connections(),
            self.stats.accepted(),
            self.stats.rejected()
        );
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        self.stop_accepting.cancel();
        self.abort_reads.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn EventHandler>,
    stats: Arc<ReceiverStats>,
    stop_accepting: CancellationToken,
    abort_reads: CancellationToken,
) {
    let mut readers = JoinSet::new();

    loop {
        // Accept first: connections already queued when shutdown starts are still read
        tokio::select! {
            biased;
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    stats.connections.fetch_add(1, Ordering::Relaxed);
                    stats.open.fetch_add(1, Ordering::Relaxed);
                    debug!("Agent connected from {peer}");
                    readers.spawn(read_frames(
                        stream,
                        peer,
                        Arc::clone(&handler),
                        Arc::clone(&stats),
                        abort_reads.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept agent connection: {e}"),
            },
            Some(joined) = readers.join_next(), if !readers.is_empty() => {
                if let Err(e) = joined {
                    warn!("Event reader task failed: {e}");
                }
            }
            () = stop_accepting.cancelled() => break,
        }
    }

    drop(listener);
    while let Some(joined) = readers.join_next().await {
        if let Err(e) = joined {
            warn!("Event reader task failed: {e}");
        }
    }
}

async fn read_frames(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: Arc<dyn EventHandler>,
    stats: Arc<ReceiverStats>,
    abort: CancellationToken,
) {
    let mut frame = [0u8; EVENT_FRAME_LEN];

    loop {
        let read = tokio::select! {
            () = abort.cancelled() => break,
            read = stream.read_exact(&mut frame) => read,
        };

        match read {
            Ok(_) => match OperationEvent::decode(&frame) {
                Ok(event) => {
                    stats.accepted.fetch_add(1, Ordering::Relaxed);
                    handler.on_event(event);
                }
                Err(e) => {
                    stats.rejected.fetch_add(1, Ordering::Relaxed);
                    warn!("Rejected event from {peer}: {e}");
                }
            },
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!("Agent {peer} closed its event stream");
                break;
            }
            Err(e) => {
                warn!("Event stream from {peer} failed: {e}");
                break;
            }
        }
    }
    stats.open.fetch_sub(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;

    fn collector() -> (Arc<Mutex<Vec<OperationEvent>>>, Arc<dyn EventHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn EventHandler> =
            Arc::new(move |event: OperationEvent| sink.lock().unwrap().push(event));
        (seen, handler)
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_stream_order() {
        let (seen, handler) = collector();
        let mut receiver =
            EventReceiver::bind("127.0.0.1:0".parse().unwrap(), handler).await.unwrap();

        let mut agent = TcpStream::connect(receiver.local_addr()).await.unwrap();
        for id in 0..10 {
            agent.write_all(&OperationEvent::new(id, id * 2).encode()).await.unwrap();
        }
        drop(agent);

        receiver.shutdown(Duration::from_secs(2)).await;
        let ids: Vec<i64> = seen.lock().unwrap().iter().map(|e| e.operation_id).collect();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert_eq!(receiver.stats().accepted(), 10);
        assert_eq!(receiver.stats().connections(), 1);
    }

    #[tokio::test]
    async fn test_negative_duration_rejected() {
        let (seen, handler) = collector();
        let mut receiver =
            EventReceiver::bind("127.0.0.1:0".parse().unwrap(), handler).await.unwrap();

        let mut agent = TcpStream::connect(receiver.local_addr()).await.unwrap();
        let mut bad = [0u8; EVENT_FRAME_LEN];
        bad[..8].copy_from_slice(&7i64.to_be_bytes());
        bad[8..].copy_from_slice(&(-5i64).to_be_bytes());
        agent.write_all(&bad).await.unwrap();
        agent.write_all(&OperationEvent::new(8, 1).encode()).await.unwrap();
        drop(agent);

        receiver.shutdown(Duration::from_secs(2)).await;
        assert_eq!(*seen.lock().unwrap(), vec![OperationEvent::new(8, 1)]);
        assert_eq!(receiver.stats().rejected(), 1);
    }

    #[tokio::test]
    async fn test_settle_waits_for_disconnect() {
        let (seen, handler) = collector();
        let mut receiver =
            EventReceiver::bind("127.0.0.1:0".parse().unwrap(), handler).await.unwrap();

        let mut agent = TcpStream::connect(receiver.local_addr()).await.unwrap();
        agent.write_all(&OperationEvent::new(1, 3).encode()).await.unwrap();
        drop(agent);

        receiver.settle(true, Duration::from_millis(5), Duration::from_secs(5)).await;
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(receiver.stats().open(), 0);
        receiver.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_cuts_idle_connection_after_grace() {
        let (_seen, handler) = collector();
        let mut receiver =
            EventReceiver::bind("127.0.0.1:0".parse().unwrap(), handler).await.unwrap();
        let _idle = TcpStream::connect(receiver.local_addr()).await.unwrap();

        // Must return even though the agent never hangs up
        tokio::time::timeout(
            Duration::from_secs(5),
            receiver.shutdown(Duration::from_millis(100)),
        )
        .await
        .unwrap();
    }
}
