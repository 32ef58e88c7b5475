//! # Profiler Session Controller
//!
//! One controller per scenario execution, driving a uniform lifecycle over
//! every backend:
//!
//! ```text
//!          start()            stop()
//!   NEW ───────────▶ RECORDING ──────▶ STOPPED
//!                        ▲                │
//!                        └────────────────┘ start()   (dynamic only repeats)
//!
//!   any state ── stop_session() ──▶ SESSION_STOPPED   (terminal, once)
//! ```
//!
//! For a dynamic backend `start`/`stop`/`capture_snapshot` send a command to
//! the agent; for the other backends they only move the state machine.
//! Operation events from the agent are tallied for the running iteration and
//! appended to the event log.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use buildscope_common::{
    ControlCommand, OperationEvent, ENV_ARTIFACT_DIR, ENV_COMMAND_ADDR, ENV_EVENT_ADDR,
    ENV_RECORD_ON_START,
};
use log::{debug, info, warn};
use serde::Serialize;

use super::backend::{Backend, BackendKind, Capabilities};
use super::tally::OperationTally;
use crate::channel::{CommandChannel, EventHandler, EventReceiver};
use crate::domain::{
    AgentCommunicationError, ControllerError, OperationId, OperationTotals, Pid, SinkError,
};
use crate::preflight::CompatibleBackend;
use crate::sink::{Event, EventKind, EventSink};

/// How long open agent connections may keep draining after `stop_session`
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Silence that marks the end of an iteration's event burst
const SETTLE_QUIET: Duration = Duration::from_millis(20);

/// Upper bound on waiting for an iteration's events
const SETTLE_LIMIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    Recording,
    Stopped,
    SessionStopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::New => "new",
            SessionState::Recording => "recording",
            SessionState::Stopped => "stopped",
            SessionState::SessionStopped => "session-stopped",
        })
    }
}

/// What a finished session did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    pub backend: BackendKind,
    pub agent_connections: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    /// Records written to the event log
    pub records_written: usize,
}

pub struct ProfilerController {
    scenario: String,
    backend: Backend,
    state: SessionState,
    commands: Option<CommandChannel>,
    receiver: Option<EventReceiver>,
    sink: Arc<EventSink<Event>>,
    tally: Arc<Mutex<OperationTally>>,
    /// Receiver connection count at the previous `settle`
    connections_settled: u64,
    /// Agent side closed, event log not yet completed
    pending: Option<SessionReport>,
    report: Option<SessionReport>,
}

impl ProfilerController {
    /// Open a session for a backend that passed preflight.
    ///
    /// Agent-backed sessions bind the event listener on loopback before any
    /// process is launched.
    ///
    /// # Errors
    /// Returns [`ControllerError::Listener`] if the event listener cannot bind.
    pub async fn open(
        compatible: CompatibleBackend,
        sink: EventSink<Event>,
    ) -> Result<Self, ControllerError> {
        let (scenario, backend) = compatible.into_parts();
        let sink = Arc::new(sink);
        let tally = Arc::new(Mutex::new(OperationTally::default()));

        let receiver = if backend.capabilities().events {
            let handler = forward_events(Arc::clone(&tally), Arc::clone(&sink));
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
            Some(EventReceiver::bind(addr, handler).await.map_err(ControllerError::Listener)?)
        } else {
            None
        };

        let commands = match &backend {
            Backend::Dynamic { command_addr, command_timeout, .. } => {
                Some(CommandChannel::new(*command_addr, *command_timeout))
            }
            Backend::None | Backend::StaticAgent { .. } => None,
        };

        debug!("Scenario '{scenario}': opened '{}' profiler session", backend.kind());
        Ok(Self {
            scenario,
            backend,
            state: SessionState::New,
            commands,
            receiver,
            sink,
            tally,
            connections_settled: 0,
            pending: None,
            report: None,
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.backend.capabilities()
    }

    /// Environment the measured process needs so its agent finds this session.
    #[must_use]
    pub fn launch_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(receiver) = &self.receiver {
            env.push((ENV_EVENT_ADDR.to_string(), receiver.local_addr().to_string()));
        }
        match &self.backend {
            Backend::None => {}
            Backend::Dynamic { command_addr, .. } => {
                env.push((ENV_COMMAND_ADDR.to_string(), command_addr.to_string()));
                env.push((ENV_RECORD_ON_START.to_string(), "false".to_string()));
            }
            Backend::StaticAgent { .. } => {
                env.push((ENV_RECORD_ON_START.to_string(), "true".to_string()));
            }
        }
        if let Some(dir) = self.backend.artifact_dir() {
            env.push((ENV_ARTIFACT_DIR.to_string(), path_string(dir)));
        }
        env
    }

    /// Begin recording an iteration.
    ///
    /// The session is `RECORDING` afterwards even if the command did not get
    /// through, so the matching [`stop`](Self::stop) stays valid.
    ///
    /// # Errors
    /// [`ControllerError::InvalidTransition`] outside `NEW`/`STOPPED`, or
    /// [`ControllerError::Agent`] if the agent could not be reached.
    pub async fn start(&mut self) -> Result<(), ControllerError> {
        self.transition("start", &[SessionState::New, SessionState::Stopped])?;
        self.state = SessionState::Recording;
        self.send(ControlCommand::Start).await
    }

    /// End recording of the current iteration.
    ///
    /// # Errors
    /// [`ControllerError::InvalidTransition`] unless `RECORDING`, or
    /// [`ControllerError::Agent`] if the agent could not be reached.
    pub async fn stop(&mut self) -> Result<(), ControllerError> {
        self.transition("stop", &[SessionState::Recording])?;
        self.state = SessionState::Stopped;
        self.send(ControlCommand::Stop).await
    }

    /// Ask the agent in `pid` for a point-in-time artifact.
    ///
    /// # Panics
    /// If the backend cannot capture snapshots. Check
    /// [`Capabilities::snapshots`] first.
    ///
    /// # Errors
    /// [`ControllerError::InvalidTransition`] unless `RECORDING` or `STOPPED`,
    /// or [`ControllerError::Agent`] if the agent could not be reached.
    pub async fn capture_snapshot(&mut self, pid: Option<Pid>) -> Result<(), ControllerError> {
        assert!(
            self.capabilities().snapshots,
            "the '{}' profiler cannot capture snapshots",
            self.kind()
        );
        self.transition("snapshot", &[SessionState::Recording, SessionState::Stopped])?;
        match pid {
            Some(pid) => debug!("Scenario '{}': snapshot of {pid}", self.scenario),
            None => debug!("Scenario '{}': snapshot", self.scenario),
        }
        self.send(ControlCommand::CaptureSnapshot).await
    }

    /// Wait for the agent to deliver the events of the iteration that just ended.
    ///
    /// Returns how many agent connections were accepted since the previous
    /// call. Zero for a static agent means its process ran uninstrumented.
    pub async fn settle(&mut self) -> u64 {
        let Some(receiver) = &self.receiver else {
            return 0;
        };
        // Static agents hang up when their process exits; dynamic ones stay connected
        let until_disconnected = matches!(self.backend, Backend::StaticAgent { .. });
        receiver.settle(until_disconnected, SETTLE_QUIET, SETTLE_LIMIT).await;

        let total = receiver.stats().connections();
        let new = total.saturating_sub(self.connections_settled);
        self.connections_settled = total;
        new
    }

    /// Totals received since the previous call.
    pub fn take_operations(&self) -> BTreeMap<OperationId, OperationTotals> {
        self.tally.lock().unwrap_or_else(PoisonError::into_inner).drain()
    }

    /// Append a timeline record to the session's event log.
    ///
    /// # Errors
    /// Returns [`SinkError::Closed`] if the log no longer accepts records.
    pub fn note(&self, kind: EventKind) -> Result<(), SinkError> {
        self.sink.append(Event::now(kind))
    }

    /// Finish the session and release the listener, agent and event log.
    ///
    /// Safe to call in any state and more than once; later calls return the
    /// first report. Agent failures are logged, never returned: the session
    /// must close either way. The agent is told to stop at most once, even
    /// when the event log fails and the call is repeated.
    ///
    /// # Errors
    /// Returns [`ControllerError::Sink`] if the event log could not be
    /// completed, on this and every later call.
    pub async fn stop_session(&mut self) -> Result<SessionReport, ControllerError> {
        if let Some(report) = &self.report {
            return Ok(report.clone());
        }
        let mut report = match self.pending.take() {
            Some(report) => report,
            None => self.close_agent_side().await,
        };

        match self.sink.stop() {
            Ok(stats) => report.records_written = stats.records,
            Err(e) => {
                self.pending = Some(report);
                return Err(e.into());
            }
        }
        info!(
            "Scenario '{}': profiler session closed, {} events, {} log records",
            self.scenario, report.events_accepted, report.records_written
        );
        self.report = Some(report.clone());
        Ok(report)
    }

    async fn close_agent_side(&mut self) -> SessionReport {
        let previous = std::mem::replace(&mut self.state, SessionState::SessionStopped);
        debug!("Scenario '{}': stopping session ({previous} → {})", self.scenario, self.state);

        if let Some(commands) = self.commands.take() {
            let delivered = commands.send(ControlCommand::StopSession).await;
            if let Err(e) = &delivered {
                warn!("Scenario '{}': {e}", self.scenario);
            }
            self.note_command(ControlCommand::StopSession, delivered.is_ok());
        }

        let mut report = SessionReport {
            backend: self.kind(),
            agent_connections: 0,
            events_accepted: 0,
            events_rejected: 0,
            records_written: 0,
        };
        if let Some(mut receiver) = self.receiver.take() {
            receiver.shutdown(SHUTDOWN_GRACE).await;
            let stats = receiver.stats();
            report.agent_connections = stats.connections();
            report.events_accepted = stats.accepted();
            report.events_rejected = stats.rejected();
        }
        report
    }

    fn transition(
        &self,
        action: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), ControllerError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ControllerError::InvalidTransition { action, state: self.state })
        }
    }

    async fn send(&self, command: ControlCommand) -> Result<(), ControllerError> {
        let Some(commands) = &self.commands else {
            return Ok(());
        };
        let result = commands.send(command).await;
        self.note_command(command, result.is_ok());
        result.map_err(|e: AgentCommunicationError| {
            warn!("Scenario '{}': {e}", self.scenario);
            ControllerError::Agent(e)
        })
    }

    fn note_command(&self, command: ControlCommand, delivered: bool) {
        let kind = EventKind::ProfilerCommand { command: command.to_string(), delivered };
        if let Err(e) = self.sink.append(Event::now(kind)) {
            debug!("Scenario '{}': profiler command not logged: {e}", self.scenario);
        }
    }
}

impl Drop for ProfilerController {
    fn drop(&mut self) {
        if self.state != SessionState::SessionStopped {
            warn!(
                "Scenario '{}': profiler session dropped while {}; closing without stop-session",
                self.scenario, self.state
            );
        }
    }
}

impl fmt::Debug for ProfilerController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfilerController")
            .field("scenario", &self.scenario)
            .field("backend", &self.backend)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn forward_events(
    tally: Arc<Mutex<OperationTally>>,
    sink: Arc<EventSink<Event>>,
) -> Arc<dyn EventHandler> {
    Arc::new(move |event: OperationEvent| {
        tally.lock().unwrap_or_else(PoisonError::into_inner).record(&event);
        if let Err(e) = sink.append(Event::operation(event)) {
            debug!("Dropped operation event after the log closed: {e}");
        }
    })
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl io::Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn memory_sink(buf: &SharedBuf) -> EventSink<Event> {
        EventSink::to_writer("memory", buf.clone(), crate::export::JsonLinesRenderer::new("test"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_state_machine_for_timing_only_backend() {
        let buf = SharedBuf::default();
        let mut controller =
            ProfilerController::open(CompatibleBackend::for_tests("s", Backend::None), memory_sink(&buf))
                .await
                .unwrap();
        assert!(controller.launch_env().is_empty());

        assert!(matches!(
            controller.stop().await,
            Err(ControllerError::InvalidTransition { action: "stop", state: SessionState::New })
        ));
        controller.start().await.unwrap();
        assert_eq!(controller.state(), SessionState::Recording);
        assert!(controller.start().await.is_err());
        controller.stop().await.unwrap();
        controller.start().await.unwrap();
        controller.stop().await.unwrap();

        let first = controller.stop_session().await.unwrap();
        let second = controller.stop_session().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(controller.state(), SessionState::SessionStopped);
        assert!(controller.start().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_agent_still_moves_state() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let backend = Backend::Dynamic {
            command_addr: addr,
            command_timeout: Duration::from_secs(1),
            artifact_dir: None,
        };
        let buf = SharedBuf::default();
        let mut controller =
            ProfilerController::open(CompatibleBackend::for_tests("s", backend), memory_sink(&buf))
                .await
                .unwrap();

        assert!(matches!(controller.start().await, Err(ControllerError::Agent(_))));
        assert_eq!(controller.state(), SessionState::Recording);
        assert!(matches!(controller.stop().await, Err(ControllerError::Agent(_))));

        let report = controller.stop_session().await.unwrap();
        assert_eq!(report.backend, BackendKind::Dynamic);

        let log = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert!(log.contains(r#""command":"start","delivered":false"#));
        assert!(log.contains(r#""command":"stop-session","delivered":false"#));
    }

    /// Accepts the log header, then fails every later write
    struct FailingLog {
        writes: usize,
    }

    impl io::Write for FailingLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.writes += 1;
            if self.writes > 1 {
                return Err(io::Error::other("disk full"));
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_event_log_is_reported_again_without_resending_stop_session() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = Backend::Dynamic {
            command_addr: listener.local_addr().unwrap(),
            command_timeout: Duration::from_secs(2),
            artifact_dir: None,
        };
        let received = Arc::new(Mutex::new(Vec::new()));
        let agent_side = Arc::clone(&received);
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut line = String::new();
                let _ = stream.read_to_string(&mut line).await;
                agent_side.lock().unwrap().push(line);
            }
        });

        let sink = EventSink::to_writer(
            "failing",
            FailingLog { writes: 0 },
            crate::export::JsonLinesRenderer::new("test"),
        )
        .unwrap();
        let mut controller =
            ProfilerController::open(CompatibleBackend::for_tests("s", backend), sink)
                .await
                .unwrap();

        assert!(matches!(controller.stop_session().await, Err(ControllerError::Sink(_))));
        assert!(matches!(
            controller.stop_session().await,
            Err(ControllerError::Sink(SinkError::Failed { .. }))
        ));
        assert_eq!(controller.state(), SessionState::SessionStopped);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*received.lock().unwrap(), vec!["stop-session\n".to_string()]);
    }

    #[tokio::test]
    #[should_panic(expected = "cannot capture snapshots")]
    async fn test_snapshot_without_capability_is_a_bug() {
        let buf = SharedBuf::default();
        let backend = Backend::StaticAgent { artifact_dir: None };
        let mut controller =
            ProfilerController::open(CompatibleBackend::for_tests("s", backend), memory_sink(&buf))
                .await
                .unwrap();
        controller.start().await.unwrap();
        let _ = controller.capture_snapshot(None).await;
    }

    #[tokio::test]
    async fn test_static_agent_env() {
        let buf = SharedBuf::default();
        let backend = Backend::StaticAgent { artifact_dir: Some("/tmp/artifacts".into()) };
        let mut controller =
            ProfilerController::open(CompatibleBackend::for_tests("s", backend), memory_sink(&buf))
                .await
                .unwrap();

        let env: BTreeMap<_, _> = controller.launch_env().into_iter().collect();
        assert!(env[ENV_EVENT_ADDR].starts_with("127.0.0.1:"));
        assert_eq!(env[ENV_RECORD_ON_START], "true");
        assert_eq!(env[ENV_ARTIFACT_DIR], "/tmp/artifacts");
        assert!(!env.contains_key(ENV_COMMAND_ADDR));
        controller.stop_session().await.unwrap();
    }
}
