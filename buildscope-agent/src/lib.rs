//! # buildscope agent - in-process side of the profiling protocol
//!
//! Linked into the measured build process. The agent connects back to the
//! controller that launched the process and reports completed operations over
//! a single long-lived event stream, while listening for `start`/`stop`/...
//! commands on its own address.
//!
//! ```text
//! ┌──────────────────────── measured process ────────────────────────┐
//! │  instrumentation hook ──record_operation()──▶ outbound buffer    │
//! │        (never blocks)                              │             │
//! │                                    writer thread ◀─┘             │
//! │  command thread ◀── "start\n" ──┐        │ 16-byte frames        │
//! └─────────────────────────────────┼────────┼───────────────────────┘
//!                                   │        ▼
//!                              controller (event receiver)
//! ```
//!
//! ## Failure model
//!
//! The agent must never take the host down with it. If the controller cannot
//! be reached at attach time the agent logs a warning and stays
//! uninstrumented: every hook becomes a cheap no-op.
//!
//! ## Process-wide holder
//!
//! Instrumentation call sites rarely get constructor arguments, so the agent
//! can be installed once per process with [`init`], fetched by reference with
//! [`global`], and released with [`teardown`]. Accessing it before `init`, or
//! initializing twice, fails fast.

mod commands;
mod stream;
mod trigger;

use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use buildscope_common::{
    ControlCommand, OperationEvent, ENV_ARTIFACT_DIR, ENV_COMMAND_ADDR, ENV_EVENT_ADDR,
    ENV_RECORD_ON_START,
};
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use thiserror::Error;

use commands::CommandListener;
use stream::Outbound;

pub use trigger::{Trigger, TriggerContext, TriggerPoint};

/// Default bound on the initial connect to the controller.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("The agent is already initialized in this process")]
    AlreadyInitialized,

    #[error("The agent has not been initialized in this process")]
    NotInitialized,

    #[error("Invalid address in {var}: {value:?}")]
    InvalidAddress { var: &'static str, value: String },
}

/// Launch-time configuration, normally read from the environment.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Controller event listener. `None` leaves the agent inactive.
    pub event_addr: Option<SocketAddr>,
    /// Address to accept commands on. `None` for always-on backends.
    pub command_addr: Option<SocketAddr>,
    /// Open the recording gate as soon as the agent attaches.
    pub record_on_start: bool,
    /// Where snapshot and final artifacts go.
    pub artifact_dir: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            event_addr: None,
            command_addr: None,
            record_on_start: false,
            artifact_dir: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl AgentConfig {
    /// Read the configuration the controller put in this process's environment.
    ///
    /// # Errors
    /// Returns [`AgentError::InvalidAddress`] if an address variable is malformed.
    pub fn from_env() -> Result<Self, AgentError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`AgentConfig::from_env`] with a custom variable lookup.
    ///
    /// # Errors
    /// Returns [`AgentError::InvalidAddress`] if an address variable is malformed.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AgentError> {
        let parse_addr = |var: &'static str| -> Result<Option<SocketAddr>, AgentError> {
            match lookup(var) {
                Some(value) if !value.trim().is_empty() => value
                    .trim()
                    .parse()
                    .map(Some)
                    .map_err(|_| AgentError::InvalidAddress { var, value }),
                _ => Ok(None),
            }
        };

        Ok(Self {
            event_addr: parse_addr(ENV_EVENT_ADDR)?,
            command_addr: parse_addr(ENV_COMMAND_ADDR)?,
            record_on_start: lookup(ENV_RECORD_ON_START)
                .is_some_and(|v| matches!(v.trim(), "1" | "true")),
            artifact_dir: lookup(ENV_ARTIFACT_DIR)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }
}

/// Receives every command after the agent has applied it to its recording gate.
pub trait CommandHandler: Send + Sync {
    fn on_command(&self, command: ControlCommand);
}

/// Collects handler and triggers, then attaches the agent.
pub struct AgentBuilder {
    config: AgentConfig,
    handler: Option<Arc<dyn CommandHandler>>,
    triggers: Vec<Trigger>,
}

impl AgentBuilder {
    #[must_use]
    pub fn new(config: AgentConfig) -> Self {
        Self { config, handler: None, triggers: Vec::new() }
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    #[must_use]
    pub fn trigger(mut self, trigger: Trigger) -> Self {
        self.triggers.push(trigger);
        self
    }

    /// Connect to the controller, start the agent threads and run the
    /// `ProcessStart` triggers.
    ///
    /// Never fails: any connection problem leaves the agent uninstrumented.
    #[must_use]
    pub fn attach(self) -> Agent {
        let agent = self.connect();
        agent.fire(TriggerPoint::ProcessStart, None);
        agent
    }

    fn connect(self) -> Agent {
        let Self { config, handler, triggers } = self;

        let connected = config.event_addr.and_then(|addr| {
            let result = TcpStream::connect_timeout(&addr, config.connect_timeout)
                .and_then(|socket| stream::spawn_writer(socket, config.artifact_dir.clone()));
            match result {
                Ok(writer) => {
                    info!("Connected to controller at {addr}");
                    Some(writer)
                }
                Err(e) => {
                    warn!("Could not connect to controller at {addr}: {e}; running uninstrumented");
                    None
                }
            }
        });
        if config.event_addr.is_none() {
            debug!("No controller address configured; agent inactive");
        }

        let (events, writer) = match connected {
            Some((tx, handle)) => (Some(tx), Some(handle)),
            None => (None, None),
        };

        let recording = Arc::new(AtomicBool::new(config.record_on_start && events.is_some()));

        let commands = match (&events, config.command_addr) {
            (Some(tx), Some(addr)) => {
                let gate = Arc::clone(&recording);
                let tx = tx.clone();
                let dispatch = move |command| apply_command(command, &gate, &tx, handler.as_deref());
                match CommandListener::bind(addr, dispatch) {
                    Ok(listener) => Some(listener),
                    Err(e) => {
                        warn!("Could not listen for commands on {addr}: {e}");
                        None
                    }
                }
            }
            _ => None,
        };

        Agent {
            command_addr: commands.as_ref().map(CommandListener::local_addr),
            events,
            writer: Mutex::new(writer),
            commands: Mutex::new(commands),
            recording,
            triggers,
            detached: AtomicBool::new(false),
        }
    }
}

fn apply_command(
    command: ControlCommand,
    recording: &AtomicBool,
    events: &Sender<Outbound>,
    handler: Option<&dyn CommandHandler>,
) {
    debug!("Agent received command: {command}");
    match command {
        ControlCommand::Start => recording.store(true, Ordering::SeqCst),
        ControlCommand::Stop => recording.store(false, Ordering::SeqCst),
        ControlCommand::CaptureSnapshot => {
            let _ = events.send(Outbound::Snapshot);
        }
        ControlCommand::StopSession => {
            recording.store(false, Ordering::SeqCst);
            let _ = events.send(Outbound::Finalize);
        }
    }
    if let Some(handler) = handler {
        handler.on_command(command);
    }
}

/// The agent resident in the measured process.
pub struct Agent {
    events: Option<Sender<Outbound>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    commands: Mutex<Option<CommandListener>>,
    command_addr: Option<SocketAddr>,
    recording: Arc<AtomicBool>,
    triggers: Vec<Trigger>,
    detached: AtomicBool,
}

impl Agent {
    /// Attach with no command handler and no triggers.
    #[must_use]
    pub fn attach(config: AgentConfig) -> Self {
        AgentBuilder::new(config).attach()
    }

    /// Whether the event stream to the controller is up.
    #[must_use]
    pub fn is_instrumented(&self) -> bool {
        self.events.is_some()
    }

    #[must_use]
    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::SeqCst)
    }

    /// Address the command listener actually bound (resolves port 0).
    #[must_use]
    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.command_addr
    }

    /// Instrumentation hook: report a completed operation.
    ///
    /// Enqueues into the outbound buffer and returns immediately; socket I/O
    /// happens on the writer thread. Dropped while not recording.
    pub fn record_operation(&self, operation_id: i64, duration: Duration) {
        if !self.is_recording() {
            return;
        }
        let duration_ms = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        let event = OperationEvent::new(operation_id, duration_ms);
        self.emit(event);
        self.fire(TriggerPoint::OperationFinished, Some(event));
    }

    /// Enqueue an event without the recording check and without firing triggers.
    pub fn emit(&self, event: OperationEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(Outbound::Event(event));
        }
    }

    /// Ask the writer thread to write a snapshot artifact.
    pub fn request_snapshot(&self) {
        if let Some(tx) = &self.events {
            let _ = tx.send(Outbound::Snapshot);
        }
    }

    /// Stop the command listener, flush pending events and close the stream.
    ///
    /// Runs the `ProcessExit` triggers first. Safe to call more than once.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        self.fire(TriggerPoint::ProcessExit, None);
        self.shut_down();
    }

    /// Detach an agent whose `ProcessStart` triggers never ran.
    fn discard(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            self.shut_down();
        }
    }

    fn shut_down(&self) {
        if let Some(listener) = lock(&self.commands).take() {
            listener.close();
        }
        if let Some(tx) = &self.events {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(handle) = lock(&self.writer).take() {
            if handle.join().is_err() {
                warn!("Agent event writer panicked");
            }
        }
    }

    fn fire(&self, point: TriggerPoint, operation: Option<OperationEvent>) {
        let ctx = TriggerContext { point, agent: self, operation };
        for trigger in self.triggers.iter().filter(|t| t.point() == point) {
            trigger.fire(&ctx);
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.detach();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Process-wide holder
// ============================================================================

static GLOBAL: Mutex<Option<Arc<Agent>>> = Mutex::new(None);

/// Attach the process-wide agent.
///
/// The holder lock is not held while connecting or while the `ProcessStart`
/// triggers run, so a trigger may call [`global`]. The agent is installed
/// before its triggers fire.
///
/// # Errors
/// Returns [`AgentError::AlreadyInitialized`] if an agent is already installed;
/// the existing agent is left untouched.
pub fn init(builder: AgentBuilder) -> Result<Arc<Agent>, AgentError> {
    if lock(&GLOBAL).is_some() {
        return Err(AgentError::AlreadyInitialized);
    }
    let agent = Arc::new(builder.connect());

    {
        let mut slot = lock(&GLOBAL);
        if slot.is_some() {
            // Another thread won while this one was connecting
            agent.discard();
            return Err(AgentError::AlreadyInitialized);
        }
        *slot = Some(Arc::clone(&agent));
    }

    agent.fire(TriggerPoint::ProcessStart, None);
    Ok(agent)
}

/// The process-wide agent, to be passed to instrumentation call sites.
///
/// # Errors
/// Returns [`AgentError::NotInitialized`] before [`init`] or after [`teardown`].
pub fn global() -> Result<Arc<Agent>, AgentError> {
    lock(&GLOBAL).clone().ok_or(AgentError::NotInitialized)
}

/// Detach and uninstall the process-wide agent.
///
/// # Errors
/// Returns [`AgentError::NotInitialized`] if no agent is installed.
pub fn teardown() -> Result<(), AgentError> {
    let agent = lock(&GLOBAL).take().ok_or(AgentError::NotInitialized)?;
    agent.detach();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildscope_common::EVENT_FRAME_LEN;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn send_command(addr: SocketAddr, command: ControlCommand) {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(command.to_line().as_bytes()).unwrap();
    }

    fn free_addr() -> SocketAddr {
        TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
    }

    #[test]
    fn test_config_from_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_EVENT_ADDR, "127.0.0.1:4000"),
            (ENV_COMMAND_ADDR, "127.0.0.1:4001"),
            (ENV_RECORD_ON_START, "1"),
            (ENV_ARTIFACT_DIR, "/tmp/artifacts"),
        ]
        .into_iter()
        .collect();

        let config = AgentConfig::from_lookup(|k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(config.event_addr, Some("127.0.0.1:4000".parse().unwrap()));
        assert_eq!(config.command_addr, Some("127.0.0.1:4001".parse().unwrap()));
        assert!(config.record_on_start);
        assert_eq!(config.artifact_dir, Some(PathBuf::from("/tmp/artifacts")));
    }

    #[test]
    fn test_config_rejects_bad_address() {
        let err = AgentConfig::from_lookup(|k| (k == ENV_EVENT_ADDR).then(|| "nope".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_EVENT_ADDR));
    }

    #[test]
    fn test_unreachable_controller_leaves_agent_uninstrumented() {
        let config = AgentConfig {
            event_addr: Some(free_addr()),
            record_on_start: true,
            ..AgentConfig::default()
        };
        let agent = Agent::attach(config);
        assert!(!agent.is_instrumented());
        assert!(!agent.is_recording());
        // Hooks must still be callable
        agent.record_operation(1, Duration::from_millis(5));
        agent.detach();
    }

    #[test]
    fn test_commands_gate_recording() {
        let controller = TcpListener::bind("127.0.0.1:0").unwrap();
        let config = AgentConfig {
            event_addr: Some(controller.local_addr().unwrap()),
            command_addr: Some("127.0.0.1:0".parse().unwrap()),
            ..AgentConfig::default()
        };
        let agent = Agent::attach(config);
        let (mut conn, _) = controller.accept().unwrap();
        let command_addr = agent.command_addr().unwrap();

        // Not recording yet: dropped
        agent.record_operation(1, Duration::from_millis(10));

        send_command(command_addr, ControlCommand::Start);
        assert!(wait_until(|| agent.is_recording()));
        agent.record_operation(2, Duration::from_millis(20));

        send_command(command_addr, ControlCommand::Stop);
        assert!(wait_until(|| !agent.is_recording()));
        agent.detach();

        let mut bytes = Vec::new();
        conn.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes.len(), EVENT_FRAME_LEN);
        let frame: [u8; EVENT_FRAME_LEN] = bytes[..].try_into().unwrap();
        assert_eq!(OperationEvent::decode(&frame).unwrap(), OperationEvent::new(2, 20));
    }

    #[test]
    fn test_triggers_fire_at_their_point() {
        let starts = Arc::new(AtomicUsize::new(0));
        let exits = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&starts);
        let e = Arc::clone(&exits);

        let agent = AgentBuilder::new(AgentConfig::default())
            .trigger(Trigger::new(TriggerPoint::ProcessStart, move |_| {
                s.fetch_add(1, Ordering::SeqCst);
            }))
            .trigger(Trigger::new(TriggerPoint::ProcessExit, move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            }))
            .attach();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        agent.detach();
        agent.detach();
        assert_eq!(exits.load(Ordering::SeqCst), 1);
    }

    /// Serializes tests that touch the process-wide holder.
    static HOLDER: Mutex<()> = Mutex::new(());

    #[test]
    fn test_global_holder_lifecycle() {
        let _holder = lock(&HOLDER);
        assert!(matches!(global(), Err(AgentError::NotInitialized)));
        let agent = init(AgentBuilder::new(AgentConfig::default())).unwrap();
        assert!(matches!(
            init(AgentBuilder::new(AgentConfig::default())),
            Err(AgentError::AlreadyInitialized)
        ));
        assert!(Arc::ptr_eq(&agent, &global().unwrap()));
        teardown().unwrap();
        assert!(matches!(global(), Err(AgentError::NotInitialized)));
        assert!(matches!(teardown(), Err(AgentError::NotInitialized)));
    }

    #[test]
    fn test_start_trigger_can_reach_the_installed_agent() {
        let _holder = lock(&HOLDER);
        let (found_tx, found_rx) = crossbeam_channel::bounded(1);

        let builder = AgentBuilder::new(AgentConfig::default()).trigger(Trigger::new(
            TriggerPoint::ProcessStart,
            move |ctx| {
                let installed = global().is_ok_and(|agent| std::ptr::eq(&*agent, ctx.agent));
                let _ = found_tx.send(installed);
            },
        ));
        let init_thread = std::thread::spawn(move || init(builder).is_ok());

        // A trigger blocked on the holder lock never reports back
        let installed = found_rx.recv_timeout(Duration::from_secs(5));
        assert_eq!(installed, Ok(true));
        assert!(init_thread.join().unwrap());
        teardown().unwrap();
    }
}
