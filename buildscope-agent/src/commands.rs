//! Command listener: one short-lived connection per command token.

use std::io::{self, BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use buildscope_common::ControlCommand;
use log::{debug, warn};

/// A sender that connects but never writes must not wedge the listener.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct CommandListener {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

impl CommandListener {
    pub(crate) fn bind<F>(addr: SocketAddr, dispatch: F) -> io::Result<Self>
    where
        F: Fn(ControlCommand) + Send + 'static,
    {
        let listener = TcpListener::bind(addr)?;
        let addr = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let worker = thread::Builder::new()
            .name("buildscope-agent-commands".to_string())
            .spawn(move || accept_loop(&listener, &flag, &dispatch))?;

        debug!("Listening for commands on {addr}");
        Ok(Self { addr, shutdown, worker })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) fn close(self) {
        self.shutdown.store(true, Ordering::SeqCst);

        // Wake the blocking accept with a throwaway connection
        let mut wake = self.addr;
        if wake.ip().is_unspecified() {
            wake.set_ip(IpAddr::V4(Ipv4Addr::LOCALHOST));
        }
        let _ = TcpStream::connect_timeout(&wake, Duration::from_millis(500));

        if self.worker.join().is_err() {
            warn!("Agent command listener panicked");
        }
    }
}

fn accept_loop(listener: &TcpListener, shutdown: &AtomicBool, dispatch: &dyn Fn(ControlCommand)) {
    for conn in listener.incoming() {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        let stream = match conn {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to accept command connection: {e}");
                continue;
            }
        };

        match read_line(stream) {
            Ok(line) if line.trim().is_empty() => debug!("Command connection closed without a token"),
            Ok(line) => match line.parse::<ControlCommand>() {
                Ok(command) => dispatch(command),
                Err(e) => warn!("{e}"),
            },
            Err(e) => warn!("Failed to read command: {e}"),
        }
    }
}

fn read_line(stream: TcpStream) -> io::Result<String> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    Ok(line)
}
