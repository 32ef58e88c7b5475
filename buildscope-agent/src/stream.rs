//! Outbound event stream to the controller.
//!
//! Hooks push into an unbounded channel; one writer thread owns the socket,
//! keeps running totals per operation, and writes artifacts on request.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::net::{Shutdown, TcpStream};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use buildscope_common::OperationEvent;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, warn};

pub(crate) enum Outbound {
    Event(OperationEvent),
    Snapshot,
    Finalize,
    Close,
}

#[derive(Debug, Default, Clone, Copy)]
struct Totals {
    count: u64,
    total_ms: i64,
}

pub(crate) fn spawn_writer(
    socket: TcpStream,
    artifact_dir: Option<PathBuf>,
) -> io::Result<(Sender<Outbound>, JoinHandle<()>)> {
    let (tx, rx) = crossbeam_channel::unbounded();
    let handle = thread::Builder::new()
        .name("buildscope-agent-events".to_string())
        .spawn(move || run_writer(socket, &rx, artifact_dir.as_deref()))?;
    Ok((tx, handle))
}

fn run_writer(socket: TcpStream, rx: &Receiver<Outbound>, artifact_dir: Option<&Path>) {
    let mut out = BufWriter::new(socket);
    let mut totals: BTreeMap<i64, Totals> = BTreeMap::new();
    let mut connected = true;
    let mut snapshots = 0u32;
    let mut finalized = false;

    for message in rx {
        match message {
            Outbound::Event(event) => {
                let entry = totals.entry(event.operation_id).or_default();
                entry.count += 1;
                entry.total_ms = entry.total_ms.saturating_add(event.duration_ms);

                if connected {
                    // Flush once the backlog is drained, not per frame
                    let written = out.write_all(&event.encode()).and_then(|()| {
                        if rx.is_empty() {
                            out.flush()
                        } else {
                            Ok(())
                        }
                    });
                    if let Err(e) = written {
                        warn!("Lost connection to controller: {e}; further events are dropped");
                        connected = false;
                    }
                }
            }
            Outbound::Snapshot => {
                snapshots += 1;
                write_artifact(artifact_dir, &format!("snapshot-{snapshots}"), &totals);
            }
            Outbound::Finalize => {
                if !finalized {
                    write_artifact(artifact_dir, "final", &totals);
                    finalized = true;
                }
            }
            Outbound::Close => break,
        }
    }

    if !finalized {
        write_artifact(artifact_dir, "final", &totals);
    }
    if connected {
        let _ = out.flush();
    }
    let _ = out.get_ref().shutdown(Shutdown::Write);
}

fn write_artifact(dir: Option<&Path>, label: &str, totals: &BTreeMap<i64, Totals>) {
    let Some(dir) = dir else {
        return;
    };

    let mut body = String::from("operation_id\tcount\ttotal_ms\n");
    for (id, t) in totals {
        let _ = writeln!(body, "{id}\t{}\t{}", t.count, t.total_ms);
    }

    let path = dir.join(format!("buildscope-agent-{}-{label}.tsv", std::process::id()));
    match fs::create_dir_all(dir).and_then(|()| fs::write(&path, body)) {
        Ok(()) => debug!("Wrote agent artifact {}", path.display()),
        Err(e) => warn!("Could not write agent artifact {}: {e}", path.display()),
    }
}
