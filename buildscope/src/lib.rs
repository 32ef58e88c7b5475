//! # buildscope - Build Benchmarking with Pluggable Profilers
//!
//! buildscope runs a build tool repeatedly (warm-up builds, then measured
//! builds), times every invocation and optionally profiles it through an
//! agent living inside the measured process. Profiling must never perturb the
//! timing it accompanies, so the agent only enqueues on the hot path and every
//! artifact is written by a dedicated thread.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     buildscope (controller)                     │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Preflight   │──▶│   Scenario   │──▶│   Analysis   │         │
//! │  │ (compatible) │   │    Runner    │   │ (statistics) │         │
//! │  └──────────────┘   └──────┬───────┘   └──────────────┘         │
//! │                            │ start / stop / snapshot            │
//! │                            ▼                                    │
//! │                     ┌──────────────┐   ┌──────────────┐         │
//! │                     │   Profiler   │──▶│  Event Sink  │──▶ log  │
//! │                     │  Controller  │   │ (1 writer)   │         │
//! │                     └──────┬───────┘   └──────────────┘         │
//! └────────────────────────────┼────────────────────────────────────┘
//!              commands (tcp)  │  ▲  events (tcp, 16-byte frames)
//!                              ▼  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              measured build process + buildscope-agent          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`runner`]: the iteration loop, build-tool adapters, process launching
//!   with timeouts and cancellation, build mutators
//! - [`preflight`]: rejects incompatible profiler/adapter pairings before any
//!   process is launched
//! - [`profiling`]: backends, their capabilities and the session state machine
//! - [`channel`]: command client and event receiver of the agent protocol
//! - [`sink`]: single-writer, order-preserving event log
//! - [`export`]: Chrome trace and JSON-lines renderers, run summary
//! - [`analysis`]: samples and their statistics over measured builds
//! - [`results`]: per-iteration results, failures and scenario reports
//! - [`domain`]: core types and errors
//! - [`cli`]: command-line arguments
//!
//! ## Profiler Backends
//!
//! - **none**: builds are only timed
//! - **dynamic**: the agent records only between `start` and `stop` commands
//!   sent around each recorded build; supports snapshots
//! - **static-agent**: the agent records from process start and writes its
//!   artifacts at exit
//!
//! ## Typical Usage
//!
//! ```bash
//! # 2 warm-up + 5 measured builds
//! buildscope -- make -j8
//!
//! # Collect operations reported by an agent linked into the build tool
//! buildscope --profiler static-agent -- ./tools/build
//!
//! # Several scenarios from a file
//! buildscope --scenario-file scenarios.json -o results/
//! ```

pub mod analysis;
pub mod channel;
pub mod cli;
pub mod domain;
pub mod export;
pub mod preflight;
pub mod profiling;
pub mod results;
pub mod runner;
pub mod sink;
