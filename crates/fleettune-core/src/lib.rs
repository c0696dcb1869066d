//! Core library for fleettune.
//!
//! Provides the building blocks used by the `fleettune` binary: local
//! command execution ([`runner`]), the [`target`] abstraction over local
//! and SSH-reachable machines, the script execution layer ([`script`]),
//! the hardware setting apply functions ([`settings`]), the concurrent
//! multi-target update orchestrator ([`orchestrator`]), and correlation
//! of per-target status lines back into per-setting verdicts
//! ([`correlate`]).

pub mod correlate;
pub mod cpu;
pub mod orchestrator;
pub mod progress;
pub mod runner;
pub mod script;
pub mod settings;
pub mod target;
