//! Module lifecycle: states, commands, the run marker and worker threads.
//!
//! Every readout module follows the same state machine:
//!
//! ```text
//! Unconfigured --configure--> Configured --start--> Running --stop--> Stopped --scrap--> Scrapped
//!                                 |                    ^                 |
//!                                 +------scrap-----+   +------start------+
//! ```
//!
//! Commands are validated with [`ModuleState::transition`] before any side effect runs,
//! and the new state is only committed once the command succeeded. A failed configure
//! therefore leaves the module `Unconfigured`.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

use crate::{ReadoutError, Result};

/// Lifecycle state of a readout module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    Unconfigured,
    Configured,
    Running,
    Stopped,
    Scrapped,
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModuleState::Unconfigured => "unconfigured",
            ModuleState::Configured => "configured",
            ModuleState::Running => "running",
            ModuleState::Stopped => "stopped",
            ModuleState::Scrapped => "scrapped",
        };
        f.write_str(name)
    }
}

/// Commands accepted by readout modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Configure,
    Start,
    Stop,
    Scrap,
    Record,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Configure => "configure",
            Command::Start => "start",
            Command::Stop => "stop",
            Command::Scrap => "scrap",
            Command::Record => "record",
        }
    }
}

impl ModuleState {
    /// Returns the state reached by applying `command`, or
    /// [`ReadoutError::InvalidTransition`] if the command is not accepted here.
    ///
    /// `Record` is only accepted while running and does not change the state.
    pub fn transition(self, command: Command) -> Result<ModuleState> {
        use ModuleState::*;
        match (self, command) {
            (Unconfigured, Command::Configure) => Ok(Configured),
            (Configured | Stopped, Command::Start) => Ok(Running),
            (Running, Command::Stop) => Ok(Stopped),
            (Configured | Stopped, Command::Scrap) => Ok(Scrapped),
            (Running, Command::Record) => Ok(Running),
            (state, command) => Err(ReadoutError::InvalidTransition { command: command.as_str(), state }),
        }
    }
}

/// Shared cancellation flag read by worker loops on every iteration.
///
/// Cloning shares the flag. Set by start, cleared by stop.
#[derive(Debug, Clone, Default)]
pub struct RunMarker(Arc<AtomicBool>);

impl RunMarker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_running(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A named OS thread running one loop until its [`RunMarker`] clears.
///
/// The closure returns whatever state the owner needs back after the loop exits
/// (typically the resources it borrowed for the run).
#[derive(Debug)]
pub struct WorkerThread<T> {
    name: String,
    marker: RunMarker,
    /// `None` when the body never received the state handed to [`spawn_with`](Self::spawn_with).
    handle: Option<JoinHandle<Option<T>>>,
}

impl<T: Send + 'static> WorkerThread<T> {
    /// Sets `marker` and spawns `body` on a thread called `name`.
    pub fn spawn<B>(name: impl Into<String>, marker: RunMarker, body: B) -> Result<Self>
    where
        B: FnOnce(RunMarker) -> T + Send + 'static,
    {
        Self::spawn_inner(name.into(), marker, move |running| Some(body(running)))
    }

    /// Like [`spawn`](Self::spawn), moving `state` into the thread.
    ///
    /// If the thread cannot be created, `state` is handed back with the error so the
    /// caller can release what it holds.
    pub fn spawn_with<S, B>(
        name: impl Into<String>,
        marker: RunMarker,
        state: S,
        body: B,
    ) -> std::result::Result<Self, (ReadoutError, Option<S>)>
    where
        S: Send + 'static,
        B: FnOnce(S, RunMarker) -> T + Send + 'static,
    {
        let name = name.into();
        let (handoff, pickup) = crossbeam_channel::bounded(1);
        if let Err(crossbeam_channel::SendError(state)) = handoff.send(state) {
            return Err((ReadoutError::Thread { thread: name, reason: "state handoff failed".into() }, Some(state)));
        }
        let thread_pickup = pickup.clone();
        Self::spawn_inner(name, marker, move |running| thread_pickup.try_recv().ok().map(|state| body(state, running)))
            .map_err(|e| (e, pickup.try_recv().ok()))
    }

    fn spawn_inner<B>(name: String, marker: RunMarker, body: B) -> Result<Self>
    where
        B: FnOnce(RunMarker) -> Option<T> + Send + 'static,
    {
        marker.set_running();
        let loop_marker = marker.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || body(loop_marker)).map_err(|e| {
            marker.clear();
            ReadoutError::Thread { thread: name.clone(), reason: e.to_string() }
        })?;
        debug!(thread = %name, "Worker thread spawned");
        Ok(Self { name, marker, handle: Some(handle) })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Clears the marker and joins the thread, returning the body's result.
    pub fn stop(self) -> Result<T> {
        self.marker.clear();
        self.join()
    }

    /// Joins the thread without touching the marker, for a loop that already ended.
    pub fn join(mut self) -> Result<T> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| ReadoutError::Thread { thread: self.name.clone(), reason: "already joined".into() })?;
        match handle.join() {
            Ok(Some(output)) => Ok(output),
            Ok(None) => Err(ReadoutError::Thread { thread: self.name.clone(), reason: "worker state was never handed over".into() }),
            Err(_) => {
                error!(thread = %self.name, "Worker thread panicked");
                Err(ReadoutError::Thread { thread: self.name.clone(), reason: "panicked".into() })
            }
        }
    }
}

impl<T> Drop for WorkerThread<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.marker.clear();
            let _ = handle.join();
        }
    }
}

/// Summary of a module for operational monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInfo {
    pub name: String,
    pub state: ModuleState,
    /// Frames delivered (readers), consumed (handlers, recorders) or packets processed.
    pub frames: u64,
}

/// The command surface shared by readers, handlers, recorders and consumers.
///
/// This is the only dynamically dispatched boundary of a readout chain; the per-frame
/// work behind it is monomorphized for the concrete frame type.
pub trait DaqModule: Send {
    fn name(&self) -> &str;
    fn state(&self) -> ModuleState;
    fn configure(&mut self) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn scrap(&mut self) -> Result<()>;
    fn info(&self) -> ModuleInfo;
}
