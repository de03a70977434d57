use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use botrun_process::{RunEvent, RunPhase};
use tokio::sync::{broadcast, watch};

use crate::{Account, Parameter, Proxy, Script, World, encoder};

/// Tells the client to log in with its stored credentials.
pub const AUTOLOGIN_FLAG: &str = "-autologin";

const EVENT_CAPACITY: usize = 64;

/// Run configuration: one account, its scripts, an optional proxy, a world pool
/// and the client's runtime switches.
#[derive(Debug)]
pub struct Configuration {
    pub account: Arc<Account>,
    pub scripts: Vec<Arc<Script>>,
    pub proxy: Option<Proxy>,
    pub worlds: Vec<Arc<World>>,
    /// Megabytes, at most [`Configuration::MAX_MEMORY`].
    pub memory_allocation: Option<u32>,
    pub collect_data: bool,
    pub debug_mode: bool,
    pub debug_port: Option<u16>,
    pub low_cpu_mode: bool,
    pub low_resource_mode: bool,
    pub dismiss_randoms: bool,
    pub reflection: bool,
    pub no_randoms: bool,
    pub no_interface: bool,
    pub no_render: bool,
    pub new_mouse: bool,
    pub enable_breaks: bool,
    pub stop_after_break: bool,
    pub mirror_mode: bool,
    pub launch_game: bool,
    pub close_client: bool,
    pub(crate) log_file: PathBuf,
    pub(crate) run_state: Arc<RunState>,
}

impl Configuration {
    /// Largest memory allocation the store can hold.
    pub const MAX_MEMORY: u32 = i32::MAX as u32;

    pub fn new(account: Arc<Account>, scripts: Vec<Arc<Script>>, logs_dir: &Path) -> Self {
        Self {
            account,
            scripts,
            proxy: None,
            worlds: Vec::new(),
            memory_allocation: None,
            collect_data: false,
            debug_mode: false,
            debug_port: None,
            low_cpu_mode: false,
            low_resource_mode: false,
            dismiss_randoms: false,
            reflection: false,
            no_randoms: false,
            no_interface: false,
            no_render: false,
            new_mouse: false,
            enable_breaks: false,
            stop_after_break: false,
            mirror_mode: false,
            launch_game: false,
            close_client: false,
            log_file: new_log_file(logs_dir),
            run_state: Arc::new(RunState::new()),
        }
    }

    /// Duplicates the configuration for editing as a new entry.
    ///
    /// Account, scripts and worlds are shared; the copy gets its own log file
    /// and run state.
    pub fn copy(&self) -> Self {
        let logs_dir = self.log_file.parent().unwrap_or_else(|| Path::new("."));
        Self {
            account: self.account.clone(),
            scripts: self.scripts.clone(),
            proxy: self.proxy.clone(),
            worlds: self.worlds.clone(),
            memory_allocation: self.memory_allocation,
            collect_data: self.collect_data,
            debug_mode: self.debug_mode,
            debug_port: self.debug_port,
            low_cpu_mode: self.low_cpu_mode,
            low_resource_mode: self.low_resource_mode,
            dismiss_randoms: self.dismiss_randoms,
            reflection: self.reflection,
            no_randoms: self.no_randoms,
            no_interface: self.no_interface,
            no_render: self.no_render,
            new_mouse: self.new_mouse,
            enable_breaks: self.enable_breaks,
            stop_after_break: self.stop_after_break,
            mirror_mode: self.mirror_mode,
            launch_game: self.launch_game,
            close_client: self.close_client,
            log_file: new_log_file(logs_dir),
            run_state: Arc::new(RunState::new()),
        }
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    /// Creates the log file, and its directory, if it does not exist yet.
    /// Existing content is kept.
    pub fn ensure_log_file(&self) -> std::io::Result<()> {
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        Ok(())
    }

    pub fn run_state(&self) -> &Arc<RunState> {
        &self.run_state
    }

    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }

    /// Encoder output for one launch, with a fresh world draw.
    pub fn to_parameter(&self) -> anyhow::Result<Vec<String>> {
        encoder::encode(self)
    }

    /// One full command per script: `prefix`, the autologin flag, this
    /// configuration's tokens and the script's tokens.
    ///
    /// Each script is encoded independently, so each may land on a different
    /// random world. See [`Configuration::commands_with_shared_world`].
    pub fn commands(&self, prefix: &[String]) -> anyhow::Result<Vec<Vec<String>>> {
        self.scripts
            .iter()
            .map(|script| -> anyhow::Result<Vec<String>> {
                let tokens = encoder::encode(self)?;
                Ok(assemble(prefix, tokens, script))
            })
            .collect()
    }

    /// Like [`Configuration::commands`] but draws one world for the whole run.
    pub fn commands_with_shared_world(&self, prefix: &[String]) -> anyhow::Result<Vec<Vec<String>>> {
        if self.scripts.is_empty() {
            return Ok(Vec::new());
        }
        let world = encoder::pick_world(&self.worlds)?;
        Ok(self
            .scripts
            .iter()
            .map(|script| assemble(prefix, encoder::encode_with_world(self, &world), script))
            .collect())
    }
}

fn assemble(prefix: &[String], tokens: Vec<String>, script: &Script) -> Vec<String> {
    let mut cmd = prefix.to_vec();
    cmd.push(AUTOLOGIN_FLAG.to_string());
    cmd.extend(tokens);
    cmd.extend(script.to_parameter());
    cmd
}

pub(crate) fn new_log_file(logs_dir: &Path) -> PathBuf {
    logs_dir.join(uuid::Uuid::new_v4().to_string())
}

/// Runtime-only state of a configuration. Never persisted.
#[derive(Debug)]
pub struct RunState {
    phase: watch::Sender<RunPhase>,
    events: broadcast::Sender<RunEvent>,
    pid: Mutex<Option<u32>>,
    active: AtomicBool,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            phase,
            events,
            pid: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.phase().is_running()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn set_phase(&self, phase: RunPhase) {
        self.phase.send_replace(phase);
    }

    pub fn publish(&self, event: RunEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }

    pub fn take_pid(&self) -> Option<u32> {
        self.pid.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Claims the single run slot. Returns false when a run task already owns it.
    pub fn try_begin(&self) -> bool {
        !self.active.swap(true, Ordering::SeqCst)
    }

    pub fn finish(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
