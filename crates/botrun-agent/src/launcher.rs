use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::Context;
use botrun_config::{Configuration, RunState};
use botrun_process::{FatalError, RunEvent, RunPhase};
use tokio::{process::Command, task::JoinHandle};

use crate::{
    client::ClientLauncher,
    monitor::{self, Outcome, RunLog},
    pids::{self, ProcessTable},
    settings::Settings,
};

/// Tokens whose following value carries credentials.
const SECRET_FLAGS: &[&str] = &["-bot", "-proxy"];

#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub runtime_name: String,
    pub settle_delay: Duration,
    pub shared_world: bool,
}

impl LaunchOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            runtime_name: settings.runtime_name.clone(),
            settle_delay: settings.settle_delay,
            shared_world: settings.shared_world,
        }
    }
}

/// Starts configurations and supervises their client processes.
#[derive(Clone)]
pub struct Launcher {
    client: Arc<dyn ClientLauncher>,
    processes: Arc<dyn ProcessTable>,
    options: LaunchOptions,
}

impl Launcher {
    pub fn new(
        client: Arc<dyn ClientLauncher>,
        processes: Arc<dyn ProcessTable>,
        options: LaunchOptions,
    ) -> Self {
        Self {
            client,
            processes,
            options,
        }
    }

    /// Runs every script of `config` in order on a background task.
    ///
    /// Returns once the task is spawned. Progress is published through the
    /// configuration's [`RunState`]. Fails if the configuration is already
    /// running or cannot produce commands.
    pub fn run(&self, config: &Configuration) -> anyhow::Result<JoinHandle<()>> {
        let state = config.run_state().clone();
        if !state.try_begin() {
            anyhow::bail!("configuration is already running");
        }

        let prepared = self.prepare(config);
        let (commands, log) = match prepared {
            Ok(v) => v,
            Err(e) => {
                state.finish();
                return Err(e);
            }
        };

        let job = RunJob {
            processes: self.processes.clone(),
            runtime_name: self.options.runtime_name.clone(),
            settle_delay: self.options.settle_delay,
            close_client: config.close_client,
            state,
            commands,
        };
        tracing::info!(
            account = %config.account,
            scripts = job.commands.len(),
            log = %config.log_file().display(),
            "run requested"
        );
        Ok(tokio::spawn(job.run(log)))
    }

    fn prepare(&self, config: &Configuration) -> anyhow::Result<(Vec<Vec<String>>, RunLog)> {
        if config.scripts.is_empty() {
            anyhow::bail!("configuration has no scripts");
        }
        let prefix = self.client.command_prefix()?;
        let commands = if self.options.shared_world {
            config.commands_with_shared_world(&prefix)?
        } else {
            config.commands(&prefix)?
        };
        let log = RunLog::create(config.log_file())
            .with_context(|| format!("create log file {}", config.log_file().display()))?;
        Ok((commands, log))
    }

    /// Kills the client of the command currently running, if its pid is known.
    ///
    /// The run itself carries on with its next script once the output closes.
    pub fn stop(&self, config: &Configuration) {
        terminate(self.processes.as_ref(), config.run_state());
    }
}

/// Kills the tracked client of an active run. A no-op when nothing is running
/// or no pid was resolved.
pub fn terminate(processes: &dyn ProcessTable, state: &RunState) {
    if !state.is_running() {
        return;
    }
    let Some(pid) = state.pid() else {
        return;
    };
    tracing::info!(pid, "stop requested, killing client");
    if let Err(e) = processes.kill(pid) {
        tracing::warn!(pid, error = %e, "failed to kill client");
    }
}

/// Copy of `command` safe to log.
pub fn redact_command(command: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(command.len());
    let mut redact_next = false;
    for token in command {
        if redact_next {
            let visible = token.split(':').next().unwrap_or_default();
            out.push(format!("{visible}:<redacted>"));
        } else {
            out.push(token.clone());
        }
        redact_next = SECRET_FLAGS.contains(&token.as_str());
    }
    out
}

struct RunJob {
    processes: Arc<dyn ProcessTable>,
    runtime_name: String,
    settle_delay: Duration,
    close_client: bool,
    state: Arc<RunState>,
    commands: Vec<Vec<String>>,
}

impl RunJob {
    async fn run(self, mut log: RunLog) {
        for index in 0..self.commands.len() {
            if let Some(err) = self.run_command(index, &mut log).await {
                tracing::warn!(index, error = %err, "run aborted by client output");
                self.state.set_phase(RunPhase::Failed);
                self.state.publish(RunEvent::Fatal { error: err });
                break;
            }
        }

        self.state.set_pid(None);
        self.state.set_phase(RunPhase::Idle);
        self.state.finish();
        self.state.publish(RunEvent::RunCompleted);
        tracing::info!("run finished");
    }

    /// Runs one script's command to completion. Returns the fatal error that
    /// should end the whole run, if any.
    async fn run_command(&self, index: usize, log: &mut RunLog) -> Option<FatalError> {
        let command = &self.commands[index];
        let Some((program, args)) = command.split_first() else {
            return None;
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(
                    index,
                    command = ?redact_command(command),
                    error = %e,
                    "failed to start client"
                );
                self.state.publish(RunEvent::CommandFailed {
                    index,
                    message: format!("spawn {program}: {e}"),
                });
                return None;
            }
        };

        self.state.set_phase(RunPhase::Running);
        let before = self.processes.list(&self.runtime_name);
        self.state.set_pid(None);
        tracing::info!(
            index,
            os_pid = ?child.id(),
            command = ?redact_command(command),
            "client started"
        );
        self.state.publish(RunEvent::Started {
            index,
            os_pid: child.id(),
        });

        let mut output = monitor::merge_output(child.stdout.take(), child.stderr.take());
        let outcome = monitor::watch_output(&mut output.lines, log, self.close_client, || {
            self.resolve_pid(index, &before)
        })
        .await;
        drop(output);

        if let Some(pid) = self.state.take_pid() {
            tracing::info!(index, pid, ?outcome, "killing client");
            if let Err(e) = self.processes.kill(pid) {
                tracing::warn!(index, pid, error = %e, "failed to kill client");
            }
            tokio::time::sleep(self.settle_delay).await;
        }
        // Reap the direct child if it already exited.
        let _ = child.try_wait();

        match outcome {
            // The caller moves the phase on to Failed.
            Outcome::Fatal(err) => Some(err),
            Outcome::Ended | Outcome::ExitMarker => {
                self.state.set_phase(RunPhase::Idle);
                self.state.publish(RunEvent::Finished { index });
                None
            }
        }
    }

    fn resolve_pid(&self, index: usize, before: &BTreeSet<u32>) {
        let after = self.processes.list(&self.runtime_name);
        match pids::resolve_new_pid(before, &after) {
            Some(pid) => {
                tracing::info!(index, pid, "client pid resolved");
                self.state.set_pid(Some(pid));
                self.state.publish(RunEvent::PidResolved { index, pid });
            }
            None => {
                tracing::debug!(
                    index,
                    new = after.difference(before).count(),
                    "client pid not resolved"
                );
            }
        }
    }
}
