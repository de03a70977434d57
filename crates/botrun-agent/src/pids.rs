use std::collections::BTreeSet;

use sysinfo::{ProcessesToUpdate, System};

/// Native process enumeration and forced termination.
pub trait ProcessTable: Send + Sync {
    /// Ids of running processes whose executable name matches `name`.
    fn list(&self, name: &str) -> BTreeSet<u32>;

    /// Forcibly ends `pid`. A process that is already gone is not an error.
    fn kill(&self, pid: u32) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn list(&self, name: &str) -> BTreeSet<u32> {
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes()
            .iter()
            .filter(|(_, p)| matches_runtime(&p.name().to_string_lossy(), name))
            .map(|(pid, _)| pid.as_u32())
            .collect()
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> anyhow::Result<()> {
        let pid_t = libc::pid_t::try_from(pid)
            .map_err(|_| anyhow::anyhow!("pid out of range: {pid}"))?;
        let rc = unsafe { libc::kill(pid_t, libc::SIGKILL) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(anyhow::Error::new(err).context(format!("kill pid {pid}")));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn kill(&self, pid: u32) -> anyhow::Result<()> {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match sys.process(pid) {
            Some(p) if !p.kill() => anyhow::bail!("failed to terminate pid {pid}"),
            _ => Ok(()),
        }
    }
}

/// `java` matches `java`, `javaw` and their `.exe` forms, case-insensitively.
fn matches_runtime(process_name: &str, name: &str) -> bool {
    let process_name = process_name.to_ascii_lowercase();
    let name = name.to_ascii_lowercase();
    let stem = process_name.strip_suffix(".exe").unwrap_or(&process_name);
    stem == name || stem.strip_suffix('w') == Some(name.as_str())
}

/// The one process that appeared between two snapshots, if exactly one did.
pub fn resolve_new_pid(before: &BTreeSet<u32>, after: &BTreeSet<u32>) -> Option<u32> {
    let mut new = after.difference(before);
    match (new.next(), new.next()) {
        (Some(pid), None) => Some(*pid),
        _ => None,
    }
}
