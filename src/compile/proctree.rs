//! Process-tree enumeration and termination.
//!
//! The parent/child map comes from a [`sysinfo`] snapshot of the process
//! table. Threads are dropped from the snapshot. Zombies are treated as dead:
//! they hold no resources beyond a process table slot and cannot be
//! signalled away.

use crate::error::{GhccError, Result};
use nix::sys::signal::{Signal, kill};
use nix::unistd::{Pid, getpgid};
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, ProcessStatus, System};
use tracing::{debug, warn};

/// How often [`terminate_tree`] checks whether signalled processes are gone.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Fail unless the process table can be read on this platform.
pub fn ensure_supported() -> Result<()> {
    if sysinfo::IS_SUPPORTED_SYSTEM {
        Ok(())
    } else {
        Err(GhccError::Unsupported(
            "process tree inspection is not available on this platform".into(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    parent: Option<i32>,
    start_time: u64,
    zombie: bool,
}

/// Point-in-time view of the process table.
#[derive(Debug, Default)]
pub struct ProcessTable {
    entries: HashMap<i32, Entry>,
}

impl ProcessTable {
    pub fn capture() -> Self {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessRefreshKind::new());

        // Threads show up next to processes; signalling one hits its whole process.
        let mut threads = HashSet::new();
        for (pid, process) in system.processes() {
            if let Some(tasks) = process.tasks() {
                threads.extend(tasks.iter().filter(|tid| *tid != pid).copied());
            }
        }

        let entries = system
            .processes()
            .iter()
            .filter(|(pid, _)| !threads.contains(*pid))
            .map(|(pid, process)| {
                let entry = Entry {
                    parent: process.parent().map(|parent| parent.as_u32() as i32),
                    start_time: process.start_time(),
                    zombie: matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
                };
                (pid.as_u32() as i32, entry)
            })
            .collect();
        Self { entries }
    }

    /// Whether `pid` exists and is not a zombie.
    pub fn is_alive(&self, pid: Pid) -> bool {
        self.entries
            .get(&pid.as_raw())
            .is_some_and(|entry| !entry.zombie)
    }

    fn start_time(&self, pid: i32) -> Option<u64> {
        self.entries
            .get(&pid)
            .filter(|entry| !entry.zombie)
            .map(|entry| entry.start_time)
    }

    /// Live descendants of `root`, parents before children. `root` is excluded.
    pub fn descendants(&self, root: Pid) -> Vec<Pid> {
        let mut children: HashMap<i32, Vec<i32>> = HashMap::new();
        for (pid, entry) in &self.entries {
            if let Some(parent) = entry.parent {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let mut found = Vec::new();
        let mut visited = HashSet::from([root.as_raw()]);
        let mut queue = VecDeque::from([root.as_raw()]);
        while let Some(pid) = queue.pop_front() {
            for child in children.get(&pid).into_iter().flatten() {
                if !visited.insert(*child) {
                    continue;
                }
                queue.push_back(*child);
                if self.is_alive(Pid::from_raw(*child)) {
                    found.push(Pid::from_raw(*child));
                }
            }
        }
        found
    }

    /// Live members of process group `pgid`.
    pub fn group_members(&self, pgid: Pid) -> Vec<Pid> {
        self.entries
            .iter()
            .filter(|(_, entry)| !entry.zombie)
            .map(|(pid, _)| Pid::from_raw(*pid))
            .filter(|pid| getpgid(Some(*pid)).is_ok_and(|group| group == pgid))
            .collect()
    }

    /// `roots` that are still alive followed by all their live descendants, without repeats.
    pub fn subtrees(&self, roots: &[Pid]) -> Vec<Pid> {
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for root in roots {
            if self.is_alive(*root) && seen.insert(*root) {
                found.push(*root);
            }
            for pid in self.descendants(*root) {
                if seen.insert(pid) {
                    found.push(pid);
                }
            }
        }
        found
    }
}

/// Every process ever observed below a worker.
///
/// Entries are keyed by pid and start time, so a recycled pid is never
/// mistaken for a process that was seen earlier.
#[derive(Debug, Default)]
pub struct Lineage {
    seen: HashMap<i32, u64>,
}

impl Lineage {
    /// Remember the current descendants of `root`.
    pub fn record(&mut self, table: &ProcessTable, root: Pid) {
        for pid in table.descendants(root) {
            if let Some(start_time) = table.start_time(pid.as_raw()) {
                self.seen.entry(pid.as_raw()).or_insert(start_time);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Recorded processes that are still the same process and still alive.
    pub fn survivors(&self, table: &ProcessTable) -> Vec<Pid> {
        let mut alive: Vec<Pid> = self
            .seen
            .iter()
            .filter(|(pid, start_time)| table.start_time(**pid) == Some(**start_time))
            .map(|(pid, _)| Pid::from_raw(*pid))
            .collect();
        alive.sort_by_key(|pid| pid.as_raw());
        alive
    }
}

/// Whether `pid` exists and is not a zombie.
#[cfg(test)]
pub fn is_alive(pid: Pid) -> bool {
    ProcessTable::capture().is_alive(pid)
}

pub fn descendants(root: Pid) -> Vec<Pid> {
    ProcessTable::capture().descendants(root)
}

#[cfg(test)]
pub fn group_members(pgid: Pid) -> Vec<Pid> {
    ProcessTable::capture().group_members(pgid)
}

/// Terminate `root` and every descendant.
///
/// Descendants are enumerated before anything is signalled, since killing a
/// parent re-parents its children out of the tree. Everything gets SIGTERM
/// first; whatever is still alive after `grace` gets SIGKILL. Returns the
/// number of processes that had to be force-killed.
pub fn terminate_tree(root: Pid, grace: Duration) -> usize {
    let mut targets = descendants(root);
    targets.insert(0, root);
    debug!(root = root.as_raw(), count = targets.len(), "Terminating process tree");

    for pid in &targets {
        let _ = kill(*pid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + grace;
    let mut alive: Vec<Pid> = targets;
    loop {
        let table = ProcessTable::capture();
        alive.retain(|pid| table.is_alive(*pid));
        if alive.is_empty() || Instant::now() >= deadline {
            // Anything forked during the grace period is reachable only now.
            for pid in table.descendants(root) {
                if !alive.contains(&pid) {
                    alive.push(pid);
                }
            }
            break;
        }
        std::thread::sleep(EXIT_POLL_INTERVAL);
    }

    signal_all(&alive, Signal::SIGKILL);
    if !alive.is_empty() {
        debug!(
            root = root.as_raw(),
            killed = alive.len(),
            "Force-killed processes that ignored SIGTERM"
        );
    }
    alive.len()
}

/// What is left of a worker: its process group, the survivors of its
/// lineage, and everything below either.
pub fn leftovers(table: &ProcessTable, pgid: Pid, lineage: &Lineage) -> Vec<Pid> {
    let mut roots = table.group_members(pgid);
    roots.extend(lineage.survivors(table));
    table.subtrees(&roots)
}

/// SIGKILL everything [`leftovers`] reports. Returns how many processes were signalled.
pub fn sweep(pgid: Pid, lineage: &Lineage) -> usize {
    let targets = leftovers(&ProcessTable::capture(), pgid, lineage);
    signal_all(&targets, Signal::SIGKILL);
    if !targets.is_empty() {
        warn!(
            pgid = pgid.as_raw(),
            count = targets.len(),
            "Killed leftover processes from worker"
        );
    }
    targets.len()
}

/// SIGKILL every live descendant of `root`. Returns how many were signalled.
pub fn kill_descendants(root: Pid) -> usize {
    let targets = descendants(root);
    signal_all(&targets, Signal::SIGKILL);
    targets.len()
}

fn signal_all(pids: &[Pid], signal: Signal) {
    for pid in pids {
        let _ = kill(*pid, signal);
    }
}
