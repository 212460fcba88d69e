//! Walking and signalling the OS process tree below a given pid.

use std::collections::{HashMap, HashSet, VecDeque};
use sysinfo::{Pid, Signal, System};
use tracing::{debug, warn};

/// All transitive children of `root` in `table` of `(pid, ppid)` pairs,
/// parents before children.
pub fn descendants_in(table: &[(u32, u32)], root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for &(pid, ppid) in table {
        if pid != ppid {
            children.entry(ppid).or_default().push(pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(parent) = queue.pop_front() {
        if let Some(kids) = children.get(&parent) {
            for &kid in kids {
                if kid != root && !found.contains(&kid) {
                    found.push(kid);
                    queue.push_back(kid);
                }
            }
        }
    }
    found
}

/// Point-in-time view of the process table.
pub struct ProcessTree {
    system: System,
}

impl ProcessTree {
    pub fn snapshot() -> Self {
        let mut system = System::new();
        system.refresh_processes();
        Self { system }
    }

    /// `(pid, ppid)` for every process with a known parent. Threads are
    /// left out: signalling a thread id would hit its whole process.
    pub fn table(&self) -> Vec<(u32, u32)> {
        let threads: HashSet<Pid> = self
            .system
            .processes()
            .iter()
            .filter_map(|(pid, process)| process.tasks().map(|tasks| (pid, tasks)))
            .flat_map(|(owner, tasks)| tasks.iter().filter(move |task| *task != owner).copied())
            .collect();

        self.system
            .processes()
            .iter()
            .filter(|(pid, _)| !threads.contains(pid))
            .filter_map(|(pid, process)| {
                process
                    .parent()
                    .map(|parent| (pid.as_u32(), parent.as_u32()))
            })
            .collect()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.system.process(to_pid(pid)).is_some()
    }

    pub fn descendants(&self, root: u32) -> Vec<u32> {
        descendants_in(&self.table(), root)
    }

    /// Arguments of `pid` after the program name, space separated.
    pub fn command_line(&self, pid: u32) -> Option<String> {
        let process = self.system.process(to_pid(pid))?;
        Some(
            process
                .cmd()
                .iter()
                .skip(1)
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        )
    }

    /// Sends `SIGTERM` to `pid`. Returns false if the process is already
    /// gone or cannot be signalled.
    pub fn terminate(&self, pid: u32) -> bool {
        let Some(process) = self.system.process(to_pid(pid)) else {
            debug!(pid, "process already exited");
            return false;
        };
        match process.kill_with(Signal::Term) {
            Some(true) => true,
            Some(false) => {
                debug!(pid, "process already exited");
                false
            }
            None => {
                warn!(pid, "SIGTERM is not supported on this platform");
                false
            }
        }
    }
}

fn to_pid(pid: u32) -> Pid {
    Pid::from(pid as usize)
}

/// Prints and terminates every descendant of `root`. Returns the number of
/// processes signalled.
pub fn terminate_descendants(root: u32) -> usize {
    let tree = ProcessTree::snapshot();
    let mut signalled = 0;
    for pid in tree.descendants(root) {
        if let Some(cmdline) = tree.command_line(pid) {
            println!("SIGTERM >>> {}", cmdline);
        }
        if tree.terminate(pid) {
            signalled += 1;
        }
    }
    signalled
}
