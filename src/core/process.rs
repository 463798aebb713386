//! Process/thread tree of the traced workload.
//!
//! Nodes are keyed by pid/tid. Processes own their thread list, threads point
//! back at their process; the pid→node maps are the only owners.

use crate::config::types::{ExitStatus, ProcessSummary, Result, TraceError};
use crate::core::handles::{FileSet, WorkingDir};
use crate::core::trap::{CallState, ResourceSample};
use crate::kernel::abi::{CompatMode, SyscallInfo};
use nix::unistd::Pid;
use std::collections::HashMap;

#[derive(Debug)]
pub struct ProcessNode {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub threads: Vec<Pid>,
    /// Latest usage sample of the whole process
    pub usage: ResourceSample,
    pub peak_threads: usize,
    /// Calling convention, detected lazily and reset on exec
    pub compat: Option<CompatMode>,
}

impl ProcessNode {
    fn new(pid: Pid, parent: Option<Pid>) -> Self {
        Self {
            pid,
            parent,
            children: Vec::new(),
            threads: vec![pid],
            usage: ResourceSample::default(),
            peak_threads: 1,
            compat: None,
        }
    }

    pub fn summary(&self, files: &FileSet, exit: Option<ExitStatus>) -> ProcessSummary {
        ProcessSummary {
            pid: self.pid.as_raw(),
            exit,
            memory: self.usage.memory,
            user_time: self.usage.user,
            sys_time: self.usage.sys,
            threads: self.peak_threads,
            files_opened: files.opened(),
            bytes_read: files.total_read(),
            bytes_written: files.total_written(),
        }
    }
}

#[derive(Debug)]
pub struct ThreadNode {
    pub tid: Pid,
    pub process: Pid,
    pub state: CallState,
    pub files: FileSet,
    pub cwd: WorkingDir,
    /// Thread whose clone created this one
    pub spawner: Option<Pid>,
    /// Decoded entry stop of the syscall in progress
    pub(crate) entry: Option<SyscallInfo>,
    /// Clone return already reported from the event stop
    pub(crate) clone_return_reported: bool,
}

impl ThreadNode {
    fn new(tid: Pid, process: Pid, files: FileSet, cwd: WorkingDir) -> Self {
        Self {
            tid,
            process,
            state: CallState::CallOut,
            files,
            cwd,
            spawner: None,
            entry: None,
            clone_return_reported: false,
        }
    }

    /// Pair a decoded stop with the entry of the syscall in progress.
    ///
    /// An exit stop reports the entry's number and arguments with the exit's
    /// return value. Registers at exit may no longer describe the call:
    /// rt_sigreturn restores a frame whose number is -1, aarch64 overwrites
    /// the first argument and exec can switch the calling convention.
    pub(crate) fn settle_syscall(&mut self, state: CallState, decoded: SyscallInfo) -> SyscallInfo {
        match state {
            CallState::CallIn => {
                self.entry = Some(decoded.clone());
                decoded
            }
            CallState::CallOut => match self.entry.take() {
                Some(entry) => SyscallInfo {
                    retval: decoded.retval,
                    ..entry
                },
                None => decoded,
            },
        }
    }
}

/// What leaving the tree took with it
#[derive(Debug)]
pub struct ThreadRemoval {
    pub thread: ThreadNode,
    /// Set when the removed thread was its process's last
    pub process: Option<ProcessNode>,
}

#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: HashMap<Pid, ProcessNode>,
    threads: HashMap<Pid, ThreadNode>,
    created: usize,
}

fn missing(what: &str, pid: Pid) -> TraceError {
    TraceError::Process(format!("unknown {what} {pid}"))
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the root process and its main thread.
    pub fn insert_root(&mut self, pid: Pid, files: FileSet, cwd: WorkingDir) {
        self.processes.insert(pid, ProcessNode::new(pid, None));
        self.threads.insert(pid, ThreadNode::new(pid, pid, files, cwd));
        self.created += 1;
    }

    /// Add `child` as a thread of `spawner`'s process, sharing its handles.
    ///
    /// The child starts out as a thread; placement as a process happens once
    /// the clone flags are known.
    pub fn attach_thread(&mut self, spawner: Pid, child: Pid) -> Result<()> {
        let parent = self.threads.get(&spawner).ok_or_else(|| missing("thread", spawner))?;
        let process = parent.process;
        let mut node = ThreadNode::new(child, process, parent.files.share(), parent.cwd.share());
        node.spawner = Some(spawner);

        let owner = self
            .processes
            .get_mut(&process)
            .ok_or_else(|| missing("process", process))?;
        owner.threads.push(child);
        self.threads.insert(child, node);
        Ok(())
    }

    /// Move `tid` out of its process into a new child process of its own.
    pub fn promote_to_process(&mut self, tid: Pid) -> Result<()> {
        let thread = self.threads.get_mut(&tid).ok_or_else(|| missing("thread", tid))?;
        let former = thread.process;
        if former == tid {
            return Ok(());
        }
        thread.process = tid;

        let owner = self
            .processes
            .get_mut(&former)
            .ok_or_else(|| missing("process", former))?;
        owner.threads.retain(|t| *t != tid);
        owner.children.push(tid);
        let compat = owner.compat;

        let mut node = ProcessNode::new(tid, Some(former));
        node.compat = compat;
        self.processes.insert(tid, node);
        self.created += 1;
        Ok(())
    }

    /// Drop a thread; drop its process too if it was the last one.
    pub fn remove_thread(&mut self, tid: Pid) -> Option<ThreadRemoval> {
        let thread = self.threads.remove(&tid)?;
        let pid = thread.process;
        let emptied = match self.processes.get_mut(&pid) {
            Some(owner) => {
                owner.threads.retain(|t| *t != tid);
                owner.threads.is_empty()
            }
            None => false,
        };

        let process = if emptied { self.detach_process(pid) } else { None };
        Some(ThreadRemoval { thread, process })
    }

    fn detach_process(&mut self, pid: Pid) -> Option<ProcessNode> {
        let node = self.processes.remove(&pid)?;
        if let Some(parent) = node.parent.and_then(|p| self.processes.get_mut(&p)) {
            parent.children.retain(|c| *c != pid);
        }
        for child in &node.children {
            if let Some(orphan) = self.processes.get_mut(child) {
                orphan.parent = None;
            }
        }
        Some(node)
    }

    /// Collapse `leader`'s process after a successful exec by `former`.
    ///
    /// The kernel reassigns the exec'ing thread the leader's tid and kills the
    /// rest of the group. The survivor keeps its handles and call state.
    /// Returns the tids that vanished.
    pub fn collapse_after_exec(&mut self, leader: Pid, former: Pid) -> Result<Vec<Pid>> {
        let pid = self
            .threads
            .get(&former)
            .or_else(|| self.threads.get(&leader))
            .map(|t| t.process)
            .ok_or_else(|| missing("thread", former))?;

        let mut survivor = match self.threads.remove(&former) {
            Some(node) => node,
            None => self.threads.remove(&leader).ok_or_else(|| missing("thread", leader))?,
        };
        // the exec'ing thread still owes the execve exit stop
        survivor.tid = leader;

        let owner = self.processes.get_mut(&pid).ok_or_else(|| missing("process", pid))?;
        let vanished: Vec<Pid> = owner
            .threads
            .iter()
            .copied()
            .filter(|t| *t != former && *t != leader)
            .collect();
        owner.threads = vec![leader];
        owner.compat = None;

        for tid in &vanished {
            self.threads.remove(tid);
        }
        self.threads.insert(leader, survivor);
        Ok(vanished)
    }

    /// Fold the current thread count into the process's peak once a new
    /// task has been placed.
    pub fn refresh_peak(&mut self, pid: Pid) {
        if let Some(node) = self.processes.get_mut(&pid) {
            node.peak_threads = node.peak_threads.max(node.threads.len());
        }
    }

    pub fn record_usage(&mut self, pid: Pid, sample: ResourceSample) {
        if let Some(node) = self.processes.get_mut(&pid) {
            node.usage.user = node.usage.user.max(sample.user);
            node.usage.sys = node.usage.sys.max(sample.sys);
            node.usage.memory = node.usage.memory.max(sample.memory);
        }
    }

    pub fn thread(&self, tid: Pid) -> Option<&ThreadNode> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Pid) -> Option<&mut ThreadNode> {
        self.threads.get_mut(&tid)
    }

    pub fn process(&self, pid: Pid) -> Option<&ProcessNode> {
        self.processes.get(&pid)
    }

    pub fn process_mut(&mut self, pid: Pid) -> Option<&mut ProcessNode> {
        self.processes.get_mut(&pid)
    }

    pub fn process_of(&self, tid: Pid) -> Option<&ProcessNode> {
        self.threads.get(&tid).and_then(|t| self.processes.get(&t.process))
    }

    pub fn processes(&self) -> impl Iterator<Item = &ProcessNode> {
        self.processes.values()
    }

    /// Live tids in ascending order
    pub fn tids(&self) -> Vec<Pid> {
        let mut tids: Vec<Pid> = self.threads.keys().copied().collect();
        tids.sort_by_key(|t| t.as_raw());
        tids
    }

    /// Live pids in ascending order
    pub fn pids(&self) -> Vec<Pid> {
        let mut pids: Vec<Pid> = self.processes.keys().copied().collect();
        pids.sort_by_key(|p| p.as_raw());
        pids
    }

    pub fn live_processes(&self) -> usize {
        self.processes.len()
    }

    pub fn live_threads(&self) -> usize {
        self.threads.len()
    }

    /// Processes ever created, root included
    pub fn created(&self) -> usize {
        self.created
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Remove every remaining process with the file table of one of its threads.
    pub fn drain(&mut self) -> Vec<(ProcessNode, FileSet)> {
        let mut drained = Vec::new();
        for pid in self.pids() {
            if let Some(node) = self.processes.remove(&pid) {
                let files = node
                    .threads
                    .iter()
                    .find_map(|t| self.threads.get(t))
                    .map(|t| t.files.share())
                    .unwrap_or_default();
                drained.push((node, files));
            }
        }
        self.threads.clear();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::abi::sysno;

    fn pid(n: i32) -> Pid {
        Pid::from_raw(n)
    }

    fn rooted() -> ProcessTable {
        let mut table = ProcessTable::new();
        table.insert_root(pid(100), FileSet::with_stdio(), WorkingDir::new("/work"));
        table
    }

    #[test]
    fn attached_thread_shares_handles_with_spawner() {
        let mut table = rooted();
        table.attach_thread(pid(100), pid(101)).unwrap();

        let child = table.thread(pid(101)).unwrap();
        let root = table.thread(pid(100)).unwrap();
        assert!(child.files.shares_with(&root.files));
        assert_eq!(child.process, pid(100));
        assert_eq!(child.spawner, Some(pid(100)));
        assert_eq!(child.state, CallState::CallOut);
        assert_eq!(table.process(pid(100)).unwrap().threads.len(), 2);
        assert_eq!(table.created(), 1);

        assert_eq!(table.process(pid(100)).unwrap().peak_threads, 1);
        table.refresh_peak(pid(100));
        assert_eq!(table.process(pid(100)).unwrap().peak_threads, 2);
    }

    #[test]
    fn promotion_creates_child_process() {
        let mut table = rooted();
        table.attach_thread(pid(100), pid(200)).unwrap();
        table.promote_to_process(pid(200)).unwrap();

        assert_eq!(table.live_processes(), 2);
        assert_eq!(table.created(), 2);
        assert_eq!(table.process(pid(100)).unwrap().children, vec![pid(200)]);
        assert_eq!(table.process(pid(100)).unwrap().threads, vec![pid(100)]);
        assert_eq!(table.process(pid(200)).unwrap().parent, Some(pid(100)));
        assert_eq!(table.process_of(pid(200)).unwrap().pid, pid(200));
    }

    #[test]
    fn last_thread_takes_process_along() {
        let mut table = rooted();
        table.attach_thread(pid(100), pid(101)).unwrap();

        let first = table.remove_thread(pid(101)).unwrap();
        assert!(first.process.is_none());

        let last = table.remove_thread(pid(100)).unwrap();
        assert_eq!(last.process.unwrap().pid, pid(100));
        assert!(table.is_empty());
        assert!(table.remove_thread(pid(100)).is_none());
    }

    #[test]
    fn exiting_parent_orphans_children() {
        let mut table = rooted();
        table.attach_thread(pid(100), pid(200)).unwrap();
        table.promote_to_process(pid(200)).unwrap();

        table.remove_thread(pid(100)).unwrap();
        assert_eq!(table.process(pid(200)).unwrap().parent, None);
    }

    #[test]
    fn exec_from_secondary_thread_rekeys_survivor() {
        let mut table = rooted();
        table.attach_thread(pid(100), pid(101)).unwrap();
        table.attach_thread(pid(100), pid(102)).unwrap();
        table.thread_mut(pid(102)).unwrap().state = CallState::CallIn;
        table.process_mut(pid(100)).unwrap().compat = Some(CompatMode::X86_64);

        let vanished = table.collapse_after_exec(pid(100), pid(102)).unwrap();
        assert_eq!(vanished, vec![pid(101)]);
        assert_eq!(table.tids(), vec![pid(100)]);
        let survivor = table.thread(pid(100)).unwrap();
        assert_eq!(survivor.state, CallState::CallIn);
        assert_eq!(table.process(pid(100)).unwrap().compat, None);
    }

    fn stop(mode: CompatMode, number: i64, raw: u64, retval: i64) -> SyscallInfo {
        SyscallInfo {
            mode,
            number,
            raw,
            args: [7, 8, 9, 0, 0, 0],
            retval,
        }
    }

    #[test]
    fn exit_stop_reports_entry_number() {
        let mut table = rooted();
        let thread = table.thread_mut(pid(100)).unwrap();

        // rt_sigreturn: the restored frame carries orig_rax == -1
        thread.settle_syscall(CallState::CallIn, stop(CompatMode::X86_64, 15, 15, 0));
        let mut exit = stop(CompatMode::X86_64, -1, u64::MAX, 3);
        exit.args = [0; 6];
        let settled = thread.settle_syscall(CallState::CallOut, exit);

        assert_eq!(settled.number, 15);
        assert_eq!(settled.raw, 15);
        assert_eq!(settled.args, [7, 8, 9, 0, 0, 0]);
        assert_eq!(settled.retval, 3);
        assert!(thread.entry.is_none());
    }

    #[test]
    fn exit_without_entry_keeps_decoded_stop() {
        let mut table = rooted();
        let thread = table.thread_mut(pid(100)).unwrap();
        let settled = thread.settle_syscall(CallState::CallOut, stop(CompatMode::X86_64, 0, 0, 5));
        assert_eq!(settled.number, 0);
        assert_eq!(settled.retval, 5);
    }

    #[test]
    fn execve_exit_survives_exec_into_other_convention() {
        let mut table = rooted();
        table.attach_thread(pid(100), pid(101)).unwrap();
        table
            .thread_mut(pid(101))
            .unwrap()
            .settle_syscall(CallState::CallIn, stop(CompatMode::X86_64, 59, 59, 0));

        table.collapse_after_exec(pid(100), pid(101)).unwrap();

        // after exec the registers decode as ia32, where 59 is olduname
        let exit = stop(CompatMode::Ia32, sysno::UNMAPPED, 59, 0);
        let settled = table
            .thread_mut(pid(100))
            .unwrap()
            .settle_syscall(CallState::CallOut, exit);
        assert_eq!(settled.number, sysno::EXECVE);
        assert_eq!(settled.mode, CompatMode::X86_64);
        assert_eq!(settled.retval, 0);
    }

    #[test]
    fn usage_keeps_maxima() {
        let mut table = rooted();
        table.record_usage(
            pid(100),
            ResourceSample {
                memory: 4096,
                ..Default::default()
            },
        );
        table.record_usage(
            pid(100),
            ResourceSample {
                memory: 1024,
                ..Default::default()
            },
        );
        assert_eq!(table.process(pid(100)).unwrap().usage.memory, 4096);
    }

    #[test]
    fn drain_empties_table_with_file_counters() {
        let mut table = rooted();
        table.thread(pid(100)).unwrap().files.open(3, "/x", 0);
        let drained = table.drain();
        assert_eq!(drained.len(), 1);
        let summary = drained[0].0.summary(&drained[0].1, None);
        assert_eq!(summary.files_opened, 1);
        assert!(table.is_empty());
    }
}
