//! Pairing of clone events with the new task's first stop.
//!
//! The parent's PTRACE_EVENT_{CLONE,FORK,VFORK} stop and the child's initial
//! SIGSTOP arrive in either order. Whichever side shows up first leaves an
//! entry here for the other side to claim.

use crate::core::trap::ResourceSample;
use nix::unistd::Pid;
use std::collections::HashMap;

/// First stop of a task nobody has announced yet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueuedStop {
    pub status: i32,
    pub usage: ResourceSample,
}

#[derive(Debug)]
enum Pending {
    /// Child stopped before its parent's event; it stays stopped
    Stopped(QueuedStop),
    /// Parent's event seen; the child's first stop is still to come
    Announced { parent: Pid },
}

/// Outcome of a first stop from an untracked task
#[derive(Debug, PartialEq, Eq)]
pub enum ChildStop {
    Queued,
    /// The parent already announced this child
    Recovered { parent: Pid },
}

/// Outcome of a parent's clone event
#[derive(Debug, PartialEq, Eq)]
pub enum ParentEvent {
    /// The child is already stopped and waiting to be resumed
    Consumed(QueuedStop),
    /// The child's first stop has not arrived yet
    Announced,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<Pid, Pending>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child_stopped(&mut self, child: Pid, stop: QueuedStop) -> ChildStop {
        match self.entries.remove(&child) {
            Some(Pending::Announced { parent }) => ChildStop::Recovered { parent },
            Some(Pending::Stopped(_)) | None => {
                self.entries.insert(child, Pending::Stopped(stop));
                ChildStop::Queued
            }
        }
    }

    pub fn parent_event(&mut self, parent: Pid, child: Pid) -> ParentEvent {
        match self.entries.remove(&child) {
            Some(Pending::Stopped(stop)) => ParentEvent::Consumed(stop),
            Some(Pending::Announced { .. }) | None => {
                self.entries.insert(child, Pending::Announced { parent });
                ParentEvent::Announced
            }
        }
    }

    /// Whether `child` is known from its parent's event but has not stopped yet.
    pub fn is_announced(&self, child: Pid) -> bool {
        matches!(self.entries.get(&child), Some(Pending::Announced { .. }))
    }

    /// Drop whatever is recorded for a task that went away.
    pub fn forget(&mut self, pid: Pid) {
        self.entries.remove(&pid);
    }

    /// Tasks sitting in their first stop, unclaimed
    pub fn stopped(&self) -> Vec<Pid> {
        self.entries
            .iter()
            .filter(|(_, p)| matches!(p, Pending::Stopped(_)))
            .map(|(pid, _)| *pid)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
