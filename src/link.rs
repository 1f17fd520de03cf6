//! Per-connection link bookkeeping.
use crate::term::Pid;

/// One `(local, remote)` link pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    /// Pid of the local mailbox.
    pub local: Pid,

    /// Pid of the remote process.
    pub remote: Pid,
}

/// Set of links routed through one connection.
///
/// Backed by a plain vector with linear search: a connection rarely
/// carries more than a handful of links. The owning connection serializes
/// access with its own lock.
#[derive(Debug, Default)]
pub struct LinkTable {
    links: Vec<Link>,
}

impl LinkTable {
    /// Makes an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a link pair. Adding an existing pair is a no-op; returns
    /// whether the pair was inserted.
    pub fn add(&mut self, local: Pid, remote: Pid) -> bool {
        if self.exists(&local, &remote) {
            return false;
        }
        self.links.push(Link { local, remote });
        true
    }

    /// Removes a link pair; returns whether it was present.
    pub fn remove(&mut self, local: &Pid, remote: &Pid) -> bool {
        let before = self.links.len();
        self.links
            .retain(|l| !(l.local == *local && l.remote == *remote));
        self.links.len() != before
    }

    /// `true` if the pair is linked.
    pub fn exists(&self, local: &Pid, remote: &Pid) -> bool {
        self.links
            .iter()
            .any(|l| l.local == *local && l.remote == *remote)
    }

    /// Local pids currently holding links.
    pub fn local_pids(&self) -> Vec<Pid> {
        self.links.iter().map(|l| l.local.clone()).collect()
    }

    /// Remote pids currently holding links.
    pub fn remote_pids(&self) -> Vec<Pid> {
        self.links.iter().map(|l| l.remote.clone()).collect()
    }

    /// Drains the table, returning its prior contents.
    ///
    /// Used when the connection dies: every drained pair produces one
    /// `noconnection` exit for its local pid.
    pub fn clear_all(&mut self) -> Vec<Link> {
        std::mem::take(&mut self.links)
    }

    /// Number of links in the table.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// `true` when no links are registered.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::Atom;

    fn pid(id: u32) -> Pid {
        Pid {
            node: Atom::from("n@h"),
            id,
            serial: 0,
            creation: 0,
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut table = LinkTable::new();
        assert!(table.add(pid(1), pid(2)));
        assert!(!table.add(pid(1), pid(2)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_and_exists() {
        let mut table = LinkTable::new();
        table.add(pid(1), pid(2));
        table.add(pid(1), pid(3));
        assert!(table.exists(&pid(1), &pid(2)));
        assert!(table.remove(&pid(1), &pid(2)));
        assert!(!table.exists(&pid(1), &pid(2)));
        assert!(!table.remove(&pid(1), &pid(2)));
        assert_eq!(table.local_pids(), vec![pid(1)]);
        assert_eq!(table.remote_pids(), vec![pid(3)]);
    }

    #[test]
    fn clear_all_drains() {
        let mut table = LinkTable::new();
        table.add(pid(1), pid(2));
        table.add(pid(3), pid(4));
        let drained = table.clear_all();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
    }
}
