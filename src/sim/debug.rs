//! Utilities to debug simulation.
//!
//! The key type here is [`Watchpoint`], which pauses multi-step execution
//! when matching memory activity occurs. Watchpoints live in a
//! [`WatchpointList`], which hands out stable keys the way GDB numbers its
//! watchpoints.
//!
//! (Plain execution breakpoints are just instruction addresses and live in
//! a sorted set on the simulator itself.)

use slotmap::{new_key_type, SlotMap};

use super::TraceEntry;

/// Which kind of memory activity a watchpoint triggers on.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum AccessKind {
    /// Trigger when a watched word is read.
    Read,
    /// Trigger when a watched word is written (even with the same value).
    Write,
    /// Trigger when a watched word's value actually changed.
    Change,
}
impl std::fmt::Display for AccessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessKind::Read   => f.write_str("read"),
            AccessKind::Write  => f.write_str("write"),
            AccessKind::Change => f.write_str("change"),
        }
    }
}

/// A watchpoint over a memory range.
///
/// A watchpoint matches a step if any word in the step's relevant access
/// set (reads, writes, or changed words, per [`AccessKind`]) overlaps
/// `[addr, addr + size)`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Watchpoint {
    /// Start of the watched byte range.
    pub addr: u16,
    /// Length of the watched byte range.
    pub size: u16,
    /// The activity to trigger on.
    pub kind: AccessKind,
}
impl Watchpoint {
    /// Checks whether a step's activity matches this watchpoint.
    pub fn matches(&self, entry: &TraceEntry) -> bool {
        let set = match self.kind {
            AccessKind::Read   => &entry.memory_reads,
            AccessKind::Write  => &entry.memory_writes,
            AccessKind::Change => &entry.changed_memory_words,
        };
        let end = u32::from(self.addr) + u32::from(self.size);
        // A word at w occupies [w, w+2).
        set.iter().any(|&w| {
            u32::from(w) < end && u32::from(self.addr) < u32::from(w) + 2
        })
    }
}
impl std::fmt::Display for Watchpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [x{:04X}, x{:04X})", self.kind, self.addr, self.addr.wrapping_add(self.size))
    }
}

new_key_type! {
    /// Key to index into a watchpoint list.
    pub struct WatchpointKey;
}

/// A list of watchpoints.
///
/// This works similarly to GDB watchpoints, in that creating a watchpoint
/// gives you a key which you can use to query or remove the watchpoint
/// later.
#[derive(Debug, Default)]
pub struct WatchpointList {
    inner: SlotMap<WatchpointKey, Watchpoint>,
}

impl WatchpointList {
    /// Creates a new watchpoint list.
    pub fn new() -> Self {
        Default::default()
    }

    /// Gets the watchpoint with a given key, returning None if it was
    /// already removed.
    pub fn get(&self, key: WatchpointKey) -> Option<&Watchpoint> {
        self.inner.get(key)
    }

    /// Counts the number of defined watchpoints.
    pub fn len(&self) -> usize {
        self.inner.len()
    }
    /// Checks if the watchpoint list is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Inserts a watchpoint into the list and returns its key.
    pub fn insert(&mut self, wp: Watchpoint) -> WatchpointKey {
        self.inner.insert(wp)
    }
    /// Removes the watchpoint with the given key.
    ///
    /// If it was previously removed, this returns None.
    pub fn remove(&mut self, key: WatchpointKey) -> Option<Watchpoint> {
        self.inner.remove(key)
    }
    /// Removes all watchpoints from the list.
    pub fn clear(&mut self) {
        self.inner.clear()
    }

    /// An iterator visiting all watchpoints and their keys in arbitrary order.
    pub fn iter(&self) -> slotmap::basic::Iter<WatchpointKey, Watchpoint> {
        self.inner.iter()
    }
    /// An iterator visiting all watchpoints in arbitrary order.
    pub fn values(&self) -> slotmap::basic::Values<WatchpointKey, Watchpoint> {
        self.inner.values()
    }

    /// The first watchpoint matching the given step, if any.
    pub fn find_match(&self, entry: &TraceEntry) -> Option<WatchpointKey> {
        self.inner.iter()
            .find(|(_, wp)| wp.matches(entry))
            .map(|(key, _)| key)
    }
}
impl std::ops::Index<WatchpointKey> for WatchpointList {
    type Output = Watchpoint;

    fn index(&self, index: WatchpointKey) -> &Self::Output {
        &self.inner[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with(reads: Vec<u16>, writes: Vec<u16>, changed: Vec<u16>) -> TraceEntry {
        TraceEntry {
            step: 1,
            instruction_address: 0,
            instruction_text: "NOP".to_string(),
            ip_before: 0,
            ip_after: 1,
            changed_registers: Default::default(),
            changed_flags: Default::default(),
            changed_memory_words: changed,
            memory_reads: reads,
            memory_writes: writes,
            output: vec![],
            cycles: 1,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn overlap_rules() {
        let wp = Watchpoint { addr: 0x0100, size: 2, kind: AccessKind::Write };
        // Word exactly at the range start.
        assert!(wp.matches(&entry_with(vec![], vec![0x0100], vec![])));
        // Word one byte below still overlaps (it spans 0x00FF..0x0101).
        assert!(wp.matches(&entry_with(vec![], vec![0x00FF], vec![])));
        // Word two below does not.
        assert!(!wp.matches(&entry_with(vec![], vec![0x00FE], vec![])));
        // Word at range end does not.
        assert!(!wp.matches(&entry_with(vec![], vec![0x0102], vec![])));
        // Reads don't trigger a write watchpoint.
        assert!(!wp.matches(&entry_with(vec![0x0100], vec![], vec![])));
    }

    #[test]
    fn kinds_select_sets() {
        let entry = entry_with(vec![0x0200], vec![0x0300], vec![0x0300]);
        let read = Watchpoint { addr: 0x0200, size: 2, kind: AccessKind::Read };
        let write = Watchpoint { addr: 0x0300, size: 2, kind: AccessKind::Write };
        let change = Watchpoint { addr: 0x0200, size: 2, kind: AccessKind::Change };
        assert!(read.matches(&entry));
        assert!(write.matches(&entry));
        assert!(!change.matches(&entry));
    }

    #[test]
    fn list_keys_stay_stable() {
        let mut list = WatchpointList::new();
        let a = list.insert(Watchpoint { addr: 0, size: 2, kind: AccessKind::Read });
        let b = list.insert(Watchpoint { addr: 4, size: 2, kind: AccessKind::Write });
        assert_eq!(list.len(), 2);
        list.remove(a);
        assert!(list.get(a).is_none());
        assert_eq!(list[b].addr, 4);
    }
}
