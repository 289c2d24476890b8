/*!
 * Connection table and paired event cells
 *
 * Three parallel arrays sized by `worker_connections`: connection records
 * plus matched read/write event cells at the same index. A free list is
 * threaded through the connection records. Event cells carry a generation
 * counter (`instance`); the counter is bumped when a connection is freed so
 * readiness notifications still in flight for the old fd can be recognized
 * and discarded.
 */

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::core::timer::TimerKey;
use crate::event::EventLoop;

/// Direction of an event cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Read,
    Write,
}

/// Addresses one event cell in the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventKey {
    pub slot: u32,
    pub kind: EventKind,
}

/// Event callback; must register interest and return rather than block
pub type EventHandler = for<'a, 'b> fn(&'a mut EventLoop<'b>, u32);

fn default_handler(_el: &mut EventLoop<'_>, _slot: u32) {}

/// Pack a connection slot and its instance into the engine's user-data word
pub fn encode_tag(slot: u32, instance: u32) -> u64 {
    (u64::from(slot) << 32) | u64::from(instance)
}

/// Unpack an engine user-data word into (slot, instance)
pub fn decode_tag(tag: u64) -> (u32, u32) {
    ((tag >> 32) as u32, tag as u32)
}

pub struct EventCell {
    /// Generation counter; disagreement with a delivered tag marks the
    /// notification stale
    pub instance: u32,
    pub active: bool,
    pub ready: bool,
    pub accept: bool,
    pub posted: bool,
    pub timedout: bool,
    pub timer: Option<TimerKey>,
    pub handler: EventHandler,
}

impl EventCell {
    fn new() -> Self {
        Self {
            instance: 0,
            active: false,
            ready: false,
            accept: false,
            posted: false,
            timedout: false,
            timer: None,
            handler: default_handler,
        }
    }

    fn reset(&mut self) {
        // The instance survives reset: it was bumped when the previous
        // occupant was freed
        self.active = false;
        self.ready = false;
        self.accept = false;
        self.posted = false;
        self.timedout = false;
        self.timer = None;
        self.handler = default_handler;
    }
}

pub struct Connection {
    /// -1 when the record is on the free list
    pub fd: RawFd,
    next_free: i32,
    /// Owning listener index, for accepted connections
    pub listener: Option<usize>,
    /// Scratch buffer carved from the cycle pool on first use; reused across
    /// occupants of this slot, reclaimed with the pool
    pub buffer: Option<NonNull<u8>>,
}

pub struct Connections {
    conns: Vec<Connection>,
    read: Vec<EventCell>,
    write: Vec<EventCell>,
    free_head: i32,
    free: usize,
}

impl Connections {
    pub fn new(n: usize) -> Self {
        assert!(n > 0 && n <= u32::MAX as usize);
        let mut conns = Vec::with_capacity(n);
        for i in 0..n {
            conns.push(Connection {
                fd: -1,
                next_free: if i + 1 < n { (i + 1) as i32 } else { -1 },
                listener: None,
                buffer: None,
            });
        }
        Self {
            conns,
            read: (0..n).map(|_| EventCell::new()).collect(),
            write: (0..n).map(|_| EventCell::new()).collect(),
            free_head: 0,
            free: n,
        }
    }

    pub fn total(&self) -> usize {
        self.conns.len()
    }

    pub fn free_count(&self) -> usize {
        self.free
    }

    /// Pop a free record, bind `fd` to it and return the slot. None when the
    /// table is exhausted.
    pub fn get(&mut self, fd: RawFd) -> Option<u32> {
        if self.free_head < 0 {
            return None;
        }
        let slot = self.free_head as usize;
        self.free_head = self.conns[slot].next_free;
        self.free -= 1;

        let c = &mut self.conns[slot];
        c.fd = fd;
        c.next_free = -1;
        c.listener = None;
        self.read[slot].reset();
        self.write[slot].reset();

        Some(slot as u32)
    }

    /// Return a record to the free list. The fd goes to -1 and both event
    /// instances are bumped before the slot becomes reusable, so in-flight
    /// notifications for the old occupant are recognizably stale.
    pub fn free(&mut self, slot: u32) {
        let i = slot as usize;
        debug_assert!(self.conns[i].fd != -1, "double free of connection slot");

        self.conns[i].fd = -1;
        self.conns[i].listener = None;
        self.read[i].instance = self.read[i].instance.wrapping_add(1);
        self.write[i].instance = self.write[i].instance.wrapping_add(1);
        self.read[i].timer = None;
        self.write[i].timer = None;

        self.conns[i].next_free = self.free_head;
        self.free_head = slot as i32;
        self.free += 1;
    }

    pub fn conn(&self, slot: u32) -> &Connection {
        &self.conns[slot as usize]
    }

    pub fn conn_mut(&mut self, slot: u32) -> &mut Connection {
        &mut self.conns[slot as usize]
    }

    pub fn read_cell(&self, slot: u32) -> &EventCell {
        &self.read[slot as usize]
    }

    pub fn read_cell_mut(&mut self, slot: u32) -> &mut EventCell {
        &mut self.read[slot as usize]
    }

    pub fn write_cell(&self, slot: u32) -> &EventCell {
        &self.write[slot as usize]
    }

    pub fn write_cell_mut(&mut self, slot: u32) -> &mut EventCell {
        &mut self.write[slot as usize]
    }

    pub fn cell(&self, key: EventKey) -> &EventCell {
        match key.kind {
            EventKind::Read => self.read_cell(key.slot),
            EventKind::Write => self.write_cell(key.slot),
        }
    }

    pub fn cell_mut(&mut self, key: EventKey) -> &mut EventCell {
        match key.kind {
            EventKind::Read => self.read_cell_mut(key.slot),
            EventKind::Write => self.write_cell_mut(key.slot),
        }
    }

    /// Engine user-data word for this slot. Read and write cells share the
    /// generation (they are bumped together).
    pub fn tag(&self, slot: u32) -> u64 {
        encode_tag(slot, self.read[slot as usize].instance)
    }
}

/// Overload shedding: how many iterations to sit out the accept lock.
/// Positive once less than one eighth of the table is free. Ceiling division
/// keeps the smallest tables honest: with one connection in the table and
/// none free this must come out positive.
pub fn accept_disabled_after(total: usize, free: usize) -> i64 {
    (total.div_ceil(8)) as i64 - free as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_binds_fd() {
        let mut table = Connections::new(4);
        let slot = table.get(9).unwrap();
        assert_eq!(table.conn(slot).fd, 9);
        assert_eq!(table.free_count(), 3);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut table = Connections::new(2);
        assert!(table.get(3).is_some());
        assert!(table.get(4).is_some());
        assert!(table.get(5).is_none());
    }

    #[test]
    fn test_free_resets_fd_and_bumps_instances() {
        let mut table = Connections::new(2);
        let slot = table.get(7).unwrap();
        let ri = table.read_cell(slot).instance;
        let wi = table.write_cell(slot).instance;

        table.free(slot);

        assert_eq!(table.conn(slot).fd, -1);
        assert_ne!(table.read_cell(slot).instance, ri);
        assert_ne!(table.write_cell(slot).instance, wi);
        assert_eq!(table.free_count(), 2);
    }

    #[test]
    fn test_stale_tag_detectable_after_reuse() {
        let mut table = Connections::new(1);
        let slot = table.get(5).unwrap();
        let old_tag = table.tag(slot);

        table.free(slot);
        let slot2 = table.get(6).unwrap();
        assert_eq!(slot, slot2); // single-slot table reuses the same cell

        let (_, old_instance) = decode_tag(old_tag);
        assert_ne!(table.read_cell(slot2).instance, old_instance);
    }

    #[test]
    fn test_tag_round_trip() {
        let (slot, instance) = decode_tag(encode_tag(123, 456));
        assert_eq!(slot, 123);
        assert_eq!(instance, 456);

        let (slot, instance) = decode_tag(encode_tag(u32::MAX, u32::MAX));
        assert_eq!(slot, u32::MAX);
        assert_eq!(instance, u32::MAX);
    }

    #[test]
    fn test_reset_preserves_instance() {
        let mut table = Connections::new(1);
        let slot = table.get(3).unwrap();
        table.free(slot);
        let bumped = table.read_cell(slot).instance;

        let slot = table.get(4).unwrap();
        assert_eq!(table.read_cell(slot).instance, bumped);
        assert!(!table.read_cell(slot).active);
        assert!(table.read_cell(slot).timer.is_none());
    }

    #[test]
    fn test_accept_disabled_accounting() {
        // Single-connection table, nothing free: must sit out the lock
        assert!(accept_disabled_after(1, 0) > 0);
        // Healthy table: plenty free, stays negative
        assert!(accept_disabled_after(512, 512) < 0);
        assert!(accept_disabled_after(512, 64) <= 0);
        // Crossing the one-eighth threshold
        assert!(accept_disabled_after(512, 63) > 0);
    }
}
