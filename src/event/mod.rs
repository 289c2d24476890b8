/*!
 * Readiness engine and the per-worker event loop
 *
 * The backend is a capability set behind the `EventEngine` trait: add and
 * remove interest per direction, add and remove whole connections, wait,
 * tear down. The loop built on top unifies timer expirations, readiness
 * batches, accept arbitration and a deferred-events queue.
 */

pub mod accept;
#[cfg(target_os = "linux")]
pub mod epoll;

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;

use crate::conn::{Connections, EventKey, EventKind};
use crate::core::clock;
use crate::core::timer::TimerTree;
use crate::cycle::Cycle;
use crate::error::{Result, ServerError};
use crate::event::accept::AcceptMutex;
use crate::process::ProcessTable;

/// Behavior flags reported by a backend
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineFlags {
    /// Notifications are delivered on state change, not state level
    pub edge_triggered: bool,
    /// The backend expects accept loops to drain until EAGAIN
    pub greedy_accept: bool,
}

/// One decoded readiness notification
#[derive(Debug, Clone, Copy)]
pub struct Readiness {
    pub slot: u32,
    pub instance: u32,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Kernel readiness backend capability set
pub trait EventEngine {
    fn name(&self) -> &'static str;

    fn flags(&self) -> EngineFlags;

    /// Register interest in one direction. `other_active` tells the backend
    /// whether the opposite direction is currently registered, which decides
    /// between a fresh registration and a modification that preserves it.
    fn add_event(
        &mut self,
        fd: RawFd,
        kind: EventKind,
        other_active: bool,
        tag: u64,
        edge: bool,
    ) -> io::Result<()>;

    /// Remove interest in one direction. With `closing` the fd is about to
    /// be closed and the kernel will drop the registration itself.
    fn del_event(
        &mut self,
        fd: RawFd,
        kind: EventKind,
        other_active: bool,
        tag: u64,
        closing: bool,
    ) -> io::Result<()>;

    /// Register both directions at once (edge-triggered)
    fn add_connection(&mut self, fd: RawFd, tag: u64) -> io::Result<()>;

    /// Remove a whole connection
    fn del_connection(&mut self, fd: RawFd, closing: bool) -> io::Result<()>;

    /// Block for readiness up to `timeout_ms` (None = indefinitely) and
    /// decode the batch into `out`
    fn wait(&mut self, timeout_ms: Option<u64>, out: &mut Vec<Readiness>) -> io::Result<usize>;

    /// Release kernel resources
    fn done(&mut self) -> io::Result<()>;
}

/// Build the platform backend
pub fn default_engine(batch: usize) -> Result<Box<dyn EventEngine>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(epoll::EpollEngine::new(batch)?))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = batch;
        Err(ServerError::Engine(
            "no readiness backend for this platform".to_string(),
        ))
    }
}

/// Deferred event: handler to run after the accept lock is released
#[derive(Debug, Clone, Copy)]
struct Posted {
    slot: u32,
    kind: EventKind,
    instance: u32,
}

/// Per-worker event loop state
pub struct EventLoop<'s> {
    pub engine: Box<dyn EventEngine>,
    pub conns: Connections,
    pub timers: TimerTree<EventKey>,
    pub cycle: &'s mut Cycle,
    pub procs: &'s mut ProcessTable,

    /// Cross-worker accept lock; None disables arbitration
    pub accept_mutex: Option<AcceptMutex>,
    /// Listeners are currently registered with the engine
    pub accept_mutex_held: bool,
    /// Iterations left to sit out lock acquisition (overload shedding)
    pub accept_disabled: i64,

    /// Graceful shutdown in progress: listeners closed, draining
    pub exiting: bool,

    /// Connection slots assigned to the cycle's listeners
    pub listener_slots: Vec<u32>,
    /// Own slot in the process table (worker), usize::MAX in single mode
    pub process_slot: usize,

    posted: VecDeque<Posted>,
    ready_buf: Vec<Readiness>,
    accept_delay: u64,
    pid: u32,
}

impl<'s> EventLoop<'s> {
    pub fn new(
        cycle: &'s mut Cycle,
        procs: &'s mut ProcessTable,
        accept_mutex: Option<AcceptMutex>,
        process_slot: usize,
    ) -> Result<Self> {
        let engine = default_engine(cycle.config.epoll_events)?;
        // worker_connections is the client budget; listeners and the
        // master channel sit in the same table and get their own cells
        let table_size = cycle.config.worker_connections + cycle.listeners.len() + 1;
        let conns = Connections::new(table_size);
        let accept_delay = cycle.config.accept_mutex_delay_ms;

        Ok(Self {
            engine,
            conns,
            timers: TimerTree::new(),
            cycle,
            procs,
            accept_mutex,
            accept_mutex_held: false,
            accept_disabled: 0,
            exiting: false,
            listener_slots: Vec::new(),
            process_slot,
            posted: VecDeque::new(),
            ready_buf: Vec::new(),
            accept_delay,
            pid: std::process::id(),
        })
    }

    /// Give every listener a connection slot with an accept-flagged read
    /// cell. Without arbitration the listeners are registered immediately;
    /// with it, registration follows the lock.
    pub fn register_listeners(&mut self) -> Result<()> {
        for i in 0..self.cycle.listeners.len() {
            let fd = self.cycle.listeners[i].fd;
            let slot = self
                .conns
                .get(fd)
                .ok_or(ServerError::ConnectionsExhausted)?;
            self.conns.conn_mut(slot).listener = Some(i);
            let rev = self.conns.read_cell_mut(slot);
            rev.accept = true;
            rev.handler = accept::accept_handler;
            self.listener_slots.push(slot);
        }

        if self.accept_mutex.is_none() {
            self.enable_accept_events()?;
        }
        Ok(())
    }

    /// The worker's inner loop: one wait plus everything hanging off it
    pub fn process_events(&mut self) -> Result<()> {
        // Timer budget; fire anything already overdue before waiting
        let mut timer = loop {
            match self.timers.min_delay(clock::now_ms()) {
                Some(0) => {
                    tracing::trace!("timer already expired before wait");
                    self.expire_timers();
                }
                other => break other,
            }
        };
        let mut expire = timer.is_some();

        let mut accept_lock = false;
        if self.accept_mutex.is_some() {
            if self.accept_disabled > 0 {
                self.accept_disabled -= 1;
            } else {
                self.trylock_accept_mutex()?;
                if self.accept_mutex_held {
                    accept_lock = true;
                } else if timer.map_or(true, |t| t > self.accept_delay) {
                    // Lost the lock: re-attempt soon
                    timer = Some(self.accept_delay);
                    expire = false;
                }
            }
        }

        tracing::trace!(?timer, "readiness wait");

        let mut ready = std::mem::take(&mut self.ready_buf);
        let res = self.engine.wait(timer, &mut ready);
        clock::update();

        match res {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                tracing::info!("readiness wait interrupted by signal");
                if accept_lock {
                    self.unlock_accept_mutex();
                }
                ready.clear();
                self.ready_buf = ready;
                return Ok(());
            }
            Err(e) => {
                if accept_lock {
                    self.unlock_accept_mutex();
                }
                ready.clear();
                self.ready_buf = ready;
                return Err(ServerError::Engine(format!("wait failed: {}", e)));
            }
        }

        let mut lock_held = accept_lock;
        self.handle_ready(&ready, &mut lock_held);

        if lock_held {
            self.unlock_accept_mutex();
        }

        if expire {
            self.expire_timers();
        }
        self.process_posted();

        ready.clear();
        self.ready_buf = ready;
        Ok(())
    }

    /// Dispatch one decoded readiness batch. Stale notifications (freed fd
    /// or instance mismatch) are discarded. While the accept lock is held,
    /// non-accept handlers are deferred so the lock is released first;
    /// accept events run synchronously so the listener drains while the
    /// lock is ours.
    pub fn handle_ready(&mut self, ready: &[Readiness], lock_held: &mut bool) {
        for r in ready {
            let slot = r.slot;

            let fd = self.conns.conn(slot).fd;
            if fd == -1 || self.conns.read_cell(slot).instance != r.instance {
                tracing::debug!(slot, "stale event discarded");
                continue;
            }

            if r.error {
                tracing::debug!(slot, fd, "error condition reported with readiness");
            }

            // Writable first: the accept optimization below relies on the
            // read event being handled last
            if r.writable && self.conns.write_cell(slot).active {
                self.conns.write_cell_mut(slot).ready = true;
                if *lock_held {
                    self.post_event(slot, EventKind::Write);
                } else {
                    let handler = self.conns.write_cell(slot).handler;
                    handler(self, slot);
                }
            }

            if r.readable && self.conns.read_cell(slot).active {
                // The connection may have been closed by its own write
                // handler a moment ago
                if self.conns.conn(slot).fd == -1
                    || self.conns.read_cell(slot).instance != r.instance
                {
                    tracing::debug!(slot, "stale read after write handler");
                    continue;
                }

                if self.conns.read_cell(slot).accept {
                    // The overload gate only makes sense under arbitration,
                    // where the shed counter decays every iteration
                    if self.accept_mutex.is_none() || self.accept_disabled <= 0 {
                        self.conns.read_cell_mut(slot).ready = true;
                        let handler = self.conns.read_cell(slot).handler;
                        handler(self, slot);

                        // The accept pass may have tipped the table into
                        // overload; give the lock up at once
                        if self.accept_disabled > 0 && *lock_held {
                            self.unlock_accept_mutex();
                            *lock_held = false;
                        }
                    }
                } else {
                    self.conns.read_cell_mut(slot).ready = true;
                    if *lock_held {
                        self.post_event(slot, EventKind::Read);
                    } else {
                        let handler = self.conns.read_cell(slot).handler;
                        handler(self, slot);
                    }
                }
            }
        }
    }

    /// Append a ready handler to the deferred-events queue
    pub fn post_event(&mut self, slot: u32, kind: EventKind) {
        let instance = self.conns.read_cell(slot).instance;
        let cell = self.conns.cell_mut(EventKey { slot, kind });
        if cell.posted {
            return;
        }
        cell.posted = true;
        self.posted.push_back(Posted {
            slot,
            kind,
            instance,
        });
    }

    /// Drain the deferred-events queue in FIFO order
    pub fn process_posted(&mut self) {
        while let Some(p) = self.posted.pop_front() {
            if self.conns.conn(p.slot).fd == -1
                || self.conns.read_cell(p.slot).instance != p.instance
            {
                tracing::debug!(slot = p.slot, "stale posted event discarded");
                continue;
            }
            let cell = self.conns.cell_mut(EventKey {
                slot: p.slot,
                kind: p.kind,
            });
            if !cell.posted {
                continue;
            }
            cell.posted = false;
            let handler = cell.handler;
            handler(self, p.slot);
        }
    }

    pub fn posted_len(&self) -> usize {
        self.posted.len()
    }

    /// Fire every timer due at the cached clock, in expiry order
    pub fn expire_timers(&mut self) {
        let now = clock::now_ms();
        while let Some((key, ev)) = self.timers.pop_due(now) {
            let cell = self.conns.cell_mut(ev);
            if cell.timer == Some(key) {
                cell.timer = None;
            } else {
                // The cell was reused since this timer was armed
                continue;
            }
            cell.timedout = true;
            cell.ready = true;
            let handler = cell.handler;
            handler(self, ev.slot);
        }
    }

    /// (Re-)arm the deadline for one event cell
    pub fn arm_timer(&mut self, slot: u32, kind: EventKind, delay_ms: u64) {
        self.disarm_timer(slot, kind);
        let key = self
            .timers
            .insert(EventKey { slot, kind }, delay_ms, clock::now_ms());
        self.conns.cell_mut(EventKey { slot, kind }).timer = Some(key);
    }

    pub fn disarm_timer(&mut self, slot: u32, kind: EventKind) {
        if let Some(key) = self.conns.cell_mut(EventKey { slot, kind }).timer.take() {
            self.timers.remove(key);
        }
    }

    pub fn add_read_event(&mut self, slot: u32, edge: bool) -> Result<()> {
        if self.conns.read_cell(slot).active {
            return Ok(());
        }
        let fd = self.conns.conn(slot).fd;
        let other = self.conns.write_cell(slot).active;
        let tag = self.conns.tag(slot);
        self.engine
            .add_event(fd, EventKind::Read, other, tag, edge)
            .map_err(|e| ServerError::Engine(format!("add read event: {}", e)))?;
        self.conns.read_cell_mut(slot).active = true;
        Ok(())
    }

    pub fn del_read_event(&mut self, slot: u32, closing: bool) -> Result<()> {
        if !self.conns.read_cell(slot).active {
            return Ok(());
        }
        let fd = self.conns.conn(slot).fd;
        let other = self.conns.write_cell(slot).active;
        let tag = self.conns.tag(slot);
        self.engine
            .del_event(fd, EventKind::Read, other, tag, closing)
            .map_err(|e| ServerError::Engine(format!("del read event: {}", e)))?;
        self.conns.read_cell_mut(slot).active = false;
        Ok(())
    }

    pub fn add_write_event(&mut self, slot: u32, edge: bool) -> Result<()> {
        if self.conns.write_cell(slot).active {
            return Ok(());
        }
        let fd = self.conns.conn(slot).fd;
        let other = self.conns.read_cell(slot).active;
        let tag = self.conns.tag(slot);
        self.engine
            .add_event(fd, EventKind::Write, other, tag, edge)
            .map_err(|e| ServerError::Engine(format!("add write event: {}", e)))?;
        self.conns.write_cell_mut(slot).active = true;
        Ok(())
    }

    pub fn del_write_event(&mut self, slot: u32, closing: bool) -> Result<()> {
        if !self.conns.write_cell(slot).active {
            return Ok(());
        }
        let fd = self.conns.conn(slot).fd;
        let other = self.conns.read_cell(slot).active;
        let tag = self.conns.tag(slot);
        self.engine
            .del_event(fd, EventKind::Write, other, tag, closing)
            .map_err(|e| ServerError::Engine(format!("del write event: {}", e)))?;
        self.conns.write_cell_mut(slot).active = false;
        Ok(())
    }

    /// Tear a connection down: cancel deadlines, drop kernel registration,
    /// return the slot (bumping instances) and close the fd
    pub fn close_connection(&mut self, slot: u32) {
        self.disarm_timer(slot, EventKind::Read);
        self.disarm_timer(slot, EventKind::Write);

        let fd = self.conns.conn(slot).fd;
        if fd == -1 {
            return;
        }

        // The kernel drops its registration when the fd closes
        let _ = self.engine.del_connection(fd, true);
        self.conns.read_cell_mut(slot).active = false;
        self.conns.write_cell_mut(slot).active = false;

        self.conns.free(slot);
        unsafe {
            libc::close(fd);
        }
    }

    /// Register every listener with the engine (on lock acquisition)
    pub fn enable_accept_events(&mut self) -> Result<()> {
        for i in 0..self.listener_slots.len() {
            let slot = self.listener_slots[i];
            // Listeners are level-triggered so an un-drained backlog is
            // reported again
            self.add_read_event(slot, false)?;
        }
        Ok(())
    }

    /// Deregister every listener (on lock loss)
    pub fn disable_accept_events(&mut self) -> Result<()> {
        for i in 0..self.listener_slots.len() {
            let slot = self.listener_slots[i];
            self.del_read_event(slot, false)?;
        }
        Ok(())
    }

    /// Non-blocking bid for the accept lock, keeping listener registration
    /// in step with ownership
    pub fn trylock_accept_mutex(&mut self) -> Result<()> {
        let mutex = match self.accept_mutex {
            Some(m) => m,
            None => return Ok(()),
        };

        if mutex.try_lock(self.pid) {
            if self.accept_mutex_held {
                return Ok(());
            }
            if let Err(e) = self.enable_accept_events() {
                mutex.unlock(self.pid);
                return Err(e);
            }
            self.accept_mutex_held = true;
        } else if self.accept_mutex_held {
            self.disable_accept_events()?;
            self.accept_mutex_held = false;
        }
        Ok(())
    }

    pub fn unlock_accept_mutex(&mut self) {
        if let Some(m) = self.accept_mutex {
            m.unlock(self.pid);
        }
    }

    /// Stop accepting for good: close every listening socket and return the
    /// slots. Existing connections are not touched.
    pub fn close_listeners(&mut self) {
        let slots = std::mem::take(&mut self.listener_slots);
        for slot in slots {
            let fd = self.conns.conn(slot).fd;
            if fd == -1 {
                continue;
            }
            let _ = self.del_read_event(slot, true);
            self.conns.free(slot);
            unsafe {
                libc::close(fd);
            }
        }
        for l in self.cycle.listeners.iter_mut() {
            l.fd = -1;
        }
    }
}
