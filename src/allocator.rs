//! Exclusive port-pair allocation over two disjoint ranges
//!
//! Every deployed app owns two ports: one in the public range and one in the
//! canvas range. Released ports are quarantined rather than freed so a port
//! vacated by a terminating app cannot be handed to a new deploy while the
//! proxy may still be serving the old route; a quarantined port only becomes
//! claimable after the allocation cursor has swept past it once.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// A closed, named interval of port numbers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    /// Range name ("public" or "canvas")
    pub name: String,
    /// First port in the range, inclusive
    pub start: u16,
    /// Last port in the range, inclusive
    pub end: u16,
}

impl PortRange {
    pub fn new(name: &str, start: u16, end: u16) -> Self {
        debug_assert!(start <= end, "range start must not exceed end");
        Self {
            name: name.to_string(),
            start,
            end,
        }
    }

    /// Number of ports in the range
    pub fn capacity(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Allocation state of a single port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Free,
    Allocated,
    Quarantined,
}

/// Per-range slot table with a wrapping allocation cursor
#[derive(Debug)]
struct RangeState {
    range: PortRange,
    slots: Vec<Slot>,
    cursor: usize,
}

impl RangeState {
    fn new(range: PortRange) -> Self {
        let slots = vec![Slot::Free; range.capacity()];
        Self {
            range,
            slots,
            cursor: 0,
        }
    }

    fn port_at(&self, idx: usize) -> u16 {
        self.range.start + idx as u16
    }

    fn index_of(&self, port: u16) -> usize {
        (port - self.range.start) as usize
    }

    /// Scan forward from the cursor, wrapping once. Allocated slots are
    /// skipped; quarantined slots are demoted to free as the cursor passes
    /// them and stay unclaimable until the next scan; the first slot that
    /// was already free is claimed. A failed scan keeps its demotions and
    /// leaves the cursor where it was.
    fn claim_next(&mut self) -> Option<u16> {
        let len = self.slots.len();
        for step in 0..len {
            let idx = (self.cursor + step) % len;
            match self.slots[idx] {
                Slot::Allocated => continue,
                Slot::Quarantined => {
                    debug!(
                        range = %self.range.name,
                        port = self.port_at(idx),
                        "Quarantined port returned to free pool"
                    );
                    self.slots[idx] = Slot::Free;
                }
                Slot::Free => {
                    self.slots[idx] = Slot::Allocated;
                    self.cursor = (idx + 1) % len;
                    return Some(self.port_at(idx));
                }
            }
        }
        None
    }

    /// Revert a just-claimed port to free and roll the cursor back to its
    /// slot, restoring the pre-claim scan position
    fn unwind(&mut self, port: u16) {
        let idx = self.index_of(port);
        self.slots[idx] = Slot::Free;
        self.cursor = idx;
    }

    fn quarantine(&mut self, port: u16) {
        let idx = self.index_of(port);
        self.slots[idx] = Slot::Quarantined;
    }

    fn counts(&self) -> RangeStats {
        let mut stats = RangeStats {
            capacity: self.slots.len(),
            ..Default::default()
        };
        for slot in &self.slots {
            match slot {
                Slot::Free => stats.free += 1,
                Slot::Allocated => stats.allocated += 1,
                Slot::Quarantined => stats.quarantined += 1,
            }
        }
        stats
    }
}

/// The atomic unit handed to and revoked from an application: both ports
/// exist together or not at all
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortAssignment {
    pub app_id: String,
    pub public_port: u16,
    pub canvas_port: u16,
}

/// Per-range occupancy counters, observability only
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RangeStats {
    pub free: usize,
    pub allocated: usize,
    pub quarantined: usize,
    pub capacity: usize,
}

struct AllocatorState {
    public: RangeState,
    canvas: RangeState,
    assignments: HashMap<String, PortAssignment>,
}

/// Hands out collision-free port pairs and reclaims them safely.
///
/// All state lives behind one lock; mutating calls take the write half,
/// `stats` and lookups take the read half.
pub struct PortAllocator {
    state: RwLock<AllocatorState>,
}

impl PortAllocator {
    pub fn new(public: PortRange, canvas: PortRange) -> Self {
        debug_assert!(!public.overlaps(&canvas), "port ranges must be disjoint");
        info!(
            public_start = public.start,
            public_end = public.end,
            canvas_start = canvas.start,
            canvas_end = canvas.end,
            "Port allocator initialized"
        );
        Self {
            state: RwLock::new(AllocatorState {
                public: RangeState::new(public),
                canvas: RangeState::new(canvas),
                assignments: HashMap::new(),
            }),
        }
    }

    /// Reserve a port pair for an app. All-or-nothing: if the canvas range
    /// is exhausted after the public port was claimed, the public port is
    /// unwound before the error returns.
    pub fn allocate(&self, app_id: &str) -> Result<PortAssignment> {
        let mut state = self.state.write();

        if state.assignments.contains_key(app_id) {
            return Err(Error::DuplicateAssignment(app_id.to_string()));
        }

        let public_port = state.public.claim_next().ok_or_else(|| {
            warn!(app = app_id, range = "public", "Port range exhausted");
            Error::PortRangeExhausted {
                range: state.public.range.name.clone(),
            }
        })?;

        let canvas_port = match state.canvas.claim_next() {
            Some(port) => port,
            None => {
                state.public.unwind(public_port);
                warn!(app = app_id, range = "canvas", "Port range exhausted");
                return Err(Error::PortRangeExhausted {
                    range: state.canvas.range.name.clone(),
                });
            }
        };

        let assignment = PortAssignment {
            app_id: app_id.to_string(),
            public_port,
            canvas_port,
        };
        state.assignments.insert(app_id.to_string(), assignment.clone());

        info!(
            app = app_id,
            public_port, canvas_port, "Allocated port pair"
        );
        Ok(assignment)
    }

    /// Quarantine an app's ports. Idempotent: releasing an app with no
    /// current assignment is a no-op.
    pub fn release(&self, app_id: &str) -> bool {
        let mut state = self.state.write();
        match state.assignments.remove(app_id) {
            Some(assignment) => {
                state.public.quarantine(assignment.public_port);
                state.canvas.quarantine(assignment.canvas_port);
                info!(
                    app = app_id,
                    public_port = assignment.public_port,
                    canvas_port = assignment.canvas_port,
                    "Released port pair to quarantine"
                );
                true
            }
            None => false,
        }
    }

    /// Return an app's ports directly to free, rolling the cursors back.
    ///
    /// Only valid for assignments that never reached the live proxy (deploy
    /// rollback): the vacated ports need no quarantine window and allocator
    /// state must match the pre-allocate snapshot.
    pub fn unwind(&self, app_id: &str) -> bool {
        let mut state = self.state.write();
        match state.assignments.remove(app_id) {
            Some(assignment) => {
                state.canvas.unwind(assignment.canvas_port);
                state.public.unwind(assignment.public_port);
                debug!(
                    app = app_id,
                    public_port = assignment.public_port,
                    canvas_port = assignment.canvas_port,
                    "Unwound port pair"
                );
                true
            }
            None => false,
        }
    }

    /// Re-mark a durable assignment as allocated at startup
    pub fn restore(&self, app_id: &str, public_port: u16, canvas_port: u16) -> Result<()> {
        let mut state = self.state.write();

        if state.assignments.contains_key(app_id) {
            return Err(Error::DuplicateAssignment(app_id.to_string()));
        }
        if !state.public.range.contains(public_port) {
            return Err(Error::ConfigValidation(format!(
                "port {} outside public range {}-{}",
                public_port, state.public.range.start, state.public.range.end
            )));
        }
        if !state.canvas.range.contains(canvas_port) {
            return Err(Error::ConfigValidation(format!(
                "port {} outside canvas range {}-{}",
                canvas_port, state.canvas.range.start, state.canvas.range.end
            )));
        }

        let pub_idx = state.public.index_of(public_port);
        if state.public.slots[pub_idx] == Slot::Allocated {
            return Err(Error::PortConflict { port: public_port });
        }
        let canvas_idx = state.canvas.index_of(canvas_port);
        if state.canvas.slots[canvas_idx] == Slot::Allocated {
            return Err(Error::PortConflict { port: canvas_port });
        }

        state.public.slots[pub_idx] = Slot::Allocated;
        state.canvas.slots[canvas_idx] = Slot::Allocated;
        state.assignments.insert(
            app_id.to_string(),
            PortAssignment {
                app_id: app_id.to_string(),
                public_port,
                canvas_port,
            },
        );

        debug!(app = app_id, public_port, canvas_port, "Restored port pair");
        Ok(())
    }

    /// Current assignment for an app, if any
    pub fn assignment(&self, app_id: &str) -> Option<PortAssignment> {
        self.state.read().assignments.get(app_id).cloned()
    }

    /// Occupancy counters per range; no side effects
    pub fn stats(&self) -> BTreeMap<String, RangeStats> {
        let state = self.state.read();
        let mut stats = BTreeMap::new();
        stats.insert(state.public.range.name.clone(), state.public.counts());
        stats.insert(state.canvas.range.name.clone(), state.canvas.counts());
        stats
    }
}
