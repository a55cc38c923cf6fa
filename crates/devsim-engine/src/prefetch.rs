//! ---
//! devsim_section: "04-orchestration"
//! devsim_subsection: "module"
//! devsim_type: "source"
//! devsim_scope: "code"
//! devsim_description: "Lookahead queue and single-flight bookkeeping for batch inference."
//! devsim_version: "v0.0.0-prealpha"
//! devsim_owner: "tbd"
//! ---
use std::collections::VecDeque;

use devsim_sim::SimulationStep;

pub const DEFAULT_LOW_WATER: usize = 5;

/// Identifies one outstanding batch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    pub id: u64,
    pub device_id: String,
    /// Buffer epoch at the time the request started.
    pub epoch: u64,
}

/// FIFO of future steps plus the in-flight flag guarding the single fetch.
///
/// The flag is global: invalidating the buffer bumps the epoch and clears the
/// queue but leaves an outstanding request flagged, so a new request can only
/// start once the old one has finished. Its result is then discarded because
/// its epoch no longer matches.
#[derive(Debug)]
pub struct PrefetchBuffer {
    queue: VecDeque<SimulationStep>,
    low_water: usize,
    in_flight: Option<u64>,
    next_ticket: u64,
    epoch: u64,
}

impl Default for PrefetchBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOW_WATER)
    }
}

impl PrefetchBuffer {
    pub fn new(low_water: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            low_water,
            in_flight: None,
            next_ticket: 0,
            epoch: 0,
        }
    }

    pub fn pop(&mut self) -> Option<SimulationStep> {
        self.queue.pop_front()
    }

    /// Whether the queue is below the low-water mark with nothing in flight.
    pub fn needs_refill(&self) -> bool {
        self.queue.len() < self.low_water && self.in_flight.is_none()
    }

    /// Claim the in-flight slot. Returns `None` while another request is outstanding.
    pub fn try_begin(&mut self, device_id: &str) -> Option<FetchTicket> {
        if self.in_flight.is_some() {
            return None;
        }
        self.next_ticket += 1;
        self.in_flight = Some(self.next_ticket);
        Some(FetchTicket {
            id: self.next_ticket,
            device_id: device_id.to_owned(),
            epoch: self.epoch,
        })
    }

    /// Append the steps of a completed request. Returns `None` when the request
    /// is stale: the buffer was invalidated or another device is active.
    pub fn accept(
        &mut self,
        ticket: &FetchTicket,
        active_device: Option<&str>,
        steps: Vec<SimulationStep>,
    ) -> Option<usize> {
        if ticket.epoch != self.epoch || active_device != Some(ticket.device_id.as_str()) {
            return None;
        }
        let accepted = steps.len();
        self.queue.extend(steps);
        Some(accepted)
    }

    /// Release the in-flight slot held by `ticket_id`. Returns whether it was held.
    pub fn finish(&mut self, ticket_id: u64) -> bool {
        if self.in_flight == Some(ticket_id) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }

    /// Drop queued steps and orphan any outstanding request.
    pub fn invalidate(&mut self) {
        self.queue.clear();
        self.epoch += 1;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn low_water(&self) -> usize {
        self.low_water
    }
}
