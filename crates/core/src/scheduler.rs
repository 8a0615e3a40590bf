//! Loose synchronisation of independently clocked devices.
//!
//! Each round the driver asks every peripheral how far away its next event
//! is, converts that into microseconds, and takes the minimum (capped so
//! input stays responsive). The CPU and every peripheral then advance by
//! that shared slice in their own clock domains.

use crate::{Device, NEVER};

/// Upper bound on one slice of simulated time.
pub const MAX_SLICE_US: f64 = 1000.0;

/// Microseconds until `device`'s next event, or `None` when it is idle.
pub fn next_event_us(device: &mut dyn Device) -> Option<f64> {
    match device.next_cycles() {
        NEVER => None,
        cycles => Some(cycles as f64 / device.frequency_in_mhz()),
    }
}

/// Smallest next-event time among `devices`, capped at `max_us`.
pub fn plan_slice(devices: &mut [&mut dyn Device], max_us: f64) -> f64 {
    devices
        .iter_mut()
        .filter_map(|d| next_event_us(&mut **d))
        .fold(max_us, f64::min)
        .max(0.0)
}

/// Converts slices of time into whole cycles for one clock domain, carrying
/// the fractional remainder so rounding never drifts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockDomain {
    frequency_in_mhz: f64,
    remainder: f64,
}

impl ClockDomain {
    pub fn new(frequency_in_mhz: f64) -> Self {
        Self {
            frequency_in_mhz,
            remainder: 0.0,
        }
    }

    pub fn frequency_in_mhz(&self) -> f64 {
        self.frequency_in_mhz
    }

    /// Whole cycles covered by `micros` plus any carried fraction.
    pub fn cycles_for(&mut self, micros: f64) -> u64 {
        let exact = micros * self.frequency_in_mhz + self.remainder;
        // absorb float noise so an event computed from a cycle count lands
        // exactly on that count
        let whole = (exact + 1e-6).floor().max(0.0);
        self.remainder = (exact - whole).max(0.0);
        whole as u64
    }

    /// Microseconds represented by `cycles` in this domain.
    pub fn micros_for(&self, cycles: u64) -> f64 {
        cycles as f64 / self.frequency_in_mhz
    }

    pub fn reset(&mut self) {
        self.remainder = 0.0;
    }
}

/// Running total of simulated time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduler {
    pub max_slice_us: f64,
    elapsed_us: f64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(MAX_SLICE_US)
    }
}

impl Scheduler {
    pub fn new(max_slice_us: f64) -> Self {
        Self {
            max_slice_us: max_slice_us.max(1.0),
            elapsed_us: 0.0,
        }
    }

    pub fn plan(&self, devices: &mut [&mut dyn Device]) -> f64 {
        plan_slice(devices, self.max_slice_us)
    }

    pub fn advance(&mut self, micros: f64) {
        self.elapsed_us += micros;
    }

    pub fn elapsed_us(&self) -> f64 {
        self.elapsed_us
    }
}
