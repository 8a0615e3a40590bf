//! Core emulator primitives and traits.

pub mod cpu_8086;
pub mod logging;
pub mod scheduler;
pub mod types {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Frame {
        pub width: u32,
        pub height: u32,
        pub pixels: Vec<u32>,
    }

    impl Frame {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                pixels: vec![0; (width * height) as usize],
            }
        }
    }
}

use serde_json::Value;

/// `next_cycles` value of a device with nothing scheduled.
pub const NEVER: u64 = u64::MAX;

/// A CPU-like component that can be stepped; returns cycles consumed.
pub trait Cpu {
    fn reset(&mut self);
    fn step(&mut self) -> u32;
}

/// A clocked peripheral driven by the scheduler.
///
/// Cycles are counted in the device's own clock domain.
pub trait Device {
    /// Clock rate in MHz, i.e. cycles per microsecond.
    fn frequency_in_mhz(&self) -> f64;

    /// Cycles until the next internally relevant event, or [`NEVER`].
    fn next_cycles(&mut self) -> u64;

    /// Advance by up to `cycles`; returns the cycles actually consumed.
    fn run_cycles(&mut self, cycles: u64) -> u64;
}

/// Description of a mount point (media slot) that a system supports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPointInfo {
    /// Unique identifier for this mount point (e.g., "Program")
    pub id: String,
    /// User-friendly name for display
    pub name: String,
    /// File extensions accepted by this mount point (e.g., ["com", "exe"])
    pub extensions: Vec<String>,
    /// Whether this mount point is required for the system to function
    pub required: bool,
}

/// A high-level System trait tying components together.
pub trait System {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Reset to initial power-on state
    fn reset(&mut self);

    /// Emulate until a frame is produced and return a framebuffer.
    fn step_frame(&mut self) -> Result<types::Frame, Self::Error>;

    /// Return a JSON-serializable save state for debugging.
    /// Save states never include the loaded program image itself.
    fn save_state(&self) -> Value;

    /// Load a JSON save state.
    fn load_state(&mut self, v: &Value) -> Result<(), serde_json::Error>;

    fn supports_save_states(&self) -> bool {
        false
    }

    /// Get the list of mount points this system supports
    fn mount_points(&self) -> Vec<MountPointInfo>;

    /// Load media into a specific mount point
    fn mount(&mut self, mount_point_id: &str, data: &[u8]) -> Result<(), Self::Error>;

    /// Unload media from a specific mount point
    fn unmount(&mut self, mount_point_id: &str) -> Result<(), Self::Error>;

    /// Check if a mount point has media loaded
    fn is_mounted(&self, mount_point_id: &str) -> bool;
}
