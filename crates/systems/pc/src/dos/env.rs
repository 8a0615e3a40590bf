//! DOS environment blocks
//!
//! A sequence of `KEY=VALUE\0` strings ending with an empty string, stored
//! in its own memory block. `size` counts the bytes in use including the
//! final terminator.

use super::mcb::Mcb;
use super::DosError;
use crate::bus::{linear, PcBus};

/// Longest `KEY=VALUE` string accepted by [`Environment::set`]
const MAX_ENTRY_LEN: usize = 255;
/// Environment blocks are limited to 32 KiB
const MAX_CAPACITY: usize = 0x8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Environment {
    seg: u16,
    capacity: usize,
    size: usize,
}

impl Environment {
    /// Start an empty environment in `seg`, blanking `capacity` bytes.
    pub fn create_in_seg(bus: &mut PcBus, seg: u16, capacity: usize) -> Result<Self, DosError> {
        if capacity == 0 || capacity >= MAX_CAPACITY {
            return Err(DosError::InvalidEnvironment);
        }
        for i in 0..capacity {
            bus.write_u8(linear(seg, i as u16), b' ');
        }
        bus.write_u8(linear(seg, 0), 0);
        Ok(Self {
            seg,
            capacity,
            size: 1,
        })
    }

    /// Open an existing environment. The capacity is the size of the
    /// memory block holding it.
    pub fn from_seg(bus: &PcBus, seg: u16) -> Result<Self, DosError> {
        let mcb = Mcb::for_data(seg);
        if seg == 0 || !mcb.has_valid_signature(bus) {
            return Err(DosError::InvalidEnvironment);
        }
        let capacity = 16 * mcb.size(bus) as usize;
        if capacity == 0 || capacity >= MAX_CAPACITY {
            return Err(DosError::InvalidEnvironment);
        }

        let mut i = 0;
        loop {
            let start = i;
            while i < capacity && bus.read_u8(linear(seg, i as u16)) != 0 {
                i += 1;
            }
            if i >= capacity {
                return Err(DosError::InvalidEnvironment);
            }
            i += 1;
            if i - start == 1 {
                break;
            }
        }

        Ok(Self {
            seg,
            capacity,
            size: i,
        })
    }

    pub fn seg(&self) -> u16 {
        self.seg
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn read_byte(&self, bus: &PcBus, i: usize) -> u8 {
        bus.read_u8(linear(self.seg, i as u16))
    }

    fn write_byte(&self, bus: &mut PcBus, i: usize, value: u8) {
        bus.write_u8(linear(self.seg, i as u16), value);
    }

    /// Every entry with its byte offset.
    fn entries_with_offsets(&self, bus: &PcBus) -> Vec<(usize, String)> {
        let mut entries = Vec::new();
        let mut i = 0;
        while i + 1 < self.size {
            let start = i;
            let mut bytes = Vec::new();
            while i < self.size {
                let c = self.read_byte(bus, i);
                i += 1;
                if c == 0 {
                    break;
                }
                bytes.push(c);
            }
            entries.push((start, String::from_utf8_lossy(&bytes).into_owned()));
        }
        entries
    }

    pub fn entries(&self, bus: &PcBus) -> Vec<String> {
        self.entries_with_offsets(bus)
            .into_iter()
            .map(|(_, entry)| entry)
            .collect()
    }

    /// Value of `key`, matched exactly.
    pub fn get(&self, bus: &PcBus, key: &str) -> Option<String> {
        self.entries(bus).into_iter().find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then(|| v.to_string())
        })
    }

    /// Set a `KEY=VALUE` string, replacing any entry with the same key.
    pub fn set(&mut self, bus: &mut PcBus, entry: &str) -> Result<(), DosError> {
        if entry.matches('=').count() != 1 || entry.len() > MAX_ENTRY_LEN {
            return Err(DosError::InvalidEnvironment);
        }
        let key = entry.split('=').next().unwrap_or_default();
        if key.is_empty() {
            return Err(DosError::InvalidEnvironment);
        }

        self.remove(bus, key);

        if self.size + entry.len() + 1 > self.capacity {
            return Err(DosError::InsufficientEnvironment);
        }

        // overwrite the final terminator, then terminate again
        let mut p = self.size - 1;
        for &b in entry.as_bytes() {
            self.write_byte(bus, p, b);
            p += 1;
        }
        self.write_byte(bus, p, 0);
        self.size += entry.len() + 1;
        self.write_byte(bus, self.size - 1, 0);
        Ok(())
    }

    /// Append the program path that follows the entries (a word count of 1
    /// then the ASCIZ path). Entries set afterwards overwrite it.
    pub fn set_program_path(&mut self, bus: &mut PcBus, path: &str) -> Result<(), DosError> {
        let needed = self.size + 2 + path.len() + 1;
        if needed > self.capacity {
            return Err(DosError::InsufficientEnvironment);
        }
        let mut p = self.size;
        self.write_byte(bus, p, 1);
        self.write_byte(bus, p + 1, 0);
        p += 2;
        for &b in path.as_bytes() {
            self.write_byte(bus, p, b);
            p += 1;
        }
        self.write_byte(bus, p, 0);
        Ok(())
    }

    /// The program path stored after the entries, if any.
    pub fn program_path(&self, bus: &PcBus) -> Option<String> {
        let count = bus.read_u16(linear(self.seg, self.size as u16));
        if count == 0 {
            return None;
        }
        let mut bytes = Vec::new();
        let mut p = self.size + 2;
        while p < self.capacity {
            match self.read_byte(bus, p) {
                0 => return Some(String::from_utf8_lossy(&bytes).into_owned()),
                b => bytes.push(b),
            }
            p += 1;
        }
        None
    }

    /// Remove the entry for `key`. Returns whether one existed.
    pub fn remove(&mut self, bus: &mut PcBus, key: &str) -> bool {
        let found = self.entries_with_offsets(bus).into_iter().find(|(_, entry)| {
            entry
                .split_once('=')
                .map(|(k, _)| k == key)
                .unwrap_or(false)
        });
        let Some((start, entry)) = found else {
            return false;
        };

        let removed = entry.len() + 1;
        for i in start..self.size - removed {
            let b = self.read_byte(bus, i + removed);
            self.write_byte(bus, i, b);
        }
        self.size -= removed;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocStrategy;
    use crate::dos::mcb::McbChain;

    fn env_block(paras: u16) -> (PcBus, u16) {
        let mut bus = PcBus::new();
        let chain = McbChain::new(0x1000);
        chain.init(&mut bus, 0x2000);
        let seg = chain
            .allocate(&mut bus, paras, AllocStrategy::FirstFit, 8)
            .unwrap();
        (bus, seg)
    }

    #[test]
    fn test_set_and_get() {
        let (mut bus, seg) = env_block(4);
        let mut env = Environment::create_in_seg(&mut bus, seg, 64).unwrap();
        env.set(&mut bus, "PATH=C:\\DOS").unwrap();
        env.set(&mut bus, "COMSPEC=C:\\COMMAND.COM").unwrap();
        assert_eq!(env.get(&bus, "PATH").as_deref(), Some("C:\\DOS"));
        assert_eq!(env.get(&bus, "PAT"), None);
        assert_eq!(env.size(), 1 + 12 + 23);
        assert_eq!(bus.read_bytes(linear(seg, 0), 12), b"PATH=C:\\DOS\0".to_vec());
        assert_eq!(bus.read_u8(linear(seg, 35)), 0);
        assert_eq!(bus.read_u8(linear(seg, 34)), 0);
    }

    #[test]
    fn test_replace_moves_entry_to_end() {
        let (mut bus, seg) = env_block(4);
        let mut env = Environment::create_in_seg(&mut bus, seg, 64).unwrap();
        env.set(&mut bus, "A=1").unwrap();
        env.set(&mut bus, "B=2").unwrap();
        env.set(&mut bus, "A=333").unwrap();
        assert_eq!(env.entries(&bus), vec!["B=2", "A=333"]);
        assert_eq!(env.size(), 1 + 4 + 6);
    }

    #[test]
    fn test_rejects_malformed_entries() {
        let (mut bus, seg) = env_block(4);
        let mut env = Environment::create_in_seg(&mut bus, seg, 64).unwrap();
        assert_eq!(env.set(&mut bus, "NOEQUALS"), Err(DosError::InvalidEnvironment));
        assert_eq!(env.set(&mut bus, "A=B=C"), Err(DosError::InvalidEnvironment));
        assert_eq!(env.set(&mut bus, "=X"), Err(DosError::InvalidEnvironment));
        let long = format!("K={}", "x".repeat(300));
        assert_eq!(env.set(&mut bus, &long), Err(DosError::InvalidEnvironment));
    }

    #[test]
    fn test_capacity_is_enforced() {
        let (mut bus, seg) = env_block(1);
        let mut env = Environment::create_in_seg(&mut bus, seg, 16).unwrap();
        env.set(&mut bus, "KEY=012345").unwrap();
        assert_eq!(env.size(), 12);
        assert_eq!(
            env.set(&mut bus, "X=12"),
            Err(DosError::InsufficientEnvironment)
        );
        env.set(&mut bus, "X=1").unwrap();
        assert_eq!(env.size(), 16);
    }

    #[test]
    fn test_from_seg_finds_size() {
        let (mut bus, seg) = env_block(2);
        let mut env = Environment::create_in_seg(&mut bus, seg, 32).unwrap();
        env.set(&mut bus, "A=1").unwrap();
        env.set(&mut bus, "BB=22").unwrap();

        let reopened = Environment::from_seg(&bus, seg).unwrap();
        assert_eq!(reopened.capacity(), 32);
        assert_eq!(reopened.size(), env.size());
        assert_eq!(reopened.entries(&bus), vec!["A=1", "BB=22"]);
    }

    #[test]
    fn test_from_seg_without_block() {
        let bus = PcBus::new();
        assert_eq!(
            Environment::from_seg(&bus, 0x3000),
            Err(DosError::InvalidEnvironment)
        );
    }

    #[test]
    fn test_program_path_follows_entries() {
        let (mut bus, seg) = env_block(4);
        let mut env = Environment::create_in_seg(&mut bus, seg, 64).unwrap();
        env.set(&mut bus, "A=1").unwrap();
        env.set_program_path(&mut bus, "C:\\GAME.EXE").unwrap();
        assert_eq!(bus.read_bytes(linear(seg, 4), 3), vec![0, 1, 0]);
        assert_eq!(env.program_path(&bus).as_deref(), Some("C:\\GAME.EXE"));
        assert_eq!(
            env.set_program_path(&mut bus, &"X".repeat(60)),
            Err(DosError::InsufficientEnvironment)
        );
    }

    #[test]
    fn test_remove() {
        let (mut bus, seg) = env_block(4);
        let mut env = Environment::create_in_seg(&mut bus, seg, 64).unwrap();
        env.set(&mut bus, "A=1").unwrap();
        env.set(&mut bus, "B=2").unwrap();
        assert!(env.remove(&mut bus, "A"));
        assert!(!env.remove(&mut bus, "A"));
        assert_eq!(env.entries(&bus), vec!["B=2"]);
        assert_eq!(bus.read_u8(linear(seg, 4)), 0);
    }
}
