//! DOS memory control blocks
//!
//! Conventional memory is a chain of blocks, each preceded by a one
//! paragraph header living in guest memory:
//!
//! ```text
//! +0  signature  'M' (more blocks follow) or 'Z' (last block)
//! +1  owner PSP  0 = free
//! +3  size       paragraphs, excluding the header
//! ```
//!
//! The next header sits right after the block's data. Free neighbours are
//! merged lazily when an allocation walks over them. Every successful
//! operation re-validates the whole chain and a broken chain is reported,
//! never repaired.

use super::DosError;
use crate::bus::{linear, PcBus};
use crate::config::AllocStrategy;

/// Segment of the first header
pub const MCB_BASE: u16 = 0x0158;
/// First paragraph past conventional memory
pub const MEMORY_TOP: u16 = 0xA000;
/// Owner of a free block
pub const FREE_OWNER: u16 = 0;
/// Owner used for blocks belonging to DOS itself
pub const SYSTEM_OWNER: u16 = 8;

const SIG_MORE: u8 = b'M';
const SIG_LAST: u8 = b'Z';

/// Handle to a header at a given segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mcb {
    pub seg: u16,
}

impl Mcb {
    pub fn at(seg: u16) -> Self {
        Self { seg }
    }

    /// Header of the block whose data starts at `data_seg`.
    pub fn for_data(data_seg: u16) -> Self {
        Self {
            seg: data_seg.wrapping_sub(1),
        }
    }

    /// Write a fresh non-last header with zeroed fields.
    pub fn build(bus: &mut PcBus, seg: u16) -> Self {
        bus.write_u8(linear(seg, 0), SIG_MORE);
        for i in 1..16 {
            bus.write_u8(linear(seg, i), 0);
        }
        Self { seg }
    }

    pub fn signature(self, bus: &PcBus) -> u8 {
        bus.read_u8(linear(self.seg, 0))
    }

    pub fn has_valid_signature(self, bus: &PcBus) -> bool {
        matches!(self.signature(bus), SIG_MORE | SIG_LAST)
    }

    pub fn is_last(self, bus: &PcBus) -> bool {
        self.signature(bus) == SIG_LAST
    }

    pub fn set_last(self, bus: &mut PcBus, last: bool) {
        bus.write_u8(linear(self.seg, 0), if last { SIG_LAST } else { SIG_MORE });
    }

    pub fn owner(self, bus: &PcBus) -> u16 {
        bus.read_u16(linear(self.seg, 1))
    }

    pub fn set_owner(self, bus: &mut PcBus, owner: u16) {
        bus.write_u16(linear(self.seg, 1), owner);
    }

    pub fn is_free(self, bus: &PcBus) -> bool {
        self.owner(bus) == FREE_OWNER
    }

    pub fn size(self, bus: &PcBus) -> u16 {
        bus.read_u16(linear(self.seg, 3))
    }

    pub fn set_size(self, bus: &mut PcBus, paras: u16) {
        bus.write_u16(linear(self.seg, 3), paras);
    }

    pub fn data_seg(self) -> u16 {
        self.seg.wrapping_add(1)
    }

    pub fn next(self, bus: &PcBus) -> Mcb {
        Mcb::at(self.data_seg().wrapping_add(self.size(bus)))
    }

    /// The following header, which must lie above this one and below the
    /// top of conventional memory.
    pub fn checked_next(self, bus: &PcBus) -> Result<Mcb, DosError> {
        let next = self
            .data_seg()
            .checked_add(self.size(bus))
            .map(Mcb::at)
            .ok_or(DosError::McbDestroyed)?;
        if next.seg <= self.seg || next.seg >= MEMORY_TOP {
            return Err(DosError::McbDestroyed);
        }
        Ok(next)
    }

    /// Shrink to `paras` and turn the remainder into a new free block.
    /// The caller guarantees `paras < size`.
    pub fn split(self, bus: &mut PcBus, paras: u16) {
        let old_size = self.size(bus);
        debug_assert!(paras < old_size);
        self.set_size(bus, paras);

        let rest = Mcb::build(bus, self.data_seg().wrapping_add(paras));
        rest.set_size(bus, old_size - paras - 1);
        if self.is_last(bus) {
            self.set_last(bus, false);
            rest.set_last(bus, true);
        }
    }

    /// Absorb `next`, header included.
    fn combine(self, bus: &mut PcBus, next: Mcb) -> Result<(), DosError> {
        let merged = self
            .size(bus)
            .checked_add(1)
            .and_then(|size| size.checked_add(next.size(bus)))
            .ok_or(DosError::McbDestroyed)?;
        self.set_size(bus, merged);
        self.set_last(bus, next.is_last(bus));
        Ok(())
    }

    /// Merge every free block directly following this one.
    pub fn coalesce(self, bus: &mut PcBus) -> Result<(), DosError> {
        while !self.is_last(bus) {
            let next = self.checked_next(bus)?;
            if !next.has_valid_signature(bus) {
                return Err(DosError::McbDestroyed);
            }
            if !next.is_free(bus) {
                break;
            }
            self.combine(bus, next)?;
        }
        Ok(())
    }
}

/// One entry of a chain walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub seg: u16,
    pub owner: u16,
    pub size: u16,
    pub last: bool,
}

/// The chain of memory control blocks starting at `base`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McbChain {
    base: u16,
}

impl Default for McbChain {
    fn default() -> Self {
        Self { base: MCB_BASE }
    }
}

impl McbChain {
    pub fn new(base: u16) -> Self {
        Self { base }
    }

    pub fn base(&self) -> u16 {
        self.base
    }

    /// Lay down a single free block covering `base..top`.
    pub fn init(&self, bus: &mut PcBus, top: u16) {
        let first = Mcb::build(bus, self.base);
        first.set_size(bus, top - self.base - 1);
        first.set_last(bus, true);
    }

    /// Every block in address order.
    pub fn blocks(&self, bus: &PcBus) -> Result<Vec<BlockInfo>, DosError> {
        let mut blocks = Vec::new();
        let mut mcb = Mcb::at(self.base);
        loop {
            if !mcb.has_valid_signature(bus) {
                return Err(DosError::McbDestroyed);
            }
            let info = BlockInfo {
                seg: mcb.seg,
                owner: mcb.owner(bus),
                size: mcb.size(bus),
                last: mcb.is_last(bus),
            };
            blocks.push(info);
            if info.last {
                return Ok(blocks);
            }
            mcb = mcb.checked_next(bus)?;
        }
    }

    /// Walk to the last block, failing on a bad signature.
    pub fn validate(&self, bus: &PcBus) -> Result<(), DosError> {
        self.blocks(bus).map(|_| ())
    }

    /// Allocate `paras` paragraphs for `owner`; returns the data segment.
    pub fn allocate(
        &self,
        bus: &mut PcBus,
        paras: u16,
        strategy: AllocStrategy,
        owner: u16,
    ) -> Result<u16, DosError> {
        let mut largest = 0u16;
        let mut chosen: Option<(Mcb, u16)> = None;

        let mut mcb = Mcb::at(self.base);
        loop {
            if !mcb.has_valid_signature(bus) {
                return Err(DosError::McbDestroyed);
            }
            if mcb.is_free(bus) {
                mcb.coalesce(bus)?;
                let size = mcb.size(bus);
                largest = largest.max(size);
                if size >= paras {
                    chosen = match (strategy, chosen) {
                        (AllocStrategy::FirstFit, Some(first)) => Some(first),
                        (AllocStrategy::BestFit, Some((best, best_size))) if best_size <= size => {
                            Some((best, best_size))
                        }
                        _ => Some((mcb, size)),
                    };
                }
            }
            if mcb.is_last(bus) {
                break;
            }
            mcb = mcb.checked_next(bus)?;
        }

        let Some((block, size)) = chosen else {
            return Err(DosError::InsufficientMemory { largest });
        };

        let block = if size > paras {
            match strategy {
                AllocStrategy::LastFit => {
                    block.split(bus, size - paras - 1);
                    block.next(bus)
                }
                _ => {
                    block.split(bus, paras);
                    block
                }
            }
        } else {
            block
        };
        block.set_owner(bus, owner);

        self.validate(bus)?;
        Ok(block.data_seg())
    }

    /// Mark the block at `data_seg` free. Neighbours are merged later.
    pub fn free(&self, bus: &mut PcBus, data_seg: u16) -> Result<(), DosError> {
        let mcb = Mcb::for_data(data_seg);
        if !mcb.has_valid_signature(bus) {
            return Err(DosError::InvalidBlock);
        }
        mcb.set_owner(bus, FREE_OWNER);
        self.validate(bus)
    }

    /// Grow or shrink the block at `data_seg` in place.
    pub fn resize(&self, bus: &mut PcBus, data_seg: u16, paras: u16) -> Result<(), DosError> {
        let mcb = Mcb::for_data(data_seg);
        if !mcb.has_valid_signature(bus) {
            return Err(DosError::InvalidBlock);
        }

        let original = mcb.size(bus);
        mcb.coalesce(bus)?;
        let available = mcb.size(bus);

        if paras > available {
            if available > original {
                mcb.split(bus, original);
            }
            self.validate(bus)?;
            return Err(DosError::InsufficientMemory { largest: available });
        }
        if paras < available {
            mcb.split(bus, paras);
        }
        self.validate(bus)
    }

    /// Free every block owned by `owner`.
    pub fn free_owned_by(&self, bus: &mut PcBus, owner: u16) -> Result<(), DosError> {
        for block in self.blocks(bus)? {
            if block.owner == owner {
                Mcb::at(block.seg).set_owner(bus, FREE_OWNER);
            }
        }
        self.validate(bus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: u16 = 0x1234;

    fn chain_with(total: u16) -> (PcBus, McbChain) {
        let mut bus = PcBus::new();
        let chain = McbChain::new(0x1000);
        chain.init(&mut bus, 0x1000 + total + 1);
        (bus, chain)
    }

    /// Free blocks of 10, 4 and 20 paragraphs separated by one-paragraph
    /// allocations. Returns the data segments of the three free blocks.
    fn fragmented() -> (PcBus, McbChain, [u16; 3]) {
        let (mut bus, chain) = chain_with(40);
        let s = AllocStrategy::FirstFit;
        let a = chain.allocate(&mut bus, 10, s, OWNER).unwrap();
        chain.allocate(&mut bus, 1, s, OWNER).unwrap();
        let c = chain.allocate(&mut bus, 4, s, OWNER).unwrap();
        chain.allocate(&mut bus, 1, s, OWNER).unwrap();
        let blocks = chain.blocks(&bus).unwrap();
        let e = blocks.last().unwrap();
        assert!(e.last);
        assert_eq!(e.owner, FREE_OWNER);
        assert_eq!(e.size, 20);
        chain.free(&mut bus, a).unwrap();
        chain.free(&mut bus, c).unwrap();
        (bus, chain, [a, c, e.seg + 1])
    }

    #[test]
    fn test_init_single_free_block() {
        let mut bus = PcBus::new();
        let chain = McbChain::default();
        chain.init(&mut bus, MEMORY_TOP);
        let blocks = chain.blocks(&bus).unwrap();
        assert_eq!(
            blocks,
            vec![BlockInfo {
                seg: MCB_BASE,
                owner: FREE_OWNER,
                size: 0x9FFF - MCB_BASE,
                last: true
            }]
        );
    }

    #[test]
    fn test_first_fit_picks_lowest_block() {
        let (mut bus, chain, [a, _, _]) = fragmented();
        let seg = chain.allocate(&mut bus, 4, AllocStrategy::FirstFit, 7).unwrap();
        assert_eq!(seg, a);
        // split at the front, remainder stays free
        assert_eq!(Mcb::for_data(seg).size(&bus), 4);
        assert!(Mcb::for_data(seg).next(&bus).is_free(&bus));
    }

    #[test]
    fn test_best_fit_picks_exact_block() {
        let (mut bus, chain, [_, c, _]) = fragmented();
        let seg = chain.allocate(&mut bus, 4, AllocStrategy::BestFit, 7).unwrap();
        assert_eq!(seg, c);
        assert_eq!(Mcb::for_data(seg).size(&bus), 4);
    }

    #[test]
    fn test_last_fit_takes_tail_of_last_block() {
        let (mut bus, chain, [_, _, e]) = fragmented();
        let seg = chain.allocate(&mut bus, 4, AllocStrategy::LastFit, 7).unwrap();
        assert_eq!(seg, e + 16);
        let mcb = Mcb::for_data(seg);
        assert!(mcb.is_last(&bus));
        assert_eq!(mcb.owner(&bus), 7);
        assert_eq!(mcb.size(&bus), 4);
        assert_eq!(Mcb::for_data(e).size(&bus), 15);
        assert!(Mcb::for_data(e).is_free(&bus));
    }

    #[test]
    fn test_out_of_memory_reports_largest_block() {
        let (mut bus, chain, _) = fragmented();
        let err = chain
            .allocate(&mut bus, 0xFFFF, AllocStrategy::FirstFit, 7)
            .unwrap_err();
        assert_eq!(err, DosError::InsufficientMemory { largest: 20 });
        assert_eq!(err.code(), 8);
        chain.validate(&bus).unwrap();
    }

    #[test]
    fn test_free_blocks_coalesce_on_next_allocation() {
        let (mut bus, chain) = chain_with(40);
        let s = AllocStrategy::FirstFit;
        let a = chain.allocate(&mut bus, 5, s, OWNER).unwrap();
        let b = chain.allocate(&mut bus, 5, s, OWNER).unwrap();
        chain.free(&mut bus, a).unwrap();
        chain.free(&mut bus, b).unwrap();
        // still three blocks until an allocation walks over them
        assert_eq!(chain.blocks(&bus).unwrap().len(), 3);
        let whole = chain.allocate(&mut bus, 40, s, OWNER).unwrap();
        assert_eq!(whole, a);
        assert_eq!(chain.blocks(&bus).unwrap().len(), 1);
    }

    #[test]
    fn test_resize_shrink_and_grow() {
        let (mut bus, chain) = chain_with(40);
        let s = AllocStrategy::FirstFit;
        let a = chain.allocate(&mut bus, 10, s, OWNER).unwrap();
        chain.resize(&mut bus, a, 4).unwrap();
        assert_eq!(Mcb::for_data(a).size(&bus), 4);
        chain.resize(&mut bus, a, 40).unwrap();
        assert_eq!(Mcb::for_data(a).size(&bus), 40);
        assert!(Mcb::for_data(a).is_last(&bus));
    }

    #[test]
    fn test_failed_grow_keeps_original_size() {
        let (mut bus, chain) = chain_with(40);
        let s = AllocStrategy::FirstFit;
        let a = chain.allocate(&mut bus, 10, s, OWNER).unwrap();
        let b = chain.allocate(&mut bus, 10, s, OWNER).unwrap();
        chain.free(&mut bus, b).unwrap();
        let err = chain.resize(&mut bus, a, 100).unwrap_err();
        assert_eq!(err, DosError::InsufficientMemory { largest: 40 });
        assert_eq!(Mcb::for_data(a).size(&bus), 10);
        assert_eq!(Mcb::for_data(a).owner(&bus), OWNER);
        chain.validate(&bus).unwrap();
    }

    #[test]
    fn test_free_invalid_block() {
        let (mut bus, chain) = chain_with(40);
        assert_eq!(chain.free(&mut bus, 0x2000), Err(DosError::InvalidBlock));
        assert_eq!(chain.resize(&mut bus, 0x2000, 1), Err(DosError::InvalidBlock));
    }

    #[test]
    fn test_corrupt_chain_is_reported() {
        let (mut bus, chain) = chain_with(40);
        let a = chain
            .allocate(&mut bus, 10, AllocStrategy::FirstFit, OWNER)
            .unwrap();
        let next = Mcb::for_data(a).next(&bus);
        bus.write_u8(linear(next.seg, 0), b'X');
        assert_eq!(chain.validate(&bus), Err(DosError::McbDestroyed));
        assert_eq!(
            chain.allocate(&mut bus, 1, AllocStrategy::FirstFit, OWNER),
            Err(DosError::McbDestroyed)
        );
    }

    #[test]
    fn test_free_block_size_wrapping_the_segment() {
        let (mut bus, chain) = chain_with(40);
        let s = AllocStrategy::FirstFit;
        let a = chain.allocate(&mut bus, 10, s, OWNER).unwrap();
        chain.free(&mut bus, a).unwrap();
        Mcb::for_data(a).set_size(&mut bus, 0xFFFF);
        assert_eq!(chain.allocate(&mut bus, 1, s, OWNER), Err(DosError::McbDestroyed));
        assert_eq!(chain.validate(&bus), Err(DosError::McbDestroyed));
    }

    #[test]
    fn test_block_reaching_past_conventional_memory() {
        let (mut bus, chain) = chain_with(40);
        let s = AllocStrategy::FirstFit;
        let a = chain.allocate(&mut bus, 10, s, OWNER).unwrap();
        // the next header would sit at A501
        Mcb::for_data(a).set_size(&mut bus, 0x9500);
        assert_eq!(chain.validate(&bus), Err(DosError::McbDestroyed));
        assert_eq!(chain.allocate(&mut bus, 1, s, OWNER), Err(DosError::McbDestroyed));
        assert_eq!(chain.resize(&mut bus, a, 12), Err(DosError::McbDestroyed));

        // freeing still marks the block, then reports the broken chain
        assert_eq!(chain.free(&mut bus, a), Err(DosError::McbDestroyed));
        assert_eq!(chain.allocate(&mut bus, 1, s, OWNER), Err(DosError::McbDestroyed));
    }

    #[test]
    fn test_bad_signature_found_while_coalescing() {
        let (mut bus, chain) = chain_with(40);
        let s = AllocStrategy::FirstFit;
        let a = chain.allocate(&mut bus, 10, s, OWNER).unwrap();
        let next = Mcb::for_data(a).next(&bus);
        bus.write_u8(linear(next.seg, 0), b'X');

        // growing in place merges forward into the broken header
        assert_eq!(chain.resize(&mut bus, a, 20), Err(DosError::McbDestroyed));

        Mcb::for_data(a).set_owner(&mut bus, FREE_OWNER);
        assert_eq!(chain.allocate(&mut bus, 1, s, OWNER), Err(DosError::McbDestroyed));
    }

    #[test]
    fn test_chain_stays_valid_under_mixed_operations() {
        let (mut bus, chain) = chain_with(0x400);
        let strategies = [
            AllocStrategy::FirstFit,
            AllocStrategy::BestFit,
            AllocStrategy::LastFit,
        ];
        let mut live: Vec<u16> = Vec::new();
        for i in 0..60u16 {
            let strategy = strategies[(i % 3) as usize];
            match i % 5 {
                0 | 1 | 2 => {
                    if let Ok(seg) = chain.allocate(&mut bus, 1 + (i * 7) % 40, strategy, OWNER) {
                        live.push(seg);
                    }
                }
                3 => {
                    if !live.is_empty() {
                        let seg = live.remove((i as usize * 3) % live.len());
                        chain.free(&mut bus, seg).unwrap();
                    }
                }
                _ => {
                    if let Some(&seg) = live.last() {
                        let _ = chain.resize(&mut bus, seg, 1 + i % 13);
                    }
                }
            }
            let blocks = chain.blocks(&bus).unwrap();
            assert_eq!(blocks.iter().filter(|b| b.last).count(), 1);
            let covered: u32 = blocks.iter().map(|b| b.size as u32 + 1).sum();
            assert_eq!(covered, 0x401);
        }
    }

    #[test]
    fn test_free_owned_by() {
        let (mut bus, chain) = chain_with(40);
        let s = AllocStrategy::FirstFit;
        chain.allocate(&mut bus, 5, s, 0x100).unwrap();
        chain.allocate(&mut bus, 5, s, 0x200).unwrap();
        chain.free_owned_by(&mut bus, 0x100).unwrap();
        let owners: Vec<u16> = chain.blocks(&bus).unwrap().iter().map(|b| b.owner).collect();
        assert_eq!(owners, vec![FREE_OWNER, 0x200, FREE_OWNER]);
    }
}
