//! DMA memory used by the pipeline for its own tables and buffers.
//!
//! The hardware needs to be given addresses it can reach, while the CPU needs
//! a mapping of the same memory to read or fill it. An allocation therefore
//! always comes as a triple: the physical address, the device-visible (DMA)
//! address, and the CPU mapping. These are obtained from a `DmaAllocator`,
//! which is the port to whatever the platform uses for contiguous memory.
//!
//! A `DmaArena` carves a single allocation into indexed regions. Each region
//! is described by a `RegionHandle` carrying its own physical and DMA
//! addresses, and its mapped bytes are reached through the arena by index
//! rather than by offsetting pointers.
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use log::debug;
use thiserror::Error;

/// Physical address of a memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(pub u64);

/// Address of a memory region as seen by the capture hardware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DmaAddr(pub u64);

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl DmaAddr {
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

impl PhysAddr {
    pub const fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("cannot allocate {0} bytes of DMA memory")]
    OutOfMemory(usize),
    #[error("cannot allocate an arena without regions")]
    EmptyLayout,
    #[error("allocator mapped {mapped} bytes out of {size}")]
    ShortMapping { size: usize, mapped: usize },
}

/// A contiguous allocation returned by a `DmaAllocator`.
pub struct DmaMemory {
    pub phys: PhysAddr,
    pub dma: DmaAddr,
    /// CPU mapping of the allocation.
    pub mapped: Box<[u8]>,
}

/// Port to the platform's contiguous memory allocator.
pub trait DmaAllocator: Send + Sync {
    fn allocate(&self, size: usize) -> Result<DmaMemory, AllocError>;
}

/// Allocator backed by the process heap. Physical addresses are handed out
/// from a bump counter starting at `base`, and DMA addresses are derived from
/// them by adding `dma_offset`, the way buses with a fixed DRAM window do.
pub struct HeapAllocator {
    next: AtomicU64,
    dma_offset: u64,
    limit: u64,
}

const PAGE_SIZE: u64 = 4096;

impl HeapAllocator {
    pub fn new(base: PhysAddr, dma_offset: u64) -> Self {
        Self {
            next: AtomicU64::new(base.0),
            dma_offset,
            limit: u64::MAX,
        }
    }

    /// Limit the total amount of memory that can be handed out.
    pub fn with_limit(self, limit: u64) -> Self {
        let base = self.next.load(Ordering::Relaxed);
        Self {
            limit: base.saturating_add(limit),
            ..self
        }
    }
}

impl Default for HeapAllocator {
    fn default() -> Self {
        Self::new(PhysAddr(0x4000_0000), 0)
    }
}

impl DmaAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<DmaMemory, AllocError> {
        let pages = (size as u64).div_ceil(PAGE_SIZE).max(1);
        let span = pages * PAGE_SIZE;
        let limit = self.limit;
        let phys = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                next.checked_add(span).filter(|end| *end <= limit)
            })
            .map_err(|_| AllocError::OutOfMemory(size))?;

        Ok(DmaMemory {
            phys: PhysAddr(phys),
            dma: DmaAddr(phys + self.dma_offset),
            mapped: vec![0u8; size].into_boxed_slice(),
        })
    }
}

/// Where a region lives inside its arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Region {
    offset: usize,
    len: usize,
}

/// Addresses of one region of a `DmaArena`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionHandle {
    pub index: usize,
    pub phys: PhysAddr,
    pub dma: DmaAddr,
    pub len: usize,
}

/// Regions start on this boundary inside an arena.
const REGION_ALIGN: usize = 64;

/// A single DMA allocation split into indexed regions.
pub struct DmaArena {
    phys: PhysAddr,
    dma: DmaAddr,
    regions: Vec<Region>,
    mapped: RwLock<Box<[u8]>>,
}

impl DmaArena {
    /// Allocate an arena holding one region per entry of `sizes`, in order.
    pub fn new(allocator: &dyn DmaAllocator, sizes: &[usize]) -> Result<Self, AllocError> {
        if sizes.is_empty() {
            return Err(AllocError::EmptyLayout);
        }

        let mut regions = Vec::with_capacity(sizes.len());
        let mut offset = 0usize;
        for &len in sizes {
            regions.push(Region { offset, len });
            offset = (offset + len).next_multiple_of(REGION_ALIGN);
        }

        let memory = allocator.allocate(offset)?;
        if memory.mapped.len() < offset {
            return Err(AllocError::ShortMapping {
                size: offset,
                mapped: memory.mapped.len(),
            });
        }
        debug!(
            "Allocated DMA arena of {} bytes with {} regions at {} (dma {})",
            offset,
            regions.len(),
            memory.phys,
            memory.dma
        );

        Ok(Self {
            phys: memory.phys,
            dma: memory.dma,
            regions,
            mapped: RwLock::new(memory.mapped),
        })
    }

    /// Allocate an arena of `count` regions of `size` bytes each.
    pub fn uniform(
        allocator: &dyn DmaAllocator,
        count: usize,
        size: usize,
    ) -> Result<Self, AllocError> {
        Self::new(allocator, &vec![size; count])
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn region(&self, index: usize) -> Option<RegionHandle> {
        self.regions.get(index).map(|r| RegionHandle {
            index,
            phys: self.phys.offset(r.offset),
            dma: self.dma.offset(r.offset),
            len: r.len,
        })
    }

    pub fn regions(&self) -> impl Iterator<Item = RegionHandle> + '_ {
        (0..self.regions.len()).filter_map(|i| self.region(i))
    }

    /// Run `f` on the CPU mapping of region `index`.
    pub fn read<R, F: FnOnce(&[u8]) -> R>(&self, index: usize, f: F) -> Option<R> {
        let region = *self.regions.get(index)?;
        let mapped = self.mapped.read().unwrap();
        Some(f(&mapped[region.offset..region.offset + region.len]))
    }

    /// Run `f` on the CPU mapping of region `index`, with write access.
    pub fn write<R, F: FnOnce(&mut [u8]) -> R>(&self, index: usize, f: F) -> Option<R> {
        let region = *self.regions.get(index)?;
        let mut mapped = self.mapped.write().unwrap();
        Some(f(&mut mapped[region.offset..region.offset + region.len]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocator_addresses() {
        let allocator = HeapAllocator::new(PhysAddr(0x1000_0000), 0x4000_0000);

        let first = allocator.allocate(100).unwrap();
        assert_eq!(first.phys, PhysAddr(0x1000_0000));
        assert_eq!(first.dma, DmaAddr(0x5000_0000));
        assert_eq!(first.mapped.len(), 100);

        // Allocations are page-granular.
        let second = allocator.allocate(PAGE_SIZE as usize + 1).unwrap();
        assert_eq!(second.phys, PhysAddr(0x1000_1000));
        let third = allocator.allocate(1).unwrap();
        assert_eq!(third.phys, PhysAddr(0x1000_3000));
    }

    #[test]
    fn test_heap_allocator_limit() {
        let allocator = HeapAllocator::default().with_limit(2 * PAGE_SIZE);

        assert!(allocator.allocate(PAGE_SIZE as usize).is_ok());
        assert!(allocator.allocate(PAGE_SIZE as usize).is_ok());
        assert!(matches!(
            allocator.allocate(1),
            Err(AllocError::OutOfMemory(1))
        ));
    }

    #[test]
    fn test_arena_regions() {
        let allocator = HeapAllocator::new(PhysAddr(0x2000_0000), 0x100);
        let arena = DmaArena::new(&allocator, &[10, 100, 64]).unwrap();

        assert_eq!(arena.num_regions(), 3);
        let regions: Vec<_> = arena.regions().collect();
        assert_eq!(regions[0].phys, PhysAddr(0x2000_0000));
        assert_eq!(regions[0].dma, DmaAddr(0x2000_0100));
        assert_eq!(regions[0].len, 10);
        assert_eq!(regions[1].phys, PhysAddr(0x2000_0040));
        assert_eq!(regions[1].len, 100);
        assert_eq!(regions[2].phys, PhysAddr(0x2000_00c0));
        assert_eq!(regions[2].dma, DmaAddr(0x2000_01c0));
        assert!(arena.region(3).is_none());
    }

    #[test]
    fn test_arena_regions_do_not_overlap() {
        let allocator = HeapAllocator::default();
        let arena = DmaArena::uniform(&allocator, 3, 16).unwrap();

        for i in 0..3 {
            arena.write(i, |bytes| bytes.fill(i as u8 + 1)).unwrap();
        }
        for i in 0..3 {
            arena
                .read(i, |bytes| {
                    assert_eq!(bytes.len(), 16);
                    assert!(bytes.iter().all(|b| *b == i as u8 + 1));
                })
                .unwrap();
        }
        assert!(arena.read(3, |_| ()).is_none());
    }

    /// Hands out less mapped memory than requested.
    struct ShortAllocator;

    impl DmaAllocator for ShortAllocator {
        fn allocate(&self, size: usize) -> Result<DmaMemory, AllocError> {
            Ok(DmaMemory {
                phys: PhysAddr(0x3000_0000),
                dma: DmaAddr(0x3000_0000),
                mapped: vec![0u8; size / 2].into_boxed_slice(),
            })
        }
    }

    #[test]
    fn test_arena_short_mapping() {
        assert!(matches!(
            DmaArena::uniform(&ShortAllocator, 2, 128),
            Err(AllocError::ShortMapping {
                size: 256,
                mapped: 128
            })
        ));
    }

    #[test]
    fn test_arena_empty_layout() {
        let allocator = HeapAllocator::default();
        assert!(matches!(
            DmaArena::new(&allocator, &[]),
            Err(AllocError::EmptyLayout)
        ));
    }
}
