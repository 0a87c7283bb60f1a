#![allow(dead_code)]

use kernel_info::boot::{MemoryRegion, MemoryRegionKind};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_mm::{ArchMmu, MemoryManager, MmConfig, ZoneLayout};
use kernel_vmem::PhysMapper;
use std::alloc::{Layout, alloc, dealloc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

pub const MIB: u64 = 1 << 20;
pub const PAGE: u64 = 4096;
pub const RAM_SIZE: u64 = 8 * MIB;

/// First frame of the NORMAL zone's usable RAM.
pub const NORMAL_BASE: u64 = 4 * MIB;
pub const NORMAL_PAGES: u64 = 1024;

/// Free pages in the DMA zone: 256 frames minus the descriptor table.
pub const DMA_PAGES: u64 = 256 - 24;

/// Host memory standing in for physical RAM; physical address = offset.
///
/// Starts out filled with garbage so that missing zero-fills show up.
pub struct SimulatedRam {
    base: *mut u8,
    layout: Layout,
}

// SAFETY: the buffer is plain memory; synchronisation is the memory manager's job.
unsafe impl Send for SimulatedRam {}
unsafe impl Sync for SimulatedRam {}

impl SimulatedRam {
    pub fn new() -> Self {
        let layout = Layout::from_size_align(RAM_SIZE as usize, PAGE as usize).unwrap();
        // SAFETY: non-zero size.
        let base = unsafe { alloc(layout) };
        assert!(!base.is_null());
        unsafe { base.write_bytes(0xA5, RAM_SIZE as usize) };
        Self { base, layout }
    }

    fn check(&self, pa: PhysicalAddress, len: usize) -> usize {
        let off = pa.as_u64();
        assert!(
            off + len as u64 <= RAM_SIZE,
            "physical address {pa} outside simulated RAM"
        );
        off as usize
    }

    pub fn read(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let off = self.check(pa, len);
        unsafe { std::slice::from_raw_parts(self.base.add(off), len) }.to_vec()
    }

    pub fn write(&self, pa: PhysicalAddress, data: &[u8]) {
        let off = self.check(pa, data.len());
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.base.add(off), data.len()) };
    }

    pub fn fill(&self, pa: PhysicalAddress, byte: u8, len: usize) {
        let off = self.check(pa, len);
        unsafe { self.base.add(off).write_bytes(byte, len) };
    }
}

impl Drop for SimulatedRam {
    fn drop(&mut self) {
        unsafe { dealloc(self.base, self.layout) };
    }
}

impl PhysMapper for SimulatedRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let off = self.check(pa, size_of::<T>());
        unsafe { &mut *self.base.add(off).cast::<T>() }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Flush {
    All,
    Page(u64),
}

/// Records TLB maintenance instead of performing it.
#[derive(Default)]
pub struct RecordingMmu {
    log: Mutex<Vec<Flush>>,
    pub fault_address: AtomicU64,
    clock: AtomicU64,
}

impl RecordingMmu {
    pub fn take(&self) -> Vec<Flush> {
        std::mem::take(&mut *self.log.lock().unwrap())
    }

    /// Whether `va` was flushed, individually or by a full flush.
    pub fn flushed(&self, va: u64) -> bool {
        self.log
            .lock()
            .unwrap()
            .iter()
            .any(|f| *f == Flush::All || *f == Flush::Page(va))
    }
}

impl ArchMmu for RecordingMmu {
    fn flush_tlb(&self) {
        self.log.lock().unwrap().push(Flush::All);
    }

    fn flush_tlb_page(&self, va: VirtualAddress) {
        self.log.lock().unwrap().push(Flush::Page(va.as_u64()));
    }

    fn fault_address(&self) -> u64 {
        self.fault_address.load(Ordering::Relaxed)
    }

    fn timestamp(&self) -> u64 {
        self.clock.fetch_add(10, Ordering::Relaxed)
    }
}

/// `[0, 1M)` usable, `[1M, 4M)` reserved, `[4M, 8M)` usable.
pub fn memory_map() -> [MemoryRegion; 3] {
    [
        MemoryRegion::available(0, MIB),
        MemoryRegion::new(MIB, 3 * MIB, MemoryRegionKind::Reserved),
        MemoryRegion::available(NORMAL_BASE, NORMAL_PAGES * PAGE),
    ]
}

/// DMA below 1 MiB, an empty DMA32 zone up to 2 MiB, NORMAL above.
pub fn config() -> MmConfig {
    MmConfig {
        zones: ZoneLayout {
            dma_end: MIB,
            dma32_end: 2 * MIB,
            normal_end: RAM_SIZE,
        },
        ..MmConfig::default()
    }
}

pub type TestManager<'m> = MemoryManager<'m, SimulatedRam, RecordingMmu>;

pub fn manager(ram: &SimulatedRam) -> TestManager<'_> {
    MemoryManager::new(ram, RecordingMmu::default(), &memory_map(), config()).unwrap()
}

pub fn manager_with(ram: &SimulatedRam, config: MmConfig) -> TestManager<'_> {
    MemoryManager::new(ram, RecordingMmu::default(), &memory_map(), config).unwrap()
}

pub const fn va(v: u64) -> VirtualAddress {
    VirtualAddress::new(v)
}

pub const fn pa(v: u64) -> PhysicalAddress {
    PhysicalAddress::new(v)
}
