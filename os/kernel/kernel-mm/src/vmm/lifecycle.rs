//! Creating, sharing, cloning and tearing down address spaces.

use super::{AddressSpace, PmmTables, SpaceCounters, SpaceKind, ensure_alive, link_for};
use crate::MmError;
use crate::arch::ArchMmu;
use crate::manager::MemoryManager;
use crate::vmm::vma::VmaSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use kernel_info::memory::{KERNEL_PML4_START, LAST_USERSPACE_ADDRESS};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::page_table::ENTRIES;
use kernel_vmem::{PageEntry, PageTables, PhysMapper};
use log::{debug, info};

impl<M: PhysMapper, A: ArchMmu> MemoryManager<'_, M, A> {
    /// A new, empty user address space with the kernel half shared.
    ///
    /// The space starts with one holder.
    ///
    /// # Errors
    /// [`MmError::OutOfMemory`] if the root table can't be allocated.
    pub fn create_address_space(&self) -> Result<Arc<AddressSpace>, MmError> {
        let mut alloc = PmmTables::new(self.pmm());
        let mut tables = PageTables::create(self.mapper(), &mut alloc)?;

        {
            let kernel = self.kernel_space();
            let _guard = kernel.tables.lock();
            let kernel_tables = PageTables::from_root(self.mapper(), kernel.root());
            for slot in KERNEL_PML4_START..ENTRIES {
                tables.set_root_entry(slot, kernel_tables.root_entry(slot));
            }
        }

        let id = self.next_space_id();
        let space = Arc::new(AddressSpace::new(id, SpaceKind::User, tables.root_page()));
        debug!("VMM: address space {id} created, root {}", space.root());
        Ok(space)
    }

    /// Add a holder to `space`; returns the new holder count.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] if the space has already been destroyed.
    pub fn retain_address_space(&self, space: &AddressSpace) -> Result<u32, MmError> {
        if space.retain() {
            Ok(space.holders())
        } else {
            Err(MmError::InvalidArgument("address space already destroyed"))
        }
    }

    /// Drop one holder of `space`. The last holder tears it down: every page
    /// is unmapped, every user-half table freed, then the root itself.
    ///
    /// Returns `true` if the space was torn down.
    ///
    /// # Errors
    /// [`MmError::InvalidArgument`] for the kernel space or a space that is
    /// already gone.
    pub fn destroy_address_space(&self, space: &AddressSpace) -> Result<bool, MmError> {
        if space.is_kernel() {
            return Err(MmError::InvalidArgument("the kernel address space cannot be destroyed"));
        }
        match space.release() {
            None => return Err(MmError::InvalidArgument("address space already destroyed")),
            Some(false) => return Ok(false),
            Some(true) => {}
        }

        let mut vmas = space.vmas.write();
        let areas = vmas.clear().len();

        let mut frames = Vec::new();
        let mut pages = 0u64;
        let tables = self.with_tables(space, |pt, alloc| {
            pt.for_each_pte(
                VirtualAddress::zero(),
                VirtualAddress::new(LAST_USERSPACE_ADDRESS),
                |_, entry| {
                    let old = core::mem::replace(entry, PageEntry::new());
                    if old.present() {
                        pages += 1;
                        if !old.device() {
                            frames.push(old.physical_address());
                        }
                    }
                },
            );
            pt.free_subtrees(alloc, 0..KERNEL_PML4_START)
        });
        self.mmu().flush_tlb();

        // The root is not counted in the table statistics.
        PageTables::from_root(self.mapper(), space.root()).free_root(&mut PmmTables::new(self.pmm()));
        for frame in frames {
            self.release_frame(frame);
        }

        let c = &space.counters;
        for counter in [&c.resident, &c.shared, &c.virtual_pages, &c.tables] {
            counter.store(0, Ordering::Relaxed);
        }
        space.mark_destroyed();
        drop(vmas);

        info!(
            "VMM: address space {} destroyed: {areas} areas, {pages} pages, {} tables",
            space.id(),
            tables + 1
        );
        Ok(true)
    }

    /// Fork `parent`: duplicate its areas and page tables into a new space.
    ///
    /// Private pages become copy-on-write in both spaces. Shared pages are
    /// shared, with their reference counts raised. Device pages are shared
    /// as they are.
    ///
    /// # Errors
    /// - [`MmError::InvalidArgument`] for the kernel space or a destroyed one.
    /// - [`MmError::OutOfMemory`] if tables for the child can't be allocated;
    ///   the half-built child is torn down again.
    pub fn clone_address_space(&self, parent: &AddressSpace) -> Result<Arc<AddressSpace>, MmError> {
        if parent.is_kernel() {
            return Err(MmError::InvalidArgument("the kernel address space cannot be cloned"));
        }
        let vmas = parent.vmas.write();
        ensure_alive(parent)?;

        let child = self.create_address_space()?;
        if let Err(e) = self.copy_space(parent, &vmas, &child) {
            drop(vmas);
            self.destroy_address_space(&child)?;
            return Err(e);
        }
        drop(vmas);

        debug!("VMM: address space {} cloned into {}", parent.id(), child.id());
        Ok(child)
    }

    fn copy_space(&self, parent: &AddressSpace, vmas: &VmaSet, child: &AddressSpace) -> Result<(), MmError> {
        {
            let mut child_vmas = child.vmas.write();
            for vma in vmas.iter() {
                child_vmas.insert(vma.duplicate())?;
            }
        }
        let pc = &parent.counters;
        SpaceCounters::add(
            &child.counters.virtual_pages,
            pc.virtual_pages.load(Ordering::Relaxed),
        );

        let link = link_for(child);
        let mut failure = None;
        let mut resident = 0;
        let mut shared = 0;
        let mut alloc = PmmTables::new(self.pmm());
        {
            let _parent_tables = parent.tables.lock();
            let _child_tables = child.tables.lock();
            let mut from = PageTables::from_root(self.mapper(), parent.root());
            let mut to = PageTables::from_root(self.mapper(), child.root());

            from.for_each_pte(
                VirtualAddress::zero(),
                VirtualAddress::new(LAST_USERSPACE_ADDRESS),
                |va, entry| {
                    if failure.is_some() || !entry.present() {
                        return;
                    }
                    let managed = !entry.device();
                    if managed && let Err(e) = self.pmm().inc_ref_count(entry.physical_address()) {
                        failure = Some(e);
                        return;
                    }
                    let is_shared = entry.shared() || vmas.find(va.as_u64()).is_some_and(|v| v.is_shared());
                    if managed && !is_shared {
                        *entry = entry.into_copy_on_write();
                    }
                    match to.ensure_pte(&mut alloc, va, link) {
                        Ok(slot) => {
                            *slot = entry.with_accessed(false);
                            resident += 1;
                            if entry.shared() {
                                shared += 1;
                            }
                        }
                        Err(e) => {
                            if managed {
                                self.release_frame(entry.physical_address());
                            }
                            failure = Some(e.into());
                        }
                    }
                },
            );
        }
        SpaceCounters::add(&child.counters.tables, alloc.allocated());
        SpaceCounters::add(&child.counters.resident, resident);
        SpaceCounters::add(&child.counters.shared, shared);

        // Parent entries lost their write permission.
        self.mmu().flush_tlb();
        failure.map_or(Ok(()), Err)
    }
}
