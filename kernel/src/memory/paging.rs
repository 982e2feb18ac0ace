/*
 * Page-Set Engine (4-level paging)
 *
 * A page set is one address space: a PML4 plus every table hanging off it,
 * together with the PhyLinMap that lets the kernel edit those tables through
 * virtual aliases. The kernel page set is a process-wide singleton built
 * from the page tables the loader booted with; user page sets share its
 * higher half by copying the top 256 PML4 entries at creation.
 *
 * Address split of a 64-bit linear address:
 *
 *   63:48  sign extension of bit 47 (0xffff selects kernel space)
 *   47:39  PML4 index      38:30  PDPT index
 *   29:21  PD index        20:12  PT index      11:0  page offset
 *
 * The `page_size` bit at PDPT and PD level switches an entry between
 * "pointer to the next table" and a huge page (1 GiB and 2 MiB).
 *
 * map and unmap are state-machine walkers over the same four levels:
 * map lazily allocates intermediate tables (permissive flags; leaf flags
 * live on the leaf only), refuses to split existing huge pages and refuses
 * to overwrite present leaves; unmap is idempotent over absent entries and
 * refuses partial huge-page unmaps. Both return the number of 4 KiB pages
 * actually processed and leave the rest to the caller.
 *
 * Intermediate tables are allocated from the kernel heap (page-aligned) and
 * referenced from parent entries by their resolved physical address; the
 * owning set's PhyLinMap records the way back.
 */

use core::ptr;

use bitflags::bitflags;
use x86_64::VirtAddr;
use x86_64::instructions::tlb;
use x86_64::registers::control::Cr3;

use crate::config::{KERNEL_ALIAS_BASE, KERNEL_OFFSET, PAGE_SIZE};
use crate::error::KernelError;
use crate::memory::heap;
use crate::memory::phy_lin_map::PhyLinMap;

pub const PML4_SIZE: usize = 512;
pub const PML4_HALF: usize = 256;

/// 4 KiB pages covered by one PML4 entry (a whole PDPT).
const PML4E_4K_PAGES: u64 = 1 << 27;
/// 4 KiB pages covered by one PDPT entry (1 GiB).
const PDPTE_4K_PAGES: u64 = 1 << 18;
/// 4 KiB pages covered by one PD entry (2 MiB).
const PDE_4K_PAGES: u64 = 1 << 9;

bitflags! {
    /// Mapping flags at the page-set interface. Architectural bits are
    /// derived from these at the leaf level only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        const READONLY   = 0x01;
        const USER       = 0x02;
        const EXECUTABLE = 0x04;
    }
}

const ENTRY_PRESENT: u64 = 1 << 0;
const ENTRY_WRITABLE: u64 = 1 << 1;
const ENTRY_USER: u64 = 1 << 2;
const ENTRY_PAGE_SIZE: u64 = 1 << 7;
const ENTRY_NO_EXECUTE: u64 = 1 << 63;
const ENTRY_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One 8-byte entry, at any of the four levels.
#[repr(transparent)]
#[derive(Debug, Clone, Copy)]
pub struct PageEntry(u64);

impl PageEntry {
    pub const fn empty() -> Self {
        PageEntry(0)
    }

    pub fn is_present(&self) -> bool {
        self.0 & ENTRY_PRESENT != 0
    }

    /// Meaningful at PDPT and PD level only.
    pub fn is_huge(&self) -> bool {
        self.0 & ENTRY_PAGE_SIZE != 0
    }

    /// Physical address of the next-level table or the 4 KiB page.
    pub fn addr(&self) -> u64 {
        self.0 & ENTRY_ADDR_MASK
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Point this entry at an intermediate table. Intermediate entries are
    /// permissive; restrictions are applied at the leaf.
    fn set_table(&mut self, physical: u64) {
        assert!(physical % PAGE_SIZE == 0);
        self.0 = (physical & ENTRY_ADDR_MASK) | ENTRY_PRESENT | ENTRY_WRITABLE | ENTRY_USER;
    }

    /// Point this leaf entry at a 4 KiB page with the given mapping flags.
    fn set_page(&mut self, physical: u64, flags: MapFlags) {
        assert!(physical % PAGE_SIZE == 0);

        let mut bits = (physical & ENTRY_ADDR_MASK) | ENTRY_PRESENT;

        if !flags.contains(MapFlags::READONLY) {
            bits |= ENTRY_WRITABLE;
        }
        if flags.contains(MapFlags::USER) {
            bits |= ENTRY_USER;
        }
        if !flags.contains(MapFlags::EXECUTABLE) {
            bits |= ENTRY_NO_EXECUTE;
        }

        self.0 = bits;
    }
}

/// One page table: 512 entries at any level.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageEntry; PML4_SIZE],
}

impl PageTable {
    fn zero(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.clear();
        }
    }
}

fn pml4_index(linear: u64) -> usize {
    ((linear >> 39) & 0x1ff) as usize
}

fn pdpt_index(linear: u64) -> usize {
    ((linear >> 30) & 0x1ff) as usize
}

fn pd_index(linear: u64) -> usize {
    ((linear >> 21) & 0x1ff) as usize
}

fn pt_index(linear: u64) -> usize {
    ((linear >> 12) & 0x1ff) as usize
}

fn prefix(linear: u64) -> u16 {
    (linear >> 48) as u16
}

/// One address space. Exactly one exists per process, plus the kernel
/// singleton.
pub struct PageSet {
    pub pml4_physical: u64,
    pml4: *mut PageTable,
    pub table_map: PhyLinMap,
}

// Page sets are only touched with interrupts disabled.
unsafe impl Send for PageSet {}

impl PageSet {
    const fn empty() -> Self {
        PageSet {
            pml4_physical: 0,
            pml4: ptr::null_mut(),
            table_map: PhyLinMap::new(),
        }
    }

    pub fn is_kernel(&self) -> bool {
        ptr::eq(self, &raw const KERNEL_PAGESET)
    }
}

static mut KERNEL_PAGESET: PageSet = PageSet::empty();
static mut CURRENT_PAGESET: *mut PageSet = ptr::null_mut();

/// The kernel's page set singleton.
pub fn kernel_pageset() -> *mut PageSet {
    &raw mut KERNEL_PAGESET
}

pub fn current_pageset() -> *mut PageSet {
    unsafe { *(&raw const CURRENT_PAGESET) }
}

/// Load a page set's PML4 into CR3 and remember it as current.
pub fn set_current_pageset(pageset: *mut PageSet) {
    unsafe {
        let pml4_physical = (*pageset).pml4_physical;

        core::arch::asm!(
            "mov cr3, {}",
            in(reg) pml4_physical,
            options(nostack, preserves_flags)
        );

        *(&raw mut CURRENT_PAGESET) = pageset;
    }
}

/// Build the kernel page set from the tables the loader booted with.
///
/// Reads CR3, aliases the PML4 at the kernel offset, drops the loader's
/// identity map of the low 2 MiB, then records every reachable intermediate
/// table in the kernel PhyLinMap so later edits can find them. Finally maps
/// and unmaps one page in the shared high-half alias window so that its
/// PDPT hangs off the kernel PML4 before any user set clones the higher
/// half; PML4 changes made later would not propagate to existing sets.
pub fn init() {
    unsafe {
        let ks = kernel_pageset();

        let (frame, _) = Cr3::read();
        (*ks).pml4_physical = frame.start_address().as_u64();
        (*ks).pml4 = ((*ks).pml4_physical + KERNEL_OFFSET) as *mut PageTable;

        *(&raw mut CURRENT_PAGESET) = ks;

        // The identity map at 0..2 MiB was only needed to reach long mode.
        (*(*ks).pml4).entries[0].clear();

        let mut address = 0u64;
        while address < 0x20_0000 {
            tlb::flush(VirtAddr::new(address));
            address += PAGE_SIZE;
        }

        // Every table the loader built sits at physical + KERNEL_OFFSET.
        // That stops being true for tables we allocate later, so record all
        // of them in the table map up front.
        for i in 0..PML4_SIZE {
            let entry = (*(*ks).pml4).entries[i];

            if entry.is_present() {
                let addr = entry.addr();

                (*ks).table_map.set(addr, addr + KERNEL_OFFSET);
                init_scan_pdpt(ks, (addr + KERNEL_OFFSET) as *mut PageTable);
            }
        }

        log::info!(
            "kernel pageset: pml4 at {:#x}, {} boot tables recorded",
            (*ks).pml4_physical,
            (*ks).table_map.len()
        );

        // Force the shared alias window's PDPT into existence now.
        let mapped = map(ks, KERNEL_ALIAS_BASE, 0, 1, MapFlags::empty());
        assert!(mapped == 1, "failed to seed the kernel alias window");
        let unmapped = unmap(ks, KERNEL_ALIAS_BASE, 1);
        assert!(unmapped == 1);
    }
}

unsafe fn init_scan_pdpt(ks: *mut PageSet, pdpt: *mut PageTable) {
    unsafe {
        for i in 0..PML4_SIZE {
            let entry = (*pdpt).entries[i];

            if entry.is_present() && !entry.is_huge() {
                let addr = entry.addr();

                (*ks).table_map.set(addr, addr + KERNEL_OFFSET);
                init_scan_pd(ks, (addr + KERNEL_OFFSET) as *mut PageTable);
            }
        }
    }
}

unsafe fn init_scan_pd(ks: *mut PageSet, pd: *mut PageTable) {
    unsafe {
        for i in 0..PML4_SIZE {
            let entry = (*pd).entries[i];

            if entry.is_present() && !entry.is_huge() {
                let addr = entry.addr();

                (*ks).table_map.set(addr, addr + KERNEL_OFFSET);
            }
        }
    }
}

/// Allocate a zeroed page table from the kernel heap and resolve the
/// physical address behind it.
fn alloc_table() -> Option<(*mut PageTable, u64)> {
    let table = heap::alloc_aligned(PAGE_SIZE as usize, PAGE_SIZE as usize) as *mut PageTable;

    if table.is_null() {
        return None;
    }

    unsafe {
        (*table).zero();

        let physical = resolve(kernel_pageset(), table as u64)
            .expect("kernel heap page has no physical mapping");

        Some((table, physical))
    }
}

/// Translate `linear` in `pageset` to a physical address, stopping at the
/// first entry that describes a page (huge or 4 KiB). Higher-half queries
/// against a user set are transparently rerouted to the kernel set, whose
/// map knows the shared tables.
pub unsafe fn resolve(pageset: *mut PageSet, linear: u64) -> Option<u64> {
    unsafe {
        let pageset = if prefix(linear) == 0xffff && !(*pageset).is_kernel() {
            kernel_pageset()
        } else {
            pageset
        };

        let pml4_entry = (*(*pageset).pml4).entries[pml4_index(linear)];
        if !pml4_entry.is_present() {
            return None;
        }

        let pdpt = (*pageset)
            .table_map
            .get(pml4_entry.addr())
            .expect("PDPT missing from table map") as *mut PageTable;

        let pdpt_entry = (*pdpt).entries[pdpt_index(linear)];
        if !pdpt_entry.is_present() {
            return None;
        }

        if pdpt_entry.is_huge() {
            // 1 GiB page: split at 30 bits.
            return Some((pdpt_entry.addr() & !0x3fff_ffff) | (linear & 0x3fff_ffff));
        }

        let pd = (*pageset)
            .table_map
            .get(pdpt_entry.addr())
            .expect("PD missing from table map") as *mut PageTable;

        let pd_entry = (*pd).entries[pd_index(linear)];
        if !pd_entry.is_present() {
            return None;
        }

        if pd_entry.is_huge() {
            // 2 MiB page: split at 21 bits.
            return Some((pd_entry.addr() & !0x1f_ffff) | (linear & 0x1f_ffff));
        }

        let pt = (*pageset)
            .table_map
            .get(pd_entry.addr())
            .expect("PT missing from table map") as *mut PageTable;

        let pt_entry = (*pt).entries[pt_index(linear)];
        if !pt_entry.is_present() {
            return None;
        }

        Some(pt_entry.addr() | (linear & 0xfff))
    }
}

/// Resolve against the kernel page set.
pub fn resolve_kernel(linear: u64) -> Option<u64> {
    unsafe { resolve(kernel_pageset(), linear) }
}

struct MapState {
    linear: u64,
    physical: u64,
    mapped: u64,
    requested: u64,
    flags: MapFlags,
    error: bool,
}

/// Map `pages` 4 KiB pages of `physical` at `linear` in `pageset`.
///
/// Returns the number of pages actually mapped; anything less than `pages`
/// means an allocation failure or a conflict (a present leaf or a huge page
/// in the way). User sets are confined to the low 256 PML4 entries.
pub unsafe fn map(
    pageset: *mut PageSet,
    linear: u64,
    physical: u64,
    pages: u64,
    flags: MapFlags,
) -> u64 {
    let mut state = MapState {
        linear,
        physical,
        mapped: 0,
        requested: pages,
        flags,
        error: false,
    };

    unsafe {
        map_pml4(pageset, &mut state);
    }

    state.mapped
}

/// Map into the kernel page set (heap growth, archive window).
pub fn map_kernel(linear: u64, physical: u64, pages: u64, flags: MapFlags) -> u64 {
    unsafe { map(kernel_pageset(), linear, physical, pages, flags) }
}

unsafe fn map_pml4(pageset: *mut PageSet, state: &mut MapState) {
    unsafe {
        // Never touch the higher half of a user set; the kernel owns it.
        let max_index = if (*pageset).is_kernel() {
            PML4_SIZE - 1
        } else {
            PML4_HALF - 1
        };

        let mut index = pml4_index(state.linear);

        while !state.error && index <= max_index && state.mapped < state.requested {
            let entry = &mut (*(*pageset).pml4).entries[pml4_index(state.linear)];

            let pdpt: *mut PageTable;

            if !entry.is_present() {
                match alloc_table() {
                    Some((table, physical)) => {
                        entry.set_table(physical);
                        (*pageset).table_map.set(physical, table as u64);
                        pdpt = table;
                    }
                    None => {
                        state.error = true;
                        break;
                    }
                }
            } else {
                pdpt = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PDPT missing from table map") as *mut PageTable;
            }

            map_pdpt(pageset, state, pdpt);
            index += 1;
        }

        if index > max_index && state.mapped < state.requested {
            log::warn!("map attempted to exceed max PML4 index");
        }
    }
}

unsafe fn map_pdpt(pageset: *mut PageSet, state: &mut MapState, pdpt: *mut PageTable) {
    unsafe {
        let mut index = pdpt_index(state.linear);

        while !state.error && index < PML4_SIZE && state.mapped < state.requested {
            let entry = &mut (*pdpt).entries[pdpt_index(state.linear)];

            let pd: *mut PageTable;

            if !entry.is_present() {
                match alloc_table() {
                    Some((table, physical)) => {
                        entry.set_table(physical);
                        (*pageset).table_map.set(physical, table as u64);
                        pd = table;
                    }
                    None => {
                        state.error = true;
                        break;
                    }
                }
            } else if entry.is_huge() {
                // Refuse to split an existing 1 GiB page.
                log::warn!("tried to map into a 1 GiB page at {:#x}", state.linear);
                state.error = true;
                break;
            } else {
                pd = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PD missing from table map") as *mut PageTable;
            }

            map_pd(pageset, state, pd);
            index += 1;
        }
    }
}

unsafe fn map_pd(pageset: *mut PageSet, state: &mut MapState, pd: *mut PageTable) {
    unsafe {
        let mut index = pd_index(state.linear);

        while !state.error && index < PML4_SIZE && state.mapped < state.requested {
            let entry = &mut (*pd).entries[pd_index(state.linear)];

            let pt: *mut PageTable;

            if !entry.is_present() {
                match alloc_table() {
                    Some((table, physical)) => {
                        entry.set_table(physical);
                        (*pageset).table_map.set(physical, table as u64);
                        pt = table;
                    }
                    None => {
                        state.error = true;
                        break;
                    }
                }
            } else if entry.is_huge() {
                // Refuse to split an existing 2 MiB page.
                log::warn!("tried to map into a 2 MiB page at {:#x}", state.linear);
                state.error = true;
                break;
            } else {
                pt = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PT missing from table map") as *mut PageTable;
            }

            map_pt(state, pt);
            index += 1;
        }
    }
}

unsafe fn map_pt(state: &mut MapState, pt: *mut PageTable) {
    unsafe {
        let mut index = pt_index(state.linear);

        while !state.error && index < PML4_SIZE && state.mapped < state.requested {
            let entry = &mut (*pt).entries[pt_index(state.linear)];

            // Mapping over a present page is an error, not an overwrite.
            if entry.is_present() {
                log::warn!("tried to map into a present PT entry at {:#x}", state.linear);
                state.error = true;
                break;
            }

            entry.set_page(state.physical, state.flags);

            state.mapped += 1;
            state.linear += PAGE_SIZE;
            state.physical += PAGE_SIZE;
            index += 1;
        }
    }
}

struct UnmapState {
    linear: u64,
    unmapped: u64,
    requested: u64,
    error: bool,
}

impl UnmapState {
    /// Skip an absent entry covering `span` 4 KiB pages.
    fn skip(&mut self, span: u64) {
        self.linear += span * PAGE_SIZE;

        if self.unmapped + span > self.requested {
            self.unmapped = self.requested;
        } else {
            self.unmapped += span;
        }
    }
}

/// Unmap `pages` 4 KiB pages starting at `linear`. Absent ranges count as
/// unmapped, so unmapping twice is harmless. A huge page is only unmapped
/// when the remaining request covers its whole span; a partial huge-page
/// unmap stops the walk. Returns the number of 4 KiB pages accounted for.
pub unsafe fn unmap(pageset: *mut PageSet, linear: u64, pages: u64) -> u64 {
    let mut state = UnmapState {
        linear,
        unmapped: 0,
        requested: pages,
        error: false,
    };

    unsafe {
        unmap_pml4(pageset, &mut state);
    }

    state.unmapped
}

/// Unmap from the kernel page set.
pub fn unmap_kernel(linear: u64, pages: u64) -> u64 {
    unsafe { unmap(kernel_pageset(), linear, pages) }
}

unsafe fn unmap_pml4(pageset: *mut PageSet, state: &mut UnmapState) {
    unsafe {
        let max_index = if (*pageset).is_kernel() {
            PML4_SIZE - 1
        } else {
            PML4_HALF - 1
        };

        let mut index = pml4_index(state.linear);

        while !state.error && index <= max_index && state.unmapped < state.requested {
            let entry = &mut (*(*pageset).pml4).entries[pml4_index(state.linear)];

            if !entry.is_present() {
                state.skip(PML4E_4K_PAGES);
            } else {
                let pdpt = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PDPT missing from table map") as *mut PageTable;

                unmap_pdpt(pageset, state, pdpt);
            }

            index += 1;
        }

        if index > max_index && state.unmapped < state.requested {
            log::warn!("unmap attempted to exceed max PML4 index");
        }
    }
}

unsafe fn unmap_pdpt(pageset: *mut PageSet, state: &mut UnmapState, pdpt: *mut PageTable) {
    unsafe {
        let mut index = pdpt_index(state.linear);

        while !state.error && index < PML4_SIZE && state.unmapped < state.requested {
            let entry = &mut (*pdpt).entries[pdpt_index(state.linear)];

            if !entry.is_present() {
                state.skip(PDPTE_4K_PAGES);
            } else if entry.is_huge() {
                // A 1 GiB page can only go away whole.
                if state.requested - state.unmapped >= PDPTE_4K_PAGES {
                    entry.clear();
                    tlb::flush(VirtAddr::new(state.linear));

                    state.linear += PDPTE_4K_PAGES * PAGE_SIZE;
                    state.unmapped += PDPTE_4K_PAGES;
                } else {
                    log::warn!("tried to unmap part of a 1 GiB page at {:#x}", state.linear);
                    state.error = true;
                    break;
                }
            } else {
                let pd = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PD missing from table map") as *mut PageTable;

                unmap_pd(pageset, state, pd);
            }

            index += 1;
        }
    }
}

unsafe fn unmap_pd(pageset: *mut PageSet, state: &mut UnmapState, pd: *mut PageTable) {
    unsafe {
        let mut index = pd_index(state.linear);

        while !state.error && index < PML4_SIZE && state.unmapped < state.requested {
            let entry = &mut (*pd).entries[pd_index(state.linear)];

            if !entry.is_present() {
                state.skip(PDE_4K_PAGES);
            } else if entry.is_huge() {
                // A 2 MiB page can only go away whole.
                if state.requested - state.unmapped >= PDE_4K_PAGES {
                    entry.clear();
                    tlb::flush(VirtAddr::new(state.linear));

                    state.linear += PDE_4K_PAGES * PAGE_SIZE;
                    state.unmapped += PDE_4K_PAGES;
                } else {
                    log::warn!("tried to unmap part of a 2 MiB page at {:#x}", state.linear);
                    state.error = true;
                    break;
                }
            } else {
                let pt = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PT missing from table map") as *mut PageTable;

                unmap_pt(state, pt);
            }

            index += 1;
        }
    }
}

unsafe fn unmap_pt(state: &mut UnmapState, pt: *mut PageTable) {
    unsafe {
        let mut index = pt_index(state.linear);

        while !state.error && index < PML4_SIZE && state.unmapped < state.requested {
            let entry = &mut (*pt).entries[pt_index(state.linear)];

            entry.clear();
            tlb::flush(VirtAddr::new(state.linear));

            state.linear += PAGE_SIZE;
            state.unmapped += 1;
            index += 1;
        }
    }
}

/// Create a user page set: a fresh PML4 with a zero lower half and the
/// kernel's higher half copied in, so every kernel mapping that exists now
/// is shared.
pub fn create_pageset() -> Result<PageSet, KernelError> {
    let (pml4, pml4_physical) = alloc_table().ok_or(KernelError::OutOfMemory)?;

    unsafe {
        let kernel_pml4 = (*kernel_pageset()).pml4;

        for i in PML4_HALF..PML4_SIZE {
            (*pml4).entries[i] = (*kernel_pml4).entries[i];
        }
    }

    Ok(PageSet {
        pml4_physical,
        pml4,
        table_map: PhyLinMap::new(),
    })
}

/// Tear down a user page set: free every intermediate table reachable from
/// the lower half (the shared higher half belongs to the kernel), then the
/// PML4, then the table map. Refuses the kernel page set.
pub unsafe fn destroy_pageset(pageset: *mut PageSet) -> Result<(), KernelError> {
    unsafe {
        if (*pageset).is_kernel() {
            return Err(KernelError::BadState);
        }

        for i in 0..PML4_HALF {
            let entry = (*(*pageset).pml4).entries[i];

            if entry.is_present() {
                let pdpt = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PDPT missing from table map") as *mut PageTable;

                destroy_pdpt(pageset, pdpt);
            }
        }

        heap::free((*pageset).pml4 as *mut u8);
        (*pageset).pml4 = ptr::null_mut();
        (*pageset).pml4_physical = 0;

        (*pageset).table_map.clear();

        Ok(())
    }
}

unsafe fn destroy_pdpt(pageset: *mut PageSet, pdpt: *mut PageTable) {
    unsafe {
        for i in 0..PML4_SIZE {
            let entry = (*pdpt).entries[i];

            if entry.is_present() && !entry.is_huge() {
                let pd = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PD missing from table map") as *mut PageTable;

                destroy_pd(pageset, pd);
            }
        }

        heap::free(pdpt as *mut u8);
    }
}

unsafe fn destroy_pd(pageset: *mut PageSet, pd: *mut PageTable) {
    unsafe {
        for i in 0..PML4_SIZE {
            let entry = (*pd).entries[i];

            if entry.is_present() && !entry.is_huge() {
                let pt = (*pageset)
                    .table_map
                    .get(entry.addr())
                    .expect("PT missing from table map") as *mut PageTable;

                heap::free(pt as *mut u8);
            }
        }

        heap::free(pd as *mut u8);
    }
}
