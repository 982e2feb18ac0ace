/*
 * Boot Archive ("kit AR01")
 *
 * The root filesystem is a packed, checksummed archive handed to the kernel
 * as a Multiboot module whose command line is `system.kit`. Little-endian
 * on-disk layout:
 *
 *   header:  magic: u64 = 0x313052412074696b ("kit AR01")
 *            entries_length: u64
 *   entry:   offset: u64       body lives at archive base + offset
 *            length: u64
 *            checksum: u64     XOR of LE 8-byte words of the body; the
 *                              trailing partial word is zero-padded
 *            name_length: u64
 *            name: u8[name_length]
 *
 * Entries are packed back to back; stepping to the next entry advances
 * 32 + name_length bytes. The archive is mapped read-only into kernel
 * space at boot, and `mmap_archive` re-maps the same frames read-only into
 * a calling process.
 */

use core::ptr;

use spin::Mutex;

use crate::config::{ARCHIVE_OFFSET, ARCHIVE_SYSTEM_NAME, PAGE_SIZE};
use crate::error::KernelError;
use crate::memory::paging::{self, MapFlags};
use crate::multiboot::MultibootInfo;

pub const ARCHIVE_MAGIC: u64 = 0x3130_5241_2074_696b;

const ENTRY_HEADER_SIZE: u64 = 32;

#[derive(Clone, Copy)]
struct Archive {
    /// Kernel-virtual address of the archive header.
    header: u64,
    /// Page-aligned physical base of the module.
    physical_base: u64,
    /// Pages covering the module (including any leading padding).
    pages: u64,
    /// Byte offset of the header inside the first page.
    page_offset: u64,
}

static SYSTEM: Mutex<Option<Archive>> = Mutex::new(None);

/// One archive entry, with the name and body resolved to kernel-space
/// slices.
#[derive(Clone, Copy)]
pub struct Entry {
    pub offset: u64,
    pub length: u64,
    pub checksum: u64,
    pub name: &'static [u8],
}

/// Locate the system archive among the loader modules and map it read-only
/// at the fixed kernel window.
pub fn init(info: &MultibootInfo) -> Result<(), KernelError> {
    for module in info.modules() {
        let Some(cmdline) = module.cmdline() else {
            continue;
        };

        if cmdline != ARCHIVE_SYSTEM_NAME {
            continue;
        }

        let physical_base = module.mod_start as u64 & !(PAGE_SIZE - 1);
        let page_offset = module.mod_start as u64 - physical_base;
        let bytes = module.length() + page_offset;
        let pages = bytes / PAGE_SIZE + if bytes % PAGE_SIZE > 0 { 1 } else { 0 };

        let mapped = paging::map_kernel(ARCHIVE_OFFSET, physical_base, pages, MapFlags::READONLY);

        if mapped != pages {
            log::error!("failed to map archive pages ({}/{})", mapped, pages);
            return Err(KernelError::OutOfMemory);
        }

        let header = ARCHIVE_OFFSET + page_offset;

        let magic = unsafe { ptr::read_unaligned(header as *const u64) };
        if magic != ARCHIVE_MAGIC {
            log::error!("archive magic mismatch: {:#x}", magic);
            return Err(KernelError::InvalidImage);
        }

        *SYSTEM.lock() = Some(Archive {
            header,
            physical_base,
            pages,
            page_offset,
        });

        log::info!(
            "system archive at {:#x} ({} pages, {} entries)",
            physical_base,
            pages,
            unsafe { ptr::read_unaligned((header + 8) as *const u64) }
        );

        return Ok(());
    }

    log::error!("{} not found among loader modules", ARCHIVE_SYSTEM_NAME);

    Err(KernelError::NotFound)
}

fn system() -> Option<Archive> {
    *SYSTEM.lock()
}

/// Iterate the system archive's entries.
pub fn entries() -> EntryIter {
    match system() {
        Some(archive) => {
            let remaining = unsafe { ptr::read_unaligned((archive.header + 8) as *const u64) };

            EntryIter {
                current: archive.header + 16,
                remaining,
            }
        }
        None => EntryIter {
            current: 0,
            remaining: 0,
        },
    }
}

pub struct EntryIter {
    current: u64,
    remaining: u64,
}

impl Iterator for EntryIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;

        unsafe {
            let offset = ptr::read_unaligned(self.current as *const u64);
            let length = ptr::read_unaligned((self.current + 8) as *const u64);
            let checksum = ptr::read_unaligned((self.current + 16) as *const u64);
            let name_length = ptr::read_unaligned((self.current + 24) as *const u64);

            let name = core::slice::from_raw_parts(
                (self.current + ENTRY_HEADER_SIZE) as *const u8,
                name_length as usize,
            );

            let entry = Entry {
                offset,
                length,
                checksum,
                name,
            };

            self.current += ENTRY_HEADER_SIZE + name_length;

            Some(entry)
        }
    }
}

/// Look up an entry by name and return its body. The checksum is verified;
/// a mismatch is logged but the body is still returned, matching the
/// forgiving behaviour user space has come to rely on.
pub fn get(entry_name: &str) -> Result<&'static [u8], KernelError> {
    let archive = system().ok_or(KernelError::NotFound)?;

    for entry in entries() {
        if entry.name != entry_name.as_bytes() {
            continue;
        }

        let buffer = unsafe {
            core::slice::from_raw_parts(
                (archive.header + entry.offset) as *const u8,
                entry.length as usize,
            )
        };

        if !verify(&entry, buffer) {
            log::warn!("archive entry '{}' failed checksum verification", entry_name);
        }

        return Ok(buffer);
    }

    Err(KernelError::NotFound)
}

/// XOR-of-words checksum over an entry body. The trailing partial word is
/// accumulated with zero padding.
pub fn verify(entry: &Entry, buffer: &[u8]) -> bool {
    let mut checksum = 0u64;
    let mut word = 0u64;
    let mut count = 0u32;

    for &byte in buffer {
        word |= (byte as u64) << (count * 8);
        count += 1;

        if count == 8 {
            checksum ^= word;
            word = 0;
            count = 0;
        }
    }

    if count > 0 {
        checksum ^= word;
    }

    if entry.checksum != checksum {
        log::warn!(
            "entry checksum {:#x} != calculated checksum {:#x}",
            entry.checksum,
            checksum
        );
    }

    entry.checksum == checksum
}

/// Physical placement of the archive, for `mmap_archive`. Returns the
/// aligned physical base, the page count and the header offset inside the
/// first page.
pub fn physical_extent() -> Option<(u64, u64, u64)> {
    system().map(|archive| (archive.physical_base, archive.pages, archive.page_offset))
}
