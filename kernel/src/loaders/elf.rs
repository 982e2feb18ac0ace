/*
 * ELF64 Loader
 *
 * Loads statically linked AMD64 executables out of the boot archive into a
 * fresh process. Accepted images: 64-bit little-endian, ELF version 1,
 * System V OS ABI (0/0), type EXEC. Each LOAD segment is allocated at its
 * p_vaddr with permissions derived from p_flags, p_filesz bytes are copied
 * from the image, and the [p_filesz, p_memsz) tail is zeroed as the format
 * requires. NULL and PHDR entries are skipped; anything else (DYNAMIC,
 * INTERP, TLS, ...) fails the load.
 *
 * Segment bytes are written through the target's own address space: the
 * loader switches page sets around the copy and restores the old one on
 * every path out.
 */

use core::mem::size_of;
use core::ptr;

use crate::error::KernelError;
use crate::fs::archive;
use crate::memory::paging::{self, MapFlags};
use crate::scheduler::process::{self, Process, ProcessId};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const ELF_CLASS_64: u8 = 2;
const ELF_DATA_2LSB: u8 = 1;
const ELF_VERSION_CURRENT: u8 = 1;

const ET_EXEC: u16 = 2;
const EM_AMD64: u16 = 62;

const PT_NULL: u32 = 0;
const PT_LOAD: u32 = 1;
const PT_PHDR: u32 = 6;

const PF_X: u32 = 1;
const PF_W: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64Header {
    ei_magic: [u8; 4],
    ei_class: u8,
    ei_data: u8,
    ei_version: u8,
    ei_os_abi: u8,
    ei_abi_version: u8,
    ei_pad: [u8; 7],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Elf64ProgramHeader {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// Check every identification and header field we insist on.
pub fn verify(image: &[u8]) -> bool {
    if image.len() < size_of::<Elf64Header>() {
        return false;
    }

    let header = unsafe { ptr::read_unaligned(image.as_ptr() as *const Elf64Header) };

    header.ei_magic == ELF_MAGIC
        && header.ei_class == ELF_CLASS_64
        && header.ei_data == ELF_DATA_2LSB
        && header.ei_version == ELF_VERSION_CURRENT
        && header.ei_os_abi == 0
        && header.ei_abi_version == 0
        && header.e_type == ET_EXEC
        && header.e_machine == EM_AMD64
}

/// Load a verified image into `process` and record its entry point.
pub fn load(image: &[u8], process: *mut Process) -> Result<(), KernelError> {
    if !verify(image) {
        return Err(KernelError::InvalidImage);
    }

    let header = unsafe { ptr::read_unaligned(image.as_ptr() as *const Elf64Header) };

    // Copies go straight to the segment's user addresses, so the target
    // address space has to be live while we work.
    let old_pageset = paging::current_pageset();

    unsafe {
        paging::set_current_pageset(&raw mut (*process).pageset);
    }

    let result = load_segments(image, &header, process);

    paging::set_current_pageset(old_pageset);

    result?;

    process::set_entry_point(process, header.e_entry);

    Ok(())
}

fn load_segments(
    image: &[u8],
    header: &Elf64Header,
    process: *mut Process,
) -> Result<(), KernelError> {
    let phentsize = header.e_phentsize as u64;

    if phentsize < size_of::<Elf64ProgramHeader>() as u64 {
        return Err(KernelError::InvalidImage);
    }

    for i in 0..header.e_phnum as u64 {
        let offset = header.e_phoff + i * phentsize;

        if offset + size_of::<Elf64ProgramHeader>() as u64 > image.len() as u64 {
            return Err(KernelError::InvalidImage);
        }

        let ph = unsafe {
            ptr::read_unaligned(image.as_ptr().add(offset as usize) as *const Elf64ProgramHeader)
        };

        match ph.p_type {
            PT_NULL | PT_PHDR => {}

            PT_LOAD => {
                if ph.p_offset + ph.p_filesz > image.len() as u64
                    || ph.p_filesz > ph.p_memsz
                {
                    return Err(KernelError::InvalidImage);
                }

                let mut flags = MapFlags::USER;

                if ph.p_flags & PF_W == 0 {
                    flags |= MapFlags::READONLY;
                }
                if ph.p_flags & PF_X != 0 {
                    flags |= MapFlags::EXECUTABLE;
                }

                unsafe {
                    process::alloc_in(process, ph.p_vaddr, ph.p_memsz, flags)?;

                    crate::memory::copy(
                        image.as_ptr().add(ph.p_offset as usize),
                        ph.p_vaddr as *mut u8,
                        ph.p_filesz as usize,
                    );

                    if ph.p_filesz < ph.p_memsz {
                        crate::memory::set(
                            (ph.p_vaddr + ph.p_filesz) as *mut u8,
                            0,
                            (ph.p_memsz - ph.p_filesz) as usize,
                        );
                    }
                }
            }

            other => {
                log::warn!("unsupported program header type {}", other);
                return Err(KernelError::InvalidImage);
            }
        }
    }

    Ok(())
}

/// Spawn a program from the boot archive: look up the entry, verify and
/// load it into a new process, stage argv, and enqueue. The negative codes
/// are the `spawn` syscall's ABI:
///   -1 not found, -2 bad image, -3 creation failed, -4 load failed,
///   -5 argument staging failed.
pub fn spawn(file: &str, argv: &[&str]) -> Result<ProcessId, i64> {
    let image = archive::get(file).map_err(|_| -1i64)?;

    if !verify(image) {
        return Err(-2);
    }

    let process = process::create(file).map_err(|error| {
        log::error!("spawn: creating '{}' failed: {}", file, error);
        -3i64
    })?;

    load(image, process).map_err(|error| {
        log::error!("spawn: loading '{}' failed: {}", file, error);
        -4i64
    })?;

    process::set_args(process, argv).map_err(|error| {
        log::error!("spawn: argument staging for '{}' failed: {}", file, error);
        -5i64
    })?;

    process::run(process);

    let id = unsafe { (*process).id };

    log::info!("spawned '{}' as process {}", file, id.0);

    Ok(id)
}
