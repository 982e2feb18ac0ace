/*
 * Archive and ELF Verification Tests
 *
 * Checksum arithmetic over synthetic bodies (including the zero-padded
 * trailing word) and the ELF header gate: a well-formed header passes,
 * single-field corruption fails. Also walks whatever real archive the
 * loader provided and verifies every entry's checksum.
 */

use alloc::vec;
use alloc::vec::Vec;

use crate::fs::archive::{self, Entry};
use crate::loaders::elf;
use crate::tests::check;

fn entry_with_checksum(checksum: u64) -> Entry {
    Entry {
        offset: 0,
        length: 0,
        checksum,
        name: b"synthetic",
    }
}

/// A minimal header that passes every verification check.
fn good_elf_header() -> Vec<u8> {
    let mut image = vec![0u8; 64];

    image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    image[4] = 2; // 64-bit
    image[5] = 1; // little-endian
    image[6] = 1; // ELF version
    // OS ABI and ABI version stay 0.
    image[16] = 2; // e_type = EXEC
    image[18] = 62; // e_machine = AMD64

    image
}

pub fn run() -> (usize, usize) {
    let mut passed = 0;
    let mut failed = 0;

    // Whole words XOR together...
    let body = [1u8, 0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0, 0, 0, 0];
    check(
        archive::verify(&entry_with_checksum(3), &body),
        "two-word body checksums to the XOR",
        &mut passed,
        &mut failed,
    );

    // ...and the trailing partial word participates zero-padded.
    let partial = [0u8, 0, 0, 0, 0, 0, 0, 0, 0xab];
    check(
        archive::verify(&entry_with_checksum(0xab), &partial),
        "trailing partial word is zero-padded",
        &mut passed,
        &mut failed,
    );

    check(
        !archive::verify(&entry_with_checksum(0xff), &partial),
        "wrong checksum is rejected",
        &mut passed,
        &mut failed,
    );

    check(
        archive::verify(&entry_with_checksum(0), &[]),
        "empty body checksums to zero",
        &mut passed,
        &mut failed,
    );

    // Every entry the loader actually gave us should verify.
    let mut live_entries = 0;
    let mut live_ok = true;

    for entry in archive::entries() {
        live_entries += 1;

        if let Ok(name) = core::str::from_utf8(entry.name) {
            if archive::get(name).is_err() {
                live_ok = false;
            }
        }
    }

    check(live_ok, "every live archive entry is retrievable", &mut passed, &mut failed);
    log::info!("archive holds {} entries", live_entries);

    check(
        archive::get("no/such/entry").is_err(),
        "missing entries report NotFound",
        &mut passed,
        &mut failed,
    );

    // ELF header gate.
    let good = good_elf_header();
    check(elf::verify(&good), "well-formed header verifies", &mut passed, &mut failed);

    let mut bad_magic = good.clone();
    bad_magic[0] = 0x7e;
    check(!elf::verify(&bad_magic), "corrupt magic is rejected", &mut passed, &mut failed);

    let mut bad_class = good.clone();
    bad_class[4] = 1;
    check(!elf::verify(&bad_class), "32-bit class is rejected", &mut passed, &mut failed);

    let mut bad_type = good.clone();
    bad_type[16] = 3; // DYN
    check(!elf::verify(&bad_type), "non-EXEC type is rejected", &mut passed, &mut failed);

    let mut bad_machine = good;
    bad_machine[18] = 40; // ARM
    check(!elf::verify(&bad_machine), "foreign machine is rejected", &mut passed, &mut failed);

    check(!elf::verify(&[0u8; 8]), "truncated image is rejected", &mut passed, &mut failed);

    (passed, failed)
}
