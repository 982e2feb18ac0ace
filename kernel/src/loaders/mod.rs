/*
 * Program Loaders
 */

pub mod elf;
