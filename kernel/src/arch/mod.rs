/*
 * Architecture Support
 *
 * Only x86_64 is supported; the module split keeps the door open.
 */

pub mod x86_64;
