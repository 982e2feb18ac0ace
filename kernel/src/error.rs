/*
 * Kernel Error Types
 *
 * One error enum covers the failure kinds that cross the core subsystem
 * boundaries. Arithmetic-level failures (an acquire or map returning fewer
 * pages than requested) are surfaced as counts by the memory modules and
 * translated to `OutOfMemory` by their callers; state-machine violations
 * inside the kernel are assertions, not errors.
 */

use core::fmt;

/// Failure kinds at the core boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No frame run or heap space could satisfy the request.
    OutOfMemory,
    /// Attempt to map over a present entry or into a huge page.
    MapConflict,
    /// Archive entry or process id does not exist.
    NotFound,
    /// ELF image failed verification or uses unsupported features.
    InvalidImage,
    /// Operation violates the object's state machine.
    BadState,
    /// Caller-supplied argument is out of range.
    BadArg,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::OutOfMemory => "out of memory",
            KernelError::MapConflict => "mapping conflict",
            KernelError::NotFound => "not found",
            KernelError::InvalidImage => "invalid executable image",
            KernelError::BadState => "operation violates object state",
            KernelError::BadArg => "bad argument",
        };
        f.write_str(msg)
    }
}
