//! Physical/process address duality.
//!
//! Hardware queues and buffer pools speak physical addresses; everything the
//! driver touches needs a process pointer. [`AddrSpace`] is the only place
//! where one becomes the other.

use std::fmt;
use std::ptr::NonNull;

use crate::errors::{Error, Result};
use crate::hw::MemoryService;

/// A hardware-visible physical address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    #[inline]
    pub fn offset(self, bytes: u64) -> PhysAddr {
        PhysAddr(self.0 + bytes)
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#x})", self.0)
    }
}

/// Typed view over the memory-region service.
///
/// Translation fails only when the address falls outside the mapped regions;
/// callers treat that as a drop condition, never as fatal.
pub struct AddrSpace<'m, M: MemoryService + ?Sized> {
    mem: &'m M,
}

impl<'m, M: MemoryService + ?Sized> AddrSpace<'m, M> {
    pub fn new(mem: &'m M) -> Self {
        Self { mem }
    }

    #[inline]
    pub fn to_process_pointer(&self, addr: PhysAddr) -> Result<NonNull<u8>> {
        self.mem
            .physical_to_process(addr)
            .ok_or(Error::NotMapped(addr.0))
    }
}
