//! Per-vCPU guest physical memory, backed by `vm-memory`.
//!
//! Each vCPU owns a single memory slot at `guest_phys_base = id * mem_size`
//! (§4.2); the sizing policy (256 KiB real-mode, 4 MiB paging, 256 MiB
//! Linux) lives with the caller that knows which mode it is building.

use crate::kvm::VmFd;
use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap};

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate guest memory ({size} bytes): {source}")]
    Allocate {
        size: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("memory access out of bounds at {addr:#x} (len {len}, slot size {slot_size})")]
    OutOfBounds {
        addr: u64,
        len: usize,
        slot_size: u64,
    },

    #[error("image ({image_len} bytes) at offset {offset:#x} exceeds slot size {slot_size}")]
    ImageTooLarge {
        image_len: usize,
        offset: u64,
        slot_size: u64,
    },
}

/// A single vCPU's guest-physical memory, registered as KVM memory slot `id`
/// at guest-physical base `id * mem_size`.
pub struct GuestMemory {
    inner: GuestMemoryMmap,
    size: u64,
}

impl GuestMemory {
    /// Allocate `size` bytes of anonymous, zero-filled host memory.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let regions = vec![(GuestAddress(0), size as usize)];
        let inner = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|e| MemoryError::Allocate {
                size,
                source: std::io::Error::other(e.to_string()),
            })?;
        Ok(Self { inner, size })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Register this region with KVM as slot `slot`, at guest-physical base
    /// `guest_base` (`slot * mem_size` per the sizing policy).
    pub fn register(&self, vm: &VmFd, slot: u32, guest_base: u64) -> Result<(), crate::kvm::KvmError> {
        let (host_addr, size) = self.as_raw_parts();
        unsafe { vm.set_user_memory_region(slot, guest_base, size, host_addr) }
    }

    /// Host virtual address and size, for KVM memory-slot registration.
    pub fn as_raw_parts(&self) -> (u64, u64) {
        let region = self.inner.iter().next().expect("memory has no regions");
        (region.as_ptr() as u64, self.size)
    }

    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
                slot_size: self.size,
            })
    }

    pub fn write_u8(&self, addr: u64, value: u8) -> Result<(), MemoryError> {
        self.write(addr, &[value])
    }

    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
                slot_size: self.size,
            })
    }

    pub fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let mut buf = [0u8; 1];
        self.read(addr, &mut buf)?;
        Ok(buf[0])
    }

    /// Load a raw image at `offset`, failing if it would run past the slot.
    pub fn load_image(&self, offset: u64, image: &[u8]) -> Result<(), MemoryError> {
        let end = offset
            .checked_add(image.len() as u64)
            .filter(|end| *end <= self.size)
            .ok_or(MemoryError::ImageTooLarge {
                image_len: image.len(),
                offset,
                slot_size: self.size,
            })?;
        let _ = end;
        self.write(offset, image)
            .map_err(|_| MemoryError::ImageTooLarge {
                image_len: image.len(),
                offset,
                slot_size: self.size,
            })
    }
}

/// Sizing policy for the three guest classes (§4.2).
pub mod sizing {
    pub const REAL_MODE: u64 = 256 * 1024;
    pub const PAGING_MODE: u64 = 4 * 1024 * 1024;
    pub const LINUX: u64 = 256 * 1024 * 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_round_trip() {
        let mem = GuestMemory::new(4096).unwrap();
        mem.write_u32(100, 0x1234_5678).unwrap();
        assert_eq!(mem.read_u8(100).unwrap(), 0x78);
    }

    #[test]
    fn write_out_of_bounds_is_an_error() {
        let mem = GuestMemory::new(100).unwrap();
        assert!(mem.write(99, &[1, 2]).is_err());
    }

    #[test]
    fn load_image_rejects_overflow() {
        let mem = GuestMemory::new(sizing::REAL_MODE).unwrap();
        let big = vec![0u8; sizing::REAL_MODE as usize];
        assert!(mem.load_image(0x1000, &big).is_err());
    }

    #[test]
    fn load_image_fits_exactly() {
        let mem = GuestMemory::new(4096).unwrap();
        let img = vec![0xabu8; 4096];
        assert!(mem.load_image(0, &img).is_ok());
    }

    #[test]
    fn guest_phys_base_matches_slot_policy() {
        // vCPU 2's real-mode base is id * mem_size.
        let id: u64 = 2;
        assert_eq!(id * sizing::REAL_MODE, 2 * 256 * 1024);
    }
}
