//! bzImage parsing and the common loader shared by all three Linux entry
//! strategies (§4.4 "Common loader").

use crate::boot::BootError;
use crate::memory::GuestMemory;
use std::fs;

const SETUP_HEADER_OFFSET: usize = 0x1f1;
const BOOT_SIGNATURE_OFFSET: usize = 0x1fe;
const BOOT_SIGNATURE: u16 = 0xaa55;
const HDR_MAGIC_OFFSET: usize = 0x202;
const HDR_MAGIC: u32 = 0x5372_6448; // "HdrS"

const LOADFLAGS_OFFSET: usize = 0x211;
const LOADED_HIGH: u8 = 0x01;

const CODE32_START_OFFSET: usize = 0x214;
const XLOADFLAGS_OFFSET: usize = 0x236;
const XLF_KERNEL_64: u16 = 1 << 0;

/// Real-mode setup code load address (§6 guest memory layout).
pub const SETUP_LOAD_ADDR: u64 = 0x9_0000;
/// Protected-mode kernel payload load address.
pub const KERNEL_LOAD_ADDR: u64 = 0x10_0000;

/// Parsed setup header plus the raw setup-header bytes to copy into the
/// zero page.
pub struct LoadedKernel {
    pub setup_header: Vec<u8>,
    pub setup_sects: u8,
    pub code32_start: u32,
    pub xloadflags: u16,
    /// Length of the protected-mode payload copied to `KERNEL_LOAD_ADDR`
    /// (§4.4's initrd placement floor is `KERNEL_LOAD_ADDR + init_size`).
    pub init_size: u64,
}

impl LoadedKernel {
    pub fn supports_boot64(&self) -> bool {
        self.xloadflags & XLF_KERNEL_64 != 0
    }
}

/// Parse, validate and load a bzImage into `memory`.
///
/// Copies the setup region (`(setup_sects + 1) * 512` bytes, default 4
/// sectors when the header says 0) to `0x90000` and the remaining
/// protected-mode payload to `0x100000`. If `code32_start` is zero it is
/// patched to `0x100000` (some older images leave it unset, relying on the
/// loader to know the convention).
pub fn load(memory: &GuestMemory, path: &str) -> Result<LoadedKernel, BootError> {
    let data = fs::read(path).map_err(|source| BootError::ReadImage {
        path: path.to_string(),
        source,
    })?;

    if data.len() < SETUP_HEADER_OFFSET + 0x80 {
        return Err(BootError::InvalidKernel(
            "image too small to contain a setup header".into(),
        ));
    }

    let boot_sig = u16::from_le_bytes([data[BOOT_SIGNATURE_OFFSET], data[BOOT_SIGNATURE_OFFSET + 1]]);
    if boot_sig != BOOT_SIGNATURE {
        return Err(BootError::InvalidKernel(format!(
            "bad boot signature: expected {BOOT_SIGNATURE:#x}, got {boot_sig:#x}"
        )));
    }

    let magic = u32::from_le_bytes([
        data[HDR_MAGIC_OFFSET],
        data[HDR_MAGIC_OFFSET + 1],
        data[HDR_MAGIC_OFFSET + 2],
        data[HDR_MAGIC_OFFSET + 3],
    ]);
    if magic != HDR_MAGIC {
        return Err(BootError::InvalidKernel(format!(
            "bad header magic: expected {HDR_MAGIC:#x} (\"HdrS\"), got {magic:#x}"
        )));
    }

    let loadflags = data[LOADFLAGS_OFFSET];
    if loadflags & LOADED_HIGH == 0 {
        return Err(BootError::InvalidKernel(
            "not a bzImage: LOADED_HIGH load-flag is clear".into(),
        ));
    }

    let setup_sects = data[SETUP_HEADER_OFFSET];
    let setup_sects = if setup_sects == 0 { 4 } else { setup_sects };
    let setup_size = (setup_sects as usize + 1) * 512;
    if setup_size >= data.len() {
        return Err(BootError::InvalidKernel(
            "setup_size exceeds image size".into(),
        ));
    }

    memory.load_image(SETUP_LOAD_ADDR, &data[..setup_size])?;
    memory.load_image(KERNEL_LOAD_ADDR, &data[setup_size..])?;
    let init_size = (data.len() - setup_size) as u64;

    let mut code32_start =
        u32::from_le_bytes(data[CODE32_START_OFFSET..CODE32_START_OFFSET + 4].try_into().unwrap());
    if code32_start == 0 {
        code32_start = KERNEL_LOAD_ADDR as u32;
    }

    let xloadflags = u16::from_le_bytes(
        data[XLOADFLAGS_OFFSET..XLOADFLAGS_OFFSET + 2]
            .try_into()
            .unwrap_or([0, 0]),
    );

    let header_end = (SETUP_HEADER_OFFSET + 0x80).min(data.len());
    let setup_header = data[SETUP_HEADER_OFFSET..header_end].to_vec();

    log::info!(
        target: "boot",
        "loaded bzImage {path}: {} setup sectors, code32_start={code32_start:#x}, xloadflags={xloadflags:#x}",
        setup_sects
    );

    Ok(LoadedKernel {
        setup_header,
        setup_sects,
        code32_start,
        xloadflags,
        init_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(loadflags: u8, code32_start: u32, xloadflags: u16) -> Vec<u8> {
        let mut data = vec![0u8; 0x300 + 512 * 5];
        data[SETUP_HEADER_OFFSET] = 4; // setup_sects
        data[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2]
            .copy_from_slice(&BOOT_SIGNATURE.to_le_bytes());
        data[HDR_MAGIC_OFFSET..HDR_MAGIC_OFFSET + 4].copy_from_slice(&HDR_MAGIC.to_le_bytes());
        data[LOADFLAGS_OFFSET] = loadflags;
        data[CODE32_START_OFFSET..CODE32_START_OFFSET + 4]
            .copy_from_slice(&code32_start.to_le_bytes());
        data[XLOADFLAGS_OFFSET..XLOADFLAGS_OFFSET + 2].copy_from_slice(&xloadflags.to_le_bytes());
        data
    }

    #[test]
    fn rejects_missing_loaded_high() {
        let data = minimal_header(0, 0, 0);
        let path = write_temp(&data);
        let mem = GuestMemory::new(crate::memory::sizing::LINUX).unwrap();
        assert!(load(&mem, &path).is_err());
    }

    #[test]
    fn patches_zero_code32_start() {
        let data = minimal_header(LOADED_HIGH, 0, 0);
        let path = write_temp(&data);
        let mem = GuestMemory::new(crate::memory::sizing::LINUX).unwrap();
        let kernel = load(&mem, &path).unwrap();
        assert_eq!(kernel.code32_start, KERNEL_LOAD_ADDR as u32);
    }

    #[test]
    fn reports_boot64_support() {
        let data = minimal_header(LOADED_HIGH, 0x10_0000, XLF_KERNEL_64);
        let path = write_temp(&data);
        let mem = GuestMemory::new(crate::memory::sizing::LINUX).unwrap();
        let kernel = load(&mem, &path).unwrap();
        assert!(kernel.supports_boot64());
    }

    fn write_temp(data: &[u8]) -> String {
        let path = std::env::temp_dir().join(format!(
            "bzimage_test_{:?}.bin",
            std::thread::current().id()
        ));
        std::fs::write(&path, data).unwrap();
        path.to_string_lossy().into_owned()
    }
}
