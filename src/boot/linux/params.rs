//! Zero-page (`boot_params`) assembly, command-line placement, E820 map,
//! and initrd placement (§4.4).

use super::bzimage::{LoadedKernel, SETUP_LOAD_ADDR};
use crate::boot::BootError;
use crate::memory::GuestMemory;

/// The real-mode setup region doubles as the zero page: the setup header's
/// own layout already matches `boot_params`' layout for the fields the
/// kernel inspects, so the loader overlays the E820 map and loader fields
/// directly into that same page instead of allocating a separate one.
pub const BOOT_PARAMS_START: u64 = SETUP_LOAD_ADDR;

pub const CMDLINE_ADDR: u64 = 0x2_0000;
pub const CMDLINE_MAX_LEN: usize = 255;

const TYPE_OF_LOADER_OFFSET: u64 = 0x210;
const RAMDISK_IMAGE_OFFSET: u64 = 0x218;
const RAMDISK_SIZE_OFFSET: u64 = 0x21c;
const CMD_LINE_PTR_OFFSET: u64 = 0x228;
const INITRD_ADDR_MAX_OFFSET: u64 = 0x22c;
const E820_ENTRIES_OFFSET: u64 = 0x1e8;
const E820_MAP_OFFSET: u64 = 0x2d0;
const SETUP_HEADER_OFFSET: u64 = 0x1f1;

const DEFAULT_INITRD_ADDR_MAX: u32 = 0x37ff_ffff;
const TYPE_OF_LOADER_UNDEFINED: u8 = 0xff;

/// Copy the parsed setup header into the zero page and set the loader,
/// initrd_addr_max, and (if present) cmd_line_ptr fields.
pub fn write_zero_page(
    memory: &GuestMemory,
    kernel: &LoadedKernel,
    cmdline: Option<&str>,
) -> Result<(), BootError> {
    memory.write(
        BOOT_PARAMS_START + SETUP_HEADER_OFFSET,
        &kernel.setup_header,
    )?;
    memory.write_u8(BOOT_PARAMS_START + TYPE_OF_LOADER_OFFSET, TYPE_OF_LOADER_UNDEFINED)?;
    memory.write_u32(
        BOOT_PARAMS_START + INITRD_ADDR_MAX_OFFSET,
        DEFAULT_INITRD_ADDR_MAX,
    )?;

    if let Some(cmdline) = cmdline {
        write_cmdline(memory, cmdline)?;
        memory.write_u32(BOOT_PARAMS_START + CMD_LINE_PTR_OFFSET, CMDLINE_ADDR as u32)?;
    }

    Ok(())
}

fn write_cmdline(memory: &GuestMemory, cmdline: &str) -> Result<(), BootError> {
    if cmdline.len() > CMDLINE_MAX_LEN {
        return Err(BootError::CmdlineTooLong {
            len: cmdline.len(),
            max: CMDLINE_MAX_LEN,
        });
    }
    memory.write(CMDLINE_ADDR, cmdline.as_bytes())?;
    memory.write_u8(CMDLINE_ADDR + cmdline.len() as u64, 0)?;
    Ok(())
}

/// Three-entry E820 map: `[0, 640 KiB)` RAM, `[640 KiB, 1 MiB)` reserved,
/// `[1 MiB, mem_size)` RAM.
pub fn write_e820_map(memory: &GuestMemory, mem_size: u64) -> Result<(), BootError> {
    const LOW_MEM_END: u64 = 640 * 1024;
    const HIMEM_START: u64 = 1024 * 1024;
    const E820_RAM: u32 = 1;
    const E820_RESERVED: u32 = 2;

    let entries = [
        (0u64, LOW_MEM_END, E820_RAM),
        (LOW_MEM_END, HIMEM_START - LOW_MEM_END, E820_RESERVED),
        (HIMEM_START, mem_size - HIMEM_START, E820_RAM),
    ];

    for (i, (base, size, kind)) in entries.iter().enumerate() {
        let addr = BOOT_PARAMS_START + E820_MAP_OFFSET + (i as u64) * 20;
        memory.write_u64(addr, *base)?;
        memory.write_u64(addr + 8, *size)?;
        memory.write_u32(addr + 16, *kind)?;
    }

    memory.write_u8(BOOT_PARAMS_START + E820_ENTRIES_OFFSET, entries.len() as u8)?;
    Ok(())
}

/// Placement of an initrd image: choose `end = min(initrd_addr_max,
/// mem_size-1)`, `start = (end + 1 - size) & !0xFFF`; fail if it would land
/// inside the kernel's reserved init window.
pub fn place_initrd(
    memory: &GuestMemory,
    mem_size: u64,
    initrd_addr_max: u32,
    kernel_init_window_end: u64,
    data: &[u8],
) -> Result<(), BootError> {
    let end = (initrd_addr_max as u64).min(mem_size.saturating_sub(1));
    let size = data.len() as u64;
    let start = (end + 1 - size) & !0xfff;

    if start < kernel_init_window_end {
        return Err(BootError::InitrdDoesNotFit {
            size: data.len(),
            max_end: end,
        });
    }

    memory.load_image(start, data)?;
    memory.write_u32(BOOT_PARAMS_START + RAMDISK_IMAGE_OFFSET, start as u32)?;
    memory.write_u32(BOOT_PARAMS_START + RAMDISK_SIZE_OFFSET, size as u32)?;

    log::info!(target: "boot", "initrd placed at {start:#x}, {size} bytes");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_with_header() -> LoadedKernel {
        LoadedKernel {
            setup_header: vec![0u8; 0x80],
            setup_sects: 4,
            code32_start: 0x10_0000,
            xloadflags: 0,
            init_size: 0x1000,
        }
    }

    #[test]
    fn e820_covers_640k_exactly() {
        let mem = GuestMemory::new(crate::memory::sizing::LINUX).unwrap();
        write_e820_map(&mem, crate::memory::sizing::LINUX).unwrap();
        let mut buf = [0u8; 8];
        mem.read(BOOT_PARAMS_START + E820_MAP_OFFSET + 8, &mut buf)
            .unwrap();
        assert_eq!(u64::from_le_bytes(buf), 640 * 1024);
    }

    #[test]
    fn cmdline_too_long_is_rejected() {
        let mem = GuestMemory::new(crate::memory::sizing::LINUX).unwrap();
        let long = "x".repeat(CMDLINE_MAX_LEN + 1);
        assert!(write_cmdline(&mem, &long).is_err());
    }

    #[test]
    fn zero_page_records_loader_type() {
        let mem = GuestMemory::new(crate::memory::sizing::LINUX).unwrap();
        write_zero_page(&mem, &kernel_with_header(), Some("console=ttyS0")).unwrap();
        assert_eq!(
            mem.read_u8(BOOT_PARAMS_START + TYPE_OF_LOADER_OFFSET).unwrap(),
            TYPE_OF_LOADER_UNDEFINED
        );
    }

    #[test]
    fn initrd_start_is_page_aligned() {
        let mem = GuestMemory::new(crate::memory::sizing::LINUX).unwrap();
        let data = vec![0xabu8; 4096 * 3 + 10];
        place_initrd(&mem, mem.size(), 0x37ff_ffff, 0x10_0000, &data).unwrap();
        let mut buf = [0u8; 4];
        mem.read(BOOT_PARAMS_START + RAMDISK_IMAGE_OFFSET, &mut buf)
            .unwrap();
        let start = u32::from_le_bytes(buf);
        assert_eq!(start % 4096, 0);
    }

    #[test]
    fn initrd_rejects_init_window_collision() {
        let mem = GuestMemory::new(crate::memory::sizing::LINUX).unwrap();
        let data = vec![0u8; 10];
        let result = place_initrd(&mem, 0x11_0000, 0x10_ffff, 0x10_0000, &data);
        assert!(result.is_err());
    }
}
