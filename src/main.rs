//! vmm - a minimal educational type-2 hypervisor over Linux KVM.
//!
//! One invocation boots one VM: up to four real-mode toy programs, up to
//! four 32-bit paging guests, or one Linux bzImage, each vCPU running on its
//! own host thread (§5, §6). This binary requires Linux with KVM support.

#[cfg(target_os = "linux")]
mod boot;
#[cfg(target_os = "linux")]
mod console;
#[cfg(target_os = "linux")]
mod cpuid;
#[cfg(target_os = "linux")]
mod debug;
#[cfg(target_os = "linux")]
mod devices;
#[cfg(target_os = "linux")]
mod hypercall;
#[cfg(target_os = "linux")]
mod keyboard;
#[cfg(target_os = "linux")]
mod kvm;
#[cfg(target_os = "linux")]
mod memory;
#[cfg(target_os = "linux")]
mod msr;
#[cfg(target_os = "linux")]
mod runtime;

use clap::Parser;
use std::process::ExitCode;

/// `--linux-entry`: which of the kernel's three entry points to boot
/// through (§4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LinuxEntryArg {
    Setup,
    Code32,
    Boot64,
}

/// `--linux-rsi`: where to point RSI for the CODE32/BOOT64 entries (§4.4, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LinuxRsiArg {
    Base,
    Hdr,
}

fn parse_addr(s: &str) -> Result<u64, String> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).map_err(|e| e.to_string()),
        None => s.parse::<u64>().map_err(|e| e.to_string()),
    }
}

#[derive(Parser, Debug)]
#[command(name = "vmm")]
#[command(about = "A minimal educational type-2 hypervisor over Linux KVM")]
struct Args {
    /// Enable 32-bit protected mode with paging for every guest.
    #[arg(long)]
    paging: bool,

    /// Implies --paging; boots every guest into 64-bit long mode instead.
    #[arg(long)]
    long_mode: bool,

    /// Linux boot mode: boot this bzImage instead of the positional images.
    #[arg(long, value_name = "PATH")]
    linux: Option<String>,

    /// Which Linux kernel entry point to use (only with --linux).
    #[arg(long, value_enum, default_value = "code32")]
    linux_entry: LinuxEntryArg,

    /// Where to point RSI for the CODE32/BOOT64 entries (only with --linux).
    #[arg(long, value_enum, default_value = "base")]
    linux_rsi: LinuxRsiArg,

    /// Kernel command line (only with --linux).
    #[arg(long)]
    cmdline: Option<String>,

    /// Path to an initrd image (only with --linux).
    #[arg(long, value_name = "PATH")]
    initrd: Option<String>,

    /// Entry point for paging/long-mode guests.
    #[arg(long, value_parser = parse_addr, default_value = "0x80001000")]
    entry: u64,

    /// Load offset within a guest's own memory slot for non-Linux guests.
    #[arg(long, value_parser = parse_addr, default_value = "0x1000")]
    load: u64,

    /// Set the debug level to BASIC (equivalent to --debug 1).
    #[arg(short, long)]
    verbose: bool,

    /// Debug level 0 (quiet) through 3 (ALL, enables single-step).
    #[arg(long, value_name = "N")]
    debug: Option<u8>,

    /// 1-4 guest-image paths (ignored under --linux).
    images: Vec<String>,
}

/// §6's four debug levels: NONE logs warnings/errors only, BASIC is the
/// default `--verbose` level, VERBOSE adds per-module debug tracing, and ALL
/// additionally engages the single-step hook (§4.9.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebugLevel {
    None,
    Basic,
    Verbose,
    All,
}

impl DebugLevel {
    fn from_n(n: u8) -> Self {
        match n {
            0 => DebugLevel::None,
            1 => DebugLevel::Basic,
            2 => DebugLevel::Verbose,
            _ => DebugLevel::All,
        }
    }

    fn log_filter(self) -> log::LevelFilter {
        match self {
            DebugLevel::None => log::LevelFilter::Warn,
            DebugLevel::Basic => log::LevelFilter::Info,
            DebugLevel::Verbose => log::LevelFilter::Debug,
            DebugLevel::All => log::LevelFilter::Trace,
        }
    }

    fn is_all(self) -> bool {
        matches!(self, DebugLevel::All)
    }
}

fn init_logging(level: DebugLevel) {
    env_logger::Builder::new()
        .filter_level(level.log_filter())
        .format_timestamp(None)
        .format_target(true)
        .init();
}

#[derive(thiserror::Error, Debug)]
enum MainError {
    #[error(transparent)]
    Kvm(#[from] kvm::KvmError),

    #[error(transparent)]
    Boot(#[from] boot::BootError),

    #[error(transparent)]
    Memory(#[from] memory::MemoryError),

    #[error("no guest images given (need 1-4, or --linux)")]
    NoImages,

    #[error("too many guest images: {0} given, max 4")]
    TooManyImages(usize),

    #[error("failed to read {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to acquire raw terminal mode: {0}")]
    RawMode(#[source] std::io::Error),
}

/// Which architectural mode every non-Linux guest in this invocation boots
/// into (§4.3); Linux boot mode picks its own entry strategy per-kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GuestMode {
    Real,
    Protected,
    LongMode,
}

fn read_file(path: &str) -> Result<Vec<u8>, MainError> {
    std::fs::read(path).map_err(|source| MainError::ReadFile {
        path: path.to_string(),
        source,
    })
}

fn display_name(path: &str) -> String {
    let name = std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    name.strip_suffix(".bin")
        .map(str::to_string)
        .unwrap_or(name)
}

fn main() -> ExitCode {
    let args = Args::parse();

    let debug_level = match args.debug {
        Some(n) => DebugLevel::from_n(n),
        None if args.verbose => DebugLevel::Basic,
        None => DebugLevel::None,
    };
    init_logging(debug_level);

    #[cfg(not(target_os = "linux"))]
    {
        log::error!(target: "main", "this hypervisor requires Linux with KVM support");
        return ExitCode::FAILURE;
    }

    #[cfg(target_os = "linux")]
    match run(args, debug_level) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            log::error!(target: "main", "{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(target_os = "linux")]
fn run(args: Args, debug_level: DebugLevel) -> Result<i32, MainError> {
    use devices::{Legacy, Serial};
    use keyboard::KeyboardRing;
    use runtime::{Shared, VcpuState};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    let linux_mode = args.linux.is_some();
    let long_mode = args.long_mode;
    let mode = if long_mode {
        GuestMode::LongMode
    } else if args.paging {
        GuestMode::Protected
    } else {
        GuestMode::Real
    };

    if !linux_mode {
        if args.images.is_empty() {
            return Err(MainError::NoImages);
        }
        if args.images.len() > 4 {
            return Err(MainError::TooManyImages(args.images.len()));
        }
    }

    let n_vcpus: usize = if linux_mode { 1 } else { args.images.len() };
    let mem_size: u64 = if linux_mode {
        memory::sizing::LINUX
    } else {
        match mode {
            GuestMode::Real => memory::sizing::REAL_MODE,
            GuestMode::Protected => memory::sizing::PAGING_MODE,
            GuestMode::LongMode => memory::sizing::PAGING_MODE,
        }
    };

    log::info!(
        target: "main",
        "starting {n_vcpus} vCPU(s), mode={mode:?}, linux={linux_mode}, mem_size={mem_size:#x}"
    );

    let vm = Arc::new(kvm::create_vm(linux_mode)?);

    let serial = Arc::new(Mutex::new(Serial::new(linux_mode)));
    let legacy = Arc::new(Mutex::new(Legacy::new()));
    let keyboard = Arc::new(KeyboardRing::new());
    let stop = Arc::new(AtomicBool::new(false));

    let raw_mode_guard = console::RawModeGuard::acquire().map_err(MainError::RawMode)?;

    let stdin_handle =
        runtime::spawn_stdin_monitor(keyboard.clone(), vm.clone(), linux_mode, stop.clone());

    let shared = Shared {
        vm: vm.clone(),
        keyboard: keyboard.clone(),
        serial,
        legacy,
        n_vcpus,
        debug_all: debug_level.is_all(),
    };

    let mut handles = Vec::with_capacity(n_vcpus);

    if linux_mode {
        let kernel_path = args.linux.clone().expect("linux_mode implies linux path");
        let strategy = match args.linux_entry {
            LinuxEntryArg::Setup => boot::linux::EntryStrategy::Setup,
            LinuxEntryArg::Code32 => boot::linux::EntryStrategy::Code32,
            LinuxEntryArg::Boot64 => boot::linux::EntryStrategy::Boot64,
        };
        let rsi_mode = match args.linux_rsi {
            LinuxRsiArg::Base => boot::linux::RsiMode::Base,
            LinuxRsiArg::Hdr => boot::linux::RsiMode::Hdr,
        };
        let initrd = args.initrd.as_deref().map(read_file).transpose()?;
        let entry_long_mode = strategy == boot::linux::EntryStrategy::Boot64;

        let memory = memory::GuestMemory::new(mem_size)?;
        memory.register(&vm, 0, 0)?;
        let vcpu = vm.create_vcpu(0, entry_long_mode)?;

        boot::linux::boot(
            &vcpu,
            &memory,
            mem_size,
            &kernel_path,
            strategy,
            rsi_mode,
            args.cmdline.as_deref(),
            initrd.as_deref(),
        )?;

        let state = VcpuState::new(0, memory, display_name(&kernel_path), true);
        let thread_shared = shared.clone();
        handles.push(std::thread::spawn(move || {
            runtime::run(vcpu, state, thread_shared)
        }));
    } else {
        for (id, path) in args.images.iter().enumerate() {
            let id = id as u64;
            let guest_base = id * mem_size;
            let memory = memory::GuestMemory::new(mem_size)?;
            memory.register(&vm, id as u32, guest_base)?;

            let data = read_file(path)?;
            let use_paging = matches!(mode, GuestMode::Protected | GuestMode::LongMode);

            let vcpu = match mode {
                GuestMode::Real => {
                    let vcpu = vm.create_vcpu(id, false)?;
                    boot::real::setup(&vcpu, id, mem_size)?;
                    boot::real::load_image(&memory, args.load, &data)?;
                    vcpu
                }
                GuestMode::Protected => {
                    let vcpu = vm.create_vcpu(id, false)?;
                    boot::protected::setup(&vcpu, &memory, args.entry)?;
                    memory.load_image(args.load, &data)?;
                    vcpu
                }
                GuestMode::LongMode => {
                    let vcpu = vm.create_vcpu(id, true)?;
                    boot::longmode::setup(&vcpu, &memory, mem_size, args.entry)?;
                    memory.load_image(args.load, &data)?;
                    vcpu
                }
            };

            let state = VcpuState::new(id, memory, display_name(path), use_paging);
            let thread_shared = shared.clone();
            handles.push(std::thread::spawn(move || {
                runtime::run(vcpu, state, thread_shared)
            }));
        }
    }

    let mut exit_code = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok(outcome)) => {
                if !outcome.is_normal() {
                    exit_code = 1;
                }
            }
            Ok(Err(e)) => {
                log::error!(target: "main", "{e}");
                exit_code = 1;
            }
            Err(_) => {
                log::error!(target: "main", "a vCPU thread panicked");
                exit_code = 1;
            }
        }
    }

    stop.store(true, Ordering::Relaxed);
    let _ = stdin_handle.join();
    drop(raw_mode_guard);

    Ok(exit_code)
}
