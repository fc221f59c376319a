//! Serialized, color-multiplexed console output and raw-mode terminal setup
//! (§4.9 "vCPU thread runtime and console").
//!
//! All console output funnels through one process-wide mutex so concurrent
//! vCPU threads never interleave mid-character; with more than one active
//! vCPU, each emitted byte is wrapped in an ANSI 256-color escape derived
//! from the vCPU's id so a human watching the merged stream can tell guests
//! apart.

use std::io::{self, Write};
use std::sync::Mutex;

/// Hues are distributed across a 300° arc starting at green (120°), so the
/// legend never reaches red (0°/360°, reserved for error text).
const HUE_START: f64 = 120.0;
const HUE_ARC: f64 = 300.0;

/// Pick the `id`-th of `n_vcpus` colors, evenly spaced across the arc.
fn vcpu_hue(id: u64, n_vcpus: usize) -> f64 {
    if n_vcpus <= 1 {
        return HUE_START;
    }
    let step = HUE_ARC / n_vcpus as f64;
    (HUE_START + step * id as f64) % 360.0
}

/// Convert an HSL color (hue in degrees, saturation/lightness in 0.0-1.0) to
/// RGB bytes.
fn hsl_to_rgb(h: f64, s: f64, l: f64) -> (u8, u8, u8) {
    if s == 0.0 {
        let v = (l * 255.0).round() as u8;
        return (v, v, v);
    }
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let hp = h / 60.0;
    let x = c * (1.0 - (hp % 2.0 - 1.0).abs());
    let (r1, g1, b1) = match hp as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    let m = l - c / 2.0;
    (
        ((r1 + m) * 255.0).round() as u8,
        ((g1 + m) * 255.0).round() as u8,
        ((b1 + m) * 255.0).round() as u8,
    )
}

/// Map an RGB triple onto the nearest color in the xterm 256-color cube
/// (indices 16-231: 6x6x6 levels of [0, 95, 135, 175, 215, 255]).
fn rgb_to_ansi256(r: u8, g: u8, b: u8) -> u8 {
    const LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];
    let nearest = |c: u8| {
        LEVELS
            .iter()
            .enumerate()
            .min_by_key(|(_, &lv)| (lv as i32 - c as i32).abs())
            .map(|(i, _)| i as u8)
            .unwrap_or(0)
    };
    let (ri, gi, bi) = (nearest(r), nearest(g), nearest(b));
    16 + 36 * ri + 6 * gi + bi
}

/// The ANSI 256-color code assigned to vCPU `id` out of `n_vcpus` active
/// vCPUs (§8 "Single-color legend": pairwise distinct for distinct ids).
pub fn vcpu_color(id: u64, n_vcpus: usize) -> u8 {
    let hue = vcpu_hue(id, n_vcpus);
    let (r, g, b) = hsl_to_rgb(hue, 0.85, 0.55);
    rgb_to_ansi256(r, g, b)
}

static STDOUT_LOCK: Mutex<()> = Mutex::new(());

/// Write `bytes` to stdout as one serialized logical message, wrapped in
/// vCPU `id`'s color escape when more than one vCPU is active.
pub fn write_guest_bytes(id: u64, n_vcpus: usize, bytes: &[u8]) {
    let _guard = STDOUT_LOCK.lock().unwrap();
    let mut out = io::stdout();
    if n_vcpus > 1 {
        let color = vcpu_color(id, n_vcpus);
        let _ = write!(out, "\x1b[38;5;{color}m");
        let _ = out.write_all(bytes);
        let _ = write!(out, "\x1b[0m");
    } else {
        let _ = out.write_all(bytes);
    }
    let _ = out.flush();
}

#[cfg(all(unix, target_os = "linux"))]
mod raw_mode {
    use std::io;
    use std::os::fd::AsRawFd;

    /// Scoped raw-mode acquisition for stdin (§4.9, §9 "Scoped terminal
    /// setup"): disables ECHO/ICANON/ISIG/IXON/ICRNL, keeps OPOST so
    /// `\n` still becomes `\r\n` on the way out. Restoring the saved
    /// termios on drop is the only way this system satisfies the
    /// byte-exact restoration property (§8.7) on every exit path,
    /// including panics.
    pub struct RawModeGuard {
        saved: Option<libc::termios>,
    }

    impl RawModeGuard {
        /// Attempt to switch stdin to raw mode. Returns a guard that
        /// restores the original mode on drop; if stdin is not a TTY, the
        /// guard is a no-op.
        pub fn acquire() -> io::Result<Self> {
            let fd = io::stdin().as_raw_fd();
            if unsafe { libc::isatty(fd) } == 0 {
                return Ok(Self { saved: None });
            }

            let mut termios = unsafe { std::mem::zeroed::<libc::termios>() };
            if unsafe { libc::tcgetattr(fd, &mut termios) } != 0 {
                return Err(io::Error::last_os_error());
            }
            let saved = termios;

            let mut raw = termios;
            raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::ISIG);
            raw.c_iflag &= !(libc::IXON | libc::ICRNL);
            raw.c_oflag |= libc::OPOST;
            raw.c_cc[libc::VMIN] = 0;
            raw.c_cc[libc::VTIME] = 0;

            if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(Self { saved: Some(saved) })
        }
    }

    impl Drop for RawModeGuard {
        fn drop(&mut self) {
            if let Some(saved) = self.saved {
                let fd = io::stdin().as_raw_fd();
                unsafe {
                    libc::tcsetattr(fd, libc::TCSANOW, &saved);
                }
            }
        }
    }
}

#[cfg(all(unix, target_os = "linux"))]
pub use raw_mode::RawModeGuard;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn colors_are_pairwise_distinct_for_four_vcpus() {
        let colors: Vec<u8> = (0..4).map(|id| vcpu_color(id, 4)).collect();
        for i in 0..colors.len() {
            for j in (i + 1)..colors.len() {
                assert_ne!(colors[i], colors[j], "colors for {i} and {j} collided");
            }
        }
    }

    #[test]
    fn single_vcpu_uses_green_hue() {
        assert_eq!(vcpu_hue(0, 1), HUE_START);
    }

    #[test]
    fn hue_arc_never_reaches_red() {
        for id in 0..4 {
            let hue = vcpu_hue(id, 4);
            assert!(hue >= HUE_START - 0.001 && hue < HUE_START + HUE_ARC + 0.001);
        }
    }

    #[test]
    fn rgb_to_ansi256_maps_pure_colors() {
        // Pure white should land on the brightest cube corner.
        assert_eq!(rgb_to_ansi256(255, 255, 255), 16 + 36 * 5 + 6 * 5 + 5);
    }
}
