//! CPUID leaf filtering for long-mode and Linux guests.
//!
//! The backend's supported-CPUID table already reflects the host's real
//! feature set; we only need to pin down the subset a from-scratch guest
//! kernel checks on the way into long mode (FPU/PAE/SSE family on leaf 1,
//! SYSCALL/NX/LM on the extended leaf). Every other leaf passes through
//! unmodified.

use kvm_bindings::{kvm_cpuid_entry2, CpuId};

const LEAF_FEATURES: u32 = 1;
const LEAF_EXT_FEATURES: u32 = 0x8000_0001;

mod leaf1_edx {
    pub const FPU: u32 = 1 << 0;
    pub const PSE: u32 = 1 << 3;
    pub const TSC: u32 = 1 << 4;
    pub const MSR: u32 = 1 << 5;
    pub const PAE: u32 = 1 << 6;
    pub const APIC: u32 = 1 << 9;
    pub const SEP: u32 = 1 << 11;
    pub const MTRR: u32 = 1 << 12;
    pub const PGE: u32 = 1 << 13;
    pub const CMOV: u32 = 1 << 15;
    pub const PAT: u32 = 1 << 16;
    pub const CLFLUSH: u32 = 1 << 19;
    pub const MMX: u32 = 1 << 23;
    pub const FXSR: u32 = 1 << 24;
    pub const SSE: u32 = 1 << 25;
    pub const SSE2: u32 = 1 << 26;
}

mod leaf1_ecx {
    pub const SSE3: u32 = 1 << 0;
    pub const SSSE3: u32 = 1 << 9;
    pub const CX16: u32 = 1 << 13;
    pub const SSE4_1: u32 = 1 << 19;
    pub const SSE4_2: u32 = 1 << 20;
    pub const POPCNT: u32 = 1 << 23;
}

mod ext_edx {
    pub const SYSCALL: u32 = 1 << 11;
    pub const NX: u32 = 1 << 20;
    pub const PDPE1GB: u32 = 1 << 26;
    pub const RDTSCP: u32 = 1 << 27;
    pub const LM: u32 = 1 << 29;
}

mod ext_ecx {
    pub const LAHF_LM: u32 = 1 << 0;
}

/// Apply the long-mode feature-bit filter to a supported-CPUID snapshot and
/// return the table to install on the vCPU.
pub fn filter_for_long_mode(supported: &CpuId) -> CpuId {
    let mut entries: Vec<kvm_cpuid_entry2> = supported.as_slice().to_vec();

    for entry in &mut entries {
        match entry.function {
            LEAF_FEATURES => {
                use leaf1_edx::*;
                entry.edx |= FPU | PSE | TSC | MSR | PAE | APIC | SEP | MTRR | PGE | CMOV | PAT
                    | CLFLUSH
                    | MMX
                    | FXSR
                    | SSE
                    | SSE2;
                use leaf1_ecx::*;
                entry.ecx |= SSE3 | SSSE3 | CX16 | SSE4_1 | SSE4_2 | POPCNT;
            }
            LEAF_EXT_FEATURES => {
                use ext_edx::*;
                entry.edx |= SYSCALL | NX | PDPE1GB | RDTSCP | LM;
                entry.ecx |= ext_ecx::LAHF_LM;
            }
            _ => {}
        }
    }

    CpuId::from_entries(&entries).unwrap_or_else(|_| supported.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::KVM_MAX_CPUID_ENTRIES;

    fn make_supported(entries: Vec<kvm_cpuid_entry2>) -> CpuId {
        CpuId::from_entries(&entries).unwrap()
    }

    #[test]
    fn leaf1_gets_expected_bits() {
        let base = make_supported(vec![kvm_cpuid_entry2 {
            function: 1,
            ..Default::default()
        }]);
        let filtered = filter_for_long_mode(&base);
        let e = filtered
            .as_slice()
            .iter()
            .find(|e| e.function == 1)
            .unwrap();
        assert_ne!(e.edx & leaf1_edx::SSE2, 0);
        assert_ne!(e.ecx & leaf1_ecx::SSE4_2, 0);
    }

    #[test]
    fn extended_leaf_gets_long_mode_bit() {
        let base = make_supported(vec![kvm_cpuid_entry2 {
            function: 0x8000_0001,
            ..Default::default()
        }]);
        let filtered = filter_for_long_mode(&base);
        let e = filtered
            .as_slice()
            .iter()
            .find(|e| e.function == 0x8000_0001)
            .unwrap();
        assert_ne!(e.edx & ext_edx::LM, 0);
        assert_ne!(e.edx & ext_edx::NX, 0);
    }

    #[test]
    fn other_leaves_pass_through() {
        let base = make_supported(vec![kvm_cpuid_entry2 {
            function: 2,
            eax: 0x1234,
            ..Default::default()
        }]);
        let filtered = filter_for_long_mode(&base);
        let e = filtered
            .as_slice()
            .iter()
            .find(|e| e.function == 2)
            .unwrap();
        assert_eq!(e.eax, 0x1234);
    }

    #[test]
    fn under_max_cpuid_entries() {
        assert!(KVM_MAX_CPUID_ENTRIES >= 1);
    }
}
