//! x86_64 CPU probing and the cycle counter

use core::arch::x86_64::{__cpuid, _rdtsc};

use alloc::string::String;

use super::CpuFeatures;

/// CPUID leaf: vendor id / highest standard level
const CPUID_VENDOR_ID: u32 = 0x0000_0000;
/// CPUID leaf: standard feature information
const CPUID_FEATURE_INFO: u32 = 0x0000_0001;
/// CPUID leaf: highest extended level
const CPUID_EXT_MAX: u32 = 0x8000_0000;
/// CPUID leaves: processor brand string
const CPUID_BRAND_STRING1: u32 = 0x8000_0002;
/// CPUID leaf: physical/virtual address sizes
const CPUID_ADDRESS_SIZE: u32 = 0x8000_0008;

/// Read the monotonic cycle counter.
pub fn rdtsc() -> u64 {
    // SAFETY: RDTSC has no memory effects and is available on every x86_64
    // processor this kernel targets.
    unsafe { _rdtsc() }
}

/// Probe CPUID for the identity and limits recorded in the CPU table.
pub fn probe_features() -> CpuFeatures {
    let mut f = CpuFeatures::default();

    // SAFETY: CPUID is unprivileged and side-effect free; the leaves queried
    // below are guarded by the reported maximum levels.
    unsafe {
        let id = __cpuid(CPUID_VENDOR_ID);
        if id.eax >= CPUID_FEATURE_INFO {
            let info = __cpuid(CPUID_FEATURE_INFO);
            f.stepping = (info.eax & 0x0F) as u8;
            f.standard_ecx = info.ecx;
            f.standard_edx = info.edx;
        }

        let ext = __cpuid(CPUID_EXT_MAX);
        if ext.eax >= CPUID_ADDRESS_SIZE {
            let mut bytes = [0u8; 48];
            for (i, chunk) in bytes.chunks_exact_mut(16).enumerate() {
                let leaf = __cpuid(CPUID_BRAND_STRING1 + i as u32);
                chunk[0..4].copy_from_slice(&leaf.eax.to_le_bytes());
                chunk[4..8].copy_from_slice(&leaf.ebx.to_le_bytes());
                chunk[8..12].copy_from_slice(&leaf.ecx.to_le_bytes());
                chunk[12..16].copy_from_slice(&leaf.edx.to_le_bytes());
            }
            let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            f.vendor = String::from_utf8_lossy(&bytes[..end]).trim().into();

            let size = __cpuid(CPUID_ADDRESS_SIZE);
            f.phys_addr_bits = (size.eax & 0xFF) as u8;
            f.virt_addr_bits = ((size.eax >> 8) & 0xFF) as u8;
        }
    }

    if f.vendor.is_empty() {
        f.vendor = String::from("Unknown vendor");
    }
    if f.phys_addr_bits == 0 {
        f.phys_addr_bits = 36;
    }
    if f.virt_addr_bits == 0 {
        f.virt_addr_bits = 48;
    }

    f
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_probe_fills_defaults() {
        let f = probe_features();
        assert!(!f.vendor.is_empty());
        assert!(f.phys_addr_bits >= 32);
        assert!(f.virt_addr_bits >= 32);
    }
}
