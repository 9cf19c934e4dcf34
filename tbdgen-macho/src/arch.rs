//! Architecture naming for `.tbd` documents.

use object::macho::CPU_SUBTYPE_MASK;

/// Converts a cpu type/subtype pair into the architecture name used in `.tbd`
/// documents.
///
/// For example, this converts `CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E` to
/// `Some("arm64e")`. The capability bits in the subtype's high byte are
/// ignored.
pub fn arch_name_for_cpu_type(cputype: u32, cpusubtype: u32) -> Option<&'static str> {
    use object::macho::*;
    let s = match (cputype, cpusubtype & !CPU_SUBTYPE_MASK) {
        (CPU_TYPE_X86, _) => "i386",
        (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H) => "x86_64h",
        (CPU_TYPE_X86_64, _) => "x86_64",
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E) => "arm64e",
        (CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_V8) => "arm64v8",
        (CPU_TYPE_ARM64, _) => "arm64",
        (CPU_TYPE_ARM64_32, CPU_SUBTYPE_ARM64_32_V8) => "arm64_32v8",
        (CPU_TYPE_ARM64_32, _) => "arm64_32",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V5TEJ) => "armv5",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6) => "armv6",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V6M) => "armv6m",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7) => "armv7",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7F) => "armv7f",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7S) => "armv7s",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7K) => "armv7k",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7M) => "armv7m",
        (CPU_TYPE_ARM, CPU_SUBTYPE_ARM_V7EM) => "armv7em",
        (CPU_TYPE_ARM, _) => "arm",
        (CPU_TYPE_POWERPC, CPU_SUBTYPE_POWERPC_ALL) => "ppc",
        (CPU_TYPE_POWERPC64, CPU_SUBTYPE_POWERPC_ALL) => "ppc64",
        _ => return None,
    };
    Some(s)
}

/// The architecture names accepted for `.tbd` documents, in the order they
/// are listed to the user.
pub const KNOWN_ARCH_NAMES: &[&str] = &[
    "arm",
    "armv5",
    "armv6",
    "armv6m",
    "armv7",
    "armv7em",
    "armv7f",
    "armv7k",
    "armv7m",
    "armv7s",
    "arm64",
    "arm64e",
    "arm64v8",
    "arm64_32",
    "arm64_32v8",
    "i386",
    "x86_64",
    "x86_64h",
    "ppc",
    "ppc64",
];

/// Whether `name` is an architecture name that may appear in a `.tbd`
/// document.
pub fn is_known_arch_name(name: &str) -> bool {
    KNOWN_ARCH_NAMES.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::macho::{CPU_SUBTYPE_ARM64E, CPU_TYPE_ARM64, CPU_TYPE_X86_64};

    #[test]
    fn arch_names() {
        assert_eq!(arch_name_for_cpu_type(CPU_TYPE_X86_64, 3), Some("x86_64"));
        assert_eq!(
            arch_name_for_cpu_type(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E),
            Some("arm64e")
        );
        // Capability bits in the high byte don't change the name.
        assert_eq!(
            arch_name_for_cpu_type(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64E | 0x8000_0000),
            Some("arm64e")
        );
        assert_eq!(arch_name_for_cpu_type(0x1234_5678, 0), None);
    }

    #[test]
    fn known_names() {
        assert!(is_known_arch_name("arm64"));
        assert!(!is_known_arch_name("riscv64"));
    }
}
