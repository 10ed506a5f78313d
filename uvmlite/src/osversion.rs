//! Host operating system build detection.

use std::fmt;

use sysinfo::System;
use uvmlite_shared::constants::host;

/// Host OS version. Only the build number gates features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct OsVersion {
    pub build: u32,
}

impl OsVersion {
    pub const fn from_build(build: u32) -> Self {
        Self { build }
    }

    /// Detect the running host's build.
    ///
    /// Windows hosts report the build as their kernel version. Anything that
    /// does not parse as a build number is treated as build 0, which fails
    /// every build gate.
    pub fn detect() -> Self {
        let build = System::kernel_version()
            .as_deref()
            .and_then(parse_build)
            .unwrap_or(0);
        tracing::trace!(build, "Detected host build");
        Self { build }
    }

    /// Whether the host can boot a Linux kernel directly.
    pub fn supports_kernel_direct(&self) -> bool {
        self.build >= host::MIN_KERNEL_DIRECT_BUILD
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build {}", self.build)
    }
}

fn parse_build(raw: &str) -> Option<u32> {
    raw.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_build() {
        assert_eq!(parse_build("22631"), Some(22631));
        assert_eq!(parse_build(" 18286\n"), Some(18286));
        assert_eq!(parse_build("6.8.0-45-generic"), None);
    }

    #[test]
    fn test_kernel_direct_gate() {
        assert!(!OsVersion::from_build(18285).supports_kernel_direct());
        assert!(OsVersion::from_build(18286).supports_kernel_direct());
        assert!(!OsVersion::default().supports_kernel_direct());
    }
}
