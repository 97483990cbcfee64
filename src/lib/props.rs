//! # Device property layouts
//!
//! `hipGetDeviceProperties` fills a `hipDeviceProp_t` whose binary layout
//! changed incompatibly in ROCm 6 (R0000 vs R0600). Even on ROCm 6 the
//! unversioned symbol may still fill the R0000 layout, so the layout cannot be
//! picked from the runtime version alone.
//!
//! The probe decodes the buffer as R0000 first and checks that the
//! architecture name looks like `gfx...`. If it does not, the same buffer is
//! re-decoded as R0600, which is only legitimate on a ROCm 6 runtime. Decoding
//! R0000 over an R0600 buffer is always in bounds because R0600 is the larger
//! struct and the buffer is sized for it.

use serde::Serialize;
use thiserror::Error;

/// Size of `hipDeviceProp_t` in the R0000 layout.
pub const PROPS_R0000_SIZE: usize = 792;
/// Size of `hipDeviceProp_t` in the R0600 layout.
pub const PROPS_R0600_SIZE: usize = 1472;
/// Bytes handed to the driver for the property query.
pub const PROPS_BUFFER_SIZE: usize = 4096;

const _: () = assert!(PROPS_R0600_SIZE >= PROPS_R0000_SIZE);
const _: () = assert!(PROPS_BUFFER_SIZE >= PROPS_R0600_SIZE);

/// First runtime version (`hipRuntimeGetVersion`) that can emit R0600.
pub const RUNTIME_VERSION_R0600: i32 = 60_000_000;

/// Every valid AMDGPU architecture name starts with this.
pub const ARCH_PREFIX: &str = "gfx";

const ARCH_NAME_LEN: usize = 256;

/// Errors from decoding the property buffer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("property buffer holds {len} bytes, need at least {required}")]
    Truncated { len: usize, required: usize },
    #[error(
        "hipGetDeviceProperties returned an invalid architecture name but HIP \
         runtime version {runtime_version} is not ROCm 6"
    )]
    LayoutMismatch { runtime_version: i32 },
}

/// Which `hipDeviceProp_t` layout produced a decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum PropsLayout {
    /// ROCm 5 layout
    R0000,
    /// ROCm 6 layout
    R0600,
}

/// Capability and target architecture decoded from the property buffer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ArchInfo {
    /// `major * 100 + minor * 10`
    pub compute_capability: u32,
    /// Architecture name without feature qualifiers, e.g. `gfx90a`.
    pub mcpu: String,
    pub layout: PropsLayout,
}

/// Read a native-endian `i32` at word index `word`.
fn read_word(raw: &[u8], word: usize) -> i32 {
    let at = word * 4;
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[at..at + 4]);
    i32::from_ne_bytes(bytes)
}

/// Read a NUL-terminated `char[256]` starting at word index `word`.
fn read_c_str(raw: &[u8], word: usize) -> String {
    let at = word * 4;
    let field = &raw[at..at + ARCH_NAME_LEN];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn check_len(raw: &[u8], required: usize) -> Result<(), ProbeError> {
    if raw.len() < required {
        return Err(ProbeError::Truncated {
            len: raw.len(),
            required,
        });
    }
    Ok(())
}

/// R0000 (ROCm 5) view of a property buffer.
pub struct PropsR0000<'a> {
    raw: &'a [u8],
}

impl<'a> PropsR0000<'a> {
    const MAJOR: usize = 82;
    const MINOR: usize = 83;
    const GCN_ARCH_NAME: usize = 99;

    pub fn new(raw: &'a [u8]) -> Result<Self, ProbeError> {
        check_len(raw, PROPS_R0000_SIZE)?;
        Ok(Self { raw })
    }

    pub fn major(&self) -> i32 {
        read_word(self.raw, Self::MAJOR)
    }

    pub fn minor(&self) -> i32 {
        read_word(self.raw, Self::MINOR)
    }

    pub fn gcn_arch_name(&self) -> String {
        read_c_str(self.raw, Self::GCN_ARCH_NAME)
    }
}

/// R0600 (ROCm 6) view of a property buffer.
pub struct PropsR0600<'a> {
    raw: &'a [u8],
}

impl<'a> PropsR0600<'a> {
    const MAJOR: usize = 90;
    const MINOR: usize = 91;
    const GCN_ARCH_NAME: usize = 290;

    pub fn new(raw: &'a [u8]) -> Result<Self, ProbeError> {
        check_len(raw, PROPS_R0600_SIZE)?;
        Ok(Self { raw })
    }

    pub fn major(&self) -> i32 {
        read_word(self.raw, Self::MAJOR)
    }

    pub fn minor(&self) -> i32 {
        read_word(self.raw, Self::MINOR)
    }

    pub fn gcn_arch_name(&self) -> String {
        read_c_str(self.raw, Self::GCN_ARCH_NAME)
    }
}

fn capability(major: i32, minor: i32) -> u32 {
    (major.max(0) as u32)
        .saturating_mul(100)
        .saturating_add((minor.max(0) as u32).saturating_mul(10))
}

fn is_valid_arch(name: &str) -> bool {
    !name.is_empty() && name.starts_with(ARCH_PREFIX)
}

/// Drop feature qualifiers such as `:xnack-` or `:sramecc+`.
pub fn strip_arch_qualifier(name: &str) -> &str {
    match name.find(':') {
        Some(pos) => &name[..pos],
        None => name,
    }
}

/// Decode capability and architecture from a raw property buffer.
///
/// `raw` must be sized for the R0600 layout. Falls back from R0000 to R0600
/// once; a fallback on a pre-ROCm 6 runtime is a [`ProbeError::LayoutMismatch`].
pub fn probe_arch(raw: &[u8], runtime_version: i32) -> Result<ArchInfo, ProbeError> {
    check_len(raw, PROPS_R0600_SIZE)?;

    let r0 = PropsR0000::new(raw)?;
    let mut name = r0.gcn_arch_name();
    let mut cc = capability(r0.major(), r0.minor());
    let mut layout = PropsLayout::R0000;

    if !is_valid_arch(&name) {
        if runtime_version < RUNTIME_VERSION_R0600 {
            return Err(ProbeError::LayoutMismatch { runtime_version });
        }
        let r6 = PropsR0600::new(raw)?;
        name = r6.gcn_arch_name();
        cc = capability(r6.major(), r6.minor());
        layout = PropsLayout::R0600;

        if !is_valid_arch(&name) {
            tracing::warn!(
                "R0600 property layout also yields an unexpected architecture name {:?}",
                name
            );
        }
    }

    Ok(ArchInfo {
        compute_capability: cc,
        mcpu: strip_arch_qualifier(&name).to_string(),
        layout,
    })
}

/// Build a property buffer in the given layout. Test helper.
#[cfg(test)]
pub(crate) fn props_blob(layout: PropsLayout, major: i32, minor: i32, arch: &str) -> Vec<u8> {
    let mut raw = vec![0u8; PROPS_BUFFER_SIZE];
    let (maj, min, name) = match layout {
        PropsLayout::R0000 => (
            PropsR0000::MAJOR,
            PropsR0000::MINOR,
            PropsR0000::GCN_ARCH_NAME,
        ),
        PropsLayout::R0600 => (
            PropsR0600::MAJOR,
            PropsR0600::MINOR,
            PropsR0600::GCN_ARCH_NAME,
        ),
    };
    raw[maj * 4..maj * 4 + 4].copy_from_slice(&major.to_ne_bytes());
    raw[min * 4..min * 4 + 4].copy_from_slice(&minor.to_ne_bytes());
    raw[name * 4..name * 4 + arch.len()].copy_from_slice(arch.as_bytes());
    raw
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_r0000_decode() {
        let raw = props_blob(PropsLayout::R0000, 9, 0, "gfx90a:sramecc+:xnack-");
        let info = probe_arch(&raw, 50_731_921).unwrap();
        assert_eq!(info.compute_capability, 900);
        assert_eq!(info.mcpu, "gfx90a");
        assert_eq!(info.layout, PropsLayout::R0000);
    }

    #[test]
    fn test_r0000_decode_on_rocm6() {
        // ROCm 6 still maps the unversioned symbol to R0000
        let raw = props_blob(PropsLayout::R0000, 11, 0, "gfx1100");
        let info = probe_arch(&raw, 60_032_830).unwrap();
        assert_eq!(info.compute_capability, 1100);
        assert_eq!(info.mcpu, "gfx1100");
        assert_eq!(info.layout, PropsLayout::R0000);
    }

    #[test]
    fn test_fallback_to_r0600() {
        let raw = props_blob(PropsLayout::R0600, 9, 4, "gfx942:sramecc+:xnack-");
        let info = probe_arch(&raw, 60_100_000).unwrap();
        assert_eq!(info.compute_capability, 940);
        assert_eq!(info.mcpu, "gfx942");
        assert_eq!(info.layout, PropsLayout::R0600);
    }

    #[test]
    fn test_fallback_at_exact_threshold() {
        let raw = props_blob(PropsLayout::R0600, 9, 0, "gfx90a");
        let info = probe_arch(&raw, RUNTIME_VERSION_R0600).unwrap();
        assert_eq!(info.layout, PropsLayout::R0600);
    }

    #[test]
    fn test_r0600_on_rocm5_is_fatal() {
        let raw = props_blob(PropsLayout::R0600, 9, 0, "gfx90a");
        let err = probe_arch(&raw, 50_700_000).unwrap_err();
        assert_eq!(
            err,
            ProbeError::LayoutMismatch {
                runtime_version: 50_700_000
            }
        );
        assert!(err.to_string().contains("50700000"));
    }

    #[test]
    fn test_wrong_prefix_triggers_fallback() {
        // A non-gfx name in the R0000 slot is not trusted
        let mut raw = props_blob(PropsLayout::R0600, 10, 3, "gfx1030");
        let at = 99 * 4;
        raw[at..at + 3].copy_from_slice(b"abc");
        let info = probe_arch(&raw, 60_000_000).unwrap();
        assert_eq!(info.mcpu, "gfx1030");
        assert_eq!(info.compute_capability, 1030);
    }

    #[test]
    fn test_truncated_buffer() {
        let raw = vec![0u8; PROPS_R0000_SIZE];
        assert_eq!(
            probe_arch(&raw, 60_000_000).unwrap_err(),
            ProbeError::Truncated {
                len: PROPS_R0000_SIZE,
                required: PROPS_R0600_SIZE
            }
        );
    }

    #[test]
    fn test_strip_arch_qualifier() {
        assert_eq!(strip_arch_qualifier("gfx90a:xnack-"), "gfx90a");
        assert_eq!(strip_arch_qualifier("gfx1100"), "gfx1100");
        assert_eq!(strip_arch_qualifier(""), "");
    }

    #[test]
    fn test_unterminated_name_is_bounded() {
        let mut raw = vec![b'x'; PROPS_BUFFER_SIZE];
        raw[99 * 4..99 * 4 + 3].copy_from_slice(b"gfx");
        let info = probe_arch(&raw, 50_000_000).unwrap();
        assert_eq!(info.mcpu.len(), 256);
    }
}
