//! # Kernel name demangling
//!
//! Kernels restored from Taichi's offline cache carry mangled names of the
//! form `{primal}{key}_{cc}`, where `key` is `T` followed by 64 lowercase hex
//! digits and `cc` is the decimal XOR of the byte sums of `primal` and `key`.
//! Bytes are summed as signed `char` widened to `size_t`, as the cache does.
//! Profiler labels use the primal name when it can be recovered.

/// Length of an offline-cache key, `T` included.
pub const KEY_LEN: usize = 65;

/// A successfully demangled kernel name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Demangled {
    pub primal: String,
    pub key: String,
}

/// Recovers human-readable kernel names for trace labels.
pub trait Demangler: Send + Sync {
    fn try_demangle(&self, name: &str) -> Option<Demangled>;
}

/// Demangler for offline-cache kernel names.
#[derive(Copy, Clone, Debug, Default)]
pub struct OfflineCacheDemangler;

fn byte_sum(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_add(b as i8 as u64))
}

fn checksum(primal: &[u8], key: &[u8]) -> u64 {
    byte_sum(primal) ^ byte_sum(key)
}

fn is_lower_hex(b: u8) -> bool {
    b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
}

fn is_valid_key(key: &[u8]) -> bool {
    key.len() == KEY_LEN && key[0] == b'T' && key[1..].iter().all(|&b| is_lower_hex(b))
}

/// Build the mangled name for `primal` under `key`. Returns None if `key` is
/// not a valid offline-cache key.
pub fn mangle(primal: &str, key: &str) -> Option<String> {
    if !is_valid_key(key.as_bytes()) {
        return None;
    }
    Some(format!(
        "{}{}_{}",
        primal,
        key,
        checksum(primal.as_bytes(), key.as_bytes())
    ))
}

impl Demangler for OfflineCacheDemangler {
    fn try_demangle(&self, name: &str) -> Option<Demangled> {
        let (head, digits) = name.rsplit_once('_')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let expected: u64 = digits.parse().ok()?;

        // The key is ASCII, so a valid key starts on a char boundary
        let split = head.len().checked_sub(KEY_LEN)?;
        let (primal, key) = (head.get(..split)?, head.get(split..)?);
        if !is_valid_key(key.as_bytes()) {
            return None;
        }
        if expected != checksum(primal.as_bytes(), key.as_bytes()) {
            return None;
        }

        Some(Demangled {
            primal: primal.to_string(),
            key: key.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> String {
        format!("T{}", "0123456789abcdef".repeat(4))
    }

    #[test]
    fn test_demangle_recovers_primal() {
        let mangled = mangle("matmul_c4_0_kernel_0_range_for", &key()).unwrap();
        let demangled = OfflineCacheDemangler.try_demangle(&mangled).unwrap();
        assert_eq!(demangled.primal, "matmul_c4_0_kernel_0_range_for");
        assert_eq!(demangled.key, key());
    }

    #[test]
    fn test_plain_name_is_not_demangled() {
        assert_eq!(OfflineCacheDemangler.try_demangle("saxpy_kernel"), None);
        assert_eq!(OfflineCacheDemangler.try_demangle(""), None);
    }

    #[test]
    fn test_checksum_is_decimal_xor_of_byte_sums() {
        // "ab" sums to 195; the key sums to 84 + 4 * (48+...+57 + 97+...+102)
        let key = key();
        let key_sum: u64 = key.bytes().map(u64::from).sum();
        assert_eq!(key_sum, 84 + 4 * (525 + 597));
        let mangled = mangle("ab", &key).unwrap();
        assert_eq!(mangled, format!("ab{}_{}", key, 195 ^ key_sum));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mangled = mangle("fill", &key()).unwrap();
        let (head, digits) = mangled.rsplit_once('_').unwrap();
        let bad = digits.parse::<u64>().unwrap() + 1;
        let tampered = format!("{}_{}", head, bad);
        assert_eq!(OfflineCacheDemangler.try_demangle(&tampered), None);
        let signed = format!("{}_+{}", head, digits);
        assert_eq!(OfflineCacheDemangler.try_demangle(&signed), None);
    }

    #[test]
    fn test_primal_with_underscores() {
        let mangled = mangle("fill_tensor_c6_0_kernel_0", &key()).unwrap();
        let demangled = OfflineCacheDemangler.try_demangle(&mangled).unwrap();
        assert_eq!(demangled.primal, "fill_tensor_c6_0_kernel_0");
    }

    #[test]
    fn test_invalid_key_rejected() {
        assert_eq!(mangle("fill", "T1234"), None);
        let upper = format!("T{}", "ABCDEF0123456789".repeat(4));
        assert_eq!(mangle("fill", &upper), None);
    }

    #[test]
    fn test_non_ascii_primal() {
        let mangled = mangle("核函数", &key()).unwrap();
        // High bytes count as negative chars, so the sum wraps
        let primal_sum = byte_sum("核函数".as_bytes());
        assert!(primal_sum > u64::MAX / 2);
        let demangled = OfflineCacheDemangler.try_demangle(&mangled).unwrap();
        assert_eq!(demangled.primal, "核函数");
    }
}
