const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

fn fnv1a_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

/// Stable FNV-1a hash, used for fingerprints that must not depend on the std hasher seed.
pub fn fnv1a_hash(bytes: &[u8]) -> u64 {
    fnv1a_bytes(FNV1A_OFFSET, bytes)
}

/// Stable override hash for a caller-chosen dispatch label.
///
/// Two wrapped functions called with the same label share one dispatch cache slot.
pub fn override_hash(label: &str) -> u64 {
    fnv1a_hash(label.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_vectors() {
        assert_eq!(fnv1a_hash(b""), FNV1A_OFFSET);
        assert_eq!(fnv1a_hash(b"a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn override_hash_depends_only_on_label() {
        assert_eq!(override_hash("kernel"), override_hash("kernel"));
        assert_ne!(override_hash("kernel"), override_hash("kernel2"));
    }
}
