use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use std::collections::HashSet;

/// Rounds `value` to `precision` decimal places.
pub fn round_float(value: f64, precision: u32) -> f64 {
    let ratio = 10f64.powi(precision as i32);
    (value * ratio).round() / ratio
}

/// Converts a byte count to gigabytes (10^9), rounded to two decimals.
pub fn bytes_to_gb(bytes: i64) -> f64 {
    round_float(bytes as f64 / 1_000_000_000.0, 2)
}

/// A fresh base64-encoded 32-byte key, suitable for Shadowsocks 2022 ciphers.
pub fn key32() -> String {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    STANDARD.encode(key)
}

/// Whether all non-zero ports are pairwise distinct. Zero means "disabled".
pub fn ports_unique(ports: &[u16]) -> bool {
    let mut seen = HashSet::new();
    ports.iter().filter(|p| **p != 0).all(|p| seen.insert(*p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_float() {
        assert_eq!(round_float(6.542450944, 2), 6.54);
        assert_eq!(round_float(0.005, 2), 0.01);
        assert_eq!(round_float(1.0, 2), 1.0);
    }

    #[test]
    fn test_bytes_to_gb() {
        assert_eq!(bytes_to_gb(0), 0.0);
        assert_eq!(bytes_to_gb(100_000_000 + 6_442_450_944), 6.54);
    }

    #[test]
    fn test_key32_is_random_and_decodes_to_32_bytes() {
        let a = key32();
        let b = key32();
        assert_ne!(a, b);
        assert_eq!(STANDARD.decode(&a).unwrap().len(), 32);
    }

    #[test]
    fn test_ports_unique() {
        assert!(ports_unique(&[0, 0, 0]));
        assert!(ports_unique(&[9000, 0, 9001]));
        assert!(!ports_unique(&[9000, 9000, 0]));
    }
}
