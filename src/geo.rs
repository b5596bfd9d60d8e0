//! Geohash prefix distance estimate used by the scoring function.
//!
//! The mapping from `requester_geozone` to a geohash is informal; the geozone
//! string is treated as a geohash prefix directly and matched on
//! common-prefix length.

/// `lookup[common_prefix_length(a, b)]`.
const DISTANCE_KM_BY_PREFIX_LEN: [f64; 7] = [5000.0, 5000.0, 1250.0, 156.0, 39.0, 5.0, 1.2];

/// Latency estimate used when either geohash is missing or empty.
const UNKNOWN_GEOHASH_LATENCY_MS: f64 = 50.0;

pub fn common_prefix_length(a: &str, b: &str) -> usize {
    a.chars()
        .zip(b.chars())
        .take_while(|(x, y)| x == y)
        .count()
}

fn distance_km(a: &str, b: &str) -> f64 {
    let len = common_prefix_length(a, b).min(DISTANCE_KM_BY_PREFIX_LEN.len() - 1);
    DISTANCE_KM_BY_PREFIX_LEN[len]
}

/// `estimated_latency_ms(r, n)`.
pub fn estimated_latency_ms(requester_geohash: &str, node_geohash: &str) -> f64 {
    if requester_geohash.is_empty() || node_geohash.is_empty() {
        return UNKNOWN_GEOHASH_LATENCY_MS;
    }
    1.0 + 0.1 * distance_km(requester_geohash, node_geohash)
}

/// Geohash base32 alphabet: digits plus lowercase letters, excluding `a`,
/// `i`, `l`, `o` (dropped from the real geohash alphabet to avoid visual
/// ambiguity with `0`/`1`).
const GEOHASH_ALPHABET: &str = "0123456789bcdefghjkmnpqrstuvwxyz";

/// `geohash` is lowercase base32, length 6.
pub fn is_valid_geohash(s: &str) -> bool {
    s.len() == 6 && s.chars().all(|c| GEOHASH_ALPHABET.contains(c))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_length_matches_shared_chars() {
        assert_eq!(common_prefix_length("9q8yyk", "9q8yyx"), 5);
        assert_eq!(common_prefix_length("9q8yyk", "abcdef"), 0);
        assert_eq!(common_prefix_length("9q8yyk", "9q8yyk"), 6);
    }

    #[test]
    fn missing_geohash_uses_flat_latency() {
        assert_eq!(estimated_latency_ms("", "9q8yyk"), 50.0);
        assert_eq!(estimated_latency_ms("9q8yyk", ""), 50.0);
    }

    #[test]
    fn exact_match_is_cheapest() {
        let same = estimated_latency_ms("9q8yyk", "9q8yyk");
        let far = estimated_latency_ms("9q8yyk", "abcdef");
        assert!(same < far);
        assert_eq!(same, 1.0 + 0.1 * 1.2);
        assert_eq!(far, 1.0 + 0.1 * 5000.0);
    }

    #[test]
    fn valid_geohash_rules() {
        assert!(is_valid_geohash("9q8yyk"));
        assert!(!is_valid_geohash("9Q8YYK"));
        assert!(!is_valid_geohash("short"));
        assert!(!is_valid_geohash("aaaaaa"), "a/i/l/o are excluded from the geohash alphabet");
        assert!(!is_valid_geohash("iiiiii"));
    }
}
