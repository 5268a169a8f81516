//!
//! Cache keys for host identifiers.
//!
//! Keys only contain ASCII alphanumerics and `_`, so they can be used as file names in the
//! offline cache directory. Identifiers that needed substitution get a hash suffix of the
//! original identifier so that `a-b` and `a.b` never share a key.
//! Keys are never decoded, the caller always has the original identifier.

const SUBSTITUTE: char = '_';

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Encode a host identifier into a filesystem safe cache key
#[must_use]
pub fn encode(host_id: &str) -> String {
    let mut substituted = false;
    let mut key: String = host_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c
            } else {
                substituted = true;
                SUBSTITUTE
            }
        })
        .collect();

    if substituted || key.is_empty() {
        key.push(SUBSTITUTE);
        key.push_str(&format!("{:016x}", fnv1a(host_id.as_bytes())));
    }
    key
}

// FNV-1a is stable across compiler releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
mod test {
    use super::encode;
    use std::collections::HashSet;

    #[test]
    fn plain_identifiers_are_kept() {
        assert_eq!(encode("sensor42"), "sensor42");
    }

    #[test]
    fn keys_are_filesystem_safe() {
        for id in ["ec2-sensor-testing-cicd-1712", "a/../../etc/passwd", "x y\tz", "ünïcode"] {
            let key = encode(id);
            assert!(
                key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'),
                "{key}"
            );
        }
    }

    #[test]
    fn encode_is_deterministic() {
        let id = "ec2-sensor-testing-cicd-codebuff-1712345678";
        assert_eq!(encode(id), encode(id));
    }

    #[test]
    fn no_collisions_between_realistic_ids() {
        let ids = [
            "ec2-sensor-testing-cicd-codebuff-1712345678",
            "ec2-sensor-testing-cicd-codebuff-1712345679",
            "ec2_sensor_testing_cicd_codebuff_1712345678",
            "ec2.sensor.testing.cicd.codebuff.1712345678",
            "ec2-sensor-release-qa-alice-1700000000",
            "ec2-sensor-release-qa-alice-1700000000-b",
            "sensor-a",
            "sensor_a",
            "sensora",
            "",
            "-",
            "_",
        ];
        let keys: HashSet<String> = ids.iter().map(|id| encode(id)).collect();
        assert_eq!(keys.len(), ids.len());
    }
}
