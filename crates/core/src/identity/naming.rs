//! Generated account handles.

use uuid::Uuid;

const FIRST_NAMES: &[&str] = &[
    "ada", "alan", "barbara", "claude", "dennis", "edsger", "frances", "grace", "hedy", "ivan",
    "john", "ken", "linus", "margaret", "niklaus", "radia", "sophie", "tim", "vint", "whitfield",
];

const LAST_NAMES: &[&str] = &[
    "allen", "backus", "cerf", "dijkstra", "hamilton", "hopper", "kernighan", "knuth",
    "lamarr", "liskov", "lovelace", "perlman", "ritchie", "shannon", "sutherland", "thompson",
    "torvalds", "turing", "wilson", "wirth",
];

/// `first.last.xxxx@domain` with a random hex suffix.
pub fn generate_handle(domain: &str) -> String {
    let bytes = *Uuid::new_v4().as_bytes();
    let first = FIRST_NAMES[bytes[0] as usize % FIRST_NAMES.len()];
    let last = LAST_NAMES[bytes[1] as usize % LAST_NAMES.len()];
    format!(
        "{}.{}.{:02x}{:02x}@{}",
        first, last, bytes[2], bytes[3], domain
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_handle_shape() {
        let handle = generate_handle("example.com");
        let (local, domain) = handle.split_once('@').unwrap();
        assert_eq!(domain, "example.com");

        let parts: Vec<&str> = local.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(FIRST_NAMES.contains(&parts[0]));
        assert!(LAST_NAMES.contains(&parts[1]));
        assert_eq!(parts[2].len(), 4);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_handles_vary() {
        let handles: HashSet<String> = (0..50).map(|_| generate_handle("example.com")).collect();
        assert!(handles.len() > 40);
    }
}
