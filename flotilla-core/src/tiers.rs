//! Node size tiers and provider size slugs.
//!
//! Vertical scaling moves exactly one step in this ordered table.

use crate::error::{FlotillaError, FlotillaResult};

/// Ordered `(vcpu, memory_mib)` tiers, ascending.
pub const SIZE_TIERS: [(u32, u32); 9] = [
    (1, 1024),
    (1, 2048),
    (2, 2048),
    (2, 4096),
    (4, 8192),
    (8, 16384),
    (16, 32768),
    (24, 49152),
    (32, 65536),
];

/// Direction of a vertical step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TierDirection {
    Up,
    Down,
}

/// Provider slug for a capacity, e.g. `(2, 4096)` → `s-2vcpu-4gb`.
pub fn slug_for(vcpu: u32, memory_mib: u32) -> FlotillaResult<String> {
    if !SIZE_TIERS.contains(&(vcpu, memory_mib)) {
        return Err(FlotillaError::Validation(format!(
            "no size slug for {} vCPU / {} MiB; known tiers: {:?}",
            vcpu, memory_mib, SIZE_TIERS
        )));
    }
    Ok(format!("s-{}vcpu-{}gb", vcpu, memory_mib / 1024))
}

/// Parse a provider slug back to `(vcpu, memory_mib)`.
///
/// Slugs outside the declared tier set are parsed best-effort from the
/// `s-{n}vcpu-{m}gb` shape; anything else is a validation error.
pub fn capacity_for(slug: &str) -> FlotillaResult<(u32, u32)> {
    for (vcpu, memory_mib) in SIZE_TIERS {
        if slug_for(vcpu, memory_mib)? == slug {
            return Ok((vcpu, memory_mib));
        }
    }

    let parts: Vec<&str> = slug.split('-').collect();
    let vcpu = parts
        .iter()
        .find(|p| p.ends_with("vcpu"))
        .and_then(|p| p.trim_end_matches("vcpu").parse::<u32>().ok());
    let mem_gb = parts
        .iter()
        .find(|p| p.ends_with("gb"))
        .and_then(|p| p.trim_end_matches("gb").parse::<u32>().ok());

    match (vcpu, mem_gb) {
        (Some(v), Some(g)) => Ok((v, g * 1024)),
        _ => Err(FlotillaError::Validation(format!(
            "cannot parse size slug: {}",
            slug
        ))),
    }
}

/// The adjacent tier in the given direction, or `None` at a boundary.
///
/// A capacity that is not exactly on the table snaps to the closest tier by
/// memory before stepping.
pub fn next_tier(vcpu: u32, memory_mib: u32, direction: TierDirection) -> Option<(u32, u32)> {
    let idx = match SIZE_TIERS.iter().position(|t| *t == (vcpu, memory_mib)) {
        Some(idx) => idx,
        None => {
            let closest = (0..SIZE_TIERS.len())
                .min_by_key(|i| SIZE_TIERS[*i].1.abs_diff(memory_mib))
                .expect("tier table is non-empty");
            match direction {
                TierDirection::Up => {
                    let stepped = (closest + 1).min(SIZE_TIERS.len() - 1);
                    return (stepped != closest).then(|| SIZE_TIERS[stepped]);
                }
                TierDirection::Down => {
                    let stepped = closest.saturating_sub(1);
                    return (stepped != closest).then(|| SIZE_TIERS[stepped]);
                }
            }
        }
    };

    match direction {
        TierDirection::Up => SIZE_TIERS.get(idx + 1).copied(),
        TierDirection::Down => idx.checked_sub(1).map(|i| SIZE_TIERS[i]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_round_trip_over_declared_tiers() {
        for (vcpu, memory_mib) in SIZE_TIERS {
            let slug = slug_for(vcpu, memory_mib).unwrap();
            assert_eq!(capacity_for(&slug).unwrap(), (vcpu, memory_mib));
        }
    }

    #[test]
    fn unknown_capacity_rejected() {
        assert!(slug_for(3, 7777).is_err());
    }

    #[test]
    fn off_table_slug_parsed_best_effort() {
        assert_eq!(capacity_for("s-6vcpu-16gb").unwrap(), (6, 16384));
        assert!(capacity_for("gd-gpu-large").is_err());
    }

    #[test]
    fn stepping_up_and_down() {
        assert_eq!(next_tier(2, 4096, TierDirection::Up), Some((4, 8192)));
        assert_eq!(next_tier(2, 4096, TierDirection::Down), Some((2, 2048)));
        assert_eq!(next_tier(32, 65536, TierDirection::Up), None);
        assert_eq!(next_tier(1, 1024, TierDirection::Down), None);
    }

    #[test]
    fn off_table_capacity_snaps_to_closest() {
        // 3000 MiB sits closest to the (2, 2048) tier
        assert_eq!(next_tier(2, 3000, TierDirection::Up), Some((2, 4096)));
        assert_eq!(next_tier(2, 3000, TierDirection::Down), Some((1, 2048)));
    }
}
