//! CPU affinity for cluster threads and resource pool workers

use tracing::{debug, warn};

/// Affinity value for the `index`-th cluster or pool.
///
/// Indices beyond the list wrap around.
pub fn affinity_for(affinities: &[usize], index: usize) -> usize {
    affinities[index % affinities.len()]
}

/// Pin the calling thread to `core`.
///
/// Pinning is best effort: on hosts without that core, or where the
/// scheduler refuses, the thread keeps running unpinned.
pub fn pin_current_thread(core: usize) -> bool {
    let available = core_affinity::get_core_ids().unwrap_or_default();
    if !available.iter().any(|c| c.id == core) {
        warn!(
            "Core {} not available to {:?} ({} cores visible), running unpinned",
            core,
            std::thread::current().name(),
            available.len()
        );
        return false;
    }

    let pinned = core_affinity::set_for_current(core_affinity::CoreId { id: core });
    if pinned {
        debug!("Pinned {:?} to core {}", std::thread::current().name(), core);
    } else {
        warn!(
            "Could not pin {:?} to core {}, running unpinned",
            std::thread::current().name(),
            core
        );
    }
    pinned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_wraps() {
        let affinities = [4, 5, 6];
        assert_eq!(affinity_for(&affinities, 0), 4);
        assert_eq!(affinity_for(&affinities, 2), 6);
        assert_eq!(affinity_for(&affinities, 3), 4);
    }

    #[test]
    fn test_pin_to_missing_core_is_not_fatal() {
        let handle = std::thread::spawn(|| pin_current_thread(1 << 20));
        assert!(!handle.join().unwrap());
    }
}
