// SPDX-License-Identifier: MIT OR Apache-2.0
//! Instance-selection algorithms for load balancing.
//!
//! Every selector first filters to healthy instances; an empty or
//! all-unhealthy input always yields `None`. `round_robin`'s cursor is a
//! shared `Arc<AtomicUsize>` so the same [`Selector`] value can be handed to
//! multiple concurrent callers and the cursor survives list-size changes,
//! wrapping naturally on shrink.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use meshrpc_config::{ConfigWarning, LoadBalance};
use meshrpc_discovery::ServiceInstance;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks one instance out of a discovered set.
///
/// Cheap to clone: `RoundRobin`'s cursor is `Arc`-shared, every other
/// variant is stateless.
#[derive(Debug, Clone)]
pub enum Selector {
    /// Iterate in input order, return the first healthy instance.
    First,
    /// Rotate through healthy instances with a shared cursor.
    RoundRobin(Arc<AtomicUsize>),
    /// Uniformly random healthy instance.
    Random,
    /// Random instance weighted by [`ServiceInstance::weight`].
    Weighted,
}

impl Selector {
    /// Build a selector for the given load-balance policy.
    #[must_use]
    pub fn new(load_balance: LoadBalance) -> Self {
        match load_balance {
            LoadBalance::First => Self::First,
            LoadBalance::RoundRobin => Self::RoundRobin(Arc::new(AtomicUsize::new(0))),
            LoadBalance::Random => Self::Random,
            LoadBalance::Weighted => Self::Weighted,
        }
    }

    /// Build a selector from a free-form strategy name. Any name other than
    /// `"first"`, `"round_robin"`, `"random"`, `"weighted"` degrades to
    /// `first`.
    #[must_use]
    pub fn by_name(name: &str) -> Self {
        match name {
            "round_robin" => Self::RoundRobin(Arc::new(AtomicUsize::new(0))),
            "random" => Self::Random,
            "weighted" => Self::Weighted,
            _ => Self::First,
        }
    }

    /// Select one healthy instance, or `None` if `instances` is empty or
    /// every instance is unhealthy.
    #[must_use]
    pub fn select(&self, instances: &[ServiceInstance]) -> Option<ServiceInstance> {
        let healthy: Vec<&ServiceInstance> = instances.iter().filter(|i| i.healthy).collect();
        if healthy.is_empty() {
            return None;
        }
        match self {
            Self::First => Some(healthy[0].clone()),
            Self::RoundRobin(cursor) => {
                let n = cursor.fetch_add(1, Ordering::Relaxed);
                Some(healthy[n % healthy.len()].clone())
            }
            Self::Random => {
                let idx = rand::rng().random_range(0..healthy.len());
                Some(healthy[idx].clone())
            }
            Self::Weighted => select_weighted(&healthy),
        }
    }

    /// Flag a `Weighted` selector whose healthy instance set carries no
    /// signal — every instance reports the same weight, making the pick
    /// equivalent to `random`. `None` for any other selector, or for fewer
    /// than two healthy instances (nothing to be uneven about).
    #[must_use]
    pub fn weight_warning(&self, service_key: &str, instances: &[ServiceInstance]) -> Option<ConfigWarning> {
        if !matches!(self, Self::Weighted) {
            return None;
        }
        let healthy: Vec<&ServiceInstance> = instances.iter().filter(|i| i.healthy).collect();
        if healthy.len() < 2 {
            return None;
        }
        let first_weight = healthy[0].weight;
        healthy
            .iter()
            .all(|i| i.weight == first_weight)
            .then(|| ConfigWarning::UniformWeights {
                service_key: service_key.to_string(),
            })
    }
}

fn select_weighted(healthy: &[&ServiceInstance]) -> Option<ServiceInstance> {
    let total: u64 = healthy.iter().map(|i| u64::from(i.weight)).sum();
    if total == 0 {
        // Every weight is zero: all instances are equally eligible.
        let idx = rand::rng().random_range(0..healthy.len());
        return Some(healthy[idx].clone());
    }
    let mut target = rand::rng().random_range(0..total);
    for instance in healthy {
        let weight = u64::from(instance.weight);
        if target < weight {
            return Some((*instance).clone());
        }
        target -= weight;
    }
    // Floating-point-free integer arithmetic above is exact, so this is
    // unreachable, but fall back to the last instance rather than panicking.
    healthy.last().map(|i| (*i).clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &str, weight: u32, healthy: bool) -> ServiceInstance {
        ServiceInstance {
            service: "auth-app".into(),
            address: format!("10.0.0.{name}:9000"),
            port: 9000,
            weight,
            healthy,
        }
    }

    #[test]
    fn empty_input_yields_none_for_every_strategy() {
        for selector in [
            Selector::First,
            Selector::RoundRobin(Arc::new(AtomicUsize::new(0))),
            Selector::Random,
            Selector::Weighted,
        ] {
            assert!(selector.select(&[]).is_none());
        }
    }

    #[test]
    fn all_unhealthy_yields_none() {
        let instances = vec![instance("1", 1, false), instance("2", 1, false)];
        assert!(Selector::First.select(&instances).is_none());
    }

    #[test]
    fn first_returns_first_healthy_in_input_order() {
        let instances = vec![instance("1", 1, false), instance("2", 1, true), instance("3", 1, true)];
        let picked = Selector::First.select(&instances).unwrap();
        assert_eq!(picked.address, "10.0.0.2:9000");
    }

    #[test]
    fn round_robin_cycles_through_every_healthy_instance_exactly_once_per_k() {
        let instances = vec![instance("1", 1, true), instance("2", 1, true), instance("3", 1, true)];
        let selector = Selector::new(LoadBalance::RoundRobin);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..3 {
            let picked = selector.select(&instances).unwrap();
            seen.insert(picked.address);
        }
        assert_eq!(seen.len(), 3);
        // A second full cycle revisits the same three addresses.
        let mut second_cycle = std::collections::HashSet::new();
        for _ in 0..3 {
            let picked = selector.select(&instances).unwrap();
            second_cycle.insert(picked.address);
        }
        assert_eq!(seen, second_cycle);
    }

    #[test]
    fn round_robin_wraps_after_list_shrinks() {
        let selector = Selector::RoundRobin(Arc::new(AtomicUsize::new(5)));
        let instances = vec![instance("1", 1, true), instance("2", 1, true)];
        // Cursor (5) exceeds the healthy count (2); must still return a
        // valid pick via modulo wraparound rather than panicking.
        let picked = selector.select(&instances).unwrap();
        assert!(["10.0.0.1:9000", "10.0.0.2:9000"].contains(&picked.address.as_str()));
    }

    #[test]
    fn weighted_never_picks_zero_weight_when_others_are_nonzero() {
        let instances = vec![instance("1", 0, true), instance("2", 10, true)];
        for _ in 0..200 {
            let picked = Selector::Weighted.select(&instances).unwrap();
            assert_eq!(picked.address, "10.0.0.2:9000");
        }
    }

    #[test]
    fn weighted_degrades_to_uniform_when_all_weights_are_zero() {
        let instances = vec![instance("1", 0, true), instance("2", 0, true)];
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let picked = Selector::Weighted.select(&instances).unwrap();
            seen.insert(picked.address);
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn weight_warning_fires_when_every_healthy_instance_shares_a_weight() {
        let instances = vec![instance("1", 5, true), instance("2", 5, true), instance("3", 5, false)];
        let warning = Selector::Weighted.weight_warning("auth-app", &instances);
        assert_eq!(
            warning,
            Some(meshrpc_config::ConfigWarning::UniformWeights {
                service_key: "auth-app".to_string()
            })
        );
    }

    #[test]
    fn weight_warning_is_silent_when_weights_differ() {
        let instances = vec![instance("1", 5, true), instance("2", 10, true)];
        assert_eq!(Selector::Weighted.weight_warning("auth-app", &instances), None);
    }

    #[test]
    fn weight_warning_is_silent_for_non_weighted_selectors() {
        let instances = vec![instance("1", 5, true), instance("2", 5, true)];
        assert_eq!(Selector::First.weight_warning("auth-app", &instances), None);
    }

    #[test]
    fn weight_warning_is_silent_with_fewer_than_two_healthy_instances() {
        let instances = vec![instance("1", 5, true), instance("2", 5, false)];
        assert_eq!(Selector::Weighted.weight_warning("auth-app", &instances), None);
    }

    #[test]
    fn unknown_strategy_name_degrades_to_first() {
        let selector = Selector::by_name("least_latency");
        assert!(matches!(selector, Selector::First));
    }

    #[test]
    fn known_strategy_names_resolve_correctly() {
        assert!(matches!(Selector::by_name("first"), Selector::First));
        assert!(matches!(Selector::by_name("round_robin"), Selector::RoundRobin(_)));
        assert!(matches!(Selector::by_name("random"), Selector::Random));
        assert!(matches!(Selector::by_name("weighted"), Selector::Weighted));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn healthy_instances(count: usize) -> Vec<ServiceInstance> {
        (0..count)
            .map(|i| ServiceInstance::new("auth-app", format!("10.0.0.{i}:9000"), 9000, 1))
            .collect()
    }

    proptest! {
        #[test]
        fn round_robin_visits_every_instance_exactly_once_per_full_cycle(count in 1usize..20) {
            let instances = healthy_instances(count);
            let selector = Selector::new(LoadBalance::RoundRobin);
            let mut seen = std::collections::HashSet::new();
            for _ in 0..count {
                seen.insert(selector.select(&instances).unwrap().address);
            }
            prop_assert_eq!(seen.len(), count);
        }

        #[test]
        fn selection_never_returns_an_unhealthy_instance(
            healthy_count in 0usize..10,
            unhealthy_count in 0usize..10,
        ) {
            let mut instances = healthy_instances(healthy_count);
            instances.extend((0..unhealthy_count).map(|i| {
                ServiceInstance::new("auth-app", format!("10.0.1.{i}:9000"), 9000, 1).unhealthy()
            }));
            for selector in [Selector::First, Selector::new(LoadBalance::RoundRobin), Selector::Random, Selector::Weighted] {
                match selector.select(&instances) {
                    Some(picked) => prop_assert!(picked.healthy),
                    None => prop_assert_eq!(healthy_count, 0),
                }
            }
        }
    }
}
