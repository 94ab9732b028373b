//! Thread-balance optimizer
//!
//! Pure functions splitting a thread budget between hack, grow and the two
//! stabilizing weakens. Efficiency is `hack / total`.

use ramlet_core::{HackConstants, ThreadPlan};

/// Grow threads needed for a money multiplier
pub trait GrowthModel {
    fn grow_threads(&self, multiplier: f64) -> f64;
}

impl<F: Fn(f64) -> f64> GrowthModel for F {
    fn grow_threads(&self, multiplier: f64) -> f64 {
        self(multiplier)
    }
}

/// Largest fraction of a target's money a single batch may take
pub const MAX_HACK_PERCENT: f64 = 0.99;

/// What the optimizer needs to know about a target
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TargetProfile {
    /// Money fraction one hack thread takes
    pub hack_fraction: f64,
    pub constants: HackConstants,
}

/// Search bounds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchLimits {
    /// Upper bound of the linear scan over hack threads
    pub scan_limit: u32,
    /// Iteration ceiling of the fallback binary search
    pub search_iterations: u32,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            scan_limit: 500,
            search_iterations: 64,
        }
    }
}

/// How a split was found
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Split {
    pub plan: ThreadPlan,
    /// Found at the first local efficiency peak rather than by the budget fallback
    pub at_peak: bool,
}

fn ceil_threads(value: f64) -> u32 {
    if value <= 0.0 {
        0
    } else {
        // Absorb float noise such as 3.0000000004 before rounding up.
        (value - 1e-9).ceil() as u32
    }
}

/// Weaken threads needed to bring security from `current` down to `min`
pub fn weaken_threads_needed(current: f64, min: f64, per_thread: f64) -> u32 {
    if per_thread <= 0.0 {
        return 0;
    }
    ceil_threads((current - min) / per_thread)
}

/// Grow threads needed to bring money from `current` up to `max`
pub fn grow_threads_needed(current: f64, max: f64, growth: &impl GrowthModel) -> u32 {
    if current >= max {
        return 0;
    }
    ceil_threads(growth.grow_threads(max / current.max(1.0)))
}

/// Thread counts of one batch built around `hack` threads
pub fn estimate(profile: &TargetProfile, growth: &impl GrowthModel, hack: u32) -> ThreadPlan {
    let constants = &profile.constants;
    let percent = (hack as f64 * profile.hack_fraction).clamp(0.0, MAX_HACK_PERCENT);
    let hack_weaken = weaken_threads_needed(
        hack as f64 * constants.sec_per_hack,
        0.0,
        constants.sec_per_weaken,
    );
    let grow = ceil_threads(growth.grow_threads(1.0 / (1.0 - percent)));
    let grow_weaken = weaken_threads_needed(
        grow as f64 * constants.sec_per_grow,
        0.0,
        constants.sec_per_weaken,
    );
    let sub_total = hack
        .saturating_add(hack_weaken)
        .saturating_add(grow)
        .saturating_add(grow_weaken);
    ThreadPlan {
        hack_fraction: percent,
        hack,
        hack_weaken,
        grow,
        grow_weaken,
        weaken: 0,
        sub_total,
        count: 1,
        total: sub_total,
    }
}

fn efficiency(plan: &ThreadPlan) -> f64 {
    if plan.sub_total == 0 {
        0.0
    } else {
        plan.hack as f64 / plan.sub_total as f64
    }
}

/// Hack threads beyond which a batch would take everything
fn max_hack(profile: &TargetProfile) -> u32 {
    if profile.hack_fraction <= 0.0 {
        return 1;
    }
    ((MAX_HACK_PERCENT / profile.hack_fraction).floor() as u32).max(1)
}

/// Best split of `budget` threads, or `None` if a single hack thread does not fit
pub fn find_best_split(
    profile: &TargetProfile,
    growth: &impl GrowthModel,
    budget: u32,
    limits: SearchLimits,
) -> Option<ThreadPlan> {
    search(profile, growth, budget, limits).map(|split| split.plan)
}

/// Linear scan for the first local peak, then the budget fallback
pub fn search(
    profile: &TargetProfile,
    growth: &impl GrowthModel,
    budget: u32,
    limits: SearchLimits,
) -> Option<Split> {
    let first = estimate(profile, growth, 1);
    if first.sub_total > budget {
        return None;
    }

    let ceiling = limits.scan_limit.min(max_hack(profile));
    let mut before: Option<ThreadPlan> = None;
    let mut previous = first;
    for hack in 2..=ceiling {
        let current = estimate(profile, growth, hack);
        if current.sub_total > budget {
            break;
        }
        if let Some(before) = before {
            let peak = efficiency(&previous);
            if efficiency(&before) < peak && efficiency(&current) < peak {
                return Some(Split {
                    plan: previous,
                    at_peak: true,
                });
            }
        }
        before = Some(previous);
        previous = current;
    }

    Some(Split {
        plan: fit_budget(profile, growth, budget, limits.search_iterations),
        at_peak: false,
    })
}

/// Binary search over the hack percentage for the split that best fills `budget`
fn fit_budget(
    profile: &TargetProfile,
    growth: &impl GrowthModel,
    budget: u32,
    iterations: u32,
) -> ThreadPlan {
    let top = max_hack(profile);
    let to_threads = |percent: f64| -> u32 {
        if profile.hack_fraction <= 0.0 {
            1
        } else {
            ((percent / profile.hack_fraction).floor() as u32).clamp(1, top)
        }
    };

    let mut best = estimate(profile, growth, 1);
    let (mut low, mut high) = (0.0, MAX_HACK_PERCENT);
    let mut last_hack = None;
    for _ in 0..iterations {
        let middle = (low + high) / 2.0;
        let hack = to_threads(middle);
        if last_hack == Some(hack) {
            break;
        }
        last_hack = Some(hack);

        let candidate = estimate(profile, growth, hack);
        if candidate.sub_total <= budget {
            if candidate.sub_total > best.sub_total
                || (candidate.sub_total == best.sub_total && candidate.hack < best.hack)
            {
                best = candidate;
            }
            low = middle;
        } else {
            high = middle;
        }
    }

    // Settle on the largest hack count that still fits.
    while best.hack < top {
        let next = estimate(profile, growth, best.hack + 1);
        if next.sub_total > budget {
            break;
        }
        best = next;
    }
    best
}

/// Split found without a budget, scanning up from a target extraction percentage
///
/// Returns the first local efficiency peak within 100 steps of the start,
/// otherwise the most efficient split seen.
pub fn default_split(profile: &TargetProfile, growth: &impl GrowthModel, target_percent: f64) -> ThreadPlan {
    let top = max_hack(profile);
    let start = if profile.hack_fraction > 0.0 {
        let wanted = (target_percent / 100.0 / profile.hack_fraction).ceil() as u32;
        wanted.saturating_sub(1).clamp(1, top)
    } else {
        1
    };
    let end = start.saturating_add(100).min(top.saturating_add(1));

    let mut best = estimate(profile, growth, start);
    let mut before: Option<ThreadPlan> = None;
    let mut previous = best;
    for hack in start.saturating_add(1)..end {
        let current = estimate(profile, growth, hack);
        if efficiency(&current) > efficiency(&best) {
            best = current;
        }
        if let Some(before) = before {
            let peak = efficiency(&previous);
            if efficiency(&before) < peak && efficiency(&current) < peak {
                return previous;
            }
        }
        before = Some(previous);
        previous = current;
    }
    best
}

/// Batches of `sub_total` threads that fit the budget and the weaken window
pub fn batch_count(budget: u32, sub_total: u32, weaken_ms: u64, batch_spacing_ms: u64) -> u32 {
    if sub_total == 0 {
        return 0;
    }
    let by_budget = budget / sub_total;
    let by_time = if batch_spacing_ms == 0 {
        by_budget
    } else {
        (weaken_ms / batch_spacing_ms).saturating_sub(1) as u32
    };
    by_budget.min(by_time).max(1)
}

/// Full hack plan: best split, repeated as often as budget and timing allow
pub fn plan_hack(
    profile: &TargetProfile,
    growth: &impl GrowthModel,
    budget: u32,
    weaken_ms: u64,
    batch_spacing_ms: u64,
    limits: SearchLimits,
) -> Option<ThreadPlan> {
    let split = search(profile, growth, budget, limits)?;
    let mut plan = split.plan;
    plan.count = if split.at_peak {
        batch_count(budget, plan.sub_total, weaken_ms, batch_spacing_ms)
    } else {
        1
    };
    plan.total = plan.sub_total * plan.count;
    Some(plan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_growth(per_thread: f64) -> impl Fn(f64) -> f64 {
        move |multiplier: f64| {
            if multiplier <= 1.0 {
                0.0
            } else {
                multiplier.ln() / per_thread.ln()
            }
        }
    }

    fn profile(hack_fraction: f64) -> TargetProfile {
        TargetProfile {
            hack_fraction,
            constants: HackConstants::default(),
        }
    }

    #[test]
    fn test_weaken_threads_needed() {
        assert_eq!(weaken_threads_needed(50.0, 10.0, 0.5), 80);
        assert_eq!(weaken_threads_needed(10.0, 10.0, 0.5), 0);
        assert_eq!(weaken_threads_needed(1.2, 1.0, 0.05), 4);
    }

    #[test]
    fn test_estimate_sums_parts() {
        let plan = estimate(&profile(0.02), &log_growth(1.005), 1);
        assert_eq!(plan.hack, 1);
        assert_eq!(plan.hack_weaken, 1);
        assert_eq!(plan.grow, 5);
        assert_eq!(plan.grow_weaken, 1);
        assert_eq!(plan.sub_total, 8);
        assert!((plan.hack_fraction - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_budget_ceiling_picks_highest_fitting_split() {
        let profile = profile(0.02);
        let growth = log_growth(1.005);
        let plan = find_best_split(&profile, &growth, 50, SearchLimits::default()).unwrap();
        assert_eq!(plan.hack, 8);
        assert!(plan.sub_total <= 50);
        assert!(estimate(&profile, &growth, plan.hack + 1).sub_total > 50);
    }

    #[test]
    fn test_never_exceeds_budget() {
        let growth = log_growth(1.003);
        for fraction in [0.001, 0.004, 0.02, 0.1] {
            for budget in [4, 9, 17, 50, 128, 1000] {
                if let Some(plan) =
                    find_best_split(&profile(fraction), &growth, budget, SearchLimits::default())
                {
                    assert!(plan.sub_total <= budget, "{} > {}", plan.sub_total, budget);
                }
            }
        }
    }

    #[test]
    fn test_first_local_peak_wins() {
        let growth = |multiplier: f64| 5.0 * multiplier.powi(4);
        let split = search(&profile(0.05), &growth, 100, SearchLimits::default()).unwrap();
        assert!(split.at_peak);
        assert_eq!(split.plan.hack, 5);
        assert_eq!(split.plan.sub_total, 24);
    }

    #[test]
    fn test_default_split_scans_from_target_percent() {
        let growth = |multiplier: f64| 5.0 * multiplier.powi(4);
        let plan = default_split(&profile(0.05), &growth, 10.0);
        assert_eq!(plan.hack, 5);

        // Starting past the peak settles on the best split seen.
        let late = default_split(&profile(0.05), &growth, 50.0);
        assert!(late.hack >= 9);
        assert_eq!(late.count, 1);
    }

    #[test]
    fn test_default_split_tiny_hack_fraction() {
        let growth = |multiplier: f64| 5.0 * multiplier.powi(4);
        let plan = default_split(&profile(1e-12), &growth, 10.0);
        assert!(plan.hack >= 1);
        assert!(plan.sub_total >= plan.hack);
    }

    #[test]
    fn test_nothing_fits() {
        let plan = find_best_split(&profile(0.02), &log_growth(1.005), 7, SearchLimits::default());
        assert!(plan.is_none());
    }

    #[test]
    fn test_batch_count() {
        assert_eq!(batch_count(100, 24, 40_000, 4000), 4);
        assert_eq!(batch_count(1000, 24, 20_000, 4000), 4);
        assert_eq!(batch_count(30, 24, 2000, 4000), 1);
    }

    #[test]
    fn test_plan_hack_repeats_peak_batches() {
        let growth = |multiplier: f64| 5.0 * multiplier.powi(4);
        let plan = plan_hack(&profile(0.05), &growth, 100, 40_000, 4000, SearchLimits::default())
            .unwrap();
        assert_eq!(plan.count, 4);
        assert_eq!(plan.total, 96);

        let fallback = plan_hack(
            &profile(0.02),
            &log_growth(1.005),
            50,
            40_000,
            4000,
            SearchLimits::default(),
        )
        .unwrap();
        assert_eq!(fallback.count, 1);
        assert_eq!(fallback.total, fallback.sub_total);
    }
}
