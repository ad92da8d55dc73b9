//! Budget-constrained scheduling of pending analyses.
//!
//! A ranked run has a monetary budget and a sub-budget for procurements
//! nobody voted for. Pending analyses are grouped by region; each region
//! gets a share of the run proportional to its number of candidates, and
//! inside a region the highest priority goes first. Capacity that a
//! region could not use is offered to the remaining candidates in global
//! priority order.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Duration, NaiveDate};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

/// A pending analysis competing for the run budget
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub analysis_id: Uuid,
    pub control_number: String,
    pub version_number: i64,
    pub region: String,
    pub priority: i64,
    pub votes: i64,
    pub estimated_cost: f64,
}

/// Limits of one ranked run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetPlan {
    pub budget: f64,

    /// Share of `budget` zero-vote candidates may spend, in percent
    pub zero_vote_percent: f64,

    pub max_messages: Option<usize>,
}

impl BudgetPlan {
    pub fn zero_vote_budget(&self) -> f64 {
        self.budget * self.zero_vote_percent / 100.0
    }

    /// What is left of this plan once `committed` have been triggered
    pub fn remaining_after(&self, committed: &[RankedCandidate]) -> BudgetPlan {
        let spent: f64 = committed.iter().map(|c| c.estimated_cost).sum();
        let zero_vote_spent: f64 = committed
            .iter()
            .filter(|c| c.votes == 0)
            .map(|c| c.estimated_cost)
            .sum();

        let budget = (self.budget - spent).max(0.0);
        let zero_vote_left = (self.zero_vote_budget() - zero_vote_spent).max(0.0);
        let zero_vote_percent = if budget > 0.0 {
            (zero_vote_left / budget * 100.0).min(100.0)
        } else {
            0.0
        };

        BudgetPlan {
            budget,
            zero_vote_percent,
            max_messages: self.max_messages.map(|max| max.saturating_sub(committed.len())),
        }
    }
}

/// Outcome of an allocation
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    /// Candidates to trigger, highest priority first
    pub chosen: Vec<RankedCandidate>,

    pub spent: f64,

    pub zero_vote_spent: f64,

    /// Candidates passed over for cost
    pub skipped: usize,
}

/// Highest priority first; ties by (control number, version, id)
pub fn compare_ranked(a: &RankedCandidate, b: &RankedCandidate) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.control_number.cmp(&b.control_number))
        .then_with(|| a.version_number.cmp(&b.version_number))
        .then_with(|| a.analysis_id.cmp(&b.analysis_id))
}

struct Budget {
    remaining: f64,
    zero_vote_remaining: f64,
    spent: f64,
    zero_vote_spent: f64,
}

impl Budget {
    /// Reserve the candidate's cost, or explain why it does not fit
    fn try_spend(&mut self, candidate: &RankedCandidate) -> Result<(), &'static str> {
        let cost = candidate.estimated_cost;
        if cost > self.remaining {
            return Err("cost exceeds remaining budget");
        }
        if candidate.votes == 0 && cost > self.zero_vote_remaining {
            return Err("cost exceeds remaining zero-vote budget");
        }
        self.remaining -= cost;
        self.spent += cost;
        if candidate.votes == 0 {
            self.zero_vote_remaining -= cost;
            self.zero_vote_spent += cost;
        }
        Ok(())
    }
}

/// Pick the candidates a ranked run triggers
pub fn allocate(candidates: Vec<RankedCandidate>, plan: &BudgetPlan) -> Allocation {
    let total = candidates.len();
    if total == 0 {
        return Allocation::default();
    }
    let target = plan.max_messages.unwrap_or(total);
    let capacity = plan.max_messages.unwrap_or(usize::MAX);

    let mut regions: BTreeMap<String, Vec<RankedCandidate>> = BTreeMap::new();
    for candidate in candidates {
        regions.entry(candidate.region.clone()).or_default().push(candidate);
    }
    for members in regions.values_mut() {
        members.sort_by(compare_ranked);
    }

    let mut budget = Budget {
        remaining: plan.budget,
        zero_vote_remaining: plan.zero_vote_budget(),
        spent: 0.0,
        zero_vote_spent: 0.0,
    };
    let mut chosen: Vec<RankedCandidate> = Vec::new();
    let mut taken: HashSet<Uuid> = HashSet::new();
    let mut rejected: HashSet<Uuid> = HashSet::new();

    'regions: for (region, members) in &regions {
        let share = members.len() as f64 / total as f64 * target as f64;
        let quota = (share.round() as usize).max(1);
        let mut accepted = 0;

        for candidate in members {
            if budget.remaining <= 0.0 || chosen.len() >= capacity {
                break 'regions;
            }
            if accepted >= quota {
                break;
            }
            match budget.try_spend(candidate) {
                Ok(()) => {
                    debug!(region = %region, analysis_id = %candidate.analysis_id, "Allocated");
                    taken.insert(candidate.analysis_id);
                    chosen.push(candidate.clone());
                    accepted += 1;
                }
                Err(reason) => {
                    debug!(analysis_id = %candidate.analysis_id, cost = candidate.estimated_cost, reason, "Skipping");
                    rejected.insert(candidate.analysis_id);
                }
            }
        }
    }

    // Leftover capacity goes to the best remaining candidates
    let mut leftovers: Vec<RankedCandidate> = regions
        .into_values()
        .flatten()
        .filter(|c| !taken.contains(&c.analysis_id) && !rejected.contains(&c.analysis_id))
        .collect();
    leftovers.sort_by(compare_ranked);

    for candidate in leftovers {
        if budget.remaining <= 0.0 || chosen.len() >= capacity {
            break;
        }
        match budget.try_spend(&candidate) {
            Ok(()) => chosen.push(candidate),
            Err(reason) => {
                debug!(analysis_id = %candidate.analysis_id, cost = candidate.estimated_cost, reason, "Skipping");
                rejected.insert(candidate.analysis_id);
            }
        }
    }

    chosen.sort_by(compare_ranked);
    info!(
        chosen = chosen.len(),
        spent = budget.spent,
        zero_vote_spent = budget.zero_vote_spent,
        "Budget allocated"
    );

    Allocation {
        chosen,
        spent: budget.spent,
        zero_vote_spent: budget.zero_vote_spent,
        skipped: rejected.len(),
    }
}

/// Period an automatic budget is paced over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    /// First day of the period containing `today` (weeks start on Monday)
    pub fn start(&self, today: NaiveDate) -> NaiveDate {
        match self {
            Self::Daily => today,
            Self::Weekly => today - Duration::days(today.weekday().num_days_from_monday() as i64),
            Self::Monthly => today.with_day(1).unwrap_or(today),
        }
    }

    /// (days in period, 1-based day of `today` within it)
    pub fn position(&self, today: NaiveDate) -> (u32, u32) {
        match self {
            Self::Daily => (1, 1),
            Self::Weekly => (7, today.weekday().num_days_from_monday() + 1),
            Self::Monthly => (days_in_month(today), today.day()),
        }
    }
}

fn days_in_month(day: NaiveDate) -> u32 {
    let (year, month) = if day.month() == 12 {
        (day.year() + 1, 1)
    } else {
        (day.year(), day.month() + 1)
    };
    let first_of_next = NaiveDate::from_ymd_opt(year, month, 1);
    let first_of_this = day.with_day(1);
    match (first_of_next, first_of_this) {
        (Some(next), Some(this)) => (next - this).num_days() as u32,
        _ => 30,
    }
}

/// Budget that keeps spending on pace with donations over the period.
///
/// The period's capital is everything donated plus what was already spent
/// in the period; the run may spend up to today's share of it.
pub fn auto_budget(period: BudgetPeriod, today: NaiveDate, total_donations: f64, expenses_in_period: f64) -> f64 {
    let (days, day_of_period) = period.position(today);
    let capital = total_donations + expenses_in_period;
    let target_today = capital / days as f64 * day_of_period as f64;
    (target_today - expenses_in_period).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(cn: &str, region: &str, priority: i64, votes: i64, cost: f64) -> RankedCandidate {
        RankedCandidate {
            analysis_id: Uuid::new_v4(),
            control_number: cn.to_string(),
            version_number: 1,
            region: region.to_string(),
            priority,
            votes,
            estimated_cost: cost,
        }
    }

    fn plan(budget: f64, zero_vote_percent: f64, max: Option<usize>) -> BudgetPlan {
        BudgetPlan {
            budget,
            zero_vote_percent,
            max_messages: max,
        }
    }

    fn chosen_numbers(allocation: &Allocation) -> Vec<&str> {
        allocation.chosen.iter().map(|c| c.control_number.as_str()).collect()
    }

    #[test]
    fn test_regions_share_capacity() {
        let candidates = vec![
            candidate("PCN1", "A", 100, 1, 1.0),
            candidate("PCN2", "A", 90, 1, 1.0),
            candidate("PCN3", "B", 95, 1, 1.0),
        ];
        let allocation = allocate(candidates, &plan(100.0, 100.0, Some(2)));
        assert_eq!(chosen_numbers(&allocation), vec!["PCN1", "PCN3"]);
    }

    #[test]
    fn test_unaffordable_candidate_triggers_nothing() {
        let allocation = allocate(vec![candidate("PCN1", "A", 10, 3, 12.0)], &plan(10.0, 100.0, None));
        assert!(allocation.chosen.is_empty());
        assert_eq!(allocation.spent, 0.0);
        assert_eq!(allocation.skipped, 1);
    }

    #[test]
    fn test_zero_vote_sub_budget() {
        let candidates = vec![
            candidate("Z1", "A", 100, 0, 3.0),
            candidate("Z2", "A", 90, 0, 3.0),
            candidate("V1", "A", 80, 5, 3.0),
        ];
        let allocation = allocate(candidates, &plan(10.0, 40.0, None));

        assert_eq!(chosen_numbers(&allocation), vec!["Z1", "V1"]);
        assert!(allocation.zero_vote_spent <= 4.0);
        assert!(allocation.spent <= 10.0);
    }

    #[test]
    fn test_leftover_capacity_is_reused() {
        // Region B's only candidate is too expensive; A fills the slot
        let candidates = vec![
            candidate("A1", "A", 50, 1, 1.0),
            candidate("A2", "A", 40, 1, 1.0),
            candidate("B1", "B", 99, 1, 50.0),
        ];
        let allocation = allocate(candidates, &plan(5.0, 100.0, Some(2)));
        assert_eq!(chosen_numbers(&allocation), vec!["A1", "A2"]);
    }

    #[test]
    fn test_equal_priority_tie_break() {
        let candidates = vec![candidate("B", "R", 10, 1, 1.0), candidate("A", "R", 10, 1, 1.0)];
        let allocation = allocate(candidates, &plan(10.0, 100.0, None));
        assert_eq!(chosen_numbers(&allocation), vec!["A", "B"]);
    }

    #[test]
    fn test_remaining_plan_after_triggers() {
        let base = plan(100.0, 20.0, Some(5));
        let committed = vec![candidate("V", "A", 10, 2, 30.0), candidate("Z", "A", 5, 0, 15.0)];

        let rest = base.remaining_after(&committed);
        assert!((rest.budget - 55.0).abs() < 1e-9);
        assert!((rest.zero_vote_budget() - 5.0).abs() < 1e-9);
        assert_eq!(rest.max_messages, Some(3));

        // zero-vote share already used up
        let rest = base.remaining_after(&[candidate("Z", "A", 5, 0, 20.0)]);
        assert_eq!(rest.zero_vote_budget(), 0.0);
        let allocation = allocate(vec![candidate("Z2", "A", 5, 0, 1.0)], &rest);
        assert!(allocation.chosen.is_empty());
    }

    #[test]
    fn test_auto_budget_pacing() {
        let wednesday = NaiveDate::from_ymd_opt(2025, 3, 12).unwrap();
        assert_eq!(BudgetPeriod::Weekly.start(wednesday), NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
        assert_eq!(BudgetPeriod::Weekly.position(wednesday), (7, 3));

        // 70 donated, 10 spent this week: capital 80, 3/7 of it is 34.28..., minus 10
        let budget = auto_budget(BudgetPeriod::Weekly, wednesday, 70.0, 10.0);
        assert!((budget - (80.0 / 7.0 * 3.0 - 10.0)).abs() < 1e-9);

        assert_eq!(BudgetPeriod::Monthly.position(NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()), (29, 10));
        assert_eq!(auto_budget(BudgetPeriod::Daily, wednesday, 0.0, 5.0), 0.0);
    }
}
