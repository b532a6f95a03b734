use std::collections::HashSet;

use chrono::{Datelike, NaiveDateTime};
use derive_more::{Display, Error};

/// Retention of snapshots in the repository.
///
/// Mirrors restic's `--keep-*` flags. A rule set to [None] is not passed to
/// restic and keeps nothing on its own.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct RetentionPolicy {
    /// Defines how many daily snapshots to keep.
    ///
    /// A daily snapshot is the most recent snapshot of the day.
    pub keep_daily: usize,

    /// Defines how many weekly snapshots to keep.
    ///
    /// A weekly snapshot is the most recent snapshot of the ISO week.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_weekly: Option<usize>,

    /// Defines how many monthly snapshots to keep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_monthly: Option<usize>,

    /// Defines how many yearly snapshots to keep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_yearly: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_daily: 7,
            keep_weekly: None,
            keep_monthly: None,
            keep_yearly: None,
        }
    }
}

/// The retention policy would remove every snapshot.
#[derive(Debug, Display, Error)]
#[display("keep_daily must be at least 1")]
pub struct EmptyRetentionPolicy;

impl RetentionPolicy {
    pub fn validate(&self) -> Result<(), EmptyRetentionPolicy> {
        if self.keep_daily == 0 {
            return Err(EmptyRetentionPolicy);
        }
        Ok(())
    }

    /// Arguments for `restic forget`.
    pub fn forget_args(&self) -> Vec<String> {
        let mut args = vec!["--keep-daily".to_string(), self.keep_daily.to_string()];
        let optional = [
            ("--keep-weekly", self.keep_weekly),
            ("--keep-monthly", self.keep_monthly),
            ("--keep-yearly", self.keep_yearly),
        ];
        for (flag, keep) in optional {
            if let Some(keep) = keep {
                args.push(flag.to_string());
                args.push(keep.to_string());
            }
        }
        args
    }

    /// Indices into `times` of the snapshots the policy keeps.
    ///
    /// `times` may be in any order; the result is sorted ascending.
    pub fn retained(&self, times: &[NaiveDateTime]) -> Vec<usize> {
        let mut newest_first: Vec<usize> = (0..times.len()).collect();
        newest_first.sort_by(|&a, &b| times[b].cmp(&times[a]));

        let mut retention = Retention::new(*self);
        let mut kept: Vec<usize> = newest_first
            .into_iter()
            .filter(|&idx| retention.retain(times[idx]))
            .collect();
        kept.sort_unstable();
        kept
    }
}

/// Stateful evaluation of a [RetentionPolicy].
///
/// Dates have to be fed newest first.
#[derive(Clone, Debug)]
pub struct Retention {
    pub policy: RetentionPolicy,
    daily: HashSet<(i32, u32)>,
    weekly: HashSet<(i32, u32)>,
    monthly: HashSet<(i32, u32)>,
    yearly: HashSet<i32>,
}

impl From<RetentionPolicy> for Retention {
    fn from(policy: RetentionPolicy) -> Self {
        Self::new(policy)
    }
}

impl Retention {
    pub fn new(policy: RetentionPolicy) -> Self {
        Self {
            policy,
            daily: HashSet::new(),
            weekly: HashSet::new(),
            monthly: HashSet::new(),
            yearly: HashSet::new(),
        }
    }

    /// Returns if the [Datelike] is to be retained.
    pub fn retain(&mut self, date: impl Datelike) -> bool {
        let Self {
            policy,
            daily,
            weekly,
            monthly,
            yearly,
        } = self;

        let new_daily = daily.len() < policy.keep_daily && {
            let daily_key = (date.year(), date.ordinal());
            daily.insert(daily_key)
        };

        let new_weekly = policy
            .keep_weekly
            .is_some_and(|keep_weekly| weekly.len() < keep_weekly)
            && {
                let iso_week = date.iso_week();
                weekly.insert((iso_week.year(), iso_week.week()))
            };

        let new_monthly = policy
            .keep_monthly
            .is_some_and(|keep_monthly| monthly.len() < keep_monthly)
            && {
                let monthly_key = (date.year(), date.month());
                monthly.insert(monthly_key)
            };

        let new_yearly = policy
            .keep_yearly
            .is_some_and(|keep_yearly| yearly.len() < keep_yearly)
            && yearly.insert(date.year());

        new_daily || new_weekly || new_monthly || new_yearly
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn keeps_newest_days() {
        let policy = RetentionPolicy {
            keep_daily: 7,
            ..Default::default()
        };
        let times: Vec<_> = (1..=10).map(|d| at(2026, 3, d, 2)).collect();

        assert_eq!(policy.retained(&times), vec![3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn keeps_only_latest_snapshot_of_a_day() {
        let policy = RetentionPolicy {
            keep_daily: 2,
            ..Default::default()
        };
        let times = [at(2026, 3, 1, 2), at(2026, 3, 2, 2), at(2026, 3, 2, 14)];

        assert_eq!(policy.retained(&times), vec![0, 2]);
    }

    #[test]
    fn weekly_rule_extends_daily_rule() {
        let policy = RetentionPolicy {
            keep_daily: 1,
            keep_weekly: Some(2),
            ..Default::default()
        };
        // 2026-03-02 is a Monday
        let times = [at(2026, 2, 25, 2), at(2026, 3, 2, 2), at(2026, 3, 3, 2)];

        assert_eq!(policy.retained(&times), vec![0, 2]);
    }

    #[test]
    fn forget_args_skip_unset_rules() {
        let policy = RetentionPolicy {
            keep_daily: 7,
            keep_monthly: Some(6),
            ..Default::default()
        };

        assert_eq!(
            policy.forget_args(),
            ["--keep-daily", "7", "--keep-monthly", "6"]
        );
    }

    #[test]
    fn zero_daily_is_rejected() {
        let policy = RetentionPolicy {
            keep_daily: 0,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }
}
