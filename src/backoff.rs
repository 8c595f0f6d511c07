//! Auto-resume policies and their backoff computation.
//!
//! When an error event lands, the dispatcher consults the configured
//! policies; the first match stamps `next_auto_resume` on the unit so a
//! later sweep can resume it without an operator.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::types::ActionType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffSpec {
    pub delay_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_secs: Option<i64>,
    #[serde(default)]
    pub random: bool,
}

impl BackoffSpec {
    /// Delay in seconds before attempt `attempt` (1-based) is retried.
    ///
    /// With a multiplier the delay grows linearly per attempt:
    /// `delay * (multiplier + attempt - 1)`, capped at `max_delay_secs`.
    /// Random mode instead samples uniformly in `[delay, max_delay]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> i64 {
        if self.random {
            let max = self.max_delay_secs.unwrap_or(self.delay_secs).max(self.delay_secs);
            if max == self.delay_secs {
                return self.delay_secs;
            }
            return rand::thread_rng().gen_range(self.delay_secs..=max);
        }
        let delay = match self.multiplier {
            Some(multiplier) => self.delay_secs * (multiplier + i64::from(attempt) - 1),
            None => self.delay_secs,
        };
        match self.max_delay_secs {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    pub fn next_resume(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(self.delay_for_attempt(attempt))
    }
}

/// Matches errored actions eligible for automatic resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumePolicy {
    pub name: String,
    /// Substring the error cause must contain. `None` matches any cause.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_substring: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<ActionType>,
    /// Attempts at or beyond this count are no longer auto-resumed.
    pub max_attempts: u32,
    pub backoff: BackoffSpec,
}

impl ResumePolicy {
    pub fn matches(
        &self,
        flow: &str,
        action: &str,
        action_type: ActionType,
        attempt: u32,
        error_cause: &str,
    ) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if let Some(required) = &self.flow {
            if required != flow {
                return false;
            }
        }
        if let Some(required) = &self.action {
            if required != action {
                return false;
            }
        }
        if let Some(required) = self.action_type {
            if required != action_type {
                return false;
            }
        }
        if let Some(substring) = &self.error_substring {
            if !error_cause.contains(substring.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Ordered policy set; first match wins.
#[derive(Debug, Clone, Default)]
pub struct ResumePolicies {
    policies: Vec<ResumePolicy>,
}

impl ResumePolicies {
    pub fn new(policies: Vec<ResumePolicy>) -> Self {
        Self { policies }
    }

    pub fn find_match(
        &self,
        flow: &str,
        action: &str,
        action_type: ActionType,
        attempt: u32,
        error_cause: &str,
    ) -> Option<&ResumePolicy> {
        self.policies
            .iter()
            .find(|p| p.matches(flow, action, action_type, attempt, error_cause))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(delay: i64, multiplier: Option<i64>, max: Option<i64>) -> BackoffSpec {
        BackoffSpec {
            delay_secs: delay,
            multiplier,
            max_delay_secs: max,
            random: false,
        }
    }

    #[test]
    fn multiplier_backoff_grows_linearly_and_caps() {
        let backoff = spec(5, Some(2), Some(60));
        let delays: Vec<i64> = (1..=13).map(|a| backoff.delay_for_attempt(a)).collect();
        assert_eq!(
            delays,
            vec![10, 15, 20, 25, 30, 35, 40, 45, 50, 55, 60, 60, 60]
        );
    }

    #[test]
    fn flat_backoff_without_multiplier() {
        let backoff = spec(30, None, None);
        assert_eq!(backoff.delay_for_attempt(1), 30);
        assert_eq!(backoff.delay_for_attempt(9), 30);
    }

    #[test]
    fn random_backoff_stays_in_bounds() {
        let backoff = BackoffSpec {
            delay_secs: 10,
            multiplier: None,
            max_delay_secs: Some(50),
            random: true,
        };
        for attempt in 1..200 {
            let delay = backoff.delay_for_attempt(attempt);
            assert!((10..=50).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn policy_matching_respects_all_filters() {
        let policy = ResumePolicy {
            name: "io-errors".to_string(),
            error_substring: Some("connection".to_string()),
            flow: Some("sample".to_string()),
            action: None,
            action_type: Some(ActionType::Egress),
            max_attempts: 3,
            backoff: spec(5, None, None),
        };
        assert!(policy.matches("sample", "EgressAction", ActionType::Egress, 1, "connection reset"));
        assert!(!policy.matches("other", "EgressAction", ActionType::Egress, 1, "connection reset"));
        assert!(!policy.matches("sample", "EgressAction", ActionType::Format, 1, "connection reset"));
        assert!(!policy.matches("sample", "EgressAction", ActionType::Egress, 1, "timeout"));
        // At max_attempts the unit stays errored for an operator.
        assert!(!policy.matches("sample", "EgressAction", ActionType::Egress, 3, "connection reset"));
    }

    #[test]
    fn first_matching_policy_wins() {
        let policies = ResumePolicies::new(vec![
            ResumePolicy {
                name: "narrow".to_string(),
                error_substring: Some("disk".to_string()),
                flow: None,
                action: None,
                action_type: None,
                max_attempts: 5,
                backoff: spec(1, None, None),
            },
            ResumePolicy {
                name: "catch-all".to_string(),
                error_substring: None,
                flow: None,
                action: None,
                action_type: None,
                max_attempts: 5,
                backoff: spec(60, None, None),
            },
        ]);
        let matched = policies
            .find_match("sample", "LoadAction", ActionType::Load, 1, "disk full")
            .unwrap();
        assert_eq!(matched.name, "narrow");
        let matched = policies
            .find_match("sample", "LoadAction", ActionType::Load, 1, "other")
            .unwrap();
        assert_eq!(matched.name, "catch-all");
    }
}
