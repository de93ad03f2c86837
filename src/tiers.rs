use crate::{
    config::AuthConfig,
    error::UsageError,
    storage::Scope,
    usage::{TimeRange, UsageAggregator, UsageStats},
};
use chrono::{DateTime, Datelike, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Enterprise,
}

impl Plan {
    pub fn as_str(self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
            Plan::Enterprise => "enterprise",
        }
    }

    /// `None` caps mean unlimited.
    pub fn limits(self) -> PlanLimits {
        match self {
            Plan::Free => PlanLimits {
                monthly_requests: Some(10_000),
                monthly_cost: Some(100.0),
                retention_days: 30,
                export_enabled: false,
            },
            Plan::Pro => PlanLimits {
                monthly_requests: Some(100_000),
                monthly_cost: Some(1_000.0),
                retention_days: 90,
                export_enabled: true,
            },
            Plan::Enterprise => PlanLimits {
                monthly_requests: None,
                monthly_cost: None,
                retention_days: 365,
                export_enabled: true,
            },
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_cost: Option<f64>,
    pub retention_days: u32,
    pub export_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionStatus {
    pub plan: Plan,
    pub limits: PlanLimits,
    pub usage: UsageStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_utilization: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_utilization: Option<f64>,
    pub within_limits: bool,
}

#[derive(Debug, Clone)]
struct Subscriber {
    organization_id: String,
    plan: Plan,
}

/// Plan lookup and month-to-date limit tracking. The subscriber directory
/// comes from the static token registry; callers without an entry are
/// treated as free-plan users billed against their own records only.
#[derive(Clone)]
pub struct Subscriptions {
    aggregator: UsageAggregator,
    directory: HashMap<String, Subscriber>,
}

impl Subscriptions {
    pub fn from_config(aggregator: UsageAggregator, auth: &AuthConfig) -> Self {
        let directory = auth
            .tokens
            .iter()
            .map(|token| {
                (
                    token.user_id.clone(),
                    Subscriber {
                        organization_id: token.organization_id.clone(),
                        plan: token.plan,
                    },
                )
            })
            .collect();

        Self {
            aggregator,
            directory,
        }
    }

    pub fn plan(&self, user_id: &str) -> Plan {
        self.directory
            .get(user_id)
            .map(|subscriber| subscriber.plan)
            .unwrap_or_default()
    }

    pub async fn subscription(&self, user_id: &str) -> Result<SubscriptionStatus, UsageError> {
        let (scope, plan) = match self.directory.get(user_id) {
            Some(subscriber) => (
                Scope::Organization(subscriber.organization_id.clone()),
                subscriber.plan,
            ),
            None => (Scope::User(user_id.to_string()), Plan::Free),
        };

        let (start, end) = month_to_date(Utc::now());
        let range = TimeRange::custom(start, end)?;
        let usage = self.aggregator.overall_stats(&scope, range).await?;
        Ok(assemble(plan, usage))
    }
}

fn assemble(plan: Plan, usage: UsageStats) -> SubscriptionStatus {
    let limits = plan.limits();
    let request_utilization = limits
        .monthly_requests
        .map(|cap| ratio(usage.total_calls as f64, cap as f64));
    let cost_utilization = limits.monthly_cost.map(|cap| ratio(usage.total_cost, cap));
    let within_limits = request_utilization.map_or(true, |value| value <= 1.0)
        && cost_utilization.map_or(true, |value| value <= 1.0);

    SubscriptionStatus {
        plan,
        limits,
        usage,
        request_utilization,
        cost_utilization,
        within_limits,
    }
}

fn ratio(used: f64, cap: f64) -> f64 {
    if cap > 0.0 { used / cap } else { 0.0 }
}

/// Billing window: first day of the current UTC month through now.
fn month_to_date(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let today = now.date_naive();
    let first = today.with_day(1).unwrap_or(today);
    (first.and_time(NaiveTime::MIN).and_utc(), now)
}
