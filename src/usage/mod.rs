use crate::{
    config::AggregationConfig,
    error::UsageError,
    provider::Provider,
    storage::{Scope, Storage, UsageRecord},
};
use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, Utc};
use serde::Serialize;
use std::{collections::BTreeMap, str::FromStr};

pub const DEFAULT_RECENT_LIMIT: usize = 10;

/// Query window. Non-custom ranges resolve relative to the clock at call
/// time; `Custom` carries explicit bounds validated at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeRange {
    LastHour,
    Last24Hours,
    Last7Days,
    Last30Days,
    Last90Days,
    LastYear,
    Custom {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl Default for TimeRange {
    fn default() -> Self {
        TimeRange::Last30Days
    }
}

impl TimeRange {
    pub fn custom(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, UsageError> {
        if start > end {
            return Err(UsageError::invalid_filter(
                "custom range start must not be after end",
            ));
        }
        Ok(TimeRange::Custom { start, end })
    }

    pub fn resolve(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self {
            TimeRange::LastHour => (now - Duration::hours(1), now),
            TimeRange::Last24Hours => (now - Duration::hours(24), now),
            TimeRange::Last7Days => (now - Duration::days(7), now),
            TimeRange::Last30Days => (now - Duration::days(30), now),
            TimeRange::Last90Days => (now - Duration::days(90), now),
            TimeRange::LastYear => (now - Duration::days(365), now),
            TimeRange::Custom { start, end } => (start, end),
        }
    }

    /// Window used for daily trend series. Day-denominated ranges align the
    /// start to a calendar-day boundary so an n-day range yields exactly n
    /// buckets and no record falls outside the bucketed days.
    pub fn resolve_trend(self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let days: u64 = match self {
            TimeRange::Last7Days => 7,
            TimeRange::Last30Days => 30,
            TimeRange::Last90Days => 90,
            TimeRange::LastYear => 365,
            TimeRange::LastHour | TimeRange::Last24Hours | TimeRange::Custom { .. } => {
                return self.resolve(now);
            }
        };

        let today = now.date_naive();
        let start_date = today.checked_sub_days(Days::new(days - 1)).unwrap_or(today);
        (start_date.and_time(NaiveTime::MIN).and_utc(), now)
    }
}

impl FromStr for TimeRange {
    type Err = UsageError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1h" => Ok(TimeRange::LastHour),
            "24h" => Ok(TimeRange::Last24Hours),
            "7d" => Ok(TimeRange::Last7Days),
            "30d" => Ok(TimeRange::Last30Days),
            "90d" => Ok(TimeRange::Last90Days),
            "1y" => Ok(TimeRange::LastYear),
            other => Err(UsageError::InvalidFilter(format!(
                "unknown date range {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageFilter {
    pub provider: Option<Provider>,
    pub range: TimeRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Rollup of a record set. Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_calls: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    pub avg_response_time: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub period: Period,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub model: String,
    pub calls: u64,
    pub tokens: u64,
    pub cost: f64,
    pub avg_response_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUsage {
    pub user_id: String,
    pub calls: u64,
    pub tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsageStats {
    pub provider: Provider,
    #[serde(flatten)]
    pub stats: UsageStats,
    pub models: Vec<ModelUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_users: Option<Vec<UserUsage>>,
    pub cost_breakdown: CostBreakdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub date: NaiveDate,
    pub calls: u64,
    pub tokens: u64,
    pub cost: f64,
}

/// What `usage_stats` answers with: provider-filtered queries carry the full
/// provider rollup, unfiltered ones the cross-provider totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum UsageReport {
    Overall(UsageStats),
    Provider(ProviderUsageStats),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllProvidersUsage {
    pub overall: UsageStats,
    pub providers: BTreeMap<Provider, ProviderUsageStats>,
}

/// Read-only rollup engine over the record store. Stateless per call: every
/// query recomputes from source records, nothing is cached across requests.
#[derive(Clone)]
pub struct UsageAggregator {
    storage: Storage,
    top_users: usize,
    recent_limit_max: usize,
}

impl UsageAggregator {
    pub fn new(storage: Storage, config: &AggregationConfig) -> Self {
        Self {
            storage,
            top_users: config.top_users,
            recent_limit_max: config.recent_limit_max.max(1),
        }
    }

    pub async fn usage_stats(
        &self,
        scope: &Scope,
        filter: &UsageFilter,
    ) -> Result<UsageReport, UsageError> {
        match filter.provider {
            Some(provider) => Ok(UsageReport::Provider(
                self.provider_stats(scope, provider, filter.range).await?,
            )),
            None => Ok(UsageReport::Overall(
                self.overall_stats(scope, filter.range).await?,
            )),
        }
    }

    pub async fn overall_stats(
        &self,
        scope: &Scope,
        range: TimeRange,
    ) -> Result<UsageStats, UsageError> {
        let (start, end) = range.resolve(Utc::now());
        let records = self.storage.find_records(scope, None, start, end).await?;
        Ok(summarize(&records, Period { start, end }))
    }

    pub async fn provider_stats(
        &self,
        scope: &Scope,
        provider: Provider,
        range: TimeRange,
    ) -> Result<ProviderUsageStats, UsageError> {
        let (start, end) = range.resolve(Utc::now());
        let records = self
            .storage
            .find_records(scope, Some(provider), start, end)
            .await?;
        Ok(self.provider_summary(provider, &records, Period { start, end }, scope))
    }

    /// One query, partitioned in memory: every supported provider appears in
    /// the answer, zero-valued where it has no records.
    pub async fn all_providers_usage(
        &self,
        scope: &Scope,
        range: TimeRange,
    ) -> Result<AllProvidersUsage, UsageError> {
        let (start, end) = range.resolve(Utc::now());
        let period = Period { start, end };
        let records = self.storage.find_records(scope, None, start, end).await?;

        let overall = summarize(&records, period);
        let mut providers = BTreeMap::new();
        for provider in Provider::ALL {
            let subset: Vec<UsageRecord> = records
                .iter()
                .filter(|record| record.provider == provider)
                .cloned()
                .collect();
            providers.insert(
                provider,
                self.provider_summary(provider, &subset, period, scope),
            );
        }

        Ok(AllProvidersUsage { overall, providers })
    }

    pub async fn usage_trend(
        &self,
        scope: &Scope,
        filter: &UsageFilter,
    ) -> Result<Vec<TrendPoint>, UsageError> {
        let (start, end) = filter.range.resolve_trend(Utc::now());
        let records = self
            .storage
            .find_records(scope, filter.provider, start, end)
            .await?;
        Ok(trend_points(&records, start.date_naive(), end.date_naive()))
    }

    /// `limit` defaults to [`DEFAULT_RECENT_LIMIT`] and is clamped to the
    /// configured maximum instead of being rejected.
    pub async fn recent_usage(
        &self,
        scope: &Scope,
        limit: Option<usize>,
        provider: Option<Provider>,
    ) -> Result<Vec<UsageRecord>, UsageError> {
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT).min(self.recent_limit_max);
        self.storage.recent_records(scope, provider, limit).await
    }

    fn provider_summary(
        &self,
        provider: Provider,
        records: &[UsageRecord],
        period: Period,
        scope: &Scope,
    ) -> ProviderUsageStats {
        let stats = summarize(records, period);
        let models = model_rollup(records);
        let cost_breakdown = cost_rollup(records);
        let top_users = match scope {
            Scope::Organization(_) => Some(rank_top_users(records, self.top_users)),
            Scope::User(_) => None,
        };

        ProviderUsageStats {
            provider,
            stats,
            models,
            top_users,
            cost_breakdown,
        }
    }
}

fn summarize(records: &[UsageRecord], period: Period) -> UsageStats {
    let total_calls = records.len() as u64;
    let mut total_tokens = 0u64;
    let mut total_cost = 0.0f64;
    let mut latency_total = 0u64;
    let mut failures = 0u64;

    for record in records {
        total_tokens += record.total_tokens;
        total_cost += record.cost;
        latency_total += record.latency_ms;
        if !record.success {
            failures += 1;
        }
    }

    // Zero records must yield zeros, never NaN.
    let (avg_response_time, success_rate, error_rate) = if total_calls > 0 {
        let calls = total_calls as f64;
        (
            latency_total as f64 / calls,
            (total_calls - failures) as f64 / calls,
            failures as f64 / calls,
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    UsageStats {
        total_calls,
        total_tokens,
        total_cost,
        avg_response_time,
        success_rate,
        error_rate,
        period,
    }
}

#[derive(Default)]
struct RollupAcc {
    calls: u64,
    tokens: u64,
    cost: f64,
    latency_total: u64,
}

/// Per-model rollup ordered by cost descending, model name ascending on ties.
fn model_rollup(records: &[UsageRecord]) -> Vec<ModelUsage> {
    let mut by_model: BTreeMap<&str, RollupAcc> = BTreeMap::new();
    for record in records {
        let acc = by_model.entry(record.model.as_str()).or_default();
        acc.calls += 1;
        acc.tokens += record.total_tokens;
        acc.cost += record.cost;
        acc.latency_total += record.latency_ms;
    }

    let mut models: Vec<ModelUsage> = by_model
        .into_iter()
        .map(|(model, acc)| ModelUsage {
            model: model.to_string(),
            calls: acc.calls,
            tokens: acc.tokens,
            cost: acc.cost,
            // Entries only exist for models with at least one call.
            avg_response_time: acc.latency_total as f64 / acc.calls as f64,
        })
        .collect();
    models.sort_by(|a, b| b.cost.total_cmp(&a.cost).then_with(|| a.model.cmp(&b.model)));
    models
}

fn cost_rollup(records: &[UsageRecord]) -> CostBreakdown {
    let mut breakdown = CostBreakdown::default();
    for record in records {
        breakdown.input_tokens += record.input_tokens;
        breakdown.output_tokens += record.output_tokens;
        breakdown.input_cost += record.input_cost;
        breakdown.output_cost += record.output_cost;
    }
    // The total is the sum of the parts by construction, not a third sum.
    breakdown.total_cost = breakdown.input_cost + breakdown.output_cost;
    breakdown
}

/// Cost descending, calls descending on ties, then user id ascending.
fn rank_top_users(records: &[UsageRecord], n: usize) -> Vec<UserUsage> {
    let mut by_user: BTreeMap<&str, RollupAcc> = BTreeMap::new();
    for record in records {
        let acc = by_user.entry(record.user_id.as_str()).or_default();
        acc.calls += 1;
        acc.tokens += record.total_tokens;
        acc.cost += record.cost;
    }

    let mut users: Vec<UserUsage> = by_user
        .into_iter()
        .map(|(user_id, acc)| UserUsage {
            user_id: user_id.to_string(),
            calls: acc.calls,
            tokens: acc.tokens,
            cost: acc.cost,
        })
        .collect();
    users.sort_by(|a, b| {
        b.cost
            .total_cmp(&a.cost)
            .then_with(|| b.calls.cmp(&a.calls))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });
    users.truncate(n);
    users
}

#[derive(Clone, Copy, Default)]
struct TrendAcc {
    calls: u64,
    tokens: u64,
    cost: f64,
}

/// Dense daily series: every day in [start_date, end_date] appears exactly
/// once, zero-valued when nothing was recorded.
fn trend_points(
    records: &[UsageRecord],
    start_date: NaiveDate,
    end_date: NaiveDate,
) -> Vec<TrendPoint> {
    let mut by_day: BTreeMap<NaiveDate, TrendAcc> = BTreeMap::new();
    for record in records {
        let acc = by_day.entry(record.timestamp.date_naive()).or_default();
        acc.calls += 1;
        acc.tokens += record.total_tokens;
        acc.cost += record.cost;
    }

    let mut points = Vec::new();
    let mut day = start_date;
    while day <= end_date {
        let acc = by_day.get(&day).copied().unwrap_or_default();
        points.push(TrendPoint {
            date: day,
            calls: acc.calls,
            tokens: acc.tokens,
            cost: acc.cost,
        });
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::NewUsageRecord;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    fn sample_period() -> Period {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap();
        Period { start, end }
    }

    fn sample_record(
        user: &str,
        provider: Provider,
        model: &str,
        minutes_ago: i64,
        tokens: (u64, u64),
        costs: (f64, f64),
        latency_ms: u64,
        success: bool,
    ) -> NewUsageRecord {
        NewUsageRecord {
            user_id: user.to_string(),
            organization_id: "acme".to_string(),
            provider,
            model: model.to_string(),
            input_tokens: tokens.0,
            output_tokens: tokens.1,
            total_tokens: tokens.0 + tokens.1,
            input_cost: costs.0,
            output_cost: costs.1,
            cost: costs.0 + costs.1,
            latency_ms,
            success,
            timestamp: Utc::now() - ChronoDuration::minutes(minutes_ago),
        }
    }

    fn stored(record: &NewUsageRecord, id: i64) -> UsageRecord {
        UsageRecord {
            id,
            user_id: record.user_id.clone(),
            organization_id: record.organization_id.clone(),
            provider: record.provider,
            model: record.model.clone(),
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            total_tokens: record.total_tokens,
            input_cost: record.input_cost,
            output_cost: record.output_cost,
            cost: record.cost,
            latency_ms: record.latency_ms,
            success: record.success,
            timestamp: record.timestamp,
        }
    }

    async fn aggregator_over(
        records: Vec<NewUsageRecord>,
        config: AggregationConfig,
    ) -> (NamedTempFile, UsageAggregator) {
        let db_file = NamedTempFile::new().unwrap();
        let storage = Storage::connect(db_file.path()).await.unwrap();
        storage.ensure_schema().await.unwrap();
        for record in records {
            storage.insert_record(record).await.unwrap();
        }
        (db_file, UsageAggregator::new(storage, &config))
    }

    #[test]
    fn non_custom_ranges_resolve_to_exact_durations() {
        let now = Utc.with_ymd_and_hms(2026, 8, 22, 15, 4, 5).unwrap();
        let cases = [
            (TimeRange::LastHour, 3_600),
            (TimeRange::Last24Hours, 86_400),
            (TimeRange::Last7Days, 7 * 86_400),
            (TimeRange::Last30Days, 30 * 86_400),
            (TimeRange::Last90Days, 90 * 86_400),
            (TimeRange::LastYear, 365 * 86_400),
        ];
        for (range, seconds) in cases {
            let (start, end) = range.resolve(now);
            assert_eq!(end, now);
            assert_eq!(end - start, ChronoDuration::seconds(seconds));
        }
    }

    #[test]
    fn custom_range_requires_ordered_bounds() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();

        let range = TimeRange::custom(earlier, later).unwrap();
        assert_eq!(range.resolve(Utc::now()), (earlier, later));

        let err = TimeRange::custom(later, earlier).unwrap_err();
        assert!(matches!(err, UsageError::InvalidFilter(_)));
        assert!(err.to_string().contains("custom range start"));
    }

    #[test]
    fn date_range_tokens_parse_case_insensitively() {
        assert_eq!("30d".parse::<TimeRange>().unwrap(), TimeRange::Last30Days);
        assert_eq!("30D".parse::<TimeRange>().unwrap(), TimeRange::Last30Days);
        assert_eq!("1h".parse::<TimeRange>().unwrap(), TimeRange::LastHour);
        assert_eq!(TimeRange::default(), TimeRange::Last30Days);

        let err = "5d".parse::<TimeRange>().unwrap_err();
        assert!(err.to_string().contains("unknown date range"));
    }

    #[test]
    fn summarize_guards_empty_record_sets() {
        let period = sample_period();
        let stats = summarize(&[], period);

        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.total_tokens, 0);
        assert_eq!(stats.total_cost, 0.0);
        assert_eq!(stats.avg_response_time, 0.0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.error_rate, 0.0);
        assert!(stats.success_rate.is_finite() && stats.error_rate.is_finite());
        assert_eq!(stats.period, period);
    }

    #[test]
    fn model_rollup_sums_match_totals_and_order_is_deterministic() {
        let samples = vec![
            sample_record("alice", Provider::OpenAi, "gpt-4o", 1, (70, 30), (0.005, 0.005), 200, true),
            sample_record("alice", Provider::OpenAi, "gpt-4o", 2, (150, 50), (0.01, 0.01), 300, true),
            sample_record("alice", Provider::OpenAi, "gpt-4o-mini", 3, (30, 20), (0.001, 0.001), 100, true),
            sample_record("alice", Provider::OpenAi, "gpt-3.5-turbo", 4, (10, 10), (0.001, 0.001), 50, false),
        ];
        let records: Vec<UsageRecord> = samples
            .iter()
            .enumerate()
            .map(|(i, r)| stored(r, i as i64 + 1))
            .collect();

        let stats = summarize(&records, sample_period());
        let models = model_rollup(&records);

        let calls: u64 = models.iter().map(|m| m.calls).sum();
        let cost: f64 = models.iter().map(|m| m.cost).sum();
        assert_eq!(calls, stats.total_calls);
        assert!((cost - stats.total_cost).abs() < 1e-6);

        assert_eq!(models[0].model, "gpt-4o");
        // Equal-cost models fall back to name order.
        assert_eq!(models[1].model, "gpt-3.5-turbo");
        assert_eq!(models[2].model, "gpt-4o-mini");
    }

    #[test]
    fn cost_rollup_total_is_the_exact_sum_of_parts() {
        let samples = vec![
            sample_record("alice", Provider::Claude, "claude-3-5-sonnet", 1, (1000, 500), (0.003, 0.0075), 200, true),
            sample_record("alice", Provider::Claude, "claude-3-haiku", 2, (2000, 100), (0.0005, 0.000125), 150, true),
        ];
        let records: Vec<UsageRecord> = samples
            .iter()
            .enumerate()
            .map(|(i, r)| stored(r, i as i64 + 1))
            .collect();

        let breakdown = cost_rollup(&records);
        assert_eq!(breakdown.input_tokens, 3000);
        assert_eq!(breakdown.output_tokens, 600);
        assert_eq!(
            breakdown.total_cost,
            breakdown.input_cost + breakdown.output_cost
        );
    }

    #[test]
    fn top_users_rank_by_cost_then_calls_then_id() {
        let samples = vec![
            // carol: one expensive call.
            sample_record("carol", Provider::OpenAi, "gpt-4o", 1, (100, 100), (0.05, 0.05), 100, true),
            // alice and bob tie on cost; bob has more calls.
            sample_record("alice", Provider::OpenAi, "gpt-4o", 2, (100, 100), (0.02, 0.02), 100, true),
            sample_record("bob", Provider::OpenAi, "gpt-4o", 3, (50, 50), (0.01, 0.01), 100, true),
            sample_record("bob", Provider::OpenAi, "gpt-4o", 4, (50, 50), (0.01, 0.01), 100, true),
            // dave ties alice on cost and calls; id breaks the tie.
            sample_record("dave", Provider::OpenAi, "gpt-4o", 5, (100, 100), (0.02, 0.02), 100, true),
        ];
        let records: Vec<UsageRecord> = samples
            .iter()
            .enumerate()
            .map(|(i, r)| stored(r, i as i64 + 1))
            .collect();

        let ranked = rank_top_users(&records, 10);
        let order: Vec<&str> = ranked.iter().map(|u| u.user_id.as_str()).collect();
        assert_eq!(order, vec!["carol", "bob", "alice", "dave"]);

        let truncated = rank_top_users(&records, 2);
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].user_id, "carol");
        assert_eq!(truncated[1].user_id, "bob");
    }

    #[test]
    fn trend_series_is_dense_and_chronological() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 22).unwrap();
        let start = today.checked_sub_days(Days::new(6)).unwrap();

        let mut first = sample_record("alice", Provider::OpenAi, "gpt-4o", 0, (10, 10), (0.01, 0.01), 100, true);
        first.timestamp = start.and_hms_opt(9, 0, 0).unwrap().and_utc();
        let mut last = sample_record("alice", Provider::OpenAi, "gpt-4o", 0, (20, 20), (0.02, 0.02), 100, true);
        last.timestamp = today.and_hms_opt(18, 30, 0).unwrap().and_utc();

        let records = vec![stored(&first, 1), stored(&last, 2)];
        let points = trend_points(&records, start, today);

        assert_eq!(points.len(), 7);
        assert_eq!(points[0].date, start);
        assert_eq!(points[6].date, today);
        assert_eq!(points[0].calls, 1);
        assert_eq!(points[6].calls, 1);
        for point in &points[1..6] {
            assert_eq!(point.calls, 0);
            assert_eq!(point.tokens, 0);
            assert_eq!(point.cost, 0.0);
        }
        for pair in points.windows(2) {
            assert!(pair[0].date < pair[1].date);
        }
    }

    #[tokio::test]
    async fn scenario_three_openai_calls_with_one_failure() {
        let records = vec![
            sample_record("alice", Provider::OpenAi, "gpt-4o", 10, (70, 30), (0.005, 0.005), 120, true),
            sample_record("alice", Provider::OpenAi, "gpt-4o", 20, (150, 50), (0.01, 0.01), 180, true),
            sample_record("alice", Provider::OpenAi, "gpt-4o-mini", 30, (30, 20), (0.0025, 0.0025), 90, false),
        ];
        let (_db_file, aggregator) =
            aggregator_over(records, AggregationConfig::default()).await;

        let scope = Scope::User("alice".to_string());
        let stats = aggregator
            .overall_stats(&scope, TimeRange::Last30Days)
            .await
            .unwrap();

        assert_eq!(stats.total_calls, 3);
        assert_eq!(stats.total_tokens, 350);
        assert!((stats.total_cost - 0.035).abs() < 1e-9);
        assert!((stats.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.success_rate + stats.error_rate - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_record_stats_keep_the_requested_period() {
        let (_db_file, aggregator) =
            aggregator_over(Vec::new(), AggregationConfig::default()).await;

        let scope = Scope::User("nobody".to_string());
        let start = Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap();
        let range = TimeRange::custom(start, end).unwrap();

        let stats = aggregator.overall_stats(&scope, range).await.unwrap();
        assert_eq!(stats.total_calls, 0);
        assert_eq!(stats.period, Period { start, end });
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.error_rate, 0.0);

        let thirty = aggregator
            .overall_stats(&scope, TimeRange::Last30Days)
            .await
            .unwrap();
        assert_eq!(
            thirty.period.end - thirty.period.start,
            ChronoDuration::days(30)
        );
    }

    #[tokio::test]
    async fn provider_stats_carry_models_breakdown_and_org_top_users() {
        let records = vec![
            sample_record("alice", Provider::Claude, "claude-3-5-sonnet", 5, (1000, 500), (0.003, 0.0075), 210, true),
            sample_record("bob", Provider::Claude, "claude-3-haiku", 6, (400, 100), (0.0001, 0.000125), 90, true),
            sample_record("alice", Provider::OpenAi, "gpt-4o", 7, (100, 100), (0.00025, 0.001), 150, true),
        ];
        let (_db_file, aggregator) =
            aggregator_over(records, AggregationConfig::default()).await;

        let user_scope = Scope::User("alice".to_string());
        let mine = aggregator
            .provider_stats(&user_scope, Provider::Claude, TimeRange::Last7Days)
            .await
            .unwrap();
        assert_eq!(mine.provider, Provider::Claude);
        assert_eq!(mine.stats.total_calls, 1);
        assert_eq!(mine.models.len(), 1);
        assert_eq!(mine.models[0].model, "claude-3-5-sonnet");
        assert!(mine.top_users.is_none());
        assert_eq!(mine.cost_breakdown.input_tokens, 1000);

        let org_scope = Scope::Organization("acme".to_string());
        let org = aggregator
            .provider_stats(&org_scope, Provider::Claude, TimeRange::Last7Days)
            .await
            .unwrap();
        assert_eq!(org.stats.total_calls, 2);
        let top = org.top_users.unwrap();
        assert_eq!(top[0].user_id, "alice");
        assert_eq!(top[1].user_id, "bob");
        assert_eq!(
            org.cost_breakdown.total_cost,
            org.cost_breakdown.input_cost + org.cost_breakdown.output_cost
        );
    }

    #[tokio::test]
    async fn all_providers_usage_lists_every_provider() {
        let records = vec![
            sample_record("alice", Provider::OpenAi, "gpt-4o", 5, (100, 50), (0.001, 0.002), 100, true),
            sample_record("alice", Provider::Claude, "claude-3-haiku", 6, (200, 20), (0.0001, 0.0002), 80, true),
        ];
        let (_db_file, aggregator) =
            aggregator_over(records, AggregationConfig::default()).await;

        let scope = Scope::User("alice".to_string());
        let usage = aggregator
            .all_providers_usage(&scope, TimeRange::Last7Days)
            .await
            .unwrap();

        assert_eq!(usage.providers.len(), Provider::ALL.len());
        assert_eq!(usage.overall.total_calls, 2);

        let openai = &usage.providers[&Provider::OpenAi];
        assert_eq!(openai.stats.total_calls, 1);

        let gemini = &usage.providers[&Provider::Gemini];
        assert_eq!(gemini.stats.total_calls, 0);
        assert_eq!(gemini.stats.period, usage.overall.period);
        assert_eq!(gemini.stats.success_rate, 0.0);

        let total_across: u64 = usage.providers.values().map(|p| p.stats.total_calls).sum();
        assert_eq!(total_across, usage.overall.total_calls);
    }

    #[tokio::test]
    async fn trend_for_seven_day_range_has_seven_buckets() {
        let mut early = sample_record("alice", Provider::OpenAi, "gpt-4o", 0, (10, 10), (0.01, 0.01), 100, true);
        early.timestamp = (Utc::now() - ChronoDuration::days(6))
            .date_naive()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        let late = sample_record("alice", Provider::OpenAi, "gpt-4o", 0, (20, 20), (0.02, 0.02), 100, true);

        let (_db_file, aggregator) =
            aggregator_over(vec![early, late], AggregationConfig::default()).await;

        let scope = Scope::User("alice".to_string());
        let filter = UsageFilter {
            provider: None,
            range: TimeRange::Last7Days,
        };
        let points = aggregator.usage_trend(&scope, &filter).await.unwrap();

        assert_eq!(points.len(), 7);
        assert_eq!(points[0].calls, 1);
        assert_eq!(points[6].calls, 1);
        assert!(points[1..6].iter().all(|p| p.calls == 0));
    }

    #[tokio::test]
    async fn recent_usage_clamps_oversized_limits() {
        let records = (0..6)
            .map(|i| {
                sample_record("alice", Provider::OpenAi, "gpt-4o", i + 1, (10, 10), (0.001, 0.001), 50, true)
            })
            .collect();
        let config = AggregationConfig {
            top_users: 5,
            recent_limit_max: 3,
        };
        let (_db_file, aggregator) = aggregator_over(records, config).await;

        let scope = Scope::User("alice".to_string());
        let clamped = aggregator
            .recent_usage(&scope, Some(10_000), None)
            .await
            .unwrap();
        assert_eq!(clamped.len(), 3);

        // Newest first.
        assert!(clamped[0].timestamp >= clamped[1].timestamp);
        assert!(clamped[1].timestamp >= clamped[2].timestamp);
    }

    #[tokio::test]
    async fn recent_usage_defaults_to_ten_records() {
        let records = (0..12)
            .map(|i| {
                sample_record("alice", Provider::OpenAi, "gpt-4o", i + 1, (10, 10), (0.001, 0.001), 50, true)
            })
            .collect();
        let (_db_file, aggregator) =
            aggregator_over(records, AggregationConfig::default()).await;

        let scope = Scope::User("alice".to_string());
        let recent = aggregator.recent_usage(&scope, None, None).await.unwrap();
        assert_eq!(recent.len(), DEFAULT_RECENT_LIMIT);
    }

    #[tokio::test]
    async fn identical_filters_yield_identical_reports() {
        let records = vec![
            sample_record("alice", Provider::OpenAi, "gpt-4o", 10, (70, 30), (0.005, 0.005), 120, true),
            sample_record("alice", Provider::OpenAi, "gpt-4o-mini", 20, (30, 20), (0.001, 0.001), 90, false),
        ];
        let (_db_file, aggregator) =
            aggregator_over(records, AggregationConfig::default()).await;

        let scope = Scope::User("alice".to_string());
        let start = Utc::now() - ChronoDuration::hours(1);
        let end = Utc::now();
        let filter = UsageFilter {
            provider: Some(Provider::OpenAi),
            range: TimeRange::custom(start, end).unwrap(),
        };

        let first = aggregator.usage_stats(&scope, &filter).await.unwrap();
        let second = aggregator.usage_stats(&scope, &filter).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn provider_filter_casing_does_not_change_results() {
        let records = vec![
            sample_record("alice", Provider::OpenAi, "gpt-4o", 10, (70, 30), (0.005, 0.005), 120, true),
        ];
        let (_db_file, aggregator) =
            aggregator_over(records, AggregationConfig::default()).await;

        let scope = Scope::User("alice".to_string());
        let start = Utc::now() - ChronoDuration::hours(1);
        let end = Utc::now();
        let range = TimeRange::custom(start, end).unwrap();

        let upper: Provider = "OPENAI".parse().unwrap();
        let lower: Provider = "openai".parse().unwrap();
        let from_upper = aggregator.provider_stats(&scope, upper, range).await.unwrap();
        let from_lower = aggregator.provider_stats(&scope, lower, range).await.unwrap();
        assert_eq!(from_upper, from_lower);
        assert_eq!(from_upper.stats.total_calls, 1);
    }
}
