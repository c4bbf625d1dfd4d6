//! Summary and per-group totals. Pure, single pass over normalized records.
//!
//! Totals only hold additive numerators and denominators. Rates are derived
//! from them on demand so every group's rate is weighted by its own volume.

use std::collections::BTreeMap;

use adrep_core::{
    group_key, safe_percent, safe_rate, AnalyticsRecord, ExchangeRecord, QualityRecord,
    TrafficVerdict,
};
use serde::Serialize;

pub trait Accumulate<R> {
    fn add(&mut self, record: &R);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExchangeTotals {
    pub exchange_revenue: f64,
    pub ad_server_revenue: f64,
    pub clicks: u64,
    pub impressions: u64,
    pub viewable_impressions: u64,
    pub ad_requests: u64,
    pub rows: u64,
}

impl ExchangeTotals {
    pub fn total_revenue(&self) -> f64 {
        self.exchange_revenue + self.ad_server_revenue
    }

    /// Exchange revenue per thousand impressions.
    pub fn ecpm(&self) -> f64 {
        safe_rate(self.exchange_revenue, self.impressions as f64) * 1000.0
    }

    pub fn ctr(&self) -> f64 {
        safe_rate(self.clicks as f64, self.impressions as f64)
    }
}

impl Accumulate<ExchangeRecord> for ExchangeTotals {
    fn add(&mut self, record: &ExchangeRecord) {
        self.exchange_revenue += record.ad_exchange_revenue;
        self.ad_server_revenue += record.ad_server_revenue;
        self.clicks += record.clicks;
        self.impressions += record.impressions;
        self.viewable_impressions += record.viewable_impressions;
        self.ad_requests += record.ad_requests;
        self.rows += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExchangeAggregate {
    pub summary: ExchangeTotals,
    pub by_source: BTreeMap<String, ExchangeTotals>,
    pub by_ad_unit: BTreeMap<String, ExchangeTotals>,
}

pub fn aggregate_exchange(records: &[ExchangeRecord]) -> ExchangeAggregate {
    let mut out = ExchangeAggregate::default();
    for record in records {
        out.summary.add(record);
        out.by_source
            .entry(group_key(Some(&record.source)))
            .or_default()
            .add(record);
        out.by_ad_unit
            .entry(group_key(Some(&record.ad_unit_name)))
            .or_default()
            .add(record);
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QualityTotals {
    pub requests: u64,
    pub responses: u64,
    pub good: u64,
    pub bad: u64,
    pub warn: u64,
}

impl QualityTotals {
    fn add_request(&mut self) {
        self.requests += 1;
    }

    fn add_response(&mut self, verdict: Option<TrafficVerdict>) {
        self.responses += 1;
        match verdict {
            Some(TrafficVerdict::Good) => self.good += 1,
            Some(TrafficVerdict::Bad) => self.bad += 1,
            Some(TrafficVerdict::Warn) => self.warn += 1,
            Some(TrafficVerdict::Other) | None => {}
        }
    }

    /// Share of requests that never got a response, as a percentage.
    pub fn drop_rate(&self) -> f64 {
        safe_percent(self.requests as f64 - self.responses as f64, self.requests as f64)
    }

    pub fn good_rate(&self) -> f64 {
        safe_percent(self.good as f64, self.responses as f64)
    }

    pub fn bad_rate(&self) -> f64 {
        safe_percent(self.bad as f64, self.responses as f64)
    }

    pub fn warn_rate(&self) -> f64 {
        safe_percent(self.warn as f64, self.responses as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityAggregate {
    pub summary: QualityTotals,
    pub by_source: BTreeMap<String, QualityTotals>,
}

/// Request rows count toward `requests`; response rows toward `responses` and their verdict.
pub fn aggregate_quality(
    requests: &[QualityRecord],
    responses: &[QualityRecord],
) -> QualityAggregate {
    let mut out = QualityAggregate::default();
    for record in requests {
        out.summary.add_request();
        out.by_source
            .entry(group_key(Some(&record.source)))
            .or_default()
            .add_request();
    }
    for record in responses {
        out.summary.add_response(record.verdict);
        out.by_source
            .entry(group_key(Some(&record.source)))
            .or_default()
            .add_response(record.verdict);
    }
    out
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalyticsTotals {
    pub sessions: u64,
    pub revenue: f64,
    pub ad_revenue: f64,
    pub events: u64,
    pub page_views: u64,
    pub engaged_sessions: u64,
    pub users: u64,
}

impl Accumulate<AnalyticsRecord> for AnalyticsTotals {
    fn add(&mut self, record: &AnalyticsRecord) {
        self.sessions += record.sessions;
        self.revenue += record.revenue;
        self.ad_revenue += record.ad_revenue;
        self.events += record.events;
        self.page_views += record.page_views;
        self.engaged_sessions += record.engaged_sessions;
        self.users += record.users;
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyticsAggregate {
    pub summary: AnalyticsTotals,
    pub by_source: BTreeMap<String, AnalyticsTotals>,
    pub by_medium: BTreeMap<String, AnalyticsTotals>,
    pub by_source_medium: BTreeMap<(String, String), AnalyticsTotals>,
}

pub fn aggregate_analytics(records: &[AnalyticsRecord]) -> AnalyticsAggregate {
    let mut out = AnalyticsAggregate::default();
    for record in records {
        let source = group_key(Some(&record.source));
        let medium = group_key(Some(&record.medium));
        out.summary.add(record);
        out.by_source.entry(source.clone()).or_default().add(record);
        out.by_medium.entry(medium.clone()).or_default().add(record);
        out.by_source_medium
            .entry((source, medium))
            .or_default()
            .add(record);
    }
    out
}

/// The `n` largest groups by `metric`, largest first.
pub fn top_groups<K: Clone, T>(
    groups: &BTreeMap<K, T>,
    n: usize,
    metric: impl Fn(&T) -> f64,
) -> Vec<(K, f64)> {
    let mut ranked: Vec<(K, f64)> = groups.iter().map(|(k, v)| (k.clone(), metric(v))).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked.truncate(n);
    ranked
}
