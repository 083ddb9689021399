//! Rows hung off a listing rather than stored on it: popularity windows,
//! feature groups, value estimates and yearly tax records.

use std::collections::BTreeMap;

use listing_common::{FeatureGroup, PropertySnapshot, TaxYear, ValueEstimate};

/// Metrics of one popularity window, e.g. the last 30 days.
#[derive(Debug, Clone, PartialEq)]
pub struct PopularityWindow {
    pub last_n_days: u32,
    pub metrics: BTreeMap<String, f64>,
}

/// Everything in a snapshot that lands in child tables of the listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelatedRecords {
    pub popularity: Vec<PopularityWindow>,
    pub features: Vec<FeatureGroup>,
    pub estimates: Vec<ValueEstimate>,
    pub tax_history: Vec<TaxYear>,
}

impl RelatedRecords {
    pub fn from_snapshot(snapshot: &PropertySnapshot) -> Self {
        Self {
            popularity: snapshot
                .popularity
                .as_ref()
                .map(popularity_windows)
                .unwrap_or_default(),
            features: snapshot.details.features.clone(),
            estimates: snapshot.details.estimates.clone(),
            tax_history: snapshot.details.tax_history.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.popularity.is_empty()
            && self.features.is_empty()
            && self.estimates.is_empty()
            && self.tax_history.is_empty()
    }
}

/// Regroup `<metric>_<n>d` keys into one window per `n`.
fn popularity_windows(metrics: &BTreeMap<String, f64>) -> Vec<PopularityWindow> {
    let mut windows: BTreeMap<u32, BTreeMap<String, f64>> = BTreeMap::new();
    for (key, value) in metrics {
        let Some((metric, window)) = key.rsplit_once('_') else {
            continue;
        };
        let Some(days) = window.strip_suffix('d').and_then(|d| d.parse::<u32>().ok()) else {
            continue;
        };
        windows
            .entry(days)
            .or_default()
            .insert(metric.to_string(), *value);
    }
    windows
        .into_iter()
        .map(|(last_n_days, metrics)| PopularityWindow {
            last_n_days,
            metrics,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, Utc};
    use listing_common::{ListingDetails, ListingStatus, Price};

    use super::*;

    #[test]
    fn popularity_keys_regroup_by_window() {
        let metrics = BTreeMap::from([
            ("views_total_30d".to_string(), 120.0),
            ("saves_total_30d".to_string(), 4.0),
            ("views_total_7d".to_string(), 31.0),
            ("dwell_time_mean_7d".to_string(), 12.5),
            ("garbage".to_string(), 1.0),
        ]);
        let windows = popularity_windows(&metrics);

        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].last_n_days, 7);
        assert_eq!(windows[0].metrics["views_total"], 31.0);
        assert_eq!(windows[0].metrics["dwell_time_mean"], 12.5);
        assert_eq!(windows[1].last_n_days, 30);
        assert_eq!(windows[1].metrics.len(), 2);
    }

    #[test]
    fn snapshot_history_is_carried_over() {
        let snapshot = PropertySnapshot {
            address: "1 Oak Ave".into(),
            canonical_source_id: "1".into(),
            price: None,
            status: ListingStatus::Active,
            photo_urls: vec![],
            popularity: None,
            details: ListingDetails {
                estimates: vec![ValueEstimate {
                    date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
                    estimate: Some(Price::from_dollars(455_000.0)),
                    high: None,
                    low: None,
                    best_home_value: true,
                    source_name: "Quantarium".into(),
                    source_type: "avm".into(),
                }],
                ..Default::default()
            },
            summary: None,
            fetched_at: Utc::now(),
        };
        let related = RelatedRecords::from_snapshot(&snapshot);
        assert_eq!(related.estimates.len(), 1);
        assert!(related.popularity.is_empty());
        assert!(!related.is_empty());
        assert!(RelatedRecords::default().is_empty());
    }
}
