//! Sliding-window byte counters.
//!
//! Every route keeps one [`TimeSeries`] of sent/received byte totals, bucketed
//! per second and bounded to a fixed number of points. Service-level status
//! aggregates route series with [`combine`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BUCKET: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_POINTS: usize = 1000;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStats {
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataPoint {
    pub timestamp: DateTime<Utc>,
    pub value: ProxyStats,
}

/// Snapshot of a time series window.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesData {
    pub points: Vec<DataPoint>,
    pub total: ProxyStats,
}

pub struct TimeSeries {
    bucket: TimeDelta,
    max_points: usize,
    data: Mutex<TimeSeriesData>,
}

impl TimeSeries {
    pub fn new(bucket: Duration, max_points: usize) -> Self {
        TimeSeries {
            bucket: TimeDelta::from_std(bucket).unwrap_or(TimeDelta::seconds(1)),
            max_points,
            data: Mutex::new(TimeSeriesData {
                points: Vec::with_capacity(max_points),
                total: ProxyStats::default(),
            }),
        }
    }

    pub fn log_sent(&self, value: u64) {
        self.add(ProxyStats {
            sent: value,
            received: 0,
        });
    }

    pub fn log_received(&self, value: u64) {
        self.add(ProxyStats {
            sent: 0,
            received: value,
        });
    }

    pub fn snapshot(&self) -> TimeSeriesData {
        let data = match self.data.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        };
        data.clone()
    }

    fn add(&self, value: ProxyStats) {
        self.add_at(Utc::now(), value);
    }

    fn add_at(&self, at: DateTime<Utc>, value: ProxyStats) {
        let now = at.duration_trunc(self.bucket).unwrap_or(at);
        let mut data = match self.data.lock() {
            Ok(x) => x,
            Err(e) => e.into_inner(),
        };

        match data.points.last_mut() {
            Some(last) if last.timestamp == now => {
                last.value.sent += value.sent;
                last.value.received += value.received;
            }
            _ => data.points.push(DataPoint {
                timestamp: now,
                value,
            }),
        }
        if data.points.len() > self.max_points {
            data.points.remove(0);
        }

        let mut total = ProxyStats::default();
        for point in &data.points {
            total.sent += point.value.sent;
            total.received += point.value.received;
        }
        data.total = total;
    }
}

impl Default for TimeSeries {
    fn default() -> Self {
        TimeSeries::new(DEFAULT_BUCKET, DEFAULT_MAX_POINTS)
    }
}

/// Merge two windows: concatenated points in timestamp order, summed totals.
pub fn combine(a: TimeSeriesData, b: TimeSeriesData) -> TimeSeriesData {
    let total = ProxyStats {
        sent: a.total.sent + b.total.sent,
        received: a.total.received + b.total.received,
    };
    let mut points = a.points;
    points.extend(b.points);
    points.sort_by_key(|p| p.timestamp);
    TimeSeriesData { points, total }
}
