use std::collections::HashSet;

use tracing::debug;

use crate::config::QueryConfig;
use crate::error::RetrievalError;
use crate::store::{PointQuery, PointSource};
use crate::types::{LatestSnapshot, Metric, Point, Reading, UNNAMED};

/// Rebuilds a reading from a stored point, filling absent metrics from
/// [`Metric::fallback`]. Returns `None` only when the point has no usable id.
pub fn reading_from_point(point: &Point) -> Option<Reading> {
    let entity_id = point.text("id").filter(|id| !id.trim().is_empty())?;
    let mut reading = Reading {
        display_name: point.text("name").unwrap_or_else(|| UNNAMED.to_string()),
        entity_id,
        ph: 0.0,
        moisture: 0.0,
        co2: 0.0,
        o2: 0.0,
        nh3: 0.0,
        h2s: 0.0,
        temperature: 0.0,
        humidity: 0.0,
        timestamp: point.time,
    };
    for metric in Metric::ALL {
        let value = point
            .number(metric.field())
            .filter(|v| v.is_finite())
            .unwrap_or_else(|| metric.fallback());
        reading.set_metric(metric, value);
    }
    Some(reading)
}

/// Keeps the first reading seen per id. Input must be ordered newest first.
pub fn reduce_latest<'a>(points: impl IntoIterator<Item = &'a Point>) -> LatestSnapshot {
    let mut seen = HashSet::new();
    let mut latest = Vec::new();
    for point in points {
        let Some(reading) = reading_from_point(point) else {
            debug!(time = %point.time, "skipping point without id");
            continue;
        };
        if seen.insert(reading.entity_id.clone()) {
            latest.push(reading);
        }
    }
    latest
}

/// Latest reading per entity over the most recent `snapshot_window` points.
///
/// Entities that have not reported inside that window are absent from the
/// result even if older points exist for them.
#[derive(Debug, Clone)]
pub struct LatestStateAggregator {
    measurement: String,
    window: usize,
}

impl LatestStateAggregator {
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            measurement: config.measurement.clone(),
            window: config.snapshot_window,
        }
    }

    pub fn snapshot<S: PointSource + ?Sized>(
        &self,
        source: &S,
    ) -> Result<LatestSnapshot, RetrievalError> {
        let points = source
            .query(&PointQuery::latest(&self.measurement, self.window))
            .map_err(|source| RetrievalError::Query {
                measurement: self.measurement.clone(),
                source,
            })?;
        let latest = reduce_latest(&points);
        debug!(points = points.len(), entities = latest.len(), "snapshot reduced");
        Ok(latest)
    }
}
