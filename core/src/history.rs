use tracing::debug;

use crate::config::QueryConfig;
use crate::error::RetrievalError;
use crate::store::{PointQuery, PointSource};
use crate::types::Point;

/// Raw recent points of one entity, newest first, capped at `history_limit`.
#[derive(Debug, Clone)]
pub struct HistoryRangeReader {
    measurement: String,
    limit: usize,
}

impl HistoryRangeReader {
    pub fn new(config: &QueryConfig) -> Self {
        Self {
            measurement: config.measurement.clone(),
            limit: config.history_limit,
        }
    }

    /// Points are returned as stored; no defaults are filled in.
    pub fn history<S: PointSource + ?Sized>(
        &self,
        source: &S,
        entity_id: &str,
    ) -> Result<Vec<Point>, RetrievalError> {
        let query = PointQuery::latest(&self.measurement, self.limit).for_entity(entity_id);
        let points = source.query(&query).map_err(|source| RetrievalError::Query {
            measurement: self.measurement.clone(),
            source,
        })?;
        debug!(entity_id, points = points.len(), "history loaded");
        Ok(points)
    }
}
