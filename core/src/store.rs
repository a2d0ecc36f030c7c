use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use duckdb::{Connection, params, params_from_iter};
use thiserror::Error;
use time::{OffsetDateTime, error::ComponentRange};

use crate::types::{FieldValue, Metric, Point};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Memory,
    Disk,
    Both,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no storage backend available")]
    NoBackend,
    #[error("disk path is required to use disk-backed storage")]
    MissingDiskPath,
    #[error("duckdb error: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("stored time {value} is out of range: {source}")]
    TimeRange { value: i64, source: ComponentRange },
    #[error("point time {0} cannot be stored as nanoseconds since the epoch")]
    Unrepresentable(OffsetDateTime),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Raw point query, always ordered by time descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointQuery {
    pub measurement: String,
    pub limit: usize,
    pub entity_id: Option<String>,
}

impl PointQuery {
    pub fn latest(measurement: impl Into<String>, limit: usize) -> Self {
        Self {
            measurement: measurement.into(),
            limit,
            entity_id: None,
        }
    }

    pub fn for_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }
}

/// Read side of a time-series store.
pub trait PointSource {
    fn query(&self, query: &PointQuery) -> Result<Vec<Point>, StoreError>;
}

impl<S: PointSource + ?Sized> PointSource for Mutex<S> {
    fn query(&self, query: &PointQuery) -> Result<Vec<Point>, StoreError> {
        let guard = self.lock().map_err(|_| StoreError::Poisoned)?;
        guard.query(query)
    }
}

impl<S: PointSource + ?Sized> PointSource for Arc<S> {
    fn query(&self, query: &PointQuery) -> Result<Vec<Point>, StoreError> {
        (**self).query(query)
    }
}

const TEXT_COLUMNS: [&str; 3] = ["id", "name", "timestamp"];

pub struct DuckDbStore {
    mode: StorageMode,
    disk_path: Option<PathBuf>,
    memory: Option<Connection>,
    disk: Option<Connection>,
}

impl DuckDbStore {
    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn new(path: impl AsRef<Path>, mode: StorageMode) -> Result<Self, StoreError> {
        let mut store = Self {
            mode,
            disk_path: Some(path.as_ref().to_path_buf()),
            memory: None,
            disk: None,
        };

        store.reconfigure(mode, Some(path))?;

        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let mut store = Self {
            mode: StorageMode::Memory,
            disk_path: None,
            memory: None,
            disk: None,
        };
        store.reconfigure(StorageMode::Memory, Option::<PathBuf>::None)?;
        Ok(store)
    }

    fn open_memory(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(conn)
    }

    fn open_disk(&self, path: &Path) -> Result<Connection, StoreError> {
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        Ok(conn)
    }

    fn reconfigure(
        &mut self,
        mode: StorageMode,
        override_path: Option<impl AsRef<Path>>,
    ) -> Result<(), StoreError> {
        let disk_path = override_path
            .map(|p| p.as_ref().to_path_buf())
            .or_else(|| self.disk_path.clone());

        self.memory = None;
        self.disk = None;

        match (mode, disk_path) {
            (StorageMode::Memory, _) => {
                self.memory = Some(self.open_memory()?);
            }
            (StorageMode::Disk, Some(path)) => {
                self.disk = Some(self.open_disk(&path)?);
                self.disk_path = Some(path);
            }
            (StorageMode::Both, Some(path)) => {
                self.memory = Some(self.open_memory()?);
                self.disk = Some(self.open_disk(&path)?);
                self.disk_path = Some(path);
            }
            (StorageMode::Disk | StorageMode::Both, None) => {
                return Err(StoreError::MissingDiskPath);
            }
        }

        self.mode = mode;

        Ok(())
    }

    fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.memory.iter().chain(self.disk.iter())
    }

    /// Disk holds every row memory does plus anything from earlier runs.
    fn read_connection(&self) -> Result<&Connection, StoreError> {
        self.disk
            .as_ref()
            .or(self.memory.as_ref())
            .ok_or(StoreError::NoBackend)
    }

    /// Appends one raw point. Fields outside the known columns are dropped.
    pub fn write_point(&self, measurement: &str, point: &Point) -> Result<(), StoreError> {
        if self.connections().count() == 0 {
            return Err(StoreError::NoBackend);
        }

        let time_ns = epoch_nanos(point.time).ok_or(StoreError::Unrepresentable(point.time))?;
        let id = point.text("id");
        let name = point.text("name");
        let timestamp = point.text("timestamp");
        let metrics: Vec<Option<f64>> = Metric::ALL
            .iter()
            .map(|m| point.number(m.field()))
            .collect();

        for conn in self.connections() {
            let mut stmt = conn.prepare(
                "INSERT INTO points (measurement, time_ns, id, name, timestamp,
                                     ph, moisture, co2, o2, nh3, h2s, temp, humidity)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            stmt.execute(params![
                measurement,
                time_ns,
                id,
                name,
                timestamp,
                metrics[0],
                metrics[1],
                metrics[2],
                metrics[3],
                metrics[4],
                metrics[5],
                metrics[6],
                metrics[7]
            ])?;
        }

        Ok(())
    }

    pub fn count(&self, measurement: &str) -> Result<u64, StoreError> {
        let conn = self.read_connection()?;
        let mut stmt = conn.prepare("SELECT COUNT(*) FROM points WHERE measurement = ?")?;
        let mut rows = stmt.query([measurement])?;
        if let Some(row) = rows.next()? {
            let n: i64 = row.get(0)?;
            return Ok(n.max(0) as u64);
        }
        Ok(0)
    }

    fn query_points(&self, query: &PointQuery) -> Result<Vec<Point>, StoreError> {
        let conn = self.read_connection()?;
        let mut conditions = vec!["measurement = ?".to_string()];
        let mut params: Vec<String> = vec![query.measurement.clone()];

        if let Some(id) = &query.entity_id {
            conditions.push("id = ?".to_string());
            params.push(id.clone());
        }

        let sql = format!(
            "SELECT time_ns, id, name, timestamp, ph, moisture, co2, o2, nh3, h2s, temp, humidity
             FROM points
             WHERE {}
             ORDER BY time_ns DESC
             LIMIT {}",
            conditions.join(" AND "),
            query.limit
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut result = Vec::new();
        while let Some(row) = rows.next()? {
            let time_ns: i64 = row.get(0)?;
            let time = OffsetDateTime::from_unix_timestamp_nanos(time_ns.into()).map_err(
                |source| StoreError::TimeRange {
                    value: time_ns,
                    source,
                },
            )?;
            let mut point = Point::new(time);
            for (offset, column) in TEXT_COLUMNS.iter().enumerate() {
                let value: Option<String> = row.get(1 + offset)?;
                if let Some(value) = value {
                    point.fields.insert(column.to_string(), FieldValue::Text(value));
                }
            }
            for (offset, metric) in Metric::ALL.iter().enumerate() {
                let value: Option<f64> = row.get(1 + TEXT_COLUMNS.len() + offset)?;
                if let Some(value) = value {
                    point
                        .fields
                        .insert(metric.field().to_string(), FieldValue::Number(value));
                }
            }
            result.push(point);
        }

        Ok(result)
    }
}

/// Nanoseconds since the epoch, if they fit the `time_ns` column.
pub fn epoch_nanos(time: OffsetDateTime) -> Option<i64> {
    i64::try_from(time.unix_timestamp_nanos()).ok()
}

impl PointSource for DuckDbStore {
    fn query(&self, query: &PointQuery) -> Result<Vec<Point>, StoreError> {
        self.query_points(query)
    }
}

fn init_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS points (
            measurement TEXT NOT NULL,
            time_ns BIGINT NOT NULL,
            id TEXT,
            name TEXT,
            timestamp TEXT,
            ph DOUBLE,
            moisture DOUBLE,
            co2 DOUBLE,
            o2 DOUBLE,
            nh3 DOUBLE,
            h2s DOUBLE,
            temp DOUBLE,
            humidity DOUBLE
        );
        CREATE INDEX IF NOT EXISTS idx_points_measurement_time ON points(measurement, time_ns);
        CREATE INDEX IF NOT EXISTS idx_points_measurement_id ON points(measurement, id);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};
    use time::macros::datetime;

    fn temp_path() -> std::path::PathBuf {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fleet-store-{nonce}.duckdb"))
    }

    fn point(id: &str, time: OffsetDateTime, ph: Option<f64>) -> Point {
        let mut p = Point::new(time)
            .with("id", FieldValue::Text(id.into()))
            .with("name", FieldValue::Text(format!("Plant_{id}")));
        if let Some(ph) = ph {
            p = p.with("ph", FieldValue::Number(ph));
        }
        p
    }

    fn sample_points() -> Vec<Point> {
        vec![
            point("1", datetime!(2024-01-01 00:00:00 UTC), Some(6.0)),
            point("2", datetime!(2024-01-01 00:01:00 UTC), Some(6.5)),
            point("1", datetime!(2024-01-01 00:02:00 UTC), None),
        ]
    }

    #[test]
    fn newest_first_with_limit() {
        let store = DuckDbStore::in_memory().unwrap();
        for p in sample_points() {
            store.write_point("m", &p).unwrap();
        }
        let loaded = store.query(&PointQuery::latest("m", 2)).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].time, datetime!(2024-01-01 00:02:00 UTC));
        assert_eq!(loaded[1].time, datetime!(2024-01-01 00:01:00 UTC));
        assert_eq!(loaded[0].number("ph"), None);
        assert_eq!(loaded[1].number("ph"), Some(6.5));
        assert_eq!(store.count("m").unwrap(), 3);
    }

    #[test]
    fn entity_filter_and_measurement_isolation() {
        let store = DuckDbStore::in_memory().unwrap();
        for p in sample_points() {
            store.write_point("m", &p).unwrap();
        }
        store
            .write_point("other", &point("1", datetime!(2024-01-02 00:00:00 UTC), None))
            .unwrap();

        let only_one = store
            .query(&PointQuery::latest("m", 50).for_entity("1"))
            .unwrap();
        assert_eq!(only_one.len(), 2);
        assert!(only_one.iter().all(|p| p.text("id").as_deref() == Some("1")));

        let unknown = store
            .query(&PointQuery::latest("m", 50).for_entity("nope"))
            .unwrap();
        assert!(unknown.is_empty());
    }

    #[test]
    fn reopened_in_both_mode_reads_earlier_disk_rows() {
        let path = temp_path();
        let store = DuckDbStore::new(&path, StorageMode::Disk).unwrap();
        for minute in 0..5 {
            let time = datetime!(2024-01-01 00:00:00 UTC) + time::Duration::minutes(minute);
            store.write_point("m", &point("1", time, Some(6.0))).unwrap();
        }
        drop(store);

        let store = DuckDbStore::new(&path, StorageMode::Both).unwrap();
        assert_eq!(store.mode(), StorageMode::Both);
        store
            .write_point("m", &point("1", datetime!(2024-01-01 01:00:00 UTC), Some(7.0)))
            .unwrap();

        let loaded = store
            .query(&PointQuery::latest("m", 50).for_entity("1"))
            .unwrap();
        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded[0].time, datetime!(2024-01-01 01:00:00 UTC));
        assert_eq!(store.count("m").unwrap(), 6);
        drop(store);
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn time_outside_nanosecond_range_is_rejected() {
        let store = DuckDbStore::in_memory().unwrap();
        let far = point("1", datetime!(2300-01-01 00:00:00 UTC), None);
        assert!(matches!(
            store.write_point("m", &far),
            Err(StoreError::Unrepresentable(_))
        ));
        assert_eq!(store.count("m").unwrap(), 0);
        assert!(epoch_nanos(datetime!(2262-01-01 00:00:00 UTC)).is_some());
    }

    #[test]
    fn shared_store_answers_queries() {
        let store = Arc::new(Mutex::new(DuckDbStore::in_memory().unwrap()));
        store
            .lock()
            .unwrap()
            .write_point("m", &sample_points()[0])
            .unwrap();
        let loaded = store.query(&PointQuery::latest("m", 5)).unwrap();
        assert_eq!(loaded.len(), 1);
    }
}
