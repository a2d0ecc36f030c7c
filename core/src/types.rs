use std::collections::BTreeMap;

use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

pub const DISPLAY_NAME_PREFIX: &str = "Plant_";
pub const UNNAMED: &str = "Unnamed";

/// One of the eight environmental measurements every sensor reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Ph,
    Moisture,
    Co2,
    O2,
    Nh3,
    H2s,
    Temperature,
    Humidity,
}

impl Metric {
    pub const ALL: [Metric; 8] = [
        Metric::Ph,
        Metric::Moisture,
        Metric::Co2,
        Metric::O2,
        Metric::Nh3,
        Metric::H2s,
        Metric::Temperature,
        Metric::Humidity,
    ];

    /// Field name used on the wire and as the store column.
    pub fn field(self) -> &'static str {
        match self {
            Metric::Ph => "ph",
            Metric::Moisture => "moisture",
            Metric::Co2 => "co2",
            Metric::O2 => "o2",
            Metric::Nh3 => "nh3",
            Metric::H2s => "h2s",
            Metric::Temperature => "temp",
            Metric::Humidity => "humidity",
        }
    }

    /// Closed interval the generator draws from.
    pub fn range(self) -> (f64, f64) {
        match self {
            Metric::Ph => (5.5, 8.0),
            Metric::Moisture => (20.0, 80.0),
            Metric::Co2 => (300.0, 1000.0),
            Metric::O2 => (18.0, 22.0),
            Metric::Nh3 => (0.0, 10.0),
            Metric::H2s => (0.0, 5.0),
            Metric::Temperature => (18.0, 35.0),
            Metric::Humidity => (30.0, 90.0),
        }
    }

    /// Substituted when a stored point lacks the field.
    pub fn fallback(self) -> f64 {
        match self {
            Metric::Ph => 7.0,
            Metric::Moisture => 0.0,
            Metric::Co2 => 400.0,
            Metric::O2 => 20.9,
            Metric::Nh3 => 0.0,
            Metric::H2s => 0.0,
            Metric::Temperature => 25.0,
            Metric::Humidity => 60.0,
        }
    }
}

pub fn display_name_for(entity_id: &str) -> String {
    format!("{DISPLAY_NAME_PREFIX}{entity_id}")
}

/// A single timestamped measurement of one sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    #[serde(rename = "id")]
    pub entity_id: String,
    #[serde(rename = "name")]
    pub display_name: String,
    pub ph: f64,
    pub moisture: f64,
    pub co2: f64,
    pub o2: f64,
    pub nh3: f64,
    pub h2s: f64,
    #[serde(rename = "temp")]
    pub temperature: f64,
    pub humidity: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl Reading {
    pub fn metric(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Ph => self.ph,
            Metric::Moisture => self.moisture,
            Metric::Co2 => self.co2,
            Metric::O2 => self.o2,
            Metric::Nh3 => self.nh3,
            Metric::H2s => self.h2s,
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
        }
    }

    pub fn set_metric(&mut self, metric: Metric, value: f64) {
        let slot = match metric {
            Metric::Ph => &mut self.ph,
            Metric::Moisture => &mut self.moisture,
            Metric::Co2 => &mut self.co2,
            Metric::O2 => &mut self.o2,
            Metric::Nh3 => &mut self.nh3,
            Metric::H2s => &mut self.h2s,
            Metric::Temperature => &mut self.temperature,
            Metric::Humidity => &mut self.humidity,
        };
        *slot = value;
    }

    /// JSON payload published on the message channel.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Most recent reading per entity, recomputed on every query.
pub type LatestSnapshot = Vec<Reading>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(v) => Some(*v),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Number(v) if v.fract() == 0.0 && v.abs() < 1e15 => format!("{}", *v as i64),
            FieldValue::Number(v) => v.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

/// A raw stored point: named fields plus the time it is indexed under.
///
/// Absent and null fields are both represented by a missing key.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub time: OffsetDateTime,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Point {
    pub fn new(time: OffsetDateTime) -> Self {
        Self {
            time,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: &str, value: FieldValue) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).map(FieldValue::as_text)
    }
}

impl From<&Reading> for Point {
    fn from(reading: &Reading) -> Self {
        let mut point = Point::new(reading.timestamp)
            .with("id", FieldValue::Text(reading.entity_id.clone()))
            .with("name", FieldValue::Text(reading.display_name.clone()));
        for metric in Metric::ALL {
            point = point.with(metric.field(), FieldValue::Number(reading.metric(metric)));
        }
        point
    }
}

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let time = self
            .time
            .format(&Rfc3339)
            .map_err(serde::ser::Error::custom)?;
        let mut map = serializer.serialize_map(Some(self.fields.len() + 1))?;
        map.serialize_entry("time", &time)?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}
