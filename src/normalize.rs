use crate::error::TimestampError;
use crate::reading::{Reading, TimestampZone};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub const TAG_CHANNEL: &str = "channel";
pub const TAG_ID: &str = "id";
pub const TAG_NAME: &str = "name";

pub const METRIC_TEMPERATURE: &str = "temperature";
pub const METRIC_HUMIDITY: &str = "humidity";
pub const METRIC_BATTERY: &str = "battery";

pub const FIELD_VALUE: &str = "value";
pub const FIELD_TEMPERATURE_C: &str = "temperature_c";
pub const FIELD_TEMPERATURE_F: &str = "temperature_f";
pub const FIELD_HUMIDITY: &str = "humidity";
pub const FIELD_BATTERY: &str = "battery";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NameKey {
    #[default]
    #[serde(alias = "id")]
    DeviceId,
    Channel,
}

#[derive(Debug, Clone, Default)]
pub struct NamingTable {
    key: NameKey,
    names: HashMap<i64, String>,
}

impl NamingTable {
    pub fn new(key: NameKey, names: impl IntoIterator<Item = (i64, String)>) -> Self {
        let names = names
            .into_iter()
            .filter_map(|(id, name)| {
                let trimmed = name.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some((id, trimmed.to_string()))
                }
            })
            .collect();
        Self { key, names }
    }

    pub fn key(&self) -> NameKey {
        self.key
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn resolve(&self, identifier: i64) -> String {
        self.names
            .get(&identifier)
            .cloned()
            .unwrap_or_else(|| identifier.to_string())
    }

    pub fn resolve_reading(&self, reading: &Reading) -> String {
        match self.key {
            NameKey::DeviceId => self.resolve(reading.device_id),
            NameKey::Channel => self.resolve(reading.channel),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointStyle {
    Gauges,
    Composite,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    names: Arc<NamingTable>,
    style: PointStyle,
    zone: TimestampZone,
    measurement: String,
}

impl Normalizer {
    pub fn new(
        names: Arc<NamingTable>,
        style: PointStyle,
        zone: TimestampZone,
        measurement: impl Into<String>,
    ) -> Self {
        Self {
            names,
            style,
            zone,
            measurement: measurement.into(),
        }
    }

    pub fn style(&self) -> PointStyle {
        self.style
    }

    pub fn normalize(&self, reading: &Reading) -> Result<Vec<MetricPoint>, TimestampError> {
        let timestamp = reading.observed_at(self.zone)?;
        let tags = BTreeMap::from([
            (TAG_CHANNEL.to_string(), reading.channel.to_string()),
            (TAG_ID.to_string(), reading.device_id.to_string()),
            (TAG_NAME.to_string(), self.names.resolve_reading(reading)),
        ]);

        let points = match self.style {
            PointStyle::Gauges => [
                (METRIC_TEMPERATURE, reading.temperature_f()),
                (METRIC_HUMIDITY, reading.humidity as f64),
                (METRIC_BATTERY, reading.battery_ok as f64),
            ]
            .into_iter()
            .map(|(name, value)| MetricPoint {
                measurement: name.to_string(),
                tags: tags.clone(),
                fields: BTreeMap::from([(FIELD_VALUE.to_string(), value)]),
                timestamp,
            })
            .collect(),
            PointStyle::Composite => vec![MetricPoint {
                measurement: self.measurement.clone(),
                fields: BTreeMap::from([
                    (FIELD_TEMPERATURE_C.to_string(), reading.temperature_c),
                    (FIELD_TEMPERATURE_F.to_string(), reading.temperature_f()),
                    (FIELD_HUMIDITY.to_string(), reading.humidity as f64),
                    (FIELD_BATTERY.to_string(), reading.battery_ok as f64),
                ]),
                tags,
                timestamp,
            }],
        };
        Ok(points)
    }
}
