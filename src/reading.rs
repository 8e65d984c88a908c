use crate::error::{ParseError, TimestampError};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use simd_json::prelude::ValueAsScalar;
use simd_json::BorrowedValue;

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampZone {
    #[default]
    Utc,
    Local,
}

// `time` stays raw text until observed_at.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    pub time: String,
    #[serde(rename = "id")]
    pub device_id: i64,
    pub channel: i64,
    pub battery_ok: i64,
    #[serde(rename = "temperature_C")]
    pub temperature_c: f64,
    pub humidity: i64,
}

impl Reading {
    pub fn temperature_f(&self) -> f64 {
        fahrenheit(self.temperature_c)
    }

    pub fn observed_at(&self, zone: TimestampZone) -> Result<DateTime<Utc>, TimestampError> {
        let naive = NaiveDateTime::parse_from_str(&self.time, TIME_FORMAT).map_err(|err| {
            TimestampError {
                raw: self.time.clone(),
                reason: err.to_string(),
            }
        })?;
        match zone {
            TimestampZone::Utc => Ok(naive.and_utc()),
            TimestampZone::Local => Local
                .from_local_datetime(&naive)
                .single()
                .map(|local| local.with_timezone(&Utc))
                .ok_or_else(|| TimestampError {
                    raw: self.time.clone(),
                    reason: "ambiguous or nonexistent local time".to_string(),
                }),
        }
    }

    #[cfg(test)]
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

pub fn fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

pub fn parse_reading(payload: &[u8]) -> Result<Reading, ParseError> {
    // simd-json parses in place; keep the caller's bytes intact for diagnostics.
    let mut scratch = payload.to_vec();
    let value =
        simd_json::to_borrowed_value(&mut scratch).map_err(|err| ParseError::Json(err.to_string()))?;
    let BorrowedValue::Object(obj) = value else {
        return Err(ParseError::NotAnObject);
    };

    // Type errors first, then missing fields.
    let time = obj
        .get("time")
        .map(|value| {
            value
                .as_str()
                .map(str::to_string)
                .ok_or(ParseError::InvalidField {
                    field: "time",
                    expected: "a string",
                })
        })
        .transpose()?;
    let device_id = obj.get("id").map(|v| integer("id", v)).transpose()?;
    let channel = obj.get("channel").map(|v| integer("channel", v)).transpose()?;
    let battery_ok = obj
        .get("battery_ok")
        .map(|v| integer("battery_ok", v))
        .transpose()?;
    let temperature_c = obj
        .get("temperature_C")
        .map(|v| float("temperature_C", v))
        .transpose()?;
    let humidity = obj.get("humidity").map(|v| integer("humidity", v)).transpose()?;

    Ok(Reading {
        time: time.ok_or(ParseError::MissingField("time"))?,
        device_id: device_id.ok_or(ParseError::MissingField("id"))?,
        channel: channel.ok_or(ParseError::MissingField("channel"))?,
        battery_ok: battery_ok.ok_or(ParseError::MissingField("battery_ok"))?,
        temperature_c: temperature_c.ok_or(ParseError::MissingField("temperature_C"))?,
        humidity: humidity.ok_or(ParseError::MissingField("humidity"))?,
    })
}

fn integer(name: &'static str, value: &BorrowedValue<'_>) -> Result<i64, ParseError> {
    value
        .as_i64()
        .or_else(|| value.as_u64().and_then(|v| i64::try_from(v).ok()))
        .ok_or(ParseError::InvalidField {
            field: name,
            expected: "an integer",
        })
}

fn float(name: &'static str, value: &BorrowedValue<'_>) -> Result<f64, ParseError> {
    value
        .as_f64()
        .or_else(|| value.as_i64().map(|v| v as f64))
        .or_else(|| value.as_u64().map(|v| v as f64))
        .filter(|v| v.is_finite())
        .ok_or(ParseError::InvalidField {
            field: name,
            expected: "a number",
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = br#"{"time":"2021-06-01 12:00:00","id":1,"channel":0,"battery_ok":1,"temperature_C":20.0,"humidity":55}"#;

    #[test]
    fn parses_receiver_line() {
        let reading = parse_reading(SAMPLE).expect("valid reading");
        assert_eq!(reading.time, "2021-06-01 12:00:00");
        assert_eq!(reading.device_id, 1);
        assert_eq!(reading.channel, 0);
        assert_eq!(reading.battery_ok, 1);
        assert_eq!(reading.temperature_c, 20.0);
        assert_eq!(reading.humidity, 55);
    }

    #[test]
    fn ignores_unknown_fields() {
        let payload = br#"{"time":"2021-06-01 12:00:00","model":"Acurite-Tower","id":7,"channel":3,
            "battery_ok":0,"temperature_C":-4.5,"humidity":91,"mic":"CHECKSUM"}"#;
        let reading = parse_reading(payload).expect("valid reading");
        assert_eq!(reading.device_id, 7);
        assert_eq!(reading.temperature_c, -4.5);
    }

    #[test]
    fn accepts_integral_temperature() {
        let payload = br#"{"time":"2021-06-01 12:00:00","id":1,"channel":0,"battery_ok":1,"temperature_C":21,"humidity":40}"#;
        assert_eq!(parse_reading(payload).unwrap().temperature_c, 21.0);
    }

    #[test]
    fn type_mismatch_names_the_field() {
        let err = parse_reading(br#"{"id": "not-a-number"}"#).unwrap_err();
        assert_eq!(err.field(), Some("id"));

        let payload = br#"{"time":"2021-06-01 12:00:00","id":"not-a-number","channel":0,"battery_ok":1,"temperature_C":20.0,"humidity":55}"#;
        let err = parse_reading(payload).unwrap_err();
        assert_eq!(
            err,
            ParseError::InvalidField {
                field: "id",
                expected: "an integer"
            }
        );
    }

    #[test]
    fn battery_flag_is_not_a_boolean() {
        let payload = br#"{"time":"2021-06-01 12:00:00","id":1,"channel":0,"battery_ok":true,"temperature_C":20.0,"humidity":55}"#;
        assert_eq!(parse_reading(payload).unwrap_err().field(), Some("battery_ok"));
    }

    #[test]
    fn missing_field_is_reported() {
        let payload = br#"{"time":"2021-06-01 12:00:00","id":1,"channel":0,"battery_ok":1,"temperature_C":20.0}"#;
        assert_eq!(
            parse_reading(payload).unwrap_err(),
            ParseError::MissingField("humidity")
        );
    }

    #[test]
    fn rejects_non_objects_and_garbage() {
        assert_eq!(parse_reading(b"[1,2,3]").unwrap_err(), ParseError::NotAnObject);
        assert!(matches!(
            parse_reading(b"rtl_433 version 21.12").unwrap_err(),
            ParseError::Json(_)
        ));
    }

    #[test]
    fn wire_encoding_parses_back_to_the_same_reading() {
        for (time, id, channel, battery_ok, temperature_c, humidity) in [
            ("2021-06-01 12:00:00", 1, 0, 1, 20.0, 55),
            ("1999-12-31 23:59:59", 65535, 3, 0, -17.3, 0),
            ("2024-02-29 00:00:01", 0, 255, 1, 48.25, 100),
        ] {
            let reading = Reading {
                time: time.to_string(),
                device_id: id,
                channel,
                battery_ok,
                temperature_c,
                humidity,
            };
            let wire = reading.to_wire().unwrap();
            assert_eq!(parse_reading(wire.as_bytes()).unwrap(), reading);
        }
    }

    #[test]
    fn fahrenheit_conversion_is_exact() {
        for c in [-40.0, -17.5, 0.0, 20.0, 21.7, 37.0, 100.0] {
            assert_eq!(fahrenheit(c), c * 9.0 / 5.0 + 32.0);
        }
        assert_eq!(fahrenheit(20.0), 68.0);
        assert_eq!(fahrenheit(-40.0), -40.0);
    }

    #[test]
    fn observed_at_reads_utc_by_default() {
        let reading = parse_reading(SAMPLE).unwrap();
        let ts = reading.observed_at(TimestampZone::Utc).unwrap();
        assert_eq!(ts.to_rfc3339(), "2021-06-01T12:00:00+00:00");
    }

    #[test]
    fn observed_at_rejects_out_of_range_fields() {
        let mut reading = parse_reading(SAMPLE).unwrap();
        reading.time = "2021-13-40 99:99:99".to_string();
        let err = reading.observed_at(TimestampZone::Utc).unwrap_err();
        assert_eq!(err.raw, "2021-13-40 99:99:99");

        reading.time = "2021-06-01T12:00:00Z".to_string();
        assert!(reading.observed_at(TimestampZone::Utc).is_err());
    }
}
