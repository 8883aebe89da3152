//! Result payload parsing: CSV time series and simulation summaries.

use chrono::{DateTime, Duration, FixedOffset};
use serde::Deserialize;
use serde_json::Value;

use crate::codec::ProtocolError;

/// A fixed-step time series fetched with `get_result`.
///
/// The wire form is a single CSV string:
/// `start_iso_offset_datetime,timestep_seconds,v1,v2,...`
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesData {
    pub name: String,
    pub start: DateTime<FixedOffset>,
    pub step_seconds: f64,
    pub values: Vec<f64>,
}

impl SeriesData {
    /// Parse the CSV wire form. Values that fail to parse become NaN rather
    /// than failing the whole series.
    pub fn parse_csv(name: &str, data: &str) -> Result<Self, ProtocolError> {
        let mut parts = data.split(',');

        let start_raw = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::Series("empty payload".into()))?;
        let start = DateTime::parse_from_rfc3339(start_raw).map_err(|e| {
            ProtocolError::Series(format!("bad start timestamp {start_raw:?}: {e}"))
        })?;

        let step_raw = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| ProtocolError::Series("missing timestep".into()))?;
        let step_seconds: f64 = step_raw
            .parse()
            .map_err(|_| ProtocolError::Series(format!("bad timestep {step_raw:?}")))?;

        let values = parts
            .map(|v| v.trim().parse().unwrap_or(f64::NAN))
            .collect();

        Ok(Self {
            name: name.to_string(),
            start,
            step_seconds,
            values,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Timestamp of the value at `index`.
    pub fn timestamp_at(&self, index: usize) -> DateTime<FixedOffset> {
        self.start + Duration::milliseconds((self.step_seconds * 1000.0 * index as f64) as i64)
    }

    /// Timestamp of the last value, if any.
    pub fn end(&self) -> Option<DateTime<FixedOffset>> {
        self.values
            .len()
            .checked_sub(1)
            .map(|last| self.timestamp_at(last))
    }
}

/// The JSON payload of a `get_result` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct SeriesPayload {
    pub series_name: String,
    pub data: String,
    #[serde(default)]
    pub format: Option<String>,
}

impl SeriesPayload {
    pub fn from_value(payload: &Value) -> Result<Self, ProtocolError> {
        serde_json::from_value(payload.clone()).map_err(ProtocolError::Json)
    }

    pub fn into_series(self) -> Result<SeriesData, ProtocolError> {
        SeriesData::parse_csv(&self.series_name, &self.data)
    }
}

/// Summary extracted from a `run_simulation` result payload.
///
/// Current engines nest it under `ts`; older ones exposed a flat
/// `outputs_generated` list, which is kept as a fallback.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulationSummary {
    pub timesteps: Option<u64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub outputs: Vec<String>,
}

impl SimulationSummary {
    pub fn from_result_payload(payload: &Value) -> Self {
        let ts = payload.get("ts");

        let outputs = ts
            .and_then(|t| t.get("outputs"))
            .or_else(|| payload.get("outputs_generated"))
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            timesteps: ts.and_then(|t| t.get("len")).and_then(Value::as_u64),
            start: ts
                .and_then(|t| t.get("start"))
                .and_then(Value::as_str)
                .map(str::to_owned),
            end: ts
                .and_then(|t| t.get("end"))
                .and_then(Value::as_str)
                .map(str::to_owned),
            outputs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_well_formed_csv() {
        let series =
            SeriesData::parse_csv("node.outlet.dsflow", "2020-01-01T00:00:00+00:00,86400,1.5,2.5,3.5")
                .unwrap();
        assert_eq!(series.name, "node.outlet.dsflow");
        assert_eq!(series.step_seconds, 86400.0);
        assert_eq!(series.values, vec![1.5, 2.5, 3.5]);
        assert_eq!(series.len(), 3);
        assert_eq!(
            series.timestamp_at(2).to_rfc3339(),
            "2020-01-03T00:00:00+00:00"
        );
        assert_eq!(series.end(), Some(series.timestamp_at(2)));
    }

    #[test]
    fn unparseable_values_become_nan() {
        let series =
            SeriesData::parse_csv("s", "2020-01-01T00:00:00+00:00,3600,1.0,oops,3.0").unwrap();
        assert_eq!(series.values.len(), 3);
        assert!(series.values[1].is_nan());
        assert_eq!(series.values[2], 3.0);
    }

    #[test]
    fn rejects_structurally_broken_payloads() {
        assert!(matches!(
            SeriesData::parse_csv("s", ""),
            Err(ProtocolError::Series(_))
        ));
        assert!(matches!(
            SeriesData::parse_csv("s", "yesterday,3600,1.0"),
            Err(ProtocolError::Series(_))
        ));
        assert!(matches!(
            SeriesData::parse_csv("s", "2020-01-01T00:00:00+00:00"),
            Err(ProtocolError::Series(_))
        ));
        assert!(matches!(
            SeriesData::parse_csv("s", "2020-01-01T00:00:00+00:00,daily,1.0"),
            Err(ProtocolError::Series(_))
        ));
    }

    #[test]
    fn series_with_no_values_is_valid() {
        let series = SeriesData::parse_csv("s", "2020-01-01T00:00:00+00:00,3600").unwrap();
        assert!(series.is_empty());
        assert_eq!(series.end(), None);
    }

    #[test]
    fn payload_struct_round_trips_into_series() {
        let payload = json!({
            "series_name": "node.x",
            "data": "2020-01-01T00:00:00+00:00,3600,1.0",
            "format": "csv"
        });
        let series = SeriesPayload::from_value(&payload)
            .unwrap()
            .into_series()
            .unwrap();
        assert_eq!(series.name, "node.x");
        assert_eq!(series.values, vec![1.0]);
    }

    #[test]
    fn summary_reads_the_ts_block() {
        let payload = json!({
            "ts": {
                "len": 731,
                "start": "2020-01-01T00:00:00",
                "end": "2021-12-31T00:00:00",
                "outputs": ["node.a.dsflow", "node.b.dsflow"]
            }
        });
        let summary = SimulationSummary::from_result_payload(&payload);
        assert_eq!(summary.timesteps, Some(731));
        assert_eq!(summary.start.as_deref(), Some("2020-01-01T00:00:00"));
        assert_eq!(summary.outputs.len(), 2);
    }

    #[test]
    fn summary_falls_back_to_legacy_outputs_list() {
        let payload = json!({ "outputs_generated": ["node.a.dsflow"] });
        let summary = SimulationSummary::from_result_payload(&payload);
        assert_eq!(summary.outputs, vec!["node.a.dsflow".to_string()]);
        assert_eq!(summary.timesteps, None);
    }

    #[test]
    fn summary_of_unrecognized_payload_is_empty() {
        let summary = SimulationSummary::from_result_payload(&json!({"completed": true}));
        assert!(summary.outputs.is_empty());
    }
}
