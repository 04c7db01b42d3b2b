//! In-memory form of the calibration table and its CSV encoding.
//!
//! The header is the five key columns followed by one column per parameter name ever
//! written. Cells without a value are left empty.

use chrono::{NaiveDate, NaiveTime};

use super::query::{last_combinations, CalibrationRecord, DATE_FORMAT, KEY_COLUMNS, TIME_FORMAT};
use crate::analysis::ModelParameters;
use crate::error::{AppResult, IlluminationError};

/// All rows of the calibration table plus the parameter column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CalibrationTable {
    columns: Vec<String>,
    records: Vec<CalibrationRecord>,
}

impl CalibrationTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameter column names after the key columns.
    pub fn parameter_columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in table order.
    pub fn records(&self) -> &[CalibrationRecord] {
        &self.records
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds a row. A row with the same full key is replaced in place.
    pub fn upsert(&mut self, record: CalibrationRecord) {
        for name in record.parameters.keys() {
            if !self.columns.contains(name) {
                self.columns.push(name.clone());
            }
        }
        match self.records.iter_mut().find(|r| r.same_key(&record)) {
            Some(existing) => *existing = record,
            None => self.records.push(record),
        }
    }

    /// Copy of this table holding only the latest row per non-time key.
    pub fn compacted(&self) -> Self {
        Self {
            columns: self.columns.clone(),
            records: last_combinations(&self.records),
        }
    }

    /// Parses CSV content.
    pub fn from_csv(bytes: &[u8]) -> AppResult<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(bytes);

        let headers = reader.headers()?.clone();
        let key_headers: Vec<&str> = headers.iter().take(KEY_COLUMNS.len()).collect();
        if key_headers != KEY_COLUMNS {
            return Err(IlluminationError::Storage(format!(
                "unexpected key columns {:?}, expected {:?}",
                key_headers, KEY_COLUMNS
            )));
        }
        let columns: Vec<String> = headers
            .iter()
            .skip(KEY_COLUMNS.len())
            .map(str::to_string)
            .collect();

        let mut records = Vec::new();
        for (line, row) in reader.records().enumerate() {
            let row = row?;
            let field = |i: usize| row.get(i).unwrap_or("");
            let context = |what: &str, value: &str| {
                IlluminationError::Storage(format!(
                    "row {}: invalid {} '{}'",
                    line + 1,
                    what,
                    value
                ))
            };

            let device = field(0).to_string();
            if device.is_empty() {
                return Err(context("DEVICE", ""));
            }
            let wavelength: f64 = field(1).parse().map_err(|_| context("WAVELENGTH", field(1)))?;
            let laser_power: f64 = field(2).parse().map_err(|_| context("LASER_POWER", field(2)))?;
            let date = NaiveDate::parse_from_str(field(3), DATE_FORMAT)
                .map_err(|_| context("DATE", field(3)))?;
            let time = NaiveTime::parse_from_str(field(4), TIME_FORMAT)
                .map_err(|_| context("TIME", field(4)))?;

            let mut parameters = ModelParameters::new();
            for (offset, name) in columns.iter().enumerate() {
                let cell = field(KEY_COLUMNS.len() + offset);
                if cell.is_empty() {
                    continue;
                }
                let value: f64 = cell.parse().map_err(|_| context(name.as_str(), cell))?;
                if !value.is_nan() {
                    parameters.insert(name.clone(), value);
                }
            }

            records.push(CalibrationRecord {
                device,
                wavelength,
                laser_power,
                date,
                time,
                parameters,
            });
        }

        Ok(Self { columns, records })
    }

    /// Encodes the table as CSV.
    pub fn to_csv(&self) -> AppResult<Vec<u8>> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(KEY_COLUMNS.iter().copied().chain(self.columns.iter().map(String::as_str)))?;
        for record in &self.records {
            let mut row: Vec<String> = record
                .key_pairs()
                .into_iter()
                .map(|(_, value)| value)
                .collect();
            for name in &self.columns {
                row.push(match record.parameters.get(name) {
                    Some(v) if !v.is_nan() => v.to_string(),
                    _ => String::new(),
                });
            }
            writer.write_record(&row)?;
        }
        writer
            .into_inner()
            .map_err(|e| IlluminationError::Storage(format!("failed to flush CSV buffer: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;

    fn record(power: f64, stamp: &str, params: &[(&str, f64)]) -> CalibrationRecord {
        let ts = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M").unwrap();
        CalibrationRecord {
            device: "M1".into(),
            wavelength: 488.0,
            laser_power: power,
            date: ts.date(),
            time: ts.time(),
            parameters: params.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn test_csv_round_trip_with_union_columns() {
        let mut table = CalibrationTable::new();
        table.upsert(record(100.0, "2026-10-01 09:00", &[("bkg", 0.1), ("amp", 50.25), ("phi", 30.0)]));
        table.upsert(record(200.0, "2026-10-01 09:05", &[("p0", 1.0 / 3.0), ("i0", -2.5)]));

        let bytes = table.to_csv().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "DEVICE,WAVELENGTH,LASER_POWER,DATE,TIME,amp,bkg,phi,i0,p0"
        );
        assert_eq!(lines.next().unwrap(), "M1,488,100,2026-10-01,09:00,50.25,0.1,30,,");

        let parsed = CalibrationTable::from_csv(&bytes).unwrap();
        assert_eq!(parsed, table);
        assert!(!parsed.records()[1].parameters.contains_key("amp"));
        assert_eq!(parsed.records()[1].parameters["p0"], 1.0 / 3.0);
    }

    #[test]
    fn test_upsert_replaces_same_key() {
        let mut table = CalibrationTable::new();
        table.upsert(record(100.0, "2026-10-01 09:00", &[("amp", 1.0)]));
        table.upsert(record(100.0, "2026-10-01 09:00", &[("amp", 2.0)]));
        assert_eq!(table.len(), 1);
        assert_eq!(table.records()[0].parameters["amp"], 2.0);
    }

    #[test]
    fn test_compacted_keeps_columns() {
        let mut table = CalibrationTable::new();
        table.upsert(record(100.0, "2026-10-01 09:00", &[("amp", 1.0)]));
        table.upsert(record(100.0, "2026-10-02 09:00", &[("bkg", 2.0)]));
        let compact = table.compacted();
        assert_eq!(compact.len(), 1);
        assert_eq!(compact.parameter_columns(), ["amp".to_string(), "bkg".to_string()]);
        assert_eq!(compact.records()[0].parameters["bkg"], 2.0);
    }

    #[test]
    fn test_rejects_foreign_header() {
        let err = CalibrationTable::from_csv(b"timestamp,value\n1,2\n").unwrap_err();
        assert!(err.to_string().contains("unexpected key columns"));
    }

    #[test]
    fn test_rejects_bad_date() {
        let csv = b"DEVICE,WAVELENGTH,LASER_POWER,DATE,TIME,amp\nM1,488,100,01/10/2026,09:00,1\n";
        let err = CalibrationTable::from_csv(csv).unwrap_err();
        assert!(err.to_string().contains("invalid DATE '01/10/2026'"));
    }

    #[test]
    fn test_nan_cells_are_absent() {
        let csv = b"DEVICE,WAVELENGTH,LASER_POWER,DATE,TIME,amp,bkg\nM1,488,100,2026-10-01,09:00,NaN,3\n";
        let table = CalibrationTable::from_csv(csv).unwrap();
        let params = &table.records()[0].parameters;
        assert!(!params.contains_key("amp"));
        assert_eq!(params["bkg"], 3.0);
    }
}
