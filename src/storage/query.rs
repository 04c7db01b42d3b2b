//! Record, index and selector types for the calibration table.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::analysis::ModelParameters;
use crate::error::{AppResult, IlluminationError};

/// Date column format.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Time column format (minute resolution).
pub const TIME_FORMAT: &str = "%H:%M";

/// Key columns, in their fixed on-disk order.
pub const KEY_COLUMNS: [&str; 5] = ["DEVICE", "WAVELENGTH", "LASER_POWER", "DATE", "TIME"];

/// Non-time part of a record key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationIndex {
    /// Attenuating device name.
    pub device: String,
    /// Laser wavelength in nm.
    pub wavelength: f64,
    /// Laser output-power set-point in mW.
    pub laser_power: f64,
}

impl CalibrationIndex {
    /// Creates an index.
    pub fn new(device: impl Into<String>, wavelength: f64, laser_power: f64) -> Self {
        Self {
            device: device.into(),
            wavelength,
            laser_power,
        }
    }
}

/// Partial index; `None` fields match every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexQuery {
    /// Device filter.
    pub device: Option<String>,
    /// Wavelength filter.
    pub wavelength: Option<f64>,
    /// Laser power filter.
    pub laser_power: Option<f64>,
}

impl IndexQuery {
    /// Matches every row.
    pub fn any() -> Self {
        Self::default()
    }

    /// Restricts to one device.
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Restricts to one wavelength.
    pub fn wavelength(mut self, wavelength: f64) -> Self {
        self.wavelength = Some(wavelength);
        self
    }

    /// Restricts to one laser power.
    pub fn laser_power(mut self, laser_power: f64) -> Self {
        self.laser_power = Some(laser_power);
        self
    }

    /// Returns true if `record` matches every specified field.
    pub fn matches(&self, record: &CalibrationRecord) -> bool {
        self.device.as_deref().map_or(true, |d| d == record.device)
            && self.wavelength.map_or(true, |w| w == record.wavelength)
            && self.laser_power.map_or(true, |p| p == record.laser_power)
    }
}

impl From<&CalibrationIndex> for IndexQuery {
    fn from(index: &CalibrationIndex) -> Self {
        Self {
            device: Some(index.device.clone()),
            wavelength: Some(index.wavelength),
            laser_power: Some(index.laser_power),
        }
    }
}

impl fmt::Display for IndexQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn field<T: fmt::Display>(value: &Option<T>) -> String {
            value.as_ref().map_or_else(|| "*".to_string(), T::to_string)
        }
        write!(
            f,
            "device={}, wavelength={}, laser_power={}",
            field(&self.device),
            field(&self.wavelength),
            field(&self.laser_power)
        )
    }
}

/// How rows are folded over the time dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSelector {
    /// The single most recent row; ties go to the later row in the table.
    Latest,
    /// All rows on the most recent date.
    LastDate,
    /// The most recent row of every `(device, wavelength, laser_power)` combination.
    LastCombinations,
    /// Every matching row.
    All,
    /// Rows stamped with exactly this date (and time, if given).
    At {
        /// Calibration date.
        date: NaiveDate,
        /// Calibration time; `None` matches the whole day.
        time: Option<NaiveTime>,
    },
}

impl FromStr for TimeSelector {
    type Err = IlluminationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "latest" => return Ok(Self::Latest),
            "last_date" => return Ok(Self::LastDate),
            "last_combinations" => return Ok(Self::LastCombinations),
            "all" => return Ok(Self::All),
            _ => {}
        }
        let mut parts = s.split_whitespace();
        let date = parts
            .next()
            .and_then(|d| NaiveDate::parse_from_str(d, DATE_FORMAT).ok());
        let time = parts.next().map(|t| NaiveTime::parse_from_str(t, TIME_FORMAT));
        match (date, time, parts.next()) {
            (Some(date), None, None) => Ok(Self::At { date, time: None }),
            (Some(date), Some(Ok(time)), None) => Ok(Self::At {
                date,
                time: Some(time),
            }),
            _ => Err(IlluminationError::InvalidRequest(format!(
                "'{}' is not a time selector. Use latest, last_date, last_combinations, all, \
                 YYYY-MM-DD or 'YYYY-MM-DD HH:MM'",
                s
            ))),
        }
    }
}

/// One row of the calibration table.
#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationRecord {
    /// Attenuating device name.
    pub device: String,
    /// Laser wavelength in nm.
    pub wavelength: f64,
    /// Laser output-power set-point in mW.
    pub laser_power: f64,
    /// Calibration date.
    pub date: NaiveDate,
    /// Calibration time, minute resolution.
    pub time: NaiveTime,
    /// Fitted model parameters. Columns without a value for this row are absent.
    pub parameters: ModelParameters,
}

impl CalibrationRecord {
    /// Non-time key.
    pub fn index(&self) -> CalibrationIndex {
        CalibrationIndex::new(self.device.clone(), self.wavelength, self.laser_power)
    }

    /// Date and time combined.
    pub fn timestamp(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    /// Key column names and their formatted values.
    pub fn key_pairs(&self) -> [(&'static str, String); 5] {
        [
            (KEY_COLUMNS[0], self.device.clone()),
            (KEY_COLUMNS[1], self.wavelength.to_string()),
            (KEY_COLUMNS[2], self.laser_power.to_string()),
            (KEY_COLUMNS[3], self.date.format(DATE_FORMAT).to_string()),
            (KEY_COLUMNS[4], self.time.format(TIME_FORMAT).to_string()),
        ]
    }

    /// File-name friendly form of the key, e.g. `DEVICE-M1_WAVELENGTH-488_..._TIME-14-05`.
    pub fn file_stem(&self) -> String {
        self.key_pairs()
            .iter()
            .map(|(name, value)| format!("{}-{}", name, value))
            .collect::<Vec<_>>()
            .join("_")
            .replace(':', "-")
            .replace(['/', '\\', ' '], "-")
    }

    pub(crate) fn same_key(&self, other: &CalibrationRecord) -> bool {
        self.same_index(other) && self.date == other.date && self.time == other.time
    }

    fn same_index(&self, other: &CalibrationRecord) -> bool {
        self.device == other.device
            && self.wavelength == other.wavelength
            && self.laser_power == other.laser_power
    }

    fn cmp_index(&self, other: &CalibrationRecord) -> Ordering {
        self.device
            .cmp(&other.device)
            .then(self.wavelength.total_cmp(&other.wavelength))
            .then(self.laser_power.total_cmp(&other.laser_power))
    }
}

/// Applies `selector` to `records` (already in table order).
///
/// Fails with [`IlluminationError::NotFound`] if nothing matches.
pub fn select(
    records: &[CalibrationRecord],
    query: &IndexQuery,
    selector: &TimeSelector,
) -> AppResult<Vec<CalibrationRecord>> {
    let matching: Vec<&CalibrationRecord> = records.iter().filter(|r| query.matches(r)).collect();
    let selected = fold(&matching, selector);
    if selected.is_empty() {
        return Err(IlluminationError::NotFound(match selector {
            TimeSelector::At { date, time } => format!(
                "{} at {}{}",
                query,
                date.format(DATE_FORMAT),
                time.map(|t| format!(" {}", t.format(TIME_FORMAT)))
                    .unwrap_or_default()
            ),
            _ => query.to_string(),
        }));
    }
    Ok(selected)
}

/// The latest row per non-time key, sorted by key. Empty input gives an empty result.
pub fn last_combinations(records: &[CalibrationRecord]) -> Vec<CalibrationRecord> {
    let all: Vec<&CalibrationRecord> = records.iter().collect();
    fold(&all, &TimeSelector::LastCombinations)
}

fn fold(records: &[&CalibrationRecord], selector: &TimeSelector) -> Vec<CalibrationRecord> {
    match selector {
        TimeSelector::All => records.iter().map(|r| (*r).clone()).collect(),
        TimeSelector::Latest => {
            let mut latest: Option<&CalibrationRecord> = None;
            for &record in records {
                if latest.map_or(true, |l| record.timestamp() >= l.timestamp()) {
                    latest = Some(record);
                }
            }
            latest.into_iter().cloned().collect()
        }
        TimeSelector::LastDate => match records.iter().map(|r| r.date).max() {
            Some(last) => records
                .iter()
                .filter(|r| r.date == last)
                .map(|r| (*r).clone())
                .collect(),
            None => Vec::new(),
        },
        TimeSelector::LastCombinations => {
            let mut latest: Vec<&CalibrationRecord> = Vec::new();
            for &record in records {
                match latest.iter_mut().find(|l| l.same_index(record)) {
                    Some(slot) => {
                        if record.timestamp() >= slot.timestamp() {
                            *slot = record;
                        }
                    }
                    None => latest.push(record),
                }
            }
            latest.sort_by(|a, b| a.cmp_index(b));
            latest.into_iter().cloned().collect()
        }
        TimeSelector::At { date, time } => records
            .iter()
            .filter(|r| r.date == *date && time.map_or(true, |t| r.time == t))
            .map(|r| (*r).clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device: &str, wavelength: f64, power: f64, stamp: &str, amp: f64) -> CalibrationRecord {
        let ts = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M").unwrap();
        let mut parameters = ModelParameters::new();
        parameters.insert("amp".into(), amp);
        CalibrationRecord {
            device: device.into(),
            wavelength,
            laser_power: power,
            date: ts.date(),
            time: ts.time(),
            parameters,
        }
    }

    fn history() -> Vec<CalibrationRecord> {
        vec![
            record("M1", 488.0, 100.0, "2026-10-01 09:00", 1.0),
            record("M1", 488.0, 200.0, "2026-10-01 09:10", 2.0),
            record("M1", 488.0, 100.0, "2026-10-02 11:30", 3.0),
            record("M1", 561.0, 50.0, "2026-10-02 08:00", 4.0),
            record("M2", 488.0, 100.0, "2026-09-30 17:45", 5.0),
        ]
    }

    #[test]
    fn test_latest() {
        let rows = select(&history(), &IndexQuery::any().device("M1"), &TimeSelector::Latest).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].parameters["amp"], 3.0);
    }

    #[test]
    fn test_latest_tie_goes_to_later_row() {
        let mut rows = history();
        rows.push(record("M1", 488.0, 300.0, "2026-10-02 11:30", 9.0));
        let latest = select(&rows, &IndexQuery::any(), &TimeSelector::Latest).unwrap();
        assert_eq!(latest[0].parameters["amp"], 9.0);
    }

    #[test]
    fn test_last_date() {
        let rows = select(&history(), &IndexQuery::any(), &TimeSelector::LastDate).unwrap();
        let amps: Vec<f64> = rows.iter().map(|r| r.parameters["amp"]).collect();
        assert_eq!(amps, vec![3.0, 4.0]);
    }

    #[test]
    fn test_last_combinations() {
        let rows = select(
            &history(),
            &IndexQuery::any().device("M1").wavelength(488.0),
            &TimeSelector::LastCombinations,
        )
        .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].laser_power, 100.0);
        assert_eq!(rows[0].parameters["amp"], 3.0);
        assert_eq!(rows[1].laser_power, 200.0);

        let all = last_combinations(&history());
        assert_eq!(all.len(), 4);
        assert_eq!(all[3].device, "M2");
    }

    #[test]
    fn test_explicit_time() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 1).unwrap();
        let day = select(&history(), &IndexQuery::any(), &TimeSelector::At { date, time: None }).unwrap();
        assert_eq!(day.len(), 2);

        let time = NaiveTime::from_hms_opt(9, 10, 0);
        let exact = select(&history(), &IndexQuery::any(), &TimeSelector::At { date, time }).unwrap();
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].laser_power, 200.0);
    }

    #[test]
    fn test_no_match_is_not_found() {
        let err = select(&history(), &IndexQuery::any().device("M9"), &TimeSelector::All).unwrap_err();
        match err {
            IlluminationError::NotFound(msg) => {
                assert_eq!(msg, "device=M9, wavelength=*, laser_power=*");
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(select(&[], &IndexQuery::any(), &TimeSelector::Latest).is_err());
    }

    #[test]
    fn test_time_selector_from_str() {
        assert_eq!("latest".parse::<TimeSelector>().unwrap(), TimeSelector::Latest);
        assert_eq!(
            "last_combinations".parse::<TimeSelector>().unwrap(),
            TimeSelector::LastCombinations
        );
        assert_eq!(
            "2026-10-01 09:10".parse::<TimeSelector>().unwrap(),
            TimeSelector::At {
                date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
                time: NaiveTime::from_hms_opt(9, 10, 0),
            }
        );
        assert!("yesterday".parse::<TimeSelector>().is_err());
        assert!("2026-10-01 9h".parse::<TimeSelector>().is_err());
    }

    #[test]
    fn test_file_stem() {
        let r = record("M1", 488.0, 100.0, "2026-10-01 09:05", 1.0);
        assert_eq!(
            r.file_stem(),
            "DEVICE-M1_WAVELENGTH-488_LASER_POWER-100_DATE-2026-10-01_TIME-09-05"
        );
    }
}
