//! Streaming parser for NRG logger text exports
//!
//! Reads an export line by line (never buffering the whole file), locates
//! the `Timestamp` header and yields one `SensorRecord` per accepted data
//! line. Malformed lines are skipped and counted; they never abort the file.
use serde::{Deserialize, Serialize};
use std::io::{BufRead, ErrorKind};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::logger::column_map::{Channel, ColumnMap, LoggerLayout, CHANNEL_COUNT};

/// Literal that anchors the header row
pub const HEADER_TOKEN: &str = "Timestamp";

/// Shortest timestamp accepted as plausible ("YYYY-MM-DD")
pub const MIN_TIMESTAMP_LEN: usize = 10;

const DELIMITER: char = '\t';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("No header row starting with \"{HEADER_TOKEN}\" found")]
    NoHeaderFound,
}

/// Why a data line was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    TooFewColumns,
    MissingTimestamp,
    ImplausibleTimestamp,
}

/// One normalized reading. Every channel is always present; cells that are
/// missing, empty or unparsable resolve to 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorRecord {
    pub timestamp: String,
    pub filename: String,
    #[serde(rename = "NRG_40C_Anem", default)]
    pub wind_speed: f64,
    #[serde(rename = "NRG_200M_Vane", default)]
    pub wind_direction: f64,
    #[serde(rename = "NRG_T60_Temp", default)]
    pub air_temperature: f64,
    #[serde(rename = "NRG_RH5X_Humi", default)]
    pub relative_humidity: f64,
    #[serde(rename = "NRG_BP60_Baro", default)]
    pub barometric_pressure: f64,
    #[serde(rename = "Rain_Gauge", default)]
    pub rainfall: f64,
    #[serde(rename = "NRG_PVT1_PV_Temp", default)]
    pub pv_temperature: f64,
    #[serde(rename = "PSM_c_Si_Isc_Soil", default)]
    pub solar_current_soiled: f64,
    #[serde(rename = "PSM_c_Si_Isc_Clean", default)]
    pub solar_current_clean: f64,
    #[serde(rename = "Average_12V_Battery", default)]
    pub battery_voltage: f64,
    #[serde(rename = "Solar_Irradiance_1", default)]
    pub solar_irradiance_1: f64,
    #[serde(rename = "Solar_Irradiance_2", default)]
    pub solar_irradiance_2: f64,
    #[serde(rename = "Solar_Irradiance_3", default)]
    pub solar_irradiance_3: f64,
}

impl SensorRecord {
    /// Record with every channel at 0
    pub fn new(timestamp: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            timestamp: timestamp.into(),
            filename: filename.into(),
            wind_speed: 0.0,
            wind_direction: 0.0,
            air_temperature: 0.0,
            relative_humidity: 0.0,
            barometric_pressure: 0.0,
            rainfall: 0.0,
            pv_temperature: 0.0,
            solar_current_soiled: 0.0,
            solar_current_clean: 0.0,
            battery_voltage: 0.0,
            solar_irradiance_1: 0.0,
            solar_irradiance_2: 0.0,
            solar_irradiance_3: 0.0,
        }
    }

    pub fn value(&self, channel: Channel) -> f64 {
        match channel {
            Channel::WindSpeed => self.wind_speed,
            Channel::WindDirection => self.wind_direction,
            Channel::AirTemperature => self.air_temperature,
            Channel::RelativeHumidity => self.relative_humidity,
            Channel::BarometricPressure => self.barometric_pressure,
            Channel::Rainfall => self.rainfall,
            Channel::PvTemperature => self.pv_temperature,
            Channel::SolarCurrentSoiled => self.solar_current_soiled,
            Channel::SolarCurrentClean => self.solar_current_clean,
            Channel::BatteryVoltage => self.battery_voltage,
            Channel::SolarIrradiance1 => self.solar_irradiance_1,
            Channel::SolarIrradiance2 => self.solar_irradiance_2,
            Channel::SolarIrradiance3 => self.solar_irradiance_3,
        }
    }

    pub fn set(&mut self, channel: Channel, value: f64) {
        let slot = match channel {
            Channel::WindSpeed => &mut self.wind_speed,
            Channel::WindDirection => &mut self.wind_direction,
            Channel::AirTemperature => &mut self.air_temperature,
            Channel::RelativeHumidity => &mut self.relative_humidity,
            Channel::BarometricPressure => &mut self.barometric_pressure,
            Channel::Rainfall => &mut self.rainfall,
            Channel::PvTemperature => &mut self.pv_temperature,
            Channel::SolarCurrentSoiled => &mut self.solar_current_soiled,
            Channel::SolarCurrentClean => &mut self.solar_current_clean,
            Channel::BatteryVoltage => &mut self.battery_voltage,
            Channel::SolarIrradiance1 => &mut self.solar_irradiance_1,
            Channel::SolarIrradiance2 => &mut self.solar_irradiance_2,
            Channel::SolarIrradiance3 => &mut self.solar_irradiance_3,
        };
        *slot = value;
    }

    /// Channel values in `Channel::ALL` order
    pub fn values(&self) -> [f64; CHANNEL_COUNT] {
        Channel::ALL.map(|c| self.value(c))
    }
}

/// Summary of a parse, available while and after iterating
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseReport {
    /// Layout used for data lines, `None` until the header is found
    pub layout: Option<LoggerLayout>,
    /// 1-based line number of the header row
    pub header_line: Option<usize>,
    pub lines_read: usize,
    pub accepted: usize,
    pub skipped: usize,
}

impl ParseReport {
    pub fn header_found(&self) -> bool {
        self.header_line.is_some()
    }

    /// `Err(NoHeaderFound)` once input ended without a header row
    pub fn check(&self) -> Result<(), ParseError> {
        if self.header_found() {
            Ok(())
        } else {
            Err(ParseError::NoHeaderFound)
        }
    }
}

enum State {
    SeekingHeader { detected: Option<LoggerLayout> },
    Reading(ColumnMap),
    Finished,
}

/// Lazy, non-restartable iterator over the records of one export
pub struct RecordParser<R> {
    reader: R,
    filename: String,
    forced_layout: Option<LoggerLayout>,
    state: State,
    buf: Vec<u8>,
    report: ParseReport,
}

impl<R: BufRead> RecordParser<R> {
    /// Create a parser that detects the layout from the export preamble
    ///
    /// # Arguments
    /// * `reader` - Buffered source of the export text
    /// * `filename` - Owning file identifier stamped on every record
    pub fn new(reader: R, filename: impl Into<String>) -> Self {
        Self {
            reader,
            filename: filename.into(),
            forced_layout: None,
            state: State::SeekingHeader { detected: None },
            buf: Vec::with_capacity(256),
            report: ParseReport::default(),
        }
    }

    /// Use a fixed layout instead of detecting one
    pub fn with_layout(mut self, layout: LoggerLayout) -> Self {
        self.forced_layout = Some(layout);
        self
    }

    pub fn report(&self) -> &ParseReport {
        &self.report
    }

    /// Drain remaining records and return the final report
    pub fn finish(mut self) -> ParseReport {
        for _ in self.by_ref() {}
        self.report
    }

    /// Read the next line into an owned string, decoding lossily.
    /// Returns `None` at end of input or on an unrecoverable read error.
    fn next_line(&mut self) -> Option<String> {
        self.buf.clear();
        loop {
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => return None,
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(
                        "Read error after line {} in {}: {}",
                        self.report.lines_read, self.filename, e
                    );
                    return None;
                }
            }
        }

        self.report.lines_read += 1;
        let line = String::from_utf8_lossy(&self.buf);
        Some(line.trim_end_matches(['\n', '\r']).to_string())
    }

    fn seek_header(&mut self, mut detected: Option<LoggerLayout>) -> Option<ColumnMap> {
        while let Some(line) = self.next_line() {
            if line.trim_start().starts_with(HEADER_TOKEN) {
                let layout = self
                    .forced_layout
                    .or(detected)
                    .unwrap_or(LoggerLayout::Legacy);
                self.report.header_line = Some(self.report.lines_read);
                self.report.layout = Some(layout);

                let columns = line.split(DELIMITER).count();
                debug!(
                    "Found header at line {} in {} ({} columns, layout {})",
                    self.report.lines_read, self.filename, columns, layout
                );
                return Some(layout.column_map());
            }

            if detected.is_none() {
                detected = LoggerLayout::detect(&line);
            }
        }

        warn!("No data section found in {}", self.filename);
        None
    }

    fn parse_line(&self, line: &str, map: &ColumnMap) -> Result<SensorRecord, SkipReason> {
        let fields: Vec<&str> = line.split(DELIMITER).collect();

        if fields.len() < map.min_columns() {
            return Err(SkipReason::TooFewColumns);
        }

        let timestamp = fields[0].trim();
        if timestamp.is_empty() {
            return Err(SkipReason::MissingTimestamp);
        }
        if timestamp.len() < MIN_TIMESTAMP_LEN {
            return Err(SkipReason::ImplausibleTimestamp);
        }

        let mut record = SensorRecord::new(fields[0], self.filename.as_str());
        for (channel, column) in map.entries() {
            let value = fields.get(*column).map(|cell| parse_cell(cell)).unwrap_or(0.0);
            record.set(*channel, value);
        }

        Ok(record)
    }
}

impl<R: BufRead> Iterator for RecordParser<R> {
    type Item = SensorRecord;

    fn next(&mut self) -> Option<SensorRecord> {
        loop {
            let map = match std::mem::replace(&mut self.state, State::Finished) {
                State::Finished => return None,
                State::SeekingHeader { detected } => match self.seek_header(detected) {
                    Some(map) => map,
                    None => return None,
                },
                State::Reading(map) => map,
            };

            let Some(line) = self.next_line() else {
                info!(
                    "Processed {} records from {} ({} lines skipped)",
                    self.report.accepted, self.filename, self.report.skipped
                );
                return None;
            };
            self.state = State::Reading(map);

            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            match self.parse_line(&line, &map) {
                Ok(record) => {
                    self.report.accepted += 1;
                    return Some(record);
                }
                Err(reason) => {
                    self.report.skipped += 1;
                    debug!(
                        "Skipping line {} in {}: {:?}",
                        self.report.lines_read, self.filename, reason
                    );
                }
            }
        }
    }
}

/// Parse one cell, resolving empty, unparsable or non-finite values to 0
fn parse_cell(cell: &str) -> f64 {
    match cell.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => v,
        _ => 0.0,
    }
}

/// Fully consumed parse of one export
#[derive(Debug, Clone)]
pub struct ParsedExport {
    pub records: Vec<SensorRecord>,
    pub report: ParseReport,
}

/// Parse a whole export into memory
///
/// A missing header is not an error here: the result simply has no records
/// and `report.check()` returns `Err(ParseError::NoHeaderFound)`.
pub fn parse_export<R: BufRead>(
    reader: R,
    filename: &str,
    layout: Option<LoggerLayout>,
) -> ParsedExport {
    let mut parser = RecordParser::new(reader, filename);
    if let Some(layout) = layout {
        parser = parser.with_layout(layout);
    }

    let records: Vec<SensorRecord> = parser.by_ref().collect();
    ParsedExport {
        records,
        report: parser.report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const LEGACY_EXPORT: &str = "Site Number:\t000110\n\
        Site Description:\tTest mast\n\
        \n\
        Timestamp\tCh1\tCh2\tCh3\tCh4\tCh5\tCh6\tCh7\tCh8\tCh9\tCh10\n\
        2024-01-01 00:00:00\t5.2\t180\t21.5\t65\t1013.2\t0\t30.1\t2.4\t3.1\t12.6\n\
        2024-01-01 00:10:00\t6.1\t190\t21.4\t66\t1013.0\t0.2\t30.0\t2.5\t3.0\t12.5\n";

    fn parse(input: &str) -> ParsedExport {
        parse_export(Cursor::new(input), "site.txt", None)
    }

    #[test]
    fn test_parses_all_well_formed_lines() {
        let parsed = parse(LEGACY_EXPORT);

        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.report.accepted, 2);
        assert_eq!(parsed.report.skipped, 0);
        assert_eq!(parsed.report.header_line, Some(4));
        assert_eq!(parsed.report.layout, Some(LoggerLayout::Legacy));

        let first = &parsed.records[0];
        assert_eq!(first.timestamp, "2024-01-01 00:00:00");
        assert_eq!(first.filename, "site.txt");
        assert_eq!(first.wind_speed, 5.2);
        assert_eq!(first.wind_direction, 180.0);
        assert_eq!(first.barometric_pressure, 1013.2);
        assert_eq!(first.battery_voltage, 12.6);
        assert_eq!(first.solar_irradiance_1, 0.0);
    }

    #[test]
    fn test_empty_cells_resolve_to_zero() {
        let input = "Timestamp\tCh1\tCh2\tCh3\tCh4\tCh5\tCh6\tCh7\tCh8\tCh9\tCh10\n\
            2024-01-01 00:00:00\t5.2\t\t21.5\t65\t\t0\t30.1\t2.4\t3.1\t12.6\n";
        let parsed = parse(input);

        assert_eq!(parsed.records.len(), 1);
        let record = &parsed.records[0];
        assert_eq!(record.timestamp, "2024-01-01 00:00:00");
        assert_eq!(record.wind_speed, 5.2);
        assert_eq!(record.wind_direction, 0.0);
        assert_eq!(record.barometric_pressure, 0.0);
        assert_eq!(record.filename, "site.txt");
    }

    #[test]
    fn test_garbage_and_non_finite_cells_resolve_to_zero() {
        let input = "Timestamp\tCh1\tCh2\tCh3\tCh4\tCh5\tCh6\tCh7\tCh8\tCh9\tCh10\n\
            2024-01-01 00:00:00\tabc\tNaN\tinf\t 65 \t1013\t0\t30\t2\t3\t12\n";
        let record = &parse(input).records[0];

        assert_eq!(record.wind_speed, 0.0);
        assert_eq!(record.wind_direction, 0.0);
        assert_eq!(record.air_temperature, 0.0);
        assert_eq!(record.relative_humidity, 65.0);
    }

    #[test]
    fn test_short_line_is_skipped_and_parsing_continues() {
        let input = "Timestamp\tCh1\tCh2\tCh3\tCh4\tCh5\tCh6\tCh7\tCh8\tCh9\tCh10\n\
            2024-01-01 00:00:00\t5.2\t180\n\
            2024-01-01 00:10:00\t6.1\t190\t21.4\t66\t1013.0\t0.2\t30.0\t2.5\t3.0\t12.5\n";
        let parsed = parse(input);

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].timestamp, "2024-01-01 00:10:00");
        assert_eq!(parsed.report.skipped, 1);
    }

    #[test]
    fn test_line_with_exact_minimum_columns_defaults_missing_channel() {
        // Ten fields: timestamp plus nine channels, battery column absent
        let input = "Timestamp\tCh1\n\
            2024-01-01 00:00:00\t1\t2\t3\t4\t5\t6\t7\t8\t9\n";
        let parsed = parse(input);

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].solar_current_clean, 9.0);
        assert_eq!(parsed.records[0].battery_voltage, 0.0);
    }

    #[test]
    fn test_bad_timestamps_are_skipped() {
        let input = "Timestamp\tCh1\n\
            \t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\n\
            2024-01\t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\n\
            2024-01-01\t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\n";
        let parsed = parse(input);

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].timestamp, "2024-01-01");
        assert_eq!(parsed.report.skipped, 2);
    }

    #[test]
    fn test_blank_and_comment_lines_are_ignored() {
        let input = "Timestamp\tCh1\n\
            \n\
            # logger restarted\n\
            2024-01-01 00:00:00\t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\n\
            \r\n";
        let parsed = parse(input);

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.report.skipped, 0);
    }

    #[test]
    fn test_missing_header_yields_no_records() {
        let input = "2024-01-01 00:00:00\t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\n";
        let parsed = parse(input);

        assert!(parsed.records.is_empty());
        assert!(!parsed.report.header_found());
        assert_eq!(parsed.report.check(), Err(ParseError::NoHeaderFound));
    }

    #[test]
    fn test_crlf_line_endings() {
        let input = "Timestamp\tCh1\r\n2024-01-01 00:00:00\t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\r\n";
        let parsed = parse(input);

        assert_eq!(parsed.records.len(), 1);
        assert_eq!(parsed.records[0].battery_voltage, 10.0);
    }

    #[test]
    fn test_symphonie_pro_detected_from_preamble() {
        let input = "SymphoniePRO Desktop Application\n\
            Export version:\t1.2\n\
            Timestamp\tCh1_Anem_Avg_m/s\n\
            2024-01-01 00:00:00\t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\t800\t810\t820\n";
        let parsed = parse(input);

        assert_eq!(parsed.report.layout, Some(LoggerLayout::SymphoniePro));
        let record = &parsed.records[0];
        assert_eq!(record.solar_irradiance_1, 800.0);
        assert_eq!(record.solar_irradiance_3, 820.0);
    }

    #[test]
    fn test_forced_layout_overrides_detection() {
        let input = "NRG Systems\n\
            Timestamp\tCh1\n\
            2024-01-01 00:00:00\t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\t800\n";
        let parsed = parse_export(Cursor::new(input), "site.txt", Some(LoggerLayout::Legacy));

        assert_eq!(parsed.report.layout, Some(LoggerLayout::Legacy));
        assert_eq!(parsed.records[0].solar_irradiance_1, 0.0);
    }

    #[test]
    fn test_latin1_header_does_not_abort() {
        let mut input = b"Timestamp\tCh3_Avg_\xB0C\n".to_vec();
        input.extend_from_slice(b"2024-01-01 00:00:00\t1\t2\t3\t4\t5\t6\t7\t8\t9\t10\n");
        let parsed = parse_export(Cursor::new(input), "site.txt", None);

        assert_eq!(parsed.records.len(), 1);
    }

    #[test]
    fn test_iterator_is_lazy_and_reports_progress() {
        let mut parser = RecordParser::new(Cursor::new(LEGACY_EXPORT), "site.txt");

        let first = parser.next().unwrap();
        assert_eq!(first.timestamp, "2024-01-01 00:00:00");
        assert_eq!(parser.report().accepted, 1);

        let report = parser.finish();
        assert_eq!(report.accepted, 2);
    }

    #[test]
    fn test_every_record_carries_all_channels() {
        let parsed = parse(LEGACY_EXPORT);
        for record in &parsed.records {
            assert_eq!(record.values().len(), CHANNEL_COUNT);
            let json = serde_json::to_value(record).unwrap();
            for channel in Channel::ALL {
                assert!(json.get(channel.wire_name()).is_some(), "missing {channel}");
            }
        }
    }
}
