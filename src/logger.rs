// Logger export module
//
// This module handles the tab-delimited text exports produced by NRG data
// loggers (directly, or after RLD -> TXT conversion). Exports contain:
// - A free-form preamble (site info, logger model, channel descriptions)
// - A header row starting with "Timestamp"
// - One tab-separated reading per line after the header

pub mod column_map;
pub mod record_parser;

pub use column_map::{Channel, ColumnMap, LoggerLayout, CHANNEL_COUNT};
pub use record_parser::{
    parse_export, ParseError, ParseReport, ParsedExport, RecordParser, SensorRecord, SkipReason,
};
