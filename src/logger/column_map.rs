//! Column layouts for NRG logger text exports
//!
//! Logger firmware writes a fixed column order per export layout, so the
//! mapping from channel to column is defined here as data rather than
//! inferred from each file's header. New layouts get a new table; existing
//! tables never change, so previously parsed files stay valid.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of channels carried by every sensor record
pub const CHANNEL_COUNT: usize = 13;

/// One named sensor measurement in an export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    WindSpeed,
    WindDirection,
    AirTemperature,
    RelativeHumidity,
    BarometricPressure,
    Rainfall,
    PvTemperature,
    SolarCurrentSoiled,
    SolarCurrentClean,
    BatteryVoltage,
    SolarIrradiance1,
    SolarIrradiance2,
    SolarIrradiance3,
}

impl Channel {
    /// All channels in export column order
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::WindSpeed,
        Channel::WindDirection,
        Channel::AirTemperature,
        Channel::RelativeHumidity,
        Channel::BarometricPressure,
        Channel::Rainfall,
        Channel::PvTemperature,
        Channel::SolarCurrentSoiled,
        Channel::SolarCurrentClean,
        Channel::BatteryVoltage,
        Channel::SolarIrradiance1,
        Channel::SolarIrradiance2,
        Channel::SolarIrradiance3,
    ];

    /// Name used on the wire (JSON keys, CSV headers, live events)
    pub fn wire_name(self) -> &'static str {
        match self {
            Channel::WindSpeed => "NRG_40C_Anem",
            Channel::WindDirection => "NRG_200M_Vane",
            Channel::AirTemperature => "NRG_T60_Temp",
            Channel::RelativeHumidity => "NRG_RH5X_Humi",
            Channel::BarometricPressure => "NRG_BP60_Baro",
            Channel::Rainfall => "Rain_Gauge",
            Channel::PvTemperature => "NRG_PVT1_PV_Temp",
            Channel::SolarCurrentSoiled => "PSM_c_Si_Isc_Soil",
            Channel::SolarCurrentClean => "PSM_c_Si_Isc_Clean",
            Channel::BatteryVoltage => "Average_12V_Battery",
            Channel::SolarIrradiance1 => "Solar_Irradiance_1",
            Channel::SolarIrradiance2 => "Solar_Irradiance_2",
            Channel::SolarIrradiance3 => "Solar_Irradiance_3",
        }
    }

    /// Column name in the `sensor_records` table
    pub fn column_name(self) -> &'static str {
        match self {
            Channel::WindSpeed => "nrg_40c_anem",
            Channel::WindDirection => "nrg_200m_vane",
            Channel::AirTemperature => "nrg_t60_temp",
            Channel::RelativeHumidity => "nrg_rh5x_humi",
            Channel::BarometricPressure => "nrg_bp60_baro",
            Channel::Rainfall => "rain_gauge",
            Channel::PvTemperature => "nrg_pvt1_pv_temp",
            Channel::SolarCurrentSoiled => "psm_c_si_isc_soil",
            Channel::SolarCurrentClean => "psm_c_si_isc_clean",
            Channel::BatteryVoltage => "average_12v_battery",
            Channel::SolarIrradiance1 => "solar_irradiance_1",
            Channel::SolarIrradiance2 => "solar_irradiance_2",
            Channel::SolarIrradiance3 => "solar_irradiance_3",
        }
    }

    /// Position of this channel in `Channel::ALL`
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Known export column layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoggerLayout {
    /// Ten core channels at columns 1-10
    Legacy,
    /// SymphoniePRO exports: the legacy core plus three irradiance channels
    SymphoniePro,
}

const LEGACY_COLUMNS: &[(Channel, usize)] = &[
    (Channel::WindSpeed, 1),
    (Channel::WindDirection, 2),
    (Channel::AirTemperature, 3),
    (Channel::RelativeHumidity, 4),
    (Channel::BarometricPressure, 5),
    (Channel::Rainfall, 6),
    (Channel::PvTemperature, 7),
    (Channel::SolarCurrentSoiled, 8),
    (Channel::SolarCurrentClean, 9),
    (Channel::BatteryVoltage, 10),
];

const SYMPHONIE_PRO_COLUMNS: &[(Channel, usize)] = &[
    (Channel::WindSpeed, 1),
    (Channel::WindDirection, 2),
    (Channel::AirTemperature, 3),
    (Channel::RelativeHumidity, 4),
    (Channel::BarometricPressure, 5),
    (Channel::Rainfall, 6),
    (Channel::PvTemperature, 7),
    (Channel::SolarCurrentSoiled, 8),
    (Channel::SolarCurrentClean, 9),
    (Channel::BatteryVoltage, 10),
    (Channel::SolarIrradiance1, 11),
    (Channel::SolarIrradiance2, 12),
    (Channel::SolarIrradiance3, 13),
];

impl LoggerLayout {
    /// Column table for this layout
    pub fn column_map(self) -> ColumnMap {
        match self {
            LoggerLayout::Legacy => ColumnMap {
                layout: self,
                columns: LEGACY_COLUMNS,
                min_columns: 10,
            },
            LoggerLayout::SymphoniePro => ColumnMap {
                layout: self,
                columns: SYMPHONIE_PRO_COLUMNS,
                min_columns: 11,
            },
        }
    }

    /// Detect the layout from a preamble line
    ///
    /// Returns `Some(SymphoniePro)` when the line carries the SymphoniePRO
    /// product or vendor marker, `None` otherwise.
    pub fn detect(line: &str) -> Option<Self> {
        if line.contains("SymphoniePRO") || line.contains("NRG Systems") {
            Some(LoggerLayout::SymphoniePro)
        } else {
            None
        }
    }

    /// Short label used as a default library tag
    pub fn tag(self) -> &'static str {
        match self {
            LoggerLayout::Legacy => "Legacy",
            LoggerLayout::SymphoniePro => "SymphoniePRO",
        }
    }
}

impl fmt::Display for LoggerLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoggerLayout::Legacy => f.write_str("legacy"),
            LoggerLayout::SymphoniePro => f.write_str("symphonie-pro"),
        }
    }
}

impl FromStr for LoggerLayout {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(LoggerLayout::Legacy),
            "symphonie-pro" | "symphonie_pro" | "symphoniepro" => Ok(LoggerLayout::SymphoniePro),
            other => Err(format!("unknown logger layout: {other}")),
        }
    }
}

/// Ordered channel -> column mapping plus the minimum field count a data
/// line must have to be considered well-formed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnMap {
    layout: LoggerLayout,
    columns: &'static [(Channel, usize)],
    min_columns: usize,
}

impl ColumnMap {
    pub fn layout(&self) -> LoggerLayout {
        self.layout
    }

    pub fn min_columns(&self) -> usize {
        self.min_columns
    }

    /// Mapped channels in column order
    pub fn entries(&self) -> &'static [(Channel, usize)] {
        self.columns
    }

    /// Zero-based column for a channel, `None` if the layout does not carry it
    pub fn column_for(&self, channel: Channel) -> Option<usize> {
        self.columns
            .iter()
            .find(|(c, _)| *c == channel)
            .map(|(_, idx)| *idx)
    }
}
