//! Hardware classification: table type, firmware family, homing mode.

use serde::{Deserialize, Serialize};

/// Physical table variant, derived from the controller's steps-per-mm pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    /// Standard full-size table.
    #[default]
    DuneWeaver,
    /// Full-size table with the upgraded drive train.
    DuneWeaverPro,
    /// Large-format table.
    DuneWeaverGold,
    /// Compact table.
    DuneWeaverMini,
    /// Compact table with stepper upgrade.
    DuneWeaverMiniPro,
}

/// Steps-per-mm pairs `(x, y)` reported by each known table variant.
const STEPS_LOOKUP: &[((f64, f64), TableType)] = &[
    ((256.0, 180.0), TableType::DuneWeaverMini),
    ((256.0, 210.0), TableType::DuneWeaverMiniPro),
    ((200.0, 270.0), TableType::DuneWeaverGold),
    ((320.0, 433.0), TableType::DuneWeaverPro),
    ((320.0, 287.0), TableType::DuneWeaver),
];

impl TableType {
    /// Classify from the controller's calibration constants.
    ///
    /// Unknown pairs fall back to [`TableType::DuneWeaver`].
    pub fn from_steps(x_steps_per_mm: f64, y_steps_per_mm: f64) -> Self {
        STEPS_LOOKUP
            .iter()
            .find(|((x, y), _)| {
                (x - x_steps_per_mm).abs() < 0.5 && (y - y_steps_per_mm).abs() < 0.5
            })
            .map(|(_, table)| *table)
            .unwrap_or_default()
    }

    /// Compact variants use the smaller gear train and subtract the cross-axis correction.
    pub fn is_compact(self) -> bool {
        matches!(self, TableType::DuneWeaverMini | TableType::DuneWeaverMiniPro)
    }

    /// Gear ratio between the angular stepper and the arm.
    pub fn default_gear_ratio(self) -> f64 {
        if self.is_compact() {
            6.25
        } else {
            10.0
        }
    }

    /// Radial travel (mm, negative) used to drive the arm into its mechanical stop.
    pub fn crash_offset_mm(self) -> f64 {
        if self.is_compact() {
            -30.0
        } else {
            -22.0
        }
    }

    /// Suffix of the clear-pattern file set for this variant.
    pub fn clear_suffix(self) -> &'static str {
        match self {
            TableType::DuneWeaverMini | TableType::DuneWeaverMiniPro => "_mini",
            TableType::DuneWeaverPro => "_pro",
            TableType::DuneWeaver | TableType::DuneWeaverGold => "",
        }
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TableType::DuneWeaver => "dune_weaver",
            TableType::DuneWeaverPro => "dune_weaver_pro",
            TableType::DuneWeaverGold => "dune_weaver_gold",
            TableType::DuneWeaverMini => "dune_weaver_mini",
            TableType::DuneWeaverMiniPro => "dune_weaver_mini_pro",
        };
        write!(f, "{}", label)
    }
}

/// Controller firmware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareKind {
    /// FluidNC (ESP32).
    Fluidnc,
    /// Classic GRBL.
    Grbl,
    /// Nothing recognisable answered the identification query.
    #[default]
    Unknown,
}

impl FirmwareKind {
    /// Classify a blob of identification output by substring match.
    pub fn classify(output: &str) -> Self {
        let lower = output.to_ascii_lowercase();
        if lower.contains("fluidnc") {
            FirmwareKind::Fluidnc
        } else if lower.contains("grbl") || lower.contains("[ver:") {
            FirmwareKind::Grbl
        } else {
            FirmwareKind::Unknown
        }
    }
}

impl std::fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirmwareKind::Fluidnc => write!(f, "fluidnc"),
            FirmwareKind::Grbl => write!(f, "grbl"),
            FirmwareKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// How the table establishes its reference position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomingMode {
    /// Drive the radial axis into its mechanical stop.
    #[default]
    Crash,
    /// Use the controller's `$H` cycle with limit sensors.
    Sensor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_steps() {
        assert_eq!(TableType::from_steps(256.0, 180.0), TableType::DuneWeaverMini);
        assert_eq!(TableType::from_steps(320.0, 287.0), TableType::DuneWeaver);
        assert_eq!(TableType::from_steps(200.0, 270.0), TableType::DuneWeaverGold);
    }

    #[test]
    fn unknown_steps_fall_back_to_standard() {
        assert_eq!(TableType::from_steps(1.0, 2.0), TableType::DuneWeaver);
    }

    #[test]
    fn compact_tables_use_longer_crash_travel() {
        assert_eq!(TableType::DuneWeaverMini.crash_offset_mm(), -30.0);
        assert_eq!(TableType::DuneWeaverGold.crash_offset_mm(), -22.0);
        assert_eq!(TableType::DuneWeaverMiniPro.default_gear_ratio(), 6.25);
    }

    #[test]
    fn firmware_classification() {
        assert_eq!(
            FirmwareKind::classify("[VER:3.7 FluidNC v3.7.8:]"),
            FirmwareKind::Fluidnc
        );
        assert_eq!(
            FirmwareKind::classify("[VER:1.1h.20190825:]\n[OPT:V,15,128]"),
            FirmwareKind::Grbl
        );
        assert_eq!(FirmwareKind::classify("ok"), FirmwareKind::Unknown);
    }
}
