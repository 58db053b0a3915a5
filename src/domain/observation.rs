//! Canonical observation schema shared by every provider.
//!
//! Raw payloads arrive in provider-specific shapes; everything downstream of
//! the normalizer only ever sees [`CanonicalObservation`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of an upstream provider (e.g. "noaa", "argo")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Station id used for gridded products that have no physical platform.
///
/// Gridded records from different providers collapse onto the same key
/// through the position bucket instead.
pub const GRID_STATION: &str = "grid";

/// A raw granule as fetched from a provider
#[derive(Debug, Clone)]
pub struct RawItem {
    /// Provider that produced the payload
    pub source: SourceId,

    /// Provider-native identifier of the granule
    pub native_id: String,

    /// Payload exactly as received
    pub payload: Vec<u8>,

    /// When the payload was fetched
    pub fetched_at: DateTime<Utc>,
}

impl RawItem {
    pub fn new(source: SourceId, native_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            source,
            native_id: native_id.into(),
            payload,
            fetched_at: Utc::now(),
        }
    }

    /// Override the fetch timestamp (replays, tests)
    pub fn fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }
}

/// Measured quantity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableType {
    SeaSurfaceTemperature,
    WaterTemperature,
    Salinity,
    DissolvedOxygen,
    AirTemperatureMax,
    AirTemperatureMin,
    Precipitation,
}

impl VariableType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SeaSurfaceTemperature => "sea_surface_temperature",
            Self::WaterTemperature => "water_temperature",
            Self::Salinity => "salinity",
            Self::DissolvedOxygen => "dissolved_oxygen",
            Self::AirTemperatureMax => "air_temperature_max",
            Self::AirTemperatureMin => "air_temperature_min",
            Self::Precipitation => "precipitation",
        }
    }

    /// Unit every value of this variable is stored in
    pub const fn canonical_unit(self) -> Unit {
        match self {
            Self::SeaSurfaceTemperature
            | Self::WaterTemperature
            | Self::AirTemperatureMax
            | Self::AirTemperatureMin => Unit::DegreesCelsius,
            Self::Salinity => Unit::PracticalSalinity,
            Self::DissolvedOxygen => Unit::MicromolePerKilogram,
            Self::Precipitation => Unit::Millimetres,
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    DegreesCelsius,
    PracticalSalinity,
    MicromolePerKilogram,
    Millimetres,
}

impl Unit {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::DegreesCelsius => "degC",
            Self::PracticalSalinity => "PSU",
            Self::MicromolePerKilogram => "umol/kg",
            Self::Millimetres => "mm",
        }
    }
}

/// Validated geospatial position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Metres below the surface
    pub depth: f64,
}

impl Position {
    /// Build a position, rejecting values outside physical ranges.
    ///
    /// The error names the offending field.
    pub fn new(latitude: f64, longitude: f64, depth: f64) -> Result<Self, (&'static str, String)> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(("latitude", format!("{} outside [-90, 90]", latitude)));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(("longitude", format!("{} outside [-180, 180]", longitude)));
        }
        if !depth.is_finite() || depth < 0.0 {
            return Err(("depth", format!("{} is negative or not finite", depth)));
        }
        Ok(Self {
            latitude,
            longitude,
            depth,
        })
    }
}

/// Quality score in [0, 1]; higher is better
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QualityFlag(f64);

impl QualityFlag {
    pub const GOOD: QualityFlag = QualityFlag(1.0);
    pub const UNKNOWN: QualityFlag = QualityFlag(0.5);

    /// Clamp into [0, 1]; NaN becomes 0
    pub fn new(value: f64) -> Self {
        if value.is_nan() {
            return Self(0.0);
        }
        Self(value.clamp(0.0, 1.0))
    }

    pub fn value(self) -> f64 {
        self.0
    }

    /// Map an Argo/ERDDAP style QC digit onto a score
    pub fn from_qc_code(code: &str) -> Option<Self> {
        let score = match code.trim() {
            "1" => 1.0,
            "2" => 0.75,
            "5" | "8" => 0.6,
            "0" => 0.5,
            "3" => 0.25,
            "4" | "9" => 0.0,
            _ => return None,
        };
        Some(Self(score))
    }
}

/// Where an observation came from
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub source: SourceId,
    /// Raw identifier inside the granule, e.g. "jplMURSST41:2024-03-01#17"
    pub raw_id: String,
    pub fetched_at: DateTime<Utc>,
}

/// An observation in the unified schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalObservation {
    pub station_id: String,
    pub position: Position,
    pub timestamp: DateTime<Utc>,
    pub variable: VariableType,
    pub value: f64,
    pub unit: Unit,
    pub quality: QualityFlag,

    /// The record this value was taken from
    pub provenance: Provenance,

    /// Provenance of records merged into this one, sorted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged_from: Vec<Provenance>,
}

impl CanonicalObservation {
    /// All sources that contributed to this record, deduplicated and sorted
    pub fn contributing_sources(&self) -> Vec<SourceId> {
        let mut sources: Vec<SourceId> = std::iter::once(&self.provenance)
            .chain(self.merged_from.iter())
            .map(|p| p.source.clone())
            .collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ranges() {
        assert!(Position::new(45.0, -120.0, 0.0).is_ok());
        assert!(Position::new(-90.0, 180.0, 5000.0).is_ok());

        let (field, _) = Position::new(200.0, 0.0, 0.0).unwrap_err();
        assert_eq!(field, "latitude");

        let (field, _) = Position::new(0.0, -181.0, 0.0).unwrap_err();
        assert_eq!(field, "longitude");

        let (field, _) = Position::new(0.0, 0.0, -1.0).unwrap_err();
        assert_eq!(field, "depth");

        assert!(Position::new(f64::NAN, 0.0, 0.0).is_err());
    }

    #[test]
    fn test_quality_clamping() {
        assert_eq!(QualityFlag::new(1.7).value(), 1.0);
        assert_eq!(QualityFlag::new(-0.2).value(), 0.0);
        assert_eq!(QualityFlag::new(f64::NAN).value(), 0.0);
        assert_eq!(QualityFlag::new(0.9).value(), 0.9);
    }

    #[test]
    fn test_qc_codes() {
        assert_eq!(QualityFlag::from_qc_code("1"), Some(QualityFlag::GOOD));
        assert_eq!(QualityFlag::from_qc_code("4").unwrap().value(), 0.0);
        assert_eq!(QualityFlag::from_qc_code("x"), None);
    }

    #[test]
    fn test_canonical_units() {
        assert_eq!(
            VariableType::SeaSurfaceTemperature.canonical_unit(),
            Unit::DegreesCelsius
        );
        assert_eq!(VariableType::Precipitation.canonical_unit().symbol(), "mm");
    }

    #[test]
    fn test_variable_serialization() {
        let json = serde_json::to_string(&VariableType::Salinity).unwrap();
        assert_eq!(json, "\"salinity\"");
    }
}
