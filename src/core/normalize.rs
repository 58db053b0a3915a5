//! Normalization of provider payloads into the canonical schema.
//!
//! A [`RawItem`] carries one granule: a CSV table in one of the
//! [`PayloadFormat`]s. Each data row may produce several observations (one
//! per recognised variable column). Rows and cells that fail validation are
//! returned as [`NormalizationError`]s next to the observations that did
//! normalize, so one bad row never discards the rest of the granule.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    CanonicalObservation, Position, Provenance, QualityFlag, RawItem, Unit, VariableType,
    GRID_STATION,
};

/// A field that could not be normalized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {reason}")]
pub struct NormalizationError {
    pub field: String,
    pub reason: String,
    /// Locator of the offending record ("<granule>#<line>")
    pub record: Option<String>,
}

impl NormalizationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
            record: None,
        }
    }

    fn at(mut self, record: &str) -> Self {
        self.record = Some(record.to_string());
        self
    }
}

/// Layout of a provider payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadFormat {
    /// ERDDAP CSV: header row followed by a units row
    ErddapCsv,

    /// Plain CSV with a header row; `#` lines are comments
    Csv,
}

/// Provider-specific knowledge the normalizer needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaHint {
    pub format: PayloadFormat,

    /// Units for columns when the payload does not carry them
    #[serde(default)]
    pub column_units: BTreeMap<String, String>,

    /// Quality assigned when the payload has no QC column
    pub default_quality: QualityFlag,

    /// Column holding the platform/station id
    #[serde(default)]
    pub station_column: Option<String>,
}

impl SchemaHint {
    pub fn new(format: PayloadFormat) -> Self {
        Self {
            format,
            column_units: BTreeMap::new(),
            default_quality: QualityFlag::UNKNOWN,
            station_column: None,
        }
    }

    pub fn with_unit(mut self, column: &str, unit: &str) -> Self {
        self.column_units
            .insert(column.to_ascii_lowercase(), unit.to_string());
        self
    }

    pub fn with_quality(mut self, quality: QualityFlag) -> Self {
        self.default_quality = quality;
        self
    }

    pub fn with_station_column(mut self, column: &str) -> Self {
        self.station_column = Some(column.to_ascii_lowercase());
        self
    }
}

/// Everything one granule normalized into
#[derive(Debug, Default)]
pub struct NormalizedItem {
    pub observations: Vec<CanonicalObservation>,
    pub errors: Vec<NormalizationError>,
    /// Cells with no value (NaN, empty)
    pub missing: u64,
}

/// Converts raw granules into canonical observations
#[derive(Debug, Clone, Default)]
pub struct Normalizer;

impl Normalizer {
    pub fn new() -> Self {
        Self
    }

    /// Normalize one raw item using the provider's schema hint
    pub fn normalize(&self, item: &RawItem, hint: &SchemaHint) -> NormalizedItem {
        let mut out = NormalizedItem::default();

        let text = match std::str::from_utf8(&item.payload) {
            Ok(text) => text,
            Err(e) => {
                out.errors.push(
                    NormalizationError::new("payload", format!("not valid UTF-8: {}", e))
                        .at(&item.native_id),
                );
                return out;
            }
        };

        // Providers answer an empty subset with an empty body
        if text.trim().is_empty() {
            return out;
        }

        let table = match Table::decode(text, hint.format) {
            Ok(table) => table,
            Err(e) => {
                out.errors.push(e.at(&item.native_id));
                return out;
            }
        };

        let layout = match Layout::resolve(&table, hint) {
            Ok(layout) => layout,
            Err(e) => {
                out.errors.push(e.at(&item.native_id));
                return out;
            }
        };

        for (line, cells) in &table.rows {
            let locator = format!("{}#{}", item.native_id, line);
            if cells.len() != table.columns.len() {
                out.errors.push(
                    NormalizationError::new(
                        "row",
                        format!(
                            "expected {} fields, found {}",
                            table.columns.len(),
                            cells.len()
                        ),
                    )
                    .at(&locator),
                );
                continue;
            }

            match layout.normalize_row(item, hint, cells, &locator, &mut out) {
                Ok(()) => {}
                Err(e) => out.errors.push(e.at(&locator)),
            }
        }

        out
    }
}

/// Decoded CSV table
#[derive(Debug)]
struct Table {
    /// Lowercased column names
    columns: Vec<String>,
    units: Vec<Option<String>>,
    /// (1-based line number, cells)
    rows: Vec<(usize, Vec<String>)>,
}

impl Table {
    fn decode(text: &str, format: PayloadFormat) -> Result<Self, NormalizationError> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .comment(Some(b'#'))
            .from_reader(text.as_bytes());

        let mut records = Vec::new();
        for result in reader.records() {
            let record = result
                .map_err(|e| NormalizationError::new("payload", format!("malformed CSV: {}", e)))?;
            if record.iter().all(|field| field.trim().is_empty()) {
                continue;
            }
            let line = record.position().map_or(0, |p| p.line() as usize);
            records.push((line, record.iter().map(str::to_string).collect::<Vec<_>>()));
        }
        let mut records = records.into_iter();

        let (_, header) = records
            .next()
            .ok_or_else(|| NormalizationError::new("payload", "empty payload"))?;
        let columns: Vec<String> = header
            .iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .collect();

        let units = match format {
            PayloadFormat::ErddapCsv => {
                let (_, units_row) = records
                    .next()
                    .ok_or_else(|| NormalizationError::new("units", "missing units row"))?;
                let mut units: Vec<Option<String>> = units_row
                    .iter()
                    .map(|u| Some(u.trim().to_string()).filter(|u| !u.is_empty()))
                    .collect();
                units.resize(columns.len(), None);
                units
            }
            PayloadFormat::Csv => vec![None; columns.len()],
        };

        Ok(Self {
            columns,
            units,
            rows: records.collect(),
        })
    }

    fn position(&self, names: &[&str]) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| names.contains(&c.as_str()))
    }
}

#[derive(Debug)]
struct VariableColumn {
    index: usize,
    name: String,
    variable: VariableType,
    unit: Option<String>,
    qc: Option<usize>,
}

/// Column roles resolved once per granule
#[derive(Debug)]
struct Layout {
    time: usize,
    latitude: usize,
    longitude: usize,
    depth: Option<(usize, Option<String>)>,
    station: Option<usize>,
    variables: Vec<VariableColumn>,
}

impl Layout {
    fn resolve(table: &Table, hint: &SchemaHint) -> Result<Self, NormalizationError> {
        let missing = |field: &str| NormalizationError::new(field, "column not found");

        let time = table
            .position(&["time", "date", "datetime", "timestamp"])
            .ok_or_else(|| missing("time"))?;
        let latitude = table
            .position(&["latitude", "lat"])
            .ok_or_else(|| missing("latitude"))?;
        let longitude = table
            .position(&["longitude", "lon", "long"])
            .ok_or_else(|| missing("longitude"))?;

        let depth = table
            .position(&["depth", "pres"])
            .map(|i| (i, unit_for(table, hint, i)));

        let station = match &hint.station_column {
            Some(column) => Some(
                table
                    .position(&[column.as_str()])
                    .ok_or_else(|| missing(column))?,
            ),
            None => table.position(&["platform_number", "station", "station_id", "platform"]),
        };

        let variables: Vec<VariableColumn> = table
            .columns
            .iter()
            .enumerate()
            .filter_map(|(index, name)| {
                variable_for_column(name).map(|variable| VariableColumn {
                    index,
                    name: name.clone(),
                    variable,
                    unit: unit_for(table, hint, index),
                    qc: table.position(&[format!("{}_qc", name).as_str()]),
                })
            })
            .collect();

        if variables.is_empty() {
            return Err(NormalizationError::new(
                "columns",
                format!("no recognised variable among [{}]", table.columns.join(", ")),
            ));
        }

        Ok(Self {
            time,
            latitude,
            longitude,
            depth,
            station,
            variables,
        })
    }

    fn normalize_row(
        &self,
        item: &RawItem,
        hint: &SchemaHint,
        cells: &[String],
        locator: &str,
        out: &mut NormalizedItem,
    ) -> Result<(), NormalizationError> {
        let timestamp = parse_timestamp(&cells[self.time])
            .ok_or_else(|| NormalizationError::new("time", format!("unparseable '{}'", cells[self.time])))?;

        let latitude = parse_number("latitude", &cells[self.latitude])?;
        let longitude = parse_number("longitude", &cells[self.longitude])?;
        let depth = match &self.depth {
            Some((index, unit)) => depth_in_metres(parse_number("depth", &cells[*index])?, unit.as_deref())?,
            None => 0.0,
        };

        let position = Position::new(latitude, longitude, depth)
            .map_err(|(field, reason)| NormalizationError::new(field, reason))?;

        let station_id = match self.station {
            Some(index) => {
                let raw = cells[index].trim();
                if raw.is_empty() {
                    return Err(NormalizationError::new("station", "empty station id"));
                }
                raw.to_string()
            }
            None => GRID_STATION.to_string(),
        };

        for column in &self.variables {
            let cell = &cells[column.index];
            if is_missing(cell) {
                out.missing += 1;
                continue;
            }

            let converted = parse_number(&column.name, cell).and_then(|raw| {
                to_canonical(column.variable, column.unit.as_deref(), raw)
                    .map_err(|reason| NormalizationError::new(column.name.as_str(), reason))
            });
            let value = match converted {
                Ok(value) => value,
                Err(e) => {
                    out.errors.push(e.at(locator));
                    continue;
                }
            };

            let quality = column
                .qc
                .and_then(|i| QualityFlag::from_qc_code(&cells[i]))
                .unwrap_or(hint.default_quality);

            out.observations.push(CanonicalObservation {
                station_id: station_id.clone(),
                position,
                timestamp,
                variable: column.variable,
                value,
                unit: column.variable.canonical_unit(),
                quality,
                provenance: Provenance {
                    source: item.source.clone(),
                    raw_id: format!("{}:{}", locator, column.name),
                    fetched_at: item.fetched_at,
                },
                merged_from: Vec::new(),
            });
        }

        Ok(())
    }
}

fn unit_for(table: &Table, hint: &SchemaHint, index: usize) -> Option<String> {
    table.units[index]
        .clone()
        .or_else(|| hint.column_units.get(&table.columns[index]).cloned())
}

/// Map a column name onto the variable it measures
pub fn variable_for_column(name: &str) -> Option<VariableType> {
    let variable = match name {
        "analysed_sst" | "sst" | "sea_surface_temperature" => VariableType::SeaSurfaceTemperature,
        "temp" | "temp_adjusted" | "temperature" | "sea_water_temperature" => {
            VariableType::WaterTemperature
        }
        "psal" | "psal_adjusted" | "salinity" | "sea_water_salinity" => VariableType::Salinity,
        "doxy" | "dissolved_oxygen" => VariableType::DissolvedOxygen,
        "tmax" => VariableType::AirTemperatureMax,
        "tmin" => VariableType::AirTemperatureMin,
        "prcp" | "precipitation" => VariableType::Precipitation,
        _ => return None,
    };
    Some(variable)
}

/// Convert a value in `unit` into the canonical unit of `variable`.
///
/// A missing unit means the value is already canonical.
pub fn to_canonical(variable: VariableType, unit: Option<&str>, value: f64) -> Result<f64, String> {
    let label = unit
        .map(|u| u.trim().to_lowercase().replace(' ', "_"))
        .unwrap_or_default();
    if label.is_empty() {
        return Ok(value);
    }

    let converted = match (variable.canonical_unit(), label.as_str()) {
        (
            Unit::DegreesCelsius,
            "degc" | "deg_c" | "degree_c" | "degrees_c" | "degree_celsius" | "celsius" | "c" | "°c",
        ) => value,
        (Unit::DegreesCelsius, "k" | "kelvin" | "degree_k" | "degrees_k") => value - 273.15,
        (Unit::DegreesCelsius, "degf" | "degree_f" | "degrees_f" | "fahrenheit" | "f" | "°f") => {
            (value - 32.0) * 5.0 / 9.0
        }
        (Unit::DegreesCelsius, "tenths_degc") => value / 10.0,
        (Unit::PracticalSalinity, "psu" | "pss-78" | "pss78" | "1e-3" | "0.001" | "1") => value,
        (Unit::MicromolePerKilogram, "umol/kg" | "micromol/kg" | "micromole/kg" | "µmol/kg") => {
            value
        }
        (Unit::Millimetres, "mm" | "millimeters" | "millimetres") => value,
        (Unit::Millimetres, "cm") => value * 10.0,
        (Unit::Millimetres, "in" | "inch" | "inches") => value * 25.4,
        (Unit::Millimetres, "tenths_mm") => value / 10.0,
        (canonical, other) => {
            return Err(format!(
                "unknown unit '{}' for {} (canonical {})",
                other,
                variable,
                canonical.symbol()
            ))
        }
    };

    if !converted.is_finite() {
        return Err(format!("value {} is not finite", converted));
    }
    Ok(converted)
}

/// Depth in metres; pressure in decibar is taken as metres
fn depth_in_metres(value: f64, unit: Option<&str>) -> Result<f64, NormalizationError> {
    let label = unit.map(|u| u.trim().to_lowercase()).unwrap_or_default();
    match label.as_str() {
        "" | "m" | "meter" | "meters" | "metres" | "decibar" | "dbar" | "db" => Ok(value),
        other => Err(NormalizationError::new(
            "depth",
            format!("unknown depth unit '{}'", other),
        )),
    }
}

fn parse_number(field: &str, cell: &str) -> Result<f64, NormalizationError> {
    let trimmed = cell.trim();
    if is_missing(trimmed) {
        return Err(NormalizationError::new(field, "missing value"));
    }
    trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| NormalizationError::new(field, format!("not a number: '{}'", trimmed)))
}

fn is_missing(cell: &str) -> bool {
    let trimmed = cell.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("nan")
        || trimmed.eq_ignore_ascii_case("na")
        || trimmed.eq_ignore_ascii_case("null")
        || trimmed == "-9999"
        || trimmed == "99999"
}

/// Parse the timestamp shapes providers emit into UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S", "%Y%m%d%H%M%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc());
        }
    }
    for fmt in ["%Y-%m-%d", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(s, fmt) {
            return date.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
        }
    }
    None
}
