use crate::error::{MalformedInputError, SourceError};
use chrono::DateTime;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::{debug, warn};

// telemetry export columns. the car logger and the timing feed disagree on names,
// so each channel accepts the logger name plus a plain alias.
#[derive(Debug, Deserialize)]
struct RawTelemetryRow {
    #[serde(default, deserialize_with = "csv::invalid_option")]
    vehicle_number: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    lap: Option<f64>,
    #[serde(rename = "Laptrigger_lapdist_dls", alias = "distance", default, deserialize_with = "csv::invalid_option")]
    distance: Option<f64>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    speed: Option<f64>,
    #[serde(rename = "aps", alias = "throttle", default, deserialize_with = "csv::invalid_option")]
    throttle: Option<f64>,
    #[serde(rename = "pbrake_f", alias = "brake", default, deserialize_with = "csv::invalid_option")]
    brake: Option<f64>,
    #[serde(rename = "Steering_Angle", alias = "steering", default, deserialize_with = "csv::invalid_option")]
    steering: Option<f64>,
    #[serde(rename = "accx_can", alias = "accel_long", default, deserialize_with = "csv::invalid_option")]
    accel_long: Option<f64>,
    #[serde(rename = "accy_can", alias = "accel_lat", default, deserialize_with = "csv::invalid_option")]
    accel_lat: Option<f64>,
}

/// One high-frequency sensor reading. Channels that can be absent from an export stay optional.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub vehicle_number: u32,
    pub lap: u32,
    /// meters into the lap
    pub distance: Option<f64>,
    /// seconds
    pub timestamp: Option<f64>,
    pub speed: Option<f64>,
    pub throttle: Option<f64>,
    pub brake: Option<f64>,
    /// degrees
    pub steering: Option<f64>,
    /// g
    pub accel_long: Option<f64>,
    /// g
    pub accel_lat: Option<f64>,
}

/// Which channels exist in a telemetry file at all (header level, not per row).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelSet {
    pub distance: bool,
    pub timestamp: bool,
    pub speed: bool,
    pub throttle: bool,
    pub brake: bool,
    pub steering: bool,
    pub accel_long: bool,
    pub accel_lat: bool,
}

impl ChannelSet {
    pub fn all() -> Self {
        Self {
            distance: true,
            timestamp: true,
            speed: true,
            throttle: true,
            brake: true,
            steering: true,
            accel_long: true,
            accel_lat: true,
        }
    }

    fn from_headers(headers: &StringRecord) -> Self {
        let has = |names: &[&str]| headers.iter().any(|h| names.contains(&h));
        Self {
            distance: has(&["Laptrigger_lapdist_dls", "distance"]),
            timestamp: has(&["timestamp"]),
            speed: has(&["speed"]),
            throttle: has(&["aps", "throttle"]),
            brake: has(&["pbrake_f", "brake"]),
            steering: has(&["Steering_Angle", "steering"]),
            accel_long: has(&["accx_can", "accel_long"]),
            accel_lat: has(&["accy_can", "accel_lat"]),
        }
    }

    pub fn missing(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for (present, name) in [
            (self.distance, "distance"),
            (self.timestamp, "timestamp"),
            (self.speed, "speed"),
            (self.throttle, "throttle"),
            (self.brake, "brake"),
            (self.steering, "steering"),
            (self.accel_long, "accel_long"),
            (self.accel_lat, "accel_lat"),
        ] {
            if !present {
                out.push(name);
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default)]
pub struct TelemetryFile {
    pub samples: Vec<TelemetrySample>,
    pub channels: ChannelSet,
}

impl TelemetryFile {
    pub fn new(samples: Vec<TelemetrySample>, channels: ChannelSet) -> Self {
        Self { samples, channels }
    }

    /// Samples regrouped per car, each car's rows kept in file order.
    pub fn by_vehicle(&self) -> BTreeMap<u32, Vec<TelemetrySample>> {
        let mut out: BTreeMap<u32, Vec<TelemetrySample>> = BTreeMap::new();
        for s in &self.samples {
            out.entry(s.vehicle_number).or_default().push(s.clone());
        }
        out
    }
}

pub fn read_telemetry<P: AsRef<Path>>(path: P) -> Result<TelemetryFile, SourceError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| SourceError::Io { path: path.to_path_buf(), source })?;
    parse_telemetry(file, &path.display().to_string())
}

pub fn parse_telemetry<R: Read>(reader: R, label: &str) -> Result<TelemetryFile, SourceError> {
    let csv_err = |source| SourceError::Csv { path: label.into(), source };
    let mut rdr = ReaderBuilder::new().has_headers(true).trim(Trim::All).from_reader(reader);
    let headers = rdr.headers().map_err(csv_err)?.clone();
    for key in ["vehicle_number", "lap"] {
        if !headers.iter().any(|h| h == key) {
            return Err(MalformedInputError::MissingColumn(key.to_string()).into());
        }
    }
    let channels = ChannelSet::from_headers(&headers);
    let missing = channels.missing();
    if !missing.is_empty() {
        warn!(file = label, channels = ?missing, "telemetry channels absent from file; dependent features will be missing");
    }

    let mut samples = Vec::new();
    let mut unkeyed = 0usize;
    let mut bad_timestamps = 0usize;
    for res in rdr.deserialize() {
        let raw: RawTelemetryRow = res.map_err(csv_err)?;
        let (Some(vehicle_number), Some(lap)) = (raw.vehicle_number, raw.lap) else {
            unkeyed += 1;
            continue;
        };
        if !lap.is_finite() || lap < 0.0 {
            unkeyed += 1;
            continue;
        }
        let timestamp = match raw.timestamp.as_deref().filter(|t| !t.is_empty()) {
            None => None,
            Some(t) => {
                let parsed = parse_timestamp(t);
                if parsed.is_none() {
                    bad_timestamps += 1;
                }
                parsed
            }
        };
        samples.push(TelemetrySample {
            vehicle_number,
            lap: lap.round() as u32,
            distance: raw.distance,
            timestamp,
            speed: raw.speed,
            throttle: raw.throttle,
            brake: raw.brake,
            steering: raw.steering,
            accel_long: raw.accel_long,
            accel_lat: raw.accel_lat,
        });
    }
    if unkeyed > 0 {
        warn!(file = label, rows = unkeyed, "dropped telemetry rows without vehicle/lap key");
    }
    if bad_timestamps > 0 {
        warn!(file = label, rows = bad_timestamps, "unparseable telemetry timestamps treated as missing");
    }
    debug!(file = label, samples = samples.len(), "telemetry loaded");
    Ok(TelemetryFile::new(samples, channels))
}

/// Seconds since epoch from either a float or an RFC 3339 string.
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    if let Ok(v) = raw.parse::<f64>() {
        return v.is_finite().then_some(v);
    }
    let dt = DateTime::parse_from_rfc3339(raw).ok()?;
    Some(dt.timestamp() as f64 + dt.timestamp_subsec_nanos() as f64 * 1e-9)
}

/// Parses `SS.mmm`, `M:SS.mmm` or `H:MM:SS.mmm` into seconds.
pub fn parse_lap_time(raw: &str) -> Result<f64, MalformedInputError> {
    let bad = || MalformedInputError::TimeString(raw.to_string());
    let s = raw.trim();
    if s.is_empty() {
        return Err(bad());
    }
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 {
        return Err(bad());
    }
    let mut total = 0.0;
    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() || part.starts_with('-') || part.starts_with('+') {
            return Err(bad());
        }
        let value: f64 = part.parse().map_err(|_| bad())?;
        if !value.is_finite() {
            return Err(bad());
        }
        // minutes and hours are whole numbers, seconds below 60 once a minute field exists
        if i < last && value.fract() != 0.0 {
            return Err(bad());
        }
        if i > 0 && value >= 60.0 {
            return Err(bad());
        }
        total = total * 60.0 + value;
    }
    Ok(total)
}

// ---------- timing-feed CSVs (semicolon-delimited) ----------

#[derive(Debug, Clone, Deserialize)]
struct RawResultRow {
    #[serde(rename = "POSITION", default, deserialize_with = "csv::invalid_option")]
    position: Option<u32>,
    #[serde(rename = "NUMBER", default, deserialize_with = "csv::invalid_option")]
    number: Option<u32>,
    #[serde(rename = "STATUS", default)]
    status: Option<String>,
    #[serde(rename = "LAPS", default, deserialize_with = "csv::invalid_option")]
    laps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    pub number: u32,
    pub position: u32,
    pub status: Option<String>,
    pub laps: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawQualifyingRow {
    #[serde(rename = "POSITION", default, deserialize_with = "csv::invalid_option")]
    position: Option<u32>,
    #[serde(rename = "NUMBER", default, deserialize_with = "csv::invalid_option")]
    number: Option<u32>,
    #[serde(rename = "BEST_LAP_TIME", default)]
    best_lap_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QualifyingRow {
    pub number: u32,
    pub position: Option<u32>,
    /// seconds, None when the time string was malformed
    pub best_lap: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawLapRow {
    #[serde(rename = "NUMBER", default, deserialize_with = "csv::invalid_option")]
    number: Option<u32>,
    #[serde(rename = "LAP_NUMBER", default, deserialize_with = "csv::invalid_option")]
    lap_number: Option<u32>,
    #[serde(rename = "LAP_TIME", default)]
    lap_time: Option<String>,
    #[serde(rename = "S1_SECONDS", default, deserialize_with = "csv::invalid_option")]
    s1: Option<f64>,
    #[serde(rename = "S2_SECONDS", default, deserialize_with = "csv::invalid_option")]
    s2: Option<f64>,
    #[serde(rename = "S3_SECONDS", default, deserialize_with = "csv::invalid_option")]
    s3: Option<f64>,
    #[serde(rename = "ELAPSED", default)]
    elapsed: Option<String>,
    #[serde(rename = "FLAG_AT_FL", default)]
    flag: Option<String>,
    #[serde(rename = "PIT_TIME", default)]
    pit_time: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LapRow {
    pub number: u32,
    pub lap_number: u32,
    pub lap_time: Option<f64>,
    pub sectors: [Option<f64>; 3],
    pub elapsed: Option<f64>,
    pub flag: String,
    pub pitted: bool,
}

fn timing_reader<R: Read>(reader: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(true)
        .trim(Trim::All)
        .flexible(true)
        .from_reader(reader)
}

fn open(path: &Path) -> Result<File, SourceError> {
    File::open(path).map_err(|source| SourceError::Io { path: path.to_path_buf(), source })
}

// parses a time column, counting failures so the file logs once
fn time_field(raw: Option<&str>, malformed: &mut usize) -> Option<f64> {
    let raw = raw.filter(|s| !s.trim().is_empty())?;
    match parse_lap_time(raw) {
        Ok(v) => Some(v),
        Err(_) => {
            *malformed += 1;
            None
        }
    }
}

pub fn read_results<P: AsRef<Path>>(path: P) -> Result<Vec<ResultRow>, SourceError> {
    let path = path.as_ref();
    parse_results(open(path)?, &path.display().to_string())
}

pub fn parse_results<R: Read>(reader: R, label: &str) -> Result<Vec<ResultRow>, SourceError> {
    let mut rows = Vec::new();
    for res in timing_reader(reader).deserialize() {
        let raw: RawResultRow = res.map_err(|source| SourceError::Csv { path: label.into(), source })?;
        if let (Some(number), Some(position)) = (raw.number, raw.position) {
            rows.push(ResultRow { number, position, status: raw.status, laps: raw.laps });
        }
    }
    Ok(rows)
}

pub fn read_qualifying<P: AsRef<Path>>(path: P) -> Result<Vec<QualifyingRow>, SourceError> {
    let path = path.as_ref();
    parse_qualifying(open(path)?, &path.display().to_string())
}

pub fn parse_qualifying<R: Read>(reader: R, label: &str) -> Result<Vec<QualifyingRow>, SourceError> {
    let mut rows = Vec::new();
    let mut malformed = 0usize;
    for res in timing_reader(reader).deserialize() {
        let raw: RawQualifyingRow = res.map_err(|source| SourceError::Csv { path: label.into(), source })?;
        let Some(number) = raw.number else { continue };
        let best_lap = time_field(raw.best_lap_time.as_deref(), &mut malformed);
        rows.push(QualifyingRow { number, position: raw.position, best_lap });
    }
    if malformed > 0 {
        warn!(file = label, values = malformed, "malformed qualifying times treated as missing");
    }
    Ok(rows)
}

pub fn read_laps<P: AsRef<Path>>(path: P) -> Result<Vec<LapRow>, SourceError> {
    let path = path.as_ref();
    parse_laps(open(path)?, &path.display().to_string())
}

pub fn parse_laps<R: Read>(reader: R, label: &str) -> Result<Vec<LapRow>, SourceError> {
    let mut rows = Vec::new();
    let mut malformed = 0usize;
    for res in timing_reader(reader).deserialize() {
        let raw: RawLapRow = res.map_err(|source| SourceError::Csv { path: label.into(), source })?;
        let (Some(number), Some(lap_number)) = (raw.number, raw.lap_number) else { continue };
        let lap_time = time_field(raw.lap_time.as_deref(), &mut malformed);
        let elapsed = time_field(raw.elapsed.as_deref(), &mut malformed);
        rows.push(LapRow {
            number,
            lap_number,
            lap_time,
            sectors: [raw.s1, raw.s2, raw.s3],
            elapsed,
            flag: raw.flag.unwrap_or_default(),
            pitted: raw.pit_time.map_or(false, |p| !p.trim().is_empty()),
        });
    }
    if malformed > 0 {
        warn!(file = label, values = malformed, "malformed lap/elapsed times treated as missing");
    }
    Ok(rows)
}

/// Everything the pipeline reads for one race.
#[derive(Debug, Clone)]
pub struct RaceData {
    pub race_id: String,
    pub telemetry: Option<TelemetryFile>,
    pub results: Vec<ResultRow>,
    pub qualifying: Vec<QualifyingRow>,
    pub laps: Vec<LapRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lap_time_formats() {
        assert!((parse_lap_time("1:39.725").unwrap() - 99.725).abs() < 1e-9);
        assert!((parse_lap_time("45.5").unwrap() - 45.5).abs() < 1e-9);
        assert!((parse_lap_time("1:02:03.500").unwrap() - 3723.5).abs() < 1e-9);
        assert!(parse_lap_time("").is_err());
        assert!(parse_lap_time("1:75.000").is_err());
        assert!(parse_lap_time("abc").is_err());
        assert!(parse_lap_time("1.5:20.000").is_err());
    }

    #[test]
    fn telemetry_aliases_and_absent_channels() {
        let csv = "vehicle_number,lap,distance,speed,brake,steering,accel_lat,timestamp\n\
                   7,1,10.0,120.5,0,2.0,0.1,2025-04-27T15:00:00.040Z\n\
                   7,1,,119.0,,3.0,0.2,\n\
                   ,1,12.0,119.0,0,3.0,0.2,1.0\n";
        let file = parse_telemetry(csv.as_bytes(), "t.csv").unwrap();
        assert!(!file.channels.throttle);
        assert!(!file.channels.accel_long);
        assert!(file.channels.accel_lat);
        assert_eq!(file.samples.len(), 2);
        assert_eq!(file.samples[1].distance, None);
        assert_eq!(file.samples[1].brake, None);
        let ts = file.samples[0].timestamp.unwrap();
        assert!((ts.fract() - 0.04).abs() < 1e-6);
    }

    #[test]
    fn telemetry_without_lap_column_is_rejected() {
        let csv = "vehicle_number,distance,speed\n7,10.0,120.5\n";
        match parse_telemetry(csv.as_bytes(), "t.csv") {
            Err(SourceError::Malformed(MalformedInputError::MissingColumn(col))) => assert_eq!(col, "lap"),
            other => panic!("expected missing lap column, got {:?}", other.map(|f| f.samples.len())),
        }
    }

    #[test]
    fn logger_column_names() {
        let csv = "vehicle_number,lap,Laptrigger_lapdist_dls,speed,aps,pbrake_f,Steering_Angle,accx_can,accy_can\n\
                   13,2,100.0,150.0,99.0,0.0,-4.0,0.3,-0.1\n";
        let file = parse_telemetry(csv.as_bytes(), "t.csv").unwrap();
        assert_eq!(file.channels.missing(), vec!["timestamp"]);
        let s = &file.samples[0];
        assert_eq!(s.throttle, Some(99.0));
        assert_eq!(s.steering, Some(-4.0));
        assert_eq!(s.distance, Some(100.0));
    }

    #[test]
    fn malformed_lap_time_is_missing_not_fatal() {
        let csv = "NUMBER; LAP_NUMBER; LAP_TIME; S1_SECONDS; S2_SECONDS; S3_SECONDS; ELAPSED; FLAG_AT_FL\n\
                   7;1;1:40.100;30.1;35.0;35.0;1:40.100;GF\n\
                   7;2;garbage;30.0;35.2;34.9;3:20.300;GF\n";
        let laps = parse_laps(csv.as_bytes(), "laps.csv").unwrap();
        assert_eq!(laps.len(), 2);
        assert!((laps[0].lap_time.unwrap() - 100.1).abs() < 1e-9);
        assert_eq!(laps[1].lap_time, None);
        assert!((laps[1].elapsed.unwrap() - 200.3).abs() < 1e-9);
        assert_eq!(laps[1].flag, "GF");
    }
}
