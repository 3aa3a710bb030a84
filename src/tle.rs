//! TLE parser.
//!
//! Deterministic, allocation-light decoding of the fixed-column Two-Line
//! Element text format. Every decoder here is a fallible free function
//! returning `Result` rather than panicking — there is no panicking path
//! through a malformed line; a bad record is simply skipped by the stream
//! parser.

use crate::breaker::CircuitBreakerRegistry;
use crate::bus::PubSubBus;
use crate::error::StellarError;
use crate::store::SharedStore;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct Tle {
    pub norad_id: u32,
    pub name: Option<String>,
    pub classification: char,
    pub intl_designator: String,
    pub epoch: DateTime<Utc>,
    pub mean_motion_dot: f64,
    pub mean_motion_ddot: f64,
    pub bstar: f64,
    pub element_set_number: u32,
    pub inclination_deg: f64,
    pub raan_deg: f64,
    pub eccentricity: f64,
    pub arg_perigee_deg: f64,
    pub mean_anomaly_deg: f64,
    pub mean_motion_rev_per_day: f64,
    pub rev_number: u32,
    pub checksum_ok: bool,
    pub line1: String,
    pub line2: String,
}

/// Columns 3-7 (NORAD catalog number), line 1 or 2: `line[2..7]`.
fn col(line: &str, range: std::ops::Range<usize>) -> Result<&str, StellarError> {
    line.get(range.clone()).ok_or_else(|| {
        StellarError::parse_error(format!("TLE line too short for field range {range:?}"))
    })
}

/// `.00012778` / `-.00012778` -> `0.000…` / `-0.000…`. TLE first-derivative
/// fields omit the leading zero before the decimal point.
fn parse_assumed_decimal(raw: &str) -> Result<f64, StellarError> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0.0);
    }
    let normalized = if let Some(rest) = s.strip_prefix('-') {
        format!("-0{rest}")
    } else if let Some(rest) = s.strip_prefix('+') {
        format!("0{rest}")
    } else if s.starts_with('.') {
        format!("0{s}")
    } else {
        s.to_string()
    };
    normalized
        .parse()
        .map_err(|_| StellarError::parse_error(format!("invalid decimal field: {raw:?}")))
}

/// TLE exponential notation: `"-12345-3"` means `-0.12345 x 10^-3`. Unlike
/// [`parse_assumed_decimal`], the mantissa carries no literal decimal
/// point at all — it is assumed to sit immediately after the sign — and
/// the field ends with a single signed exponent digit.
fn parse_tle_exponential(raw: &str) -> Result<f64, StellarError> {
    let s = raw.trim();
    if s.is_empty() {
        return Ok(0.0);
    }
    let bytes = s.as_bytes();
    if bytes.len() < 2 {
        return Err(StellarError::parse_error(format!("TLE exponential field too short: {raw:?}")));
    }
    let exp_sign = bytes[bytes.len() - 2] as char;
    let exp_digit = bytes[bytes.len() - 1] as char;
    if !exp_digit.is_ascii_digit() {
        return Err(StellarError::parse_error(format!("invalid exponent digit in {raw:?}")));
    }
    let mantissa_str = &s[..s.len() - 2];
    let (sign, digits) = if let Some(rest) = mantissa_str.strip_prefix('-') {
        (-1.0, rest)
    } else if let Some(rest) = mantissa_str.strip_prefix('+') {
        (1.0, rest)
    } else {
        (1.0, mantissa_str)
    };
    let digits = digits.trim();
    let mantissa = if digits.is_empty() {
        0.0
    } else {
        format!("0.{digits}")
            .parse::<f64>()
            .map_err(|_| StellarError::parse_error(format!("invalid mantissa in {raw:?}")))?
    };
    let exponent: i32 = exp_digit.to_digit(10).unwrap() as i32;
    let exponent = match exp_sign {
        '-' => -exponent,
        '+' | ' ' => exponent,
        other => {
            return Err(StellarError::parse_error(format!(
                "invalid exponent sign {other:?} in {raw:?}"
            )))
        }
    };
    Ok(sign * mantissa * 10f64.powi(exponent))
}

/// Eccentricity has an assumed leading `"0."`: `"0001234"` -> `0.0001234`.
fn parse_eccentricity(raw: &str) -> Result<f64, StellarError> {
    let s = raw.trim();
    format!("0.{s}")
        .parse()
        .map_err(|_| StellarError::parse_error(format!("invalid eccentricity field: {raw:?}")))
}

/// `57..99 -> 1957..1999`, `00..56 -> 2000..2056`.
fn full_year(two_digit: u32) -> i32 {
    if two_digit >= 57 {
        1900 + two_digit as i32
    } else {
        2000 + two_digit as i32
    }
}

fn reconstruct_epoch(year: i32, day_of_year_fractional: f64) -> Result<DateTime<Utc>, StellarError> {
    let day = day_of_year_fractional.trunc() as u32;
    let frac = day_of_year_fractional.fract();
    if day == 0 {
        return Err(StellarError::parse_error("TLE epoch day-of-year must be >= 1"));
    }
    let base = NaiveDate::from_yo_opt(year, day)
        .ok_or_else(|| StellarError::parse_error(format!("invalid epoch day-of-year {day} for year {year}")))?
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let micros_in_day = 86_400_000_000f64;
    let micros = (frac * micros_in_day).round() as i64;
    Ok(Utc.from_utc_datetime(&base) + chrono::Duration::microseconds(micros))
}

fn checksum_of(line: &str) -> u32 {
    let body = if line.len() > 68 { &line[..68] } else { line };
    body.chars()
        .map(|c| {
            if c.is_ascii_digit() {
                c.to_digit(10).unwrap()
            } else if c == '-' {
                1
            } else {
                0
            }
        })
        .sum::<u32>()
        % 10
}

fn verify_checksum(line: &str) -> bool {
    match line.chars().nth(68).and_then(|c| c.to_digit(10)) {
        Some(expected) => checksum_of(line) == expected,
        None => false,
    }
}

/// Parse a single 2-line (or 3-line with a leading name line) TLE record.
/// `name_line` is `None` for the bare 2-line form.
pub fn parse_record(name_line: Option<&str>, line1: &str, line2: &str) -> Result<Tle, StellarError> {
    if line1.len() < 69 {
        return Err(StellarError::parse_error("TLE line 1 shorter than 69 columns"));
    }
    if line2.len() < 69 {
        return Err(StellarError::parse_error("TLE line 2 shorter than 69 columns"));
    }

    let norad_id: u32 = col(line1, 2..7)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid NORAD id in line 1"))?;
    let classification = col(line1, 7..8)?.chars().next().unwrap_or('U');
    let intl_designator = col(line1, 9..17)?.trim().to_string();
    let epoch_year_2d: u32 = col(line1, 18..20)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid epoch year in line 1"))?;
    let epoch_day: f64 = col(line1, 20..32)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid epoch day in line 1"))?;
    let mean_motion_dot = parse_assumed_decimal(col(line1, 33..43)?)?;
    let mean_motion_ddot = parse_tle_exponential(col(line1, 44..52)?)?;
    let bstar = parse_tle_exponential(col(line1, 53..61)?)?;
    let element_set_number: u32 = col(line1, 64..68)?.trim().parse().unwrap_or(0);

    let norad_id_l2: u32 = col(line2, 2..7)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid NORAD id in line 2"))?;
    let inclination_deg: f64 = col(line2, 8..16)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid inclination in line 2"))?;
    let raan_deg: f64 = col(line2, 17..25)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid RAAN in line 2"))?;
    let eccentricity = parse_eccentricity(col(line2, 26..33)?)?;
    let arg_perigee_deg: f64 = col(line2, 34..42)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid argument of perigee in line 2"))?;
    let mean_anomaly_deg: f64 = col(line2, 43..51)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid mean anomaly in line 2"))?;
    let mean_motion_rev_per_day: f64 = col(line2, 52..63)?
        .trim()
        .parse()
        .map_err(|_| StellarError::parse_error("invalid mean motion in line 2"))?;
    let rev_number: u32 = col(line2, 63..68)?.trim().parse().unwrap_or(0);

    if norad_id != norad_id_l2 {
        return Err(StellarError::parse_error(format!(
            "NORAD id mismatch between lines: {norad_id} vs {norad_id_l2}"
        )));
    }

    let epoch = reconstruct_epoch(full_year(epoch_year_2d), epoch_day)?;
    let checksum_ok = verify_checksum(line1) && verify_checksum(line2);

    Ok(Tle {
        norad_id,
        name: name_line.map(|n| n.trim().to_string()),
        classification,
        intl_designator,
        epoch,
        mean_motion_dot,
        mean_motion_ddot,
        bstar,
        element_set_number,
        inclination_deg,
        raan_deg,
        eccentricity,
        arg_perigee_deg,
        mean_anomaly_deg,
        mean_motion_rev_per_day,
        rev_number,
        checksum_ok,
        line1: line1.to_string(),
        line2: line2.to_string(),
    })
}

/// Parse a text blob containing any number of 2- or 3-line TLE records.
/// A line beginning with `"1 "` starts a bare 2-line record; any other
/// non-empty line starts a 3-line (named) record. Invalid records are
/// skipped rather than aborting the whole stream.
pub fn parse_stream(text: &str) -> Vec<Tle> {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut results = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("1 ") {
            if i + 1 < lines.len() {
                if let Ok(tle) = parse_record(None, line, lines[i + 1]) {
                    results.push(tle);
                } else {
                    tracing::debug!("skipping unparsable 2-line TLE record at line {i}");
                }
                i += 2;
            } else {
                break;
            }
        } else {
            if i + 2 < lines.len() {
                if let Ok(tle) = parse_record(Some(line), lines[i + 1], lines[i + 2]) {
                    results.push(tle);
                } else {
                    tracing::debug!("skipping unparsable named TLE record at line {i}");
                }
                i += 3;
            } else {
                break;
            }
        }
    }
    results
}

/// A source of TLE text. The real network client (HTTP fetch from a TLE
/// provider) is an external collaborator out of this repository's scope —
/// `spec.md` §1 calls out "TLE sources (their clients are trivial HTTP)" as
/// deliberately excluded. This trait is the seam a caller plugs one into.
#[async_trait]
pub trait TleSource: Send + Sync {
    async fn fetch(&self) -> Result<String, StellarError>;
}

/// Reads a pre-fetched TLE text blob from a fixed string, standing in for
/// whatever trivial HTTP client an operator wires up outside this
/// repository. Useful for local runs and tests.
pub struct StaticTleSource {
    pub text: String,
}

#[async_trait]
impl TleSource for StaticTleSource {
    async fn fetch(&self) -> Result<String, StellarError> {
        Ok(self.text.clone())
    }
}

/// Periodic task owned by the TLE parser module (per the "TLE refresh
/// service" component named in spec.md §2/§5 without its own letter):
/// pulls text from a [`TleSource`] through the `orbital_service` circuit
/// breaker, parses it, and upserts matching satellites by NORAD id.
pub struct TleRefreshService {
    source: Arc<dyn TleSource>,
    store: SharedStore,
    bus: PubSubBus,
    breakers: CircuitBreakerRegistry,
}

impl TleRefreshService {
    pub fn new(
        source: Arc<dyn TleSource>,
        store: SharedStore,
        bus: PubSubBus,
        breakers: CircuitBreakerRegistry,
    ) -> Self {
        Self { source, store, bus, breakers }
    }

    /// One refresh cycle: fetch (breaker-wrapped), parse the stream, and
    /// upsert every satellite already known under a matching NORAD id.
    /// Satellites with no NORAD id on record, or no matching TLE in the
    /// fetched stream, are left untouched.
    pub async fn refresh_once(&self) {
        let source = self.source.clone();
        let text = self
            .breakers
            .call("orbital_service", move || {
                let source = source.clone();
                async move { source.fetch().await }
            })
            .await;
        let text = match text {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(error = %e, "TLE refresh fetch failed");
                return;
            }
        };

        let tles = parse_stream(&text);
        let Ok(satellites) = self.store.list_satellites().await else {
            return;
        };
        for satellite in satellites {
            let Some(norad_id) = satellite.norad_id else { continue };
            let Some(tle) = tles.iter().find(|t| t.norad_id == norad_id) else { continue };
            if let Err(e) = self
                .store
                .upsert_tle(&satellite.id, tle.line1.clone(), tle.line2.clone(), tle.epoch)
                .await
            {
                tracing::warn!(satellite_id = %satellite.id, error = %e, "failed to upsert TLE");
                continue;
            }
            self.bus.publish(
                &format!("satellites:{}", satellite.id),
                serde_json::json!({"event": "tle_updated", "norad_id": norad_id, "epoch": tle.epoch}),
            );
        }
    }

    /// Spawns the periodic refresh loop at `interval_ms`.
    pub fn spawn(self: Arc<Self>, interval_ms: u64) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                interval.tick().await;
                self.refresh_once().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISS_L1: &str = "1 25544U 98067A   08264.51782528 -.00002182  00000-0 -11606-4 0  2927";
    const ISS_L2: &str = "2 25544  51.6416 247.4627 0006703 130.5360 325.0288 15.72125391563537";

    #[test]
    fn parses_iss_canonical_pair() {
        let tle = parse_record(None, ISS_L1, ISS_L2).unwrap();
        assert_eq!(tle.norad_id, 25544);
        assert!((tle.eccentricity - 0.0006703).abs() < 1e-9);
        assert!(tle.checksum_ok);
        assert_eq!(tle.epoch.format("%Y-%m-%d").to_string(), "2008-09-20");
    }

    #[test]
    fn checksum_mismatch_is_a_soft_warning() {
        let mut bad_l1 = ISS_L1.to_string();
        let last = bad_l1.len() - 1;
        let bytes = unsafe { bad_l1.as_bytes_mut() };
        bytes[last] = if bytes[last] == b'0' { b'1' } else { b'0' };
        let tle = parse_record(None, &bad_l1, ISS_L2).unwrap();
        assert!(!tle.checksum_ok);
    }

    #[test]
    fn assumed_decimal_quirks() {
        assert!((parse_assumed_decimal(".00012778").unwrap() - 0.00012778).abs() < 1e-12);
        assert!((parse_assumed_decimal("-.00012778").unwrap() + 0.00012778).abs() < 1e-12);
    }

    #[test]
    fn exponential_quirk() {
        assert!((parse_tle_exponential("-12345-3").unwrap() - (-0.12345e-3)).abs() < 1e-12);
        assert!((parse_tle_exponential("00000-0").unwrap()).abs() < 1e-12);
    }

    #[test]
    fn eccentricity_quirk() {
        assert!((parse_eccentricity("0001234").unwrap() - 0.0001234).abs() < 1e-12);
    }

    #[test]
    fn stream_parser_skips_invalid_records() {
        // A named record whose data lines are too short to decode is
        // skipped, and parsing resumes are not attempted mid-record.
        let text = format!("ISS (ZARYA)\ntoo short\n{ISS_L2}\n{ISS_L1}\n{ISS_L2}\n");
        let tles = parse_stream(&text);
        assert_eq!(tles.len(), 1, "only the trailing valid 2-line record should parse");
        assert_eq!(tles[0].norad_id, 25544);

        let text2 = format!("{ISS_L1}\n{ISS_L2}\n");
        let tles2 = parse_stream(&text2);
        assert_eq!(tles2.len(), 1);
        assert_eq!(tles2[0].norad_id, 25544);
    }
}
