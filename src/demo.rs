//! Synthetic daily logs for trying out the query surface without a live
//! ingest source. Values follow bounded sine curves per metric kind, and the
//! yield counters integrate the matching power series.

use std::collections::{BTreeSet, HashMap};
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate, TimeZone, Utc};

use crate::error::{TsdbError, TsdbResult};
use crate::format::round_to;
use crate::value::{decimal_places_from_literal, parse_strict_float};
use crate::writer::TsdbWriter;

const STEPS_PER_DAY: usize = 24 * 12; // 5-minute intervals
const STEP_MS: u64 = 5 * 60 * 1000;
const STEP_HOURS: f64 = 5.0 / 60.0;

const EMBEDDED_DEMO_SERIES: &str = "\
solar/ac/power=1200.0
solar/ac/yieldday=0
solar/ac/yieldtotal=12500
solar/114172608275/0/current=0.02
solar/114172608275/0/efficiency=95.000
solar/114172608275/0/frequency=49.99
solar/114172608275/0/power=5.7
solar/114172608275/0/powerdc=6.0
solar/114172608275/0/powerfactor=1.001
solar/114172608275/0/reactivepower=0.0
solar/114172608275/0/temperature=14.2
solar/114172608275/0/voltage=236.4
solar/114172608275/0/yieldday=175
solar/114172608275/0/yieldtotal=6.283
solar/114172608275/1/current=0.10
solar/114172608275/1/irradiation=0.600
solar/114172608275/1/power=3.0
solar/114172608275/1/voltage=29.3
solar/114172608275/1/yieldday=87
solar/114172608275/1/yieldtotal=3.151
solar/114172608275/2/current=0.10
solar/114172608275/2/irradiation=0.600
solar/114172608275/2/power=3.0
solar/114172608275/2/voltage=29.4
solar/114172608275/2/yieldday=88
solar/114172608275/2/yieldtotal=3.132
solar/114172608275/device/bootloaderversion=104
solar/114172608275/device/fwbuildversion=10008
solar/114172608275/device/hwpartnumber=269553683
solar/114172608275/name=HM600_BalkonUnten
solar/114172608275/radio/rssi=-80
solar/114172608275/status/last_update=1770827328
solar/114172608275/status/limit_absolute=600.00
solar/114172608275/status/limit_relative=100.00
solar/114172608275/status/producing=1
solar/114172608275/status/reachable=0";

#[derive(Debug, Clone)]
enum DemoValue {
    Numeric { base: f64, decimals: u32 },
    Text(String),
}

#[derive(Debug, Clone)]
struct DemoSeries {
    name: String,
    value: DemoValue,
}

fn parse_demo_series_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Vec<DemoSeries> {
    let mut series = Vec::new();
    for line in lines {
        let line = line.trim();
        let Some((name, value_raw)) = line.split_once('=') else {
            continue;
        };
        let value = match parse_strict_float(value_raw) {
            Some(base) => DemoValue::Numeric {
                base,
                decimals: decimal_places_from_literal(value_raw),
            },
            None => DemoValue::Text(value_raw.to_string()),
        };
        series.push(DemoSeries {
            name: name.to_string(),
            value,
        });
    }
    series
}

fn load_demo_series(path: &Path) -> TsdbResult<Vec<DemoSeries>> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_demo_series_lines(text.lines()))
}

fn metric_suffix(series_name: &str) -> String {
    series_name
        .rsplit('/')
        .next()
        .unwrap_or(series_name)
        .to_lowercase()
}

fn range_for_series(series_name: &str, base: f64) -> (f64, f64) {
    let suffix = metric_suffix(series_name);
    if suffix.contains("powerfactor") {
        return (0.85, 1.0);
    }
    if suffix.contains("frequency") {
        return (49.8, 50.2);
    }
    if suffix.contains("temperature") {
        return (-5.0, 75.0);
    }
    if suffix == "voltage" {
        if series_name.contains("/0/") || series_name.contains("/ac/") {
            return (210.0, 250.0);
        }
        return (10.0, 60.0);
    }
    if suffix == "current" {
        return (0.0, 15.0);
    }
    if suffix == "powerdc" {
        return (0.0, 2600.0);
    }
    if suffix == "power" {
        return (0.0, 2500.0);
    }
    if suffix == "irradiation" {
        return (0.0, 1.2);
    }
    if suffix == "efficiency" {
        return (0.0, 98.0);
    }
    if suffix == "reactivepower" {
        return (-400.0, 400.0);
    }
    if suffix == "rssi" {
        return (-95.0, -20.0);
    }
    if suffix.starts_with("limit_") {
        return (0.0, 2000f64.max(base * 1.05));
    }
    if matches!(suffix.as_str(), "producing" | "reachable" | "is_valid") {
        return (0.0, 1.0);
    }
    if matches!(suffix.as_str(), "yieldday" | "yieldtotal") {
        return (0.0, 10f64.max(base));
    }
    if suffix == "uptime" {
        return (base.max(0.0), base + 86_400.0);
    }
    if suffix.starts_with("rx_")
        || suffix.starts_with("tx_")
        || matches!(
            suffix.as_str(),
            "heap/free" | "heap/maxalloc" | "heap/minfree" | "heap/size"
        )
    {
        return ((base * 0.5).max(0.0), 10f64.max(base * 1.5));
    }
    if matches!(
        suffix.as_str(),
        "bootloaderversion" | "fwbuildversion" | "hwpartnumber" | "status/last_update"
    ) {
        return (base.max(0.0), base);
    }
    let mut low = (base * 0.5).min(base * 1.5);
    let mut high = (base * 0.5).max(base * 1.5);
    if base.abs() < 1.0 {
        low = -1.0;
        high = 1.0;
    }
    (low, high)
}

fn bounded_sin(
    min_value: f64,
    max_value: f64,
    phase: f64,
    periods_per_day: u32,
    day_fraction: f64,
) -> f64 {
    let mid = (min_value + max_value) * 0.5;
    let amp = (max_value - min_value) * 0.5;
    let value = mid + amp * ((2.0 * PI * periods_per_day as f64 * day_fraction) + phase).sin();
    value.clamp(min_value, max_value)
}

fn quantize_numeric(value: f64, decimal_places: u32) -> f64 {
    if decimal_places == 0 {
        return value.round();
    }
    round_to(value, decimal_places)
}

fn day_start_ms(day: NaiveDate) -> i64 {
    let midnight = day.and_hms_opt(0, 0, 0).expect("midnight is always valid");
    Utc.from_utc_datetime(&midnight).timestamp_millis()
}

/// Generate `days` daily log files ending today (UTC) and return their
/// paths. The series list comes from `series_file` (`name=value` lines) or
/// the embedded defaults.
pub fn generate_demo_data(
    days: u32,
    output_dir: &Path,
    series_file: Option<&Path>,
) -> TsdbResult<Vec<PathBuf>> {
    if days == 0 {
        return Err(TsdbError::BadRequest("days must be > 0, got 0".into()));
    }
    let series = match series_file {
        Some(path) => load_demo_series(path)?,
        None => parse_demo_series_lines(EMBEDDED_DEMO_SERIES.lines()),
    };
    if series.is_empty() {
        return Err(TsdbError::BadRequest(match series_file {
            Some(path) => format!("No series found in {}", path.display()),
            None => "No embedded demo series configured".to_string(),
        }));
    }
    std::fs::create_dir_all(output_dir)?;

    let yieldday_series: BTreeSet<String> = series
        .iter()
        .filter(|s| {
            matches!(s.value, DemoValue::Numeric { .. }) && metric_suffix(&s.name) == "yieldday"
        })
        .map(|s| s.name.clone())
        .collect();
    let yieldtotal_series: BTreeSet<String> = series
        .iter()
        .filter(|s| {
            matches!(s.value, DemoValue::Numeric { .. }) && metric_suffix(&s.name) == "yieldtotal"
        })
        .map(|s| s.name.clone())
        .collect();
    let series_decimals: HashMap<String, u32> = series
        .iter()
        .filter_map(|s| match s.value {
            DemoValue::Numeric { decimals, .. } => Some((s.name.clone(), decimals)),
            DemoValue::Text(_) => None,
        })
        .collect();
    let base_numeric: HashMap<String, f64> = series
        .iter()
        .filter_map(|s| match s.value {
            DemoValue::Numeric { base, .. } => Some((s.name.clone(), base)),
            DemoValue::Text(_) => None,
        })
        .collect();

    let mut cumulative_yieldtotal: HashMap<String, f64> = yieldtotal_series
        .iter()
        .map(|name| (name.clone(), base_numeric.get(name).copied().unwrap_or(0.0).max(0.0)))
        .collect();

    let today = Utc::now().date_naive();
    let start_day = today - Duration::days(days as i64 - 1);

    let mut produced = Vec::new();
    for day_index in 0..days {
        let day = start_day + Duration::days(day_index as i64);
        let start_ms = day_start_ms(day).max(0) as u64;
        let path = output_dir.join(format!("data_{}.tsdb", day.format("%Y-%m-%d")));
        produced.push(path.clone());

        let mut daily_yields: HashMap<String, f64> =
            yieldday_series.iter().map(|n| (n.clone(), 0.0)).collect();
        let mut writer = TsdbWriter::create(&path)?;

        for step_idx in 0..STEPS_PER_DAY {
            let ts = start_ms + step_idx as u64 * STEP_MS;
            let day_fraction = step_idx as f64 / STEPS_PER_DAY as f64;

            let mut numeric_cache: HashMap<&str, f64> = HashMap::new();
            for (idx, entry) in series.iter().enumerate() {
                let (base, decimals) = match &entry.value {
                    DemoValue::Text(text) => {
                        writer.add_string(&entry.name, text, Some(ts))?;
                        continue;
                    }
                    DemoValue::Numeric { base, decimals } => (*base, *decimals),
                };

                let suffix = metric_suffix(&entry.name);
                if suffix == "yieldday" || suffix == "yieldtotal" {
                    continue;
                }

                let periods = (idx % 24) as u32 + 1;
                let phase = idx as f64 * 0.73 + day_index as f64 * 0.11;
                let (min_v, max_v) = range_for_series(&entry.name, base);
                let value = if matches!(suffix.as_str(), "producing" | "reachable" | "is_valid") {
                    let raw = bounded_sin(min_v, max_v, phase, periods, day_fraction);
                    if raw >= 0.5 {
                        1.0
                    } else {
                        0.0
                    }
                } else if suffix == "uptime" {
                    base + step_idx as f64 * STEP_HOURS * 3600.0
                } else {
                    bounded_sin(min_v, max_v, phase, periods, day_fraction)
                };
                let value = quantize_numeric(value, decimals);
                numeric_cache.insert(entry.name.as_str(), value);
                writer.add(&entry.name, value, Some(ts))?;
            }

            for name in &yieldday_series {
                let power_series = name.replace("/yieldday", "/power");
                let power_w = numeric_cache
                    .get(power_series.as_str())
                    .copied()
                    .unwrap_or(0.0)
                    .max(0.0);
                let decimals = series_decimals.get(name).copied().unwrap_or(3);
                let accumulated = daily_yields.get(name).copied().unwrap_or(0.0);
                writer.add(name, quantize_numeric(accumulated, decimals), Some(ts))?;
                daily_yields.insert(name.clone(), accumulated + power_w * STEP_HOURS / 1000.0);
            }

            for name in &yieldtotal_series {
                let power_series = name.replace("/yieldtotal", "/power");
                let power_w = numeric_cache
                    .get(power_series.as_str())
                    .copied()
                    .unwrap_or(0.0)
                    .max(0.0);
                let decimals = series_decimals.get(name).copied().unwrap_or(3);
                let total = cumulative_yieldtotal.get(name).copied().unwrap_or(0.0);
                writer.add(name, quantize_numeric(total, decimals), Some(ts))?;
                cumulative_yieldtotal.insert(name.clone(), total + power_w * STEP_HOURS / 1000.0);
            }
        }

        writer.close(true)?;
    }

    Ok(produced)
}
