//! Aggregator library.
//!
//! A fixed set of stateless reducers over an ordered point sequence. The
//! aggregation key is parsed once at the facade boundary into the tagged
//! [`Aggregation`] enum; the hot path dispatches on the enum, never on
//! strings. Every reducer returns [`AggregateOutput::Undefined`] on empty
//! input except `raw`, which returns an empty point list.

use std::collections::HashMap;
use std::str::FromStr;

use chronolithdb_core::error::StoreError;
use chronolithdb_core::types::Point;

/// A parsed aggregation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Raw,
    Sum,
    Average,
    Min,
    Max,
    Count,
    Median,
    Mode,
    StdDev,
    Variance,
    First,
    Last,
    Range,
    Iqr,
    RateOfChange,
    Trend,
    /// `percentile_N` with `0 ≤ N ≤ 100`.
    Percentile(u8),
}

impl Aggregation {
    /// Canonical key, also used as the cache fingerprint component.
    pub fn cache_key(&self) -> String {
        match self {
            Aggregation::Raw => "raw".into(),
            Aggregation::Sum => "sum".into(),
            Aggregation::Average => "average".into(),
            Aggregation::Min => "min".into(),
            Aggregation::Max => "max".into(),
            Aggregation::Count => "count".into(),
            Aggregation::Median => "median".into(),
            Aggregation::Mode => "mode".into(),
            Aggregation::StdDev => "stddev".into(),
            Aggregation::Variance => "variance".into(),
            Aggregation::First => "first".into(),
            Aggregation::Last => "last".into(),
            Aggregation::Range => "range".into(),
            Aggregation::Iqr => "iqr".into(),
            Aggregation::RateOfChange => "rate_of_change".into(),
            Aggregation::Trend => "trend".into(),
            Aggregation::Percentile(n) => format!("percentile_{n}"),
        }
    }
}

impl FromStr for Aggregation {
    type Err = StoreError;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        let unsupported = || StoreError::UnsupportedAggregation { key: key.into() };
        if let Some(suffix) = key.strip_prefix("percentile_") {
            let n: u8 = suffix.parse().map_err(|_| unsupported())?;
            if n > 100 {
                return Err(unsupported());
            }
            return Ok(Aggregation::Percentile(n));
        }
        match key {
            "raw" => Ok(Aggregation::Raw),
            "sum" => Ok(Aggregation::Sum),
            "average" => Ok(Aggregation::Average),
            "min" => Ok(Aggregation::Min),
            "max" => Ok(Aggregation::Max),
            "count" => Ok(Aggregation::Count),
            "median" => Ok(Aggregation::Median),
            "mode" => Ok(Aggregation::Mode),
            "stddev" => Ok(Aggregation::StdDev),
            "variance" => Ok(Aggregation::Variance),
            "first" => Ok(Aggregation::First),
            "last" => Ok(Aggregation::Last),
            "range" => Ok(Aggregation::Range),
            "iqr" => Ok(Aggregation::Iqr),
            "rate_of_change" => Ok(Aggregation::RateOfChange),
            "trend" => Ok(Aggregation::Trend),
            _ => Err(unsupported()),
        }
    }
}

/// Result of a reduction: a scalar, a short list, a symbolic label, the raw
/// points, or the `undefined` sentinel for empty input.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutput {
    Undefined,
    Number(f64),
    Numbers(Vec<f64>),
    Label(&'static str),
    Points(Vec<Point>),
}

impl AggregateOutput {
    pub fn is_undefined(&self) -> bool {
        matches!(self, AggregateOutput::Undefined)
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AggregateOutput::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// JSON projection for callers that serialize results outward. Points
    /// are rendered under their long-name alias view.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AggregateOutput::Undefined => serde_json::Value::Null,
            AggregateOutput::Number(n) => serde_json::json!(n),
            AggregateOutput::Numbers(ns) => serde_json::json!(ns),
            AggregateOutput::Label(label) => serde_json::json!(label),
            AggregateOutput::Points(points) => {
                serde_json::Value::Array(points.iter().map(Point::aliased_json).collect())
            }
        }
    }
}

/// Dispatch one aggregation over a point sequence.
pub fn apply(aggregation: Aggregation, points: &[Point]) -> AggregateOutput {
    if points.is_empty() {
        return match aggregation {
            Aggregation::Raw => AggregateOutput::Points(Vec::new()),
            _ => AggregateOutput::Undefined,
        };
    }
    let values = || points.iter().map(Point::value);
    match aggregation {
        Aggregation::Raw => AggregateOutput::Points(points.to_vec()),
        Aggregation::Sum => AggregateOutput::Number(values().sum()),
        Aggregation::Average => {
            AggregateOutput::Number(values().sum::<f64>() / points.len() as f64)
        }
        Aggregation::Min => AggregateOutput::Number(values().fold(f64::INFINITY, f64::min)),
        Aggregation::Max => AggregateOutput::Number(values().fold(f64::NEG_INFINITY, f64::max)),
        Aggregation::Count => AggregateOutput::Number(points.len() as f64),
        Aggregation::Median => AggregateOutput::Number(median(&sorted_values(points))),
        Aggregation::Mode => mode(points),
        Aggregation::StdDev => match sample_variance(points) {
            Some(v) => AggregateOutput::Number(v.sqrt()),
            None => AggregateOutput::Undefined,
        },
        Aggregation::Variance => match sample_variance(points) {
            Some(v) => AggregateOutput::Number(v),
            None => AggregateOutput::Undefined,
        },
        Aggregation::First => AggregateOutput::Number(points[0].value()),
        Aggregation::Last => AggregateOutput::Number(points[points.len() - 1].value()),
        Aggregation::Range => {
            let min = values().fold(f64::INFINITY, f64::min);
            let max = values().fold(f64::NEG_INFINITY, f64::max);
            AggregateOutput::Number(max - min)
        }
        Aggregation::Iqr => iqr(&sorted_values(points)),
        Aggregation::RateOfChange => rate_of_change(points),
        Aggregation::Trend => trend(points),
        Aggregation::Percentile(n) => AggregateOutput::Number(percentile(
            &sorted_values(points),
            n,
        )),
    }
}

fn sorted_values(points: &[Point]) -> Vec<f64> {
    let mut values: Vec<f64> = points.iter().map(Point::value).collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

fn median(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Value(s) with the highest frequency; a singleton is returned unwrapped,
/// ties are returned ascending.
fn mode(points: &[Point]) -> AggregateOutput {
    let mut frequency: HashMap<u64, (f64, usize)> = HashMap::new();
    for point in points {
        let entry = frequency.entry(point.value().to_bits()).or_insert((point.value(), 0));
        entry.1 += 1;
    }
    let best = frequency.values().map(|&(_, count)| count).max().unwrap_or(0);
    let mut modes: Vec<f64> = frequency
        .values()
        .filter(|&&(_, count)| count == best)
        .map(|&(value, _)| value)
        .collect();
    modes.sort_by(|a, b| a.total_cmp(b));
    if modes.len() == 1 {
        AggregateOutput::Number(modes[0])
    } else {
        AggregateOutput::Numbers(modes)
    }
}

/// Sample variance with the n−1 denominator; `None` for n < 2.
fn sample_variance(points: &[Point]) -> Option<f64> {
    let n = points.len();
    if n < 2 {
        return None;
    }
    let mean = points.iter().map(Point::value).sum::<f64>() / n as f64;
    let squared: f64 = points
        .iter()
        .map(|p| {
            let d = p.value() - mean;
            d * d
        })
        .sum();
    Some(squared / (n - 1) as f64)
}

/// Third quartile minus first quartile with simple positional picks: Q1 at
/// `floor(n/4)`, Q3 at `floor(3n/4)`, averaged with its predecessor when
/// `n` is even.
fn iqr(sorted: &[f64]) -> AggregateOutput {
    let n = sorted.len();
    let q1 = sorted[n / 4];
    let q3_idx = 3 * n / 4;
    let q3 = if n % 2 == 0 && q3_idx > 0 {
        (sorted[q3_idx] + sorted[q3_idx - 1]) / 2.0
    } else {
        sorted[q3_idx.min(n - 1)]
    };
    AggregateOutput::Number(q3 - q1)
}

/// Successive relative changes `(v_i − v_{i−1}) / v_{i−1}`.
fn rate_of_change(points: &[Point]) -> AggregateOutput {
    if points.len() < 2 {
        return AggregateOutput::Undefined;
    }
    let changes = points
        .windows(2)
        .map(|w| (w[1].value() - w[0].value()) / w[0].value())
        .collect();
    AggregateOutput::Numbers(changes)
}

fn trend(points: &[Point]) -> AggregateOutput {
    if points.len() <= 1 {
        return AggregateOutput::Label("steady");
    }
    let first = points[0].value();
    let last = points[points.len() - 1].value();
    if last > first {
        AggregateOutput::Label("up")
    } else if last < first {
        AggregateOutput::Label("down")
    } else {
        AggregateOutput::Label("steady")
    }
}

/// Linear interpolation on the sorted values with the one-based rank
/// `N/100 · (n−1) + 1`.
fn percentile(sorted: &[f64], n: u8) -> f64 {
    let count = sorted.len();
    let rank = (n as f64 / 100.0) * (count as f64 - 1.0) + 1.0;
    let lower = rank.floor() as usize; // one-based
    let fraction = rank - rank.floor();
    if lower >= count {
        return sorted[count - 1];
    }
    sorted[lower - 1] + fraction * (sorted[lower] - sorted[lower - 1])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64]) -> Vec<Point> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| Point::new("m", v, i as i64 * 1000))
            .collect()
    }

    #[test]
    fn parses_every_named_key() {
        for key in [
            "raw", "sum", "average", "min", "max", "count", "median", "mode", "stddev",
            "variance", "first", "last", "range", "iqr", "rate_of_change", "trend",
        ] {
            let agg: Aggregation = key.parse().unwrap();
            assert_eq!(agg.cache_key(), key);
        }
        assert_eq!(
            "percentile_95".parse::<Aggregation>().unwrap(),
            Aggregation::Percentile(95)
        );
    }

    #[test]
    fn rejects_unknown_keys() {
        for key in ["mean", "percentile_101", "percentile_", "percentile_x", ""] {
            assert!(matches!(
                key.parse::<Aggregation>(),
                Err(StoreError::UnsupportedAggregation { .. })
            ));
        }
    }

    #[test]
    fn empty_input_is_undefined_except_raw() {
        assert_eq!(apply(Aggregation::Raw, &[]), AggregateOutput::Points(vec![]));
        for agg in [
            Aggregation::Sum,
            Aggregation::Average,
            Aggregation::Min,
            Aggregation::Median,
            Aggregation::Trend,
            Aggregation::Percentile(50),
        ] {
            assert!(apply(agg, &[]).is_undefined());
        }
    }

    #[test]
    fn basic_scalars() {
        let points = series(&[40.0, 20.0, 60.0]);
        assert_eq!(apply(Aggregation::Sum, &points).as_number(), Some(120.0));
        assert_eq!(apply(Aggregation::Average, &points).as_number(), Some(40.0));
        assert_eq!(apply(Aggregation::Min, &points).as_number(), Some(20.0));
        assert_eq!(apply(Aggregation::Max, &points).as_number(), Some(60.0));
        assert_eq!(apply(Aggregation::Count, &points).as_number(), Some(3.0));
        assert_eq!(apply(Aggregation::First, &points).as_number(), Some(40.0));
        assert_eq!(apply(Aggregation::Last, &points).as_number(), Some(60.0));
        assert_eq!(apply(Aggregation::Range, &points).as_number(), Some(40.0));
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(
            apply(Aggregation::Median, &series(&[3.0, 1.0, 2.0])).as_number(),
            Some(2.0)
        );
        assert_eq!(
            apply(Aggregation::Median, &series(&[4.0, 1.0, 3.0, 2.0])).as_number(),
            Some(2.5)
        );
    }

    #[test]
    fn mode_unwraps_singletons_and_lists_ties() {
        assert_eq!(
            apply(Aggregation::Mode, &series(&[1.0, 2.0, 2.0, 3.0])).as_number(),
            Some(2.0)
        );
        assert_eq!(
            apply(Aggregation::Mode, &series(&[5.0, 1.0, 5.0, 1.0, 3.0])),
            AggregateOutput::Numbers(vec![1.0, 5.0])
        );
    }

    #[test]
    fn stddev_and_variance_use_sample_denominator() {
        let points = series(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        // Population variance is 4; the sample denominator gives 32/7.
        let variance = apply(Aggregation::Variance, &points).as_number().unwrap();
        assert!((variance - 32.0 / 7.0).abs() < 1e-12);
        let stddev = apply(Aggregation::StdDev, &points).as_number().unwrap();
        assert!((stddev - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);

        assert!(apply(Aggregation::Variance, &series(&[1.0])).is_undefined());
        assert!(apply(Aggregation::StdDev, &series(&[1.0])).is_undefined());
    }

    #[test]
    fn iqr_positional_picks() {
        // n = 8 (even): Q1 = sorted[2], Q3 = avg(sorted[6], sorted[5]).
        let points = series(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert_eq!(apply(Aggregation::Iqr, &points).as_number(), Some(3.5));
        // n = 5 (odd): Q1 = sorted[1], Q3 = sorted[3].
        let points = series(&[10.0, 20.0, 30.0, 40.0, 50.0]);
        assert_eq!(apply(Aggregation::Iqr, &points).as_number(), Some(20.0));
    }

    #[test]
    fn rate_of_change_is_relative() {
        let points = series(&[100.0, 110.0, 99.0]);
        let AggregateOutput::Numbers(changes) = apply(Aggregation::RateOfChange, &points)
        else {
            panic!("expected numbers");
        };
        assert!((changes[0] - 0.1).abs() < 1e-12);
        assert!((changes[1] + 0.1).abs() < 1e-12);
        assert!(apply(Aggregation::RateOfChange, &series(&[1.0])).is_undefined());
    }

    #[test]
    fn trend_compares_last_to_first() {
        assert_eq!(
            apply(Aggregation::Trend, &series(&[1.0, 5.0])),
            AggregateOutput::Label("up")
        );
        assert_eq!(
            apply(Aggregation::Trend, &series(&[5.0, 1.0])),
            AggregateOutput::Label("down")
        );
        assert_eq!(
            apply(Aggregation::Trend, &series(&[5.0, 9.0, 5.0])),
            AggregateOutput::Label("steady")
        );
        assert_eq!(
            apply(Aggregation::Trend, &series(&[5.0])),
            AggregateOutput::Label("steady")
        );
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let points = series(&[15.0, 20.0, 35.0, 40.0, 50.0]);
        assert_eq!(apply(Aggregation::Percentile(0), &points).as_number(), Some(15.0));
        assert_eq!(apply(Aggregation::Percentile(100), &points).as_number(), Some(50.0));
        // rank = 0.4 * 4 + 1 = 2.6 → 20 + 0.6 * (35 − 20) = 29.
        assert_eq!(apply(Aggregation::Percentile(40), &points).as_number(), Some(29.0));
        // Single point: every percentile is that point.
        assert_eq!(
            apply(Aggregation::Percentile(75), &series(&[7.0])).as_number(),
            Some(7.0)
        );
    }

    #[test]
    fn raw_returns_points_in_given_order() {
        let points = series(&[3.0, 1.0, 2.0]);
        assert_eq!(
            apply(Aggregation::Raw, &points),
            AggregateOutput::Points(points.clone())
        );
    }

    #[test]
    fn output_json_projection() {
        assert_eq!(AggregateOutput::Undefined.to_json(), serde_json::Value::Null);
        assert_eq!(AggregateOutput::Number(1.5).to_json(), serde_json::json!(1.5));
        assert_eq!(AggregateOutput::Label("up").to_json(), serde_json::json!("up"));
        let points = AggregateOutput::Points(vec![Point::new("t", 1.0, 2)]);
        assert_eq!(
            points.to_json(),
            serde_json::json!([{"measurement": "t", "value": 1.0, "timestamp": 2}])
        );
    }
}
