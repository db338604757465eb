//! Prometheus text exposition (format 0.0.4).
//!
//! Callers group samples by metric name before calling [`format_gauge`] / [`format_counter`],
//! so each family gets exactly one `# HELP` / `# TYPE` pair.

use std::collections::BTreeMap;
use std::fmt::Write as _;

/// Label pairs in emission order.
pub type Labels = Vec<(String, String)>;

/// Build a label list from string pairs.
pub fn labels<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Labels {
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
    Counter,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Labels,
    pub value: f64,
}

impl Sample {
    pub fn new(labels: Labels, value: f64) -> Self {
        Self { labels, value }
    }
}

/// Escape a label value: backslash first, then quote, then newline.
pub fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

pub fn format_labels(labels: &[(String, String)]) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let body: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
        .collect();
    format!("{{{}}}", body.join(","))
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "+Inf".to_string() } else { "-Inf".to_string() }
    } else {
        value.to_string()
    }
}

pub fn format_sample(name: &str, value: f64, labels: &[(String, String)]) -> String {
    format!("{}{} {}", name, format_labels(labels), format_value(value))
}

fn format_family(name: &str, help: &str, kind: MetricType, samples: &[Sample]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# HELP {} {}", name, help.replace('\\', "\\\\").replace('\n', "\\n"));
    let _ = write!(out, "# TYPE {} {}", name, kind.as_str());
    for sample in samples {
        out.push('\n');
        out.push_str(&format_sample(name, sample.value, &sample.labels));
    }
    out
}

pub fn format_gauge(name: &str, help: &str, samples: &[Sample]) -> String {
    format_family(name, help, MetricType::Gauge, samples)
}

pub fn format_counter(name: &str, help: &str, samples: &[Sample]) -> String {
    format_family(name, help, MetricType::Counter, samples)
}

/// Info-style gauge: value 1 carrying identity labels.
pub fn format_info(name: &str, help: &str, labels: Labels) -> String {
    format_gauge(name, help, &[Sample::new(labels, 1.0)])
}

/// Parse a device-reported number, tolerating a trailing unit such as `dBm` or `%`.
///
/// Returns NaN for anything that does not parse.
pub fn safe_float64(value: &str) -> f64 {
    let trimmed = value.trim();
    let numeric = trimmed
        .trim_end_matches(|c: char| c.is_ascii_alphabetic() || c == '%')
        .trim_end();
    if numeric.is_empty() {
        return f64::NAN;
    }
    numeric.parse::<f64>().unwrap_or(f64::NAN)
}

pub fn safe_bool(value: &str) -> f64 {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "enable" | "on" | "yes" => 1.0,
        "false" | "0" | "disable" | "off" | "no" => 0.0,
        _ => f64::NAN,
    }
}

/// Metric families keyed by name, rendered in name order.
///
/// Collectors push samples as they walk device state; rendering groups them so headers are
/// never repeated.
#[derive(Debug, Default)]
pub struct FamilySet {
    families: BTreeMap<String, Family>,
}

#[derive(Debug)]
struct Family {
    help: String,
    kind: MetricType,
    samples: Vec<Sample>,
}

impl FamilySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gauge(&mut self, name: &str, help: &str, labels: Labels, value: f64) {
        self.push(name, help, MetricType::Gauge, labels, value);
    }

    pub fn counter(&mut self, name: &str, help: &str, labels: Labels, value: f64) {
        self.push(name, help, MetricType::Counter, labels, value);
    }

    fn push(&mut self, name: &str, help: &str, kind: MetricType, labels: Labels, value: f64) {
        self.families
            .entry(name.to_string())
            .or_insert_with(|| Family {
                help: help.to_string(),
                kind,
                samples: Vec::new(),
            })
            .samples
            .push(Sample::new(labels, value));
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn render(&self) -> String {
        self.families
            .iter()
            .map(|(name, family)| format_family(name, &family.help, family.kind, &family.samples))
            .collect::<Vec<_>>()
            .join("\n")
    }
}
