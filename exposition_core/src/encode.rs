//! Renders registry snapshots into the plaintext exposition format
//! consumed by pull-based scrapers.

use std::fmt::Write;

use crate::error::MetricsError;
use crate::registry::{MetricSnapshot, SampleRow};
use crate::SampleValue;

/// The content type advertised alongside bodies in this format.
pub const TEXT_FORMAT: &str = "text/plain; version=0.0.4";

/// Render a snapshot in the text exposition format.
///
/// Encoding is pure and deterministic: the same snapshot always yields
/// byte-identical output, so unchanged values between scrapes produce
/// unchanged bodies.
pub fn render(snapshot: &[MetricSnapshot]) -> Result<String, MetricsError> {
    let mut out = String::new();
    for metric in snapshot {
        write_metric(&mut out, metric).map_err(|_| MetricsError::Encoding)?;
    }
    Ok(out)
}

fn write_metric(out: &mut String, metric: &MetricSnapshot) -> std::fmt::Result {
    let name = metric.descriptor.name();
    if !metric.descriptor.help().is_empty() {
        write!(out, "# HELP {} ", name)?;
        push_escaped(out, metric.descriptor.help(), false);
        out.push('\n');
    }
    writeln!(out, "# TYPE {} {}", name, metric.descriptor.kind().as_str())?;
    for sample in &metric.samples {
        write_sample(out, name, sample)?;
    }
    Ok(())
}

/// One line: `name{label1="v1",label2="v2"} value` (no braces without labels)
fn write_sample(out: &mut String, name: &str, sample: &SampleRow) -> std::fmt::Result {
    out.push_str(name);
    if !sample.labels.is_empty() {
        out.push('{');
        for (index, (label, value)) in sample.labels.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            write!(out, "{}=\"", label)?;
            push_escaped(out, value, true);
            out.push('"');
        }
        out.push('}');
    }
    out.push(' ');
    write_value(out, sample.value)?;
    out.push('\n');
    Ok(())
}

/// Escape `\` and newline; label values additionally escape `"`
fn push_escaped(out: &mut String, text: &str, quoted: bool) {
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '"' if quoted => out.push_str("\\\""),
            ch => out.push(ch),
        }
    }
}

/// Integers print without a decimal point; floats use the shortest decimal
/// representation that round-trips; non-finite values use the format's
/// `+Inf`/`-Inf`/`NaN` spellings.
fn write_value(out: &mut String, value: SampleValue) -> std::fmt::Result {
    match value {
        SampleValue::I64(val) => write!(out, "{}", val),
        SampleValue::F64(val) if val.is_nan() => write!(out, "NaN"),
        SampleValue::F64(val) if val == f64::INFINITY => write!(out, "+Inf"),
        SampleValue::F64(val) if val == f64::NEG_INFINITY => write!(out, "-Inf"),
        SampleValue::F64(val) => write!(out, "{}", val),
    }
}
