//! Text exposition format rendering.

use std::fmt::Write as _;

use super::{LabelSet, RegistrySnapshot};

/// Content type of the rendered text.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Render a snapshot as `# HELP` / `# TYPE` headers followed by one line per series.
#[must_use]
pub fn render(snapshot: &RegistrySnapshot) -> String {
    let mut out = String::new();
    for family in &snapshot.families {
        let name = &family.descriptor.name;
        if !family.descriptor.help.is_empty() {
            let _ = writeln!(out, "# HELP {name} {}", escape_help(&family.descriptor.help));
        }
        let _ = writeln!(out, "# TYPE {name} gauge");
        for (labels, value) in family.series.iter() {
            let _ = writeln!(out, "{name}{} {}", format_labels(labels), format_value(*value));
        }
    }
    out
}

fn format_labels(labels: &LabelSet) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let pairs: Vec<String> = labels
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label_value(v)))
        .collect();
    format!("{{{}}}", pairs.join(","))
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value.is_infinite() {
        if value.is_sign_positive() { "+Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
