//! Extraction of structured diagnostics from tool log output.
//!
//! Tool logs are unstructured text; this module scans them line by line for
//! severity-prefixed messages (`ERROR:`, `CRITICAL WARNING:`, `WARNING:`,
//! `INFO:`), splits out the bracketed message code and trailing source
//! location when present, and classifies the first error into a failure kind.

use std::collections::HashSet;

use chrono::Utc;

use crate::job::FailureKind;

pub use crate::job::diagnostics::{Diagnostic, DiagnosticsReport, Severity};

/// Build a report from log files, scanned in the given order. Duplicate
/// entries (same severity, code, message and location) collapse to one.
pub fn build_report(logs: &[(String, Vec<u8>)]) -> DiagnosticsReport {
    let mut report = DiagnosticsReport {
        schema: 1,
        generated_at: Utc::now(),
        error_count: 0,
        warning_count: 0,
        info_count: 0,
        diagnostics: Vec::new(),
    };
    let mut seen: HashSet<String> = HashSet::new();

    for (source, raw) in logs {
        let text = String::from_utf8_lossy(raw);
        for line in text.split('\n') {
            let line = line.trim_end_matches('\r');
            let Some(diag) = parse_line(line, source) else {
                continue;
            };
            if !seen.insert(dedup_key(&diag)) {
                continue;
            }
            match diag.severity {
                Severity::Error => report.error_count += 1,
                Severity::Warning => report.warning_count += 1,
                Severity::Info => report.info_count += 1,
            }
            report.diagnostics.push(diag);
        }
    }
    report
}

/// Classify a failed run: the first ERROR diagnostic decides the kind and
/// the summary; with no errors in the logs the failure is `internal` and
/// the summary falls back to the run message or error text.
pub fn infer_failure(
    report: &DiagnosticsReport,
    fallback_message: &str,
    run_error: Option<&str>,
) -> (FailureKind, String) {
    if let Some(diag) = report
        .diagnostics
        .iter()
        .find(|d| d.severity == Severity::Error)
    {
        return (classify(diag), format_summary(diag));
    }
    let mut msg = fallback_message.trim().to_string();
    if msg.is_empty() {
        if let Some(err) = run_error {
            msg = err.trim().to_string();
        }
    }
    if msg.is_empty() {
        msg = "job failed".to_string();
    }
    (FailureKind::Internal, msg)
}

fn classify(diag: &Diagnostic) -> FailureKind {
    let lower = format!(
        "{} {} {} {}",
        diag.message, diag.code, diag.tool, diag.file
    )
    .to_lowercase();
    let tool = diag.tool.trim().to_lowercase();

    if lower.contains("syntax") {
        FailureKind::Syntax
    } else if lower.contains("constraint")
        || lower.contains(".xdc")
        || lower.contains("nstd")
        || lower.contains("ucio")
        || tool.starts_with("drc")
    {
        FailureKind::Constraints
    } else if lower.contains("timing") {
        FailureKind::Timing
    } else if tool.starts_with("synth")
        || lower.contains("synthesis failed")
        || (lower.contains("module '") && lower.contains("not found"))
    {
        FailureKind::Synthesis
    } else if tool.starts_with("place")
        || tool.starts_with("route")
        || tool.starts_with("impl")
        || lower.contains("bitstream")
    {
        FailureKind::Implementation
    } else {
        FailureKind::Internal
    }
}

/// `[code] message (file:line)`, omitting parts that are absent.
fn format_summary(diag: &Diagnostic) -> String {
    let mut code = diag.code.trim();
    if code.is_empty() {
        code = diag.tool.trim();
    }
    let mut out = String::new();
    if !code.is_empty() {
        out.push('[');
        out.push_str(code);
        out.push_str("] ");
    }
    out.push_str(&diag.message);
    if !diag.file.is_empty() && diag.line > 0 {
        out.push_str(&format!(" ({}:{})", diag.file, diag.line));
    } else if !diag.file.is_empty() {
        out.push_str(&format!(" ({})", diag.file));
    }
    out
}

fn parse_line(raw_line: &str, source: &str) -> Option<Diagnostic> {
    let line = raw_line.trim();
    if line.is_empty() {
        return None;
    }

    // Prefix priority matters: CRITICAL WARNING must win over WARNING.
    let (severity, rest) = if let Some(rest) = line.strip_prefix("ERROR:") {
        (Severity::Error, rest)
    } else if let Some(rest) = line.strip_prefix("CRITICAL WARNING:") {
        (Severity::Warning, rest)
    } else if let Some(rest) = line.strip_prefix("WARNING:") {
        (Severity::Warning, rest)
    } else if let Some(rest) = line.strip_prefix("INFO:") {
        (Severity::Info, rest)
    } else {
        return None;
    };
    let mut rest = rest.trim();

    let mut diag = Diagnostic {
        severity,
        tool: String::new(),
        code: String::new(),
        message: String::new(),
        file: String::new(),
        line: 0,
        column: 0,
        source: source.to_string(),
        raw: line.to_string(),
    };

    if rest.starts_with('[') {
        if let Some(end) = rest.find(']') {
            if end > 1 {
                let full_code = rest[1..end].trim();
                diag.code = full_code.to_string();
                if let Some(tool) = full_code.split_whitespace().next() {
                    diag.tool = tool.to_string();
                }
                rest = rest[end + 1..].trim();
            }
        }
    }

    let (message, file, line_no, column) = split_trailing_location(rest);
    diag.message = message;
    diag.file = file;
    diag.line = line_no;
    diag.column = column;

    if diag.message.is_empty() {
        diag.message = rest.to_string();
    }
    Some(diag)
}

/// Strip a trailing ` [path:line:col]` or ` [path:line]` bracket off a
/// message. Windows drive colons survive because the split works backwards
/// from the last numeric suffixes.
fn split_trailing_location(msg: &str) -> (String, String, u32, u32) {
    let msg = msg.trim();
    if !msg.ends_with(']') {
        return (msg.to_string(), String::new(), 0, 0);
    }
    let Some(start) = msg.rfind(" [") else {
        return (msg.to_string(), String::new(), 0, 0);
    };
    let location = msg[start + 2..msg.len() - 1].trim();
    if location.is_empty() {
        return (msg.to_string(), String::new(), 0, 0);
    }
    let (path, line, column) = parse_location(location);
    if path.is_empty() {
        return (msg.to_string(), String::new(), 0, 0);
    }
    (msg[..start].trim().to_string(), path, line, column)
}

fn parse_location(location: &str) -> (String, u32, u32) {
    let parts: Vec<&str> = location.split(':').collect();
    if parts.len() < 2 {
        return (location.to_string(), 0, 0);
    }

    let last = parts[parts.len() - 1].trim();
    if let Some(n) = parse_number(last) {
        if parts.len() >= 3 {
            let prev = parts[parts.len() - 2].trim();
            if let Some(line) = parse_number(prev) {
                let path = parts[..parts.len() - 2].join(":");
                return (path, line, n);
            }
        }
        let path = parts[..parts.len() - 1].join(":");
        return (path, n, 0);
    }
    (location.to_string(), 0, 0)
}

fn parse_number(v: &str) -> Option<u32> {
    if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    v.parse().ok()
}

fn dedup_key(diag: &Diagnostic) -> String {
    format!(
        "{:?}|{}|{}|{}|{}|{}",
        diag.severity, diag.code, diag.message, diag.file, diag.line, diag.column
    )
}
