use jobforge::diagnostics::{build_report, infer_failure, Severity};
use jobforge::job::FailureKind;

fn report_from(console: &str) -> jobforge::diagnostics::DiagnosticsReport {
    build_report(&[("console.log".to_string(), console.as_bytes().to_vec())])
}

#[test]
fn test_severity_prefixes() {
    let report = report_from(
        "ERROR: something broke\n\
         CRITICAL WARNING: close call\n\
         WARNING: heads up\n\
         INFO: all fine\n\
         plain line with no prefix\n",
    );

    assert_eq!(report.error_count, 1);
    assert_eq!(report.warning_count, 2);
    assert_eq!(report.info_count, 1);
    assert_eq!(report.diagnostics.len(), 4);
    assert_eq!(report.diagnostics[0].severity, Severity::Error);
    assert_eq!(report.diagnostics[0].message, "something broke");
}

#[test]
fn test_code_and_tool_split() {
    let report = report_from("ERROR: [Synth 8-2716] syntax error near 'fake' [hdl/spade.sv:1]\n");
    let diag = &report.diagnostics[0];

    assert_eq!(diag.code, "Synth 8-2716");
    assert_eq!(diag.tool, "Synth");
    assert_eq!(diag.message, "syntax error near 'fake'");
    assert_eq!(diag.file, "hdl/spade.sv");
    assert_eq!(diag.line, 1);
    assert_eq!(diag.column, 0);
    assert_eq!(diag.source, "console.log");
}

#[test]
fn test_trailing_location_with_column() {
    let report = report_from("ERROR: [Synth 8-100] wire undeclared [src/alu.v:42:17]\n");
    let diag = &report.diagnostics[0];

    assert_eq!(diag.file, "src/alu.v");
    assert_eq!(diag.line, 42);
    assert_eq!(diag.column, 17);
}

#[test]
fn test_windows_drive_path_survives() {
    let report = report_from("ERROR: [Synth 8-100] wire undeclared [C:/proj/top.v:7]\n");
    let diag = &report.diagnostics[0];

    assert_eq!(diag.file, "C:/proj/top.v");
    assert_eq!(diag.line, 7);
}

#[test]
fn test_duplicate_lines_collapse() {
    let line = "ERROR: [Synth 8-2716] syntax error near 'fake' [hdl/spade.sv:1]\n";
    let report = report_from(&format!("{line}{line}{line}"));
    assert_eq!(report.error_count, 1);
    assert_eq!(report.diagnostics.len(), 1);
}

#[test]
fn test_secondary_log_scanned_and_deduped_across_sources() {
    let line = "ERROR: [Synth 8-2716] syntax error near 'fake' [hdl/spade.sv:1]\n";
    let report = build_report(&[
        ("tool.log".to_string(), line.as_bytes().to_vec()),
        ("console.log".to_string(), line.as_bytes().to_vec()),
    ]);
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].source, "tool.log");
}

#[test]
fn test_very_long_line_parses_without_truncation() {
    let filler = "x".repeat(90 * 1024);
    let report = report_from(&format!("ERROR: [Synth 8-1] {filler} [a.v:3]\n"));
    let diag = &report.diagnostics[0];
    assert_eq!(diag.message.len(), 90 * 1024);
    assert_eq!(diag.file, "a.v");
    assert_eq!(diag.line, 3);
}

#[test]
fn test_report_is_deterministic() {
    let logs = vec![(
        "console.log".to_string(),
        b"ERROR: [Synth 8-1] bad thing [a.v:1]\nWARNING: minor\n".to_vec(),
    )];
    let a = build_report(&logs);
    let b = build_report(&logs);
    assert_eq!(a.diagnostics, b.diagnostics);
    assert_eq!(a.error_count, b.error_count);
}

#[test]
fn test_classifier_table() {
    let cases = [
        (
            "ERROR: [Synth 8-2716] syntax error near 'fake' [hdl/spade.sv:1]",
            FailureKind::Syntax,
        ),
        (
            "ERROR: [Common 17-55] constraint could not be applied [pins.xdc:4]",
            FailureKind::Constraints,
        ),
        (
            "ERROR: [DRC 23-20] rule violation on pin bank",
            FailureKind::Constraints,
        ),
        (
            "ERROR: [Timing 38-282] timing requirement not met",
            FailureKind::Timing,
        ),
        (
            "ERROR: [Common 17-69] Command failed: Synthesis failed",
            FailureKind::Synthesis,
        ),
        (
            "ERROR: [Route 35-7] unroutable net between regions",
            FailureKind::Implementation,
        ),
        (
            "ERROR: [Write 10-1] bitstream generation aborted",
            FailureKind::Implementation,
        ),
        (
            "ERROR: [Common 17-99] unexpected internal condition",
            FailureKind::Internal,
        ),
    ];

    for (line, expected) in cases {
        let report = report_from(&format!("{line}\n"));
        let (kind, _) = infer_failure(&report, "", None);
        assert_eq!(kind, expected, "line: {line}");
    }
}

#[test]
fn test_summary_format() {
    let report = report_from("ERROR: [Synth 8-2716] syntax error near 'fake' [hdl/spade.sv:1]\n");
    let (kind, summary) = infer_failure(&report, "", None);

    assert_eq!(kind, FailureKind::Syntax);
    assert_eq!(summary, "[Synth 8-2716] syntax error near 'fake' (hdl/spade.sv:1)");
}

#[test]
fn test_summary_without_code_or_location() {
    let report = report_from("ERROR: everything is on fire\n");
    let (kind, summary) = infer_failure(&report, "", None);

    assert_eq!(kind, FailureKind::Internal);
    assert_eq!(summary, "everything is on fire");
}

#[test]
fn test_infer_failure_fallbacks() {
    let empty = report_from("INFO: nothing to see\n");

    let (kind, summary) = infer_failure(&empty, "tool exited non-zero", Some("exit status 2"));
    assert_eq!(kind, FailureKind::Internal);
    assert_eq!(summary, "tool exited non-zero");

    let (_, summary) = infer_failure(&empty, "", Some("exit status 2"));
    assert_eq!(summary, "exit status 2");

    let (_, summary) = infer_failure(&empty, "", None);
    assert_eq!(summary, "job failed");
}
