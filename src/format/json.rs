//! JSON and JSON Lines report formatters

use serde_json::json;

use super::{ReportFormatter, TransformReport};
use crate::EngineError;

impl ReportFormatter for super::JsonFormatter {
    fn format(&self, report: &TransformReport) -> Result<String, EngineError> {
        serde_json::to_string_pretty(report)
            .map_err(|e| EngineError::Report(format!("JSON serialization error: {}", e)))
    }
}

impl ReportFormatter for super::JsonLinesFormatter {
    fn format(&self, report: &TransformReport) -> Result<String, EngineError> {
        let mut output = String::new();

        let summary = json!({
            "type": "summary",
            "architecture": report.architecture,
            "input_len": report.input_len,
            "output_len": report.output_len,
            "instructions": report.instructions,
            "passes": report.passes,
        });
        output.push_str(&to_line(&summary)?);

        for r in &report.rewrites {
            let rewrite = json!({
                "type": "rewrite",
                "offset": format!("0x{:x}", r.offset),
                "mnemonic": r.mnemonic,
                "strategy": r.strategy,
                "orig_len": r.orig_len,
                "new_len": r.new_len,
            });
            output.push_str(&to_line(&rewrite)?);
        }

        for off in &report.unresolved {
            let unresolved = json!({
                "type": "unresolved",
                "offset": format!("0x{:x}", off),
            });
            output.push_str(&to_line(&unresolved)?);
        }

        Ok(output)
    }
}

fn to_line(value: &serde_json::Value) -> Result<String, EngineError> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| EngineError::Report(format!("JSON serialization error: {}", e)))?;
    line.push('\n');
    Ok(line)
}
