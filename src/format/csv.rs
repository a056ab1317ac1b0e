//! CSV report formatter

use super::{ReportFormatter, TransformReport};
use crate::EngineError;

impl ReportFormatter for super::CsvFormatter {
    fn format(&self, report: &TransformReport) -> Result<String, EngineError> {
        let mut writer = csv::Writer::from_writer(Vec::new());

        writer
            .write_record(["offset", "mnemonic", "strategy", "orig_len", "new_len"])
            .map_err(csv_error)?;

        for r in &report.rewrites {
            writer
                .write_record([
                    format!("0x{:x}", r.offset),
                    r.mnemonic.clone(),
                    r.strategy.clone(),
                    r.orig_len.to_string(),
                    r.new_len.to_string(),
                ])
                .map_err(csv_error)?;
        }

        for off in &report.unresolved {
            writer
                .write_record([
                    format!("0x{:x}", off),
                    String::new(),
                    "unresolved".to_string(),
                    String::new(),
                    String::new(),
                ])
                .map_err(csv_error)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| EngineError::Report(format!("CSV serialization error: {}", e)))?;
        String::from_utf8(bytes)
            .map_err(|e| EngineError::Report(format!("CSV serialization error: {}", e)))
    }
}

fn csv_error(e: csv::Error) -> EngineError {
    EngineError::Report(format!("CSV serialization error: {}", e))
}
