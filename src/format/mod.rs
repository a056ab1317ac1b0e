//! Transform-report output formats.

mod csv;
mod json;

pub use self::csv::*;
pub use self::json::*;

use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{Address, EngineError};

/// One accepted rewrite, for diagnostics and reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteRecord {
    /// Original offset of the rewritten instruction
    pub offset: Address,
    /// Mnemonic of the original instruction
    pub mnemonic: String,
    /// Name of the accepted strategy
    pub strategy: String,
    /// Original encoding length
    pub orig_len: usize,
    /// Replacement encoding length
    pub new_len: usize,
}

/// Summary of one engine run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformReport {
    /// Architecture the run was configured for
    pub architecture: String,
    /// Input length in bytes
    pub input_len: usize,
    /// Output length in bytes
    pub output_len: usize,
    /// Number of decoded instructions
    pub instructions: usize,
    /// Fixed-point passes executed
    pub passes: usize,
    /// Accepted rewrites, in instruction order
    pub rewrites: Vec<RewriteRecord>,
    /// Original offsets still unresolved (empty on success)
    pub unresolved: Vec<Address>,
}

/// Supported report output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output (default)
    Text,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per line)
    JsonLines,
    /// CSV format (comma-separated values)
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonLines => write!(f, "jsonl"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "jsonl" | "jsonlines" => Ok(OutputFormat::JsonLines),
            "csv" => Ok(OutputFormat::Csv),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

impl OutputFormat {
    /// Get all available output formats
    pub fn available_formats() -> &'static [Self] {
        &[
            OutputFormat::Text,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn ReportFormatter> {
        match self {
            OutputFormat::Text => Box::new(TextFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for report output
pub trait ReportFormatter {
    /// Format a transform report
    fn format(&self, report: &TransformReport) -> Result<String, EngineError>;
}

/// Format a report in plain text
pub struct TextFormatter;

/// Format a report in JSON
pub struct JsonFormatter;

/// Format a report in JSON Lines
pub struct JsonLinesFormatter;

/// Format a report in CSV
pub struct CsvFormatter;

impl ReportFormatter for TextFormatter {
    fn format(&self, report: &TransformReport) -> Result<String, EngineError> {
        let mut output = String::new();

        output.push_str(&format!(
            "Transformed {} bytes -> {} bytes ({}) in {} pass(es)\n",
            report.input_len, report.output_len, report.architecture, report.passes
        ));
        output.push_str(&format!(
            "{} instruction(s), {} rewritten\n",
            report.instructions,
            report.rewrites.len()
        ));

        if !report.rewrites.is_empty() {
            output.push('\n');
            for r in &report.rewrites {
                output.push_str(&format!(
                    "0x{:08x}: {:<8} {} -> {} bytes via {}\n",
                    r.offset, r.mnemonic, r.orig_len, r.new_len, r.strategy
                ));
            }
        }

        if !report.unresolved.is_empty() {
            output.push_str("\nUnresolved offsets: ");
            for (i, off) in report.unresolved.iter().enumerate() {
                if i > 0 {
                    output.push_str(", ");
                }
                output.push_str(&format!("0x{:08x}", off));
            }
            output.push('\n');
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_report() -> TransformReport {
        TransformReport {
            architecture: "x86-32".to_string(),
            input_len: 6,
            output_len: 12,
            instructions: 2,
            passes: 1,
            rewrites: vec![RewriteRecord {
                offset: 0,
                mnemonic: "mov".to_string(),
                strategy: "mov_xor_imm".to_string(),
                orig_len: 5,
                new_len: 11,
            }],
            unresolved: Vec::new(),
        }
    }

    #[test]
    fn test_text_formatter() {
        let report = sample_report();
        let out = TextFormatter.format(&report).unwrap();

        assert!(out.contains("6 bytes -> 12 bytes"));
        assert!(out.contains("mov_xor_imm"));
        assert!(out.contains("0x00000000: mov"));
        assert!(!out.contains("Unresolved"));
    }

    #[test]
    fn test_text_formatter_unresolved() {
        let mut report = sample_report();
        report.unresolved = vec![0x10, 0x20];
        let out = TextFormatter.format(&report).unwrap();

        assert!(out.contains("Unresolved offsets: 0x00000010, 0x00000020"));
    }

    #[test]
    fn test_format_selection() {
        for format in OutputFormat::available_formats() {
            let formatter = format.get_formatter();
            assert!(formatter.format(&sample_report()).is_ok());
        }
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("json".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(
            "jsonl".parse::<OutputFormat>().unwrap(),
            OutputFormat::JsonLines
        );
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
