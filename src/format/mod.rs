//! Output format module implementation

mod json;
mod csv;

pub use self::json::*;
pub use self::csv::*;

use crate::analysis::Analysis;
use crate::image::ByteImage;
use crate::region::Classification;
use crate::{Address, AnalysisError, EdgeKind};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use clap::ValueEnum;

/// Bytes per `DB` line in listings
const DB_PER_LINE: usize = 8;

/// Supported output formats for analysis results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Annotated assembler listing (default)
    #[default]
    Listing,
    /// JSON format (hierarchical)
    Json,
    /// JSON Lines format (one JSON object per line)
    JsonLines,
    /// CSV format, one row per subroutine
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Listing => write!(f, "listing"),
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
            "listing" | "asm" | "text" => Ok(OutputFormat::Listing),
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
            OutputFormat::Listing,
            OutputFormat::Json,
            OutputFormat::JsonLines,
            OutputFormat::Csv,
        ]
    }

    /// Get a formatter for this output format
    pub fn get_formatter(&self) -> Box<dyn AnalysisFormatter> {
        match self {
            OutputFormat::Listing => Box::new(ListingFormatter),
            OutputFormat::Json => Box::new(JsonFormatter),
            OutputFormat::JsonLines => Box::new(JsonLinesFormatter),
            OutputFormat::Csv => Box::new(CsvFormatter),
        }
    }
}

/// Formatter trait for analysis output
pub trait AnalysisFormatter {
    /// Render an analysis of `image`
    fn format(&self, analysis: &Analysis, image: &ByteImage) -> Result<String, AnalysisError>;
}

/// Format as an annotated assembler listing
pub struct ListingFormatter;

/// Format in JSON
pub struct JsonFormatter;

/// Format in JSON Lines
pub struct JsonLinesFormatter;

/// Format in CSV
pub struct CsvFormatter;

/// Addresses that get an `Lxxxx:` label: subroutine entries and in-image jump targets.
fn labels(analysis: &Analysis, image: &ByteImage) -> BTreeSet<Address> {
    let mut labels: BTreeSet<Address> = analysis
        .call_graph
        .subroutines()
        .map(|s| s.entry)
        .filter(|&a| image.contains(a))
        .collect();
    labels.extend(
        analysis
            .flow
            .edges
            .iter()
            .filter(|e| e.kind != EdgeKind::FallThrough && image.contains(e.to))
            .map(|e| e.to),
    );
    labels.extend(analysis.flow.seeds.iter().copied());
    labels
}

fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

impl AnalysisFormatter for ListingFormatter {
    fn format(&self, analysis: &Analysis, image: &ByteImage) -> Result<String, AnalysisError> {
        let mut output = String::new();
        let labels = labels(analysis, image);
        let diag = &analysis.diagnostics;

        output.push_str(&format!(
            "; {} of &{:04X}-&{:04X}\n",
            analysis.strategy,
            image.base(),
            image.end() - 1
        ));
        output.push_str(&format!(
            "; {} instructions, {} subroutines, {} unresolved, {} invalid opcodes\n",
            analysis.flow.instruction_count(),
            analysis.call_graph.len(),
            diag.unresolved_targets,
            diag.invalid_opcode_count()
        ));
        output.push_str(&format!(
            "; code {} bytes, data {} bytes, unknown {} bytes\n\n",
            diag.code_bytes, diag.data_bytes, diag.unknown_bytes
        ));
        output.push_str(&format!("        ORG &{:04X}\n", image.base()));

        for region in analysis.regions.regions() {
            match region.evidence.and_then(|e| e.signature) {
                Some(sig) => output.push_str(&format!(
                    "\n; ---- {} ({}) &{:04X}-&{:04X} ----\n",
                    region.class,
                    sig,
                    region.start,
                    region.end - 1
                )),
                None => output.push_str(&format!(
                    "\n; ---- {} &{:04X}-&{:04X} ----\n",
                    region.class,
                    region.start,
                    region.end - 1
                )),
            }

            if region.class == Classification::Code {
                let mut at = region.start;
                while at < region.end {
                    let Some(insn) = analysis.flow.instruction_at(at) else {
                        // Overlapping decode; the bytes belong to the previous instruction
                        at += 1;
                        continue;
                    };
                    if labels.contains(&at) {
                        match analysis.call_graph.get(at) {
                            Some(sub) => output.push_str(&format!(
                                "L{:04X}:                          ; called {} time(s)\n",
                                at,
                                sub.call_count()
                            )),
                            None => output.push_str(&format!("L{:04X}:\n", at)),
                        }
                    }
                    output.push_str(&format!(
                        "        {:<24} ; {:04X}  {}\n",
                        insn.to_string(),
                        at,
                        hex_bytes(insn.bytes())
                    ));
                    at += insn.size as Address;
                }
            } else {
                let data = image
                    .slice(region.start, region.len())
                    .map_err(|e| AnalysisError::Format(e.to_string()))?;
                for (i, chunk) in data.chunks(DB_PER_LINE).enumerate() {
                    let addr = region.start + (i * DB_PER_LINE) as Address;
                    let db = chunk.iter().map(|b| format!("&{:02X}", b)).collect::<Vec<_>>().join(",");
                    output.push_str(&format!("        DB {:<21} ; {:04X}\n", db, addr));
                }
            }
        }

        if !analysis.call_graph.unresolved().is_empty() {
            output.push_str("\n; Unresolved targets:\n");
            for u in analysis.call_graph.unresolved() {
                output.push_str(&format!(";   &{:04X} {}\n", u.site, u.kind));
            }
        }

        Ok(output)
    }
}
