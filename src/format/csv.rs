//! CSV output formatter

use crate::analysis::Analysis;
use crate::image::ByteImage;
use crate::AnalysisError;
use super::AnalysisFormatter;

impl AnalysisFormatter for super::CsvFormatter {
    fn format(&self, analysis: &Analysis, image: &ByteImage) -> Result<String, AnalysisError> {
        let mut writer = ::csv::Writer::from_writer(Vec::new());
        let base_addr_str = format!("0x{:04x}", image.base());

        writer
            .write_record([
                "base_address",
                "entry",
                "call_count",
                "call_sites",
                "jump_sites",
                "first_return",
                "external",
            ])
            .map_err(csv_error)?;

        for sub in analysis.call_graph.by_frequency() {
            let call_count = sub.call_count().to_string();
            let record = [
                base_addr_str.clone(),
                format!("0x{:04x}", sub.entry),
                call_count,
                join_addresses(&sub.call_sites),
                join_addresses(&sub.jump_sites),
                sub.first_return.map(|a| format!("0x{:04x}", a)).unwrap_or_default(),
                sub.external.to_string(),
            ];
            writer.write_record(&record).map_err(csv_error)?;
        }

        let bytes = writer
            .into_inner()
            .map_err(|e| AnalysisError::Format(format!("CSV flush error: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| AnalysisError::Format(e.to_string()))
    }
}

/// Space-separated list; the writer quotes it if needed
fn join_addresses(addrs: &[crate::Address]) -> String {
    addrs.iter().map(|a| format!("0x{:04x}", a)).collect::<Vec<_>>().join(" ")
}

fn csv_error(e: ::csv::Error) -> AnalysisError {
    AnalysisError::Format(format!("CSV error: {}", e))
}
