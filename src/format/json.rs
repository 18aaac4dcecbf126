//! JSON and JSON Lines output formatters

use serde::Serialize;
use serde_json::json;

use crate::analysis::{Analysis, Diagnostics};
use crate::callgraph::{Subroutine, UnresolvedTarget};
use crate::image::ByteImage;
use crate::region::Region;
use crate::{Address, AnalysisError};
use super::AnalysisFormatter;

/// Serializable subroutine for JSON output
#[derive(Serialize)]
struct SubroutineJson {
    /// Entry address
    entry: String,
    /// Number of call sites
    call_count: usize,
    /// Call-site addresses, ascending
    call_sites: Vec<String>,
    /// Jump-site addresses, ascending
    #[serde(skip_serializing_if = "Vec::is_empty")]
    jump_sites: Vec<String>,
    /// First `RET`/`RETI`/`RETN` after the entry
    #[serde(skip_serializing_if = "Option::is_none")]
    first_return: Option<String>,
    /// Entry outside the image
    external: bool,
}

/// Serializable region for JSON output
#[derive(Serialize)]
struct RegionJson {
    start: String,
    /// Exclusive end
    end: String,
    length: usize,
    classification: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pointer_density: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    text_density: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    undecodable: Option<usize>,
    /// Signature spans making up a data region
    #[serde(skip_serializing_if = "Vec::is_empty")]
    spans: Vec<SpanJson>,
}

/// Serializable data span for JSON output
#[derive(Serialize)]
struct SpanJson {
    start: String,
    end: String,
    signature: String,
}

/// Serializable unresolved target for JSON output
#[derive(Serialize)]
struct UnresolvedJson {
    site: String,
    kind: String,
}

/// Serializable analysis result for JSON output
#[derive(Serialize)]
struct AnalysisJson<'a> {
    /// Strategy that produced the result
    strategy: String,
    /// Image base address
    base_address: String,
    /// Image length in bytes
    length: usize,
    /// Seed addresses
    seeds: Vec<String>,
    /// Subroutines by call count, most called first
    subroutines: Vec<SubroutineJson>,
    /// Regions in address order
    regions: Vec<RegionJson>,
    /// Dynamic calls and jumps
    unresolved: Vec<UnresolvedJson>,
    /// Counters
    diagnostics: &'a Diagnostics,
}

impl AnalysisFormatter for super::JsonFormatter {
    fn format(&self, analysis: &Analysis, image: &ByteImage) -> Result<String, AnalysisError> {
        let result = AnalysisJson {
            strategy: analysis.strategy.to_string(),
            base_address: hex(image.base()),
            length: image.len(),
            seeds: analysis.flow.seeds.iter().copied().map(hex).collect(),
            subroutines: analysis.call_graph.by_frequency().into_iter().map(subroutine_to_json).collect(),
            regions: analysis.regions.regions().iter().map(region_to_json).collect(),
            unresolved: analysis.call_graph.unresolved().iter().map(unresolved_to_json).collect(),
            diagnostics: &analysis.diagnostics,
        };

        serde_json::to_string_pretty(&result)
            .map_err(|e| AnalysisError::Format(format!("JSON serialization error: {}", e)))
    }
}

impl AnalysisFormatter for super::JsonLinesFormatter {
    fn format(&self, analysis: &Analysis, image: &ByteImage) -> Result<String, AnalysisError> {
        let mut output = String::new();
        let base_addr_str = hex(image.base());

        let mut push = |value: serde_json::Value| -> Result<(), AnalysisError> {
            output.push_str(
                &serde_json::to_string(&value)
                    .map_err(|e| AnalysisError::Format(format!("JSON serialization error: {}", e)))?,
            );
            output.push('\n');
            Ok(())
        };

        push(json!({
            "type": "summary",
            "base_address": base_addr_str,
            "strategy": analysis.strategy,
            "instructions": analysis.flow.instruction_count(),
            "diagnostics": analysis.diagnostics,
        }))?;

        for sub in analysis.call_graph.by_frequency() {
            let mut value = json!(subroutine_to_json(sub));
            value["type"] = json!("subroutine");
            push(value)?;
        }
        for region in analysis.regions.regions() {
            let mut value = json!(region_to_json(region));
            value["type"] = json!("region");
            push(value)?;
        }
        for target in analysis.call_graph.unresolved() {
            let mut value = json!(unresolved_to_json(target));
            value["type"] = json!("unresolved");
            push(value)?;
        }

        Ok(output)
    }
}

fn hex(addr: Address) -> String {
    format!("0x{:04x}", addr)
}

/// Convert a subroutine to JSON format
fn subroutine_to_json(sub: &Subroutine) -> SubroutineJson {
    SubroutineJson {
        entry: hex(sub.entry),
        call_count: sub.call_count(),
        call_sites: sub.call_sites.iter().copied().map(hex).collect(),
        jump_sites: sub.jump_sites.iter().copied().map(hex).collect(),
        first_return: sub.first_return.map(hex),
        external: sub.external,
    }
}

/// Convert a region to JSON format
fn region_to_json(region: &Region) -> RegionJson {
    RegionJson {
        start: hex(region.start),
        end: hex(region.end),
        length: region.len(),
        classification: region.class.to_string(),
        signature: region.evidence.and_then(|e| e.signature).map(|s| s.to_string()),
        pointer_density: region.evidence.map(|e| e.pointer_density),
        text_density: region.evidence.map(|e| e.text_density),
        undecodable: region.evidence.map(|e| e.undecodable),
        spans: region
            .spans
            .iter()
            .map(|span| SpanJson {
                start: hex(span.start),
                end: hex(span.end),
                signature: span.signature.to_string(),
            })
            .collect(),
    }
}

fn unresolved_to_json(target: &UnresolvedTarget) -> UnresolvedJson {
    UnresolvedJson {
        site: hex(target.site),
        kind: target.kind.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::tests::sample;
    use crate::format::{JsonFormatter, JsonLinesFormatter};
    use serde_json::Value;

    #[test]
    fn test_json_formatter() {
        let (image, analysis) = sample();

        let output = JsonFormatter.format(&analysis, &image).unwrap();
        let parsed: Value = serde_json::from_str(&output).unwrap();

        assert_eq!(parsed["base_address"], "0x4000");
        assert_eq!(parsed["length"], 0x18);
        assert_eq!(parsed["subroutines"][0]["entry"], "0x4010");
        assert_eq!(parsed["subroutines"][0]["call_count"], 2);
        assert_eq!(parsed["subroutines"][0]["call_sites"], json!(["0x4000", "0x4003"]));
        assert_eq!(parsed["subroutines"][0]["first_return"], "0x4012");
        assert_eq!(parsed["regions"][0]["classification"], "code");
        // "DATA!" is split off from the zero bytes after it
        assert_eq!(parsed["regions"][1]["signature"], "text");
        assert_eq!(parsed["regions"][1]["spans"][0]["end"], "0x400c");
        assert_eq!(parsed["regions"][2]["classification"], "unknown");
        assert!(parsed["regions"][2].get("spans").is_none());
        assert_eq!(parsed["unresolved"][0]["kind"], "jump");
        assert_eq!(parsed["diagnostics"]["unresolved_targets"], 1);
    }

    #[test]
    fn test_json_lines_formatter() {
        let (image, analysis) = sample();

        let output = JsonLinesFormatter.format(&analysis, &image).unwrap();
        let lines: Vec<Value> = output.lines().map(|l| serde_json::from_str(l).unwrap()).collect();

        assert_eq!(lines[0]["type"], "summary");
        assert_eq!(lines[0]["strategy"], "recursive");
        let subs = lines.iter().filter(|l| l["type"] == "subroutine").count();
        let regions = lines.iter().filter(|l| l["type"] == "region").count();
        assert_eq!(subs, analysis.call_graph.len());
        assert_eq!(regions, analysis.regions.len());
        assert_eq!(lines.last().unwrap()["type"], "unresolved");
    }
}
