//! Code/data/unknown partition of an image.
//!
//! Classification is best-effort. Runs of flow-reached instruction bytes are code.
//! Every other run is checked for a data signature (pointer table, text, fill) as a
//! whole. A run that shows none as a whole is searched for signature spans, so a
//! table followed by padding is still data; the bytes no span claims are left
//! unknown rather than guessed at. Each data verdict carries the [`Evidence`] it was
//! based on and the [`DataSpan`]s it is made of.

use std::fmt;

use rayon::prelude::*;
use serde::Serialize;

use crate::analysis::{AnalysisConfig, AnalysisContext};
use crate::image::ByteImage;
use crate::{Address, AddressStatus, FlowMap};

/// Region classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// Decoded, flow-reached instructions
    Code,
    /// Not code, with a data signature
    Data,
    /// Neither
    Unknown,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Code => write!(f, "code"),
            Classification::Data => write!(f, "data"),
            Classification::Unknown => write!(f, "unknown"),
        }
    }
}

/// Which heuristic marked a run as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataSignature {
    /// Little-endian words pointing at decoded instructions
    PointerTable,
    /// Printable ASCII
    Text,
    /// One byte value repeated
    Fill,
}

impl fmt::Display for DataSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSignature::PointerTable => write!(f, "pointer table"),
            DataSignature::Text => write!(f, "text"),
            DataSignature::Fill => write!(f, "fill"),
        }
    }
}

/// Measurements taken over a non-code run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evidence {
    /// Signature that matched, if any
    pub signature: Option<DataSignature>,
    /// Best fraction of aligned words that point at an instruction start
    pub pointer_density: f32,
    /// Fraction of printable bytes
    pub text_density: f32,
    /// Addresses in the run where decoding was attempted and failed
    pub undecodable: usize,
}

/// Stretch of a data region matched by one signature, `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataSpan {
    pub start: Address,
    pub end: Address,
    pub signature: DataSignature,
}

/// A maximal run of one classification, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    pub start: Address,
    pub end: Address,
    pub class: Classification,
    /// Present for data and unknown regions
    pub evidence: Option<Evidence>,
    /// Signature spans of a data region, in address order; empty otherwise
    pub spans: Vec<DataSpan>,
}

impl Region {
    /// Length in bytes
    pub fn len(&self) -> usize {
        (self.end - self.start) as usize
    }

    /// Always false; regions are never empty
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns true if `addr` lies in the region.
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// Ordered regions tiling the image with no gaps or overlaps.
#[derive(Debug, Clone, Default)]
pub struct RegionMap {
    regions: Vec<Region>,
}

impl RegionMap {
    /// Regions in address order
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Number of regions
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Returns true if there are no regions
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Number of regions with the given classification
    pub fn count(&self, class: Classification) -> usize {
        self.regions.iter().filter(|r| r.class == class).count()
    }

    /// Total bytes with the given classification
    pub fn bytes_in(&self, class: Classification) -> usize {
        self.regions.iter().filter(|r| r.class == class).map(Region::len).sum()
    }

    /// Region containing `addr`
    pub fn find(&self, addr: Address) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.end <= addr);
        self.regions.get(idx).filter(|r| r.contains(addr))
    }

    /// Classification of `addr`, if it lies in the image
    pub fn classify_addr(&self, addr: Address) -> Option<Classification> {
        self.find(addr).map(|r| r.class)
    }
}

/// Partition the image into regions.
///
/// Non-code runs are independent of each other and are measured in parallel.
pub fn classify(ctx: &AnalysisContext<'_>, flow: &FlowMap) -> RegionMap {
    let image = ctx.image;
    let status = flow.coverage(image);

    let mut runs: Vec<(usize, usize, bool)> = Vec::new();
    let mut start = 0;
    for off in 1..=status.len() {
        let is_code = status[start] == AddressStatus::Code;
        if off == status.len() || (status[off] == AddressStatus::Code) != is_code {
            runs.push((start, off, is_code));
            start = off;
        }
    }

    let regions: Vec<Region> = runs
        .par_iter()
        .flat_map_iter(|&(from, to, is_code)| {
            if is_code {
                return vec![Region {
                    start: image.base() + from as Address,
                    end: image.base() + to as Address,
                    class: Classification::Code,
                    evidence: None,
                    spans: Vec::new(),
                }];
            }
            classify_run(image, flow, &status, from, to, ctx.config)
        })
        .collect();

    log::debug!(
        "Classified {} regions: {} code, {} data, {} unknown",
        regions.len(),
        regions.iter().filter(|r| r.class == Classification::Code).count(),
        regions.iter().filter(|r| r.class == Classification::Data).count(),
        regions.iter().filter(|r| r.class == Classification::Unknown).count()
    );
    RegionMap { regions }
}

/// Regions for the non-code run at image offsets `[from, to)`.
fn classify_run(
    image: &ByteImage,
    flow: &FlowMap,
    status: &[AddressStatus],
    from: usize,
    to: usize,
    config: &AnalysisConfig,
) -> Vec<Region> {
    let base = image.base();
    let evidence = measure(image, flow, status, from, to, config);
    if let Some(signature) = evidence.signature {
        let (start, end) = (base + from as Address, base + to as Address);
        return vec![Region {
            start,
            end,
            class: Classification::Data,
            evidence: Some(evidence),
            spans: vec![DataSpan { start, end, signature }],
        }];
    }

    let marks = mark_signatures(&image.bytes()[from..to], flow, base + from as Address, config);

    // Group equal marks into spans, then spans into data/unknown regions
    let mut regions: Vec<Region> = Vec::new();
    let mut seg = 0;
    while seg < marks.len() {
        let mark = marks[seg];
        let mut next = seg + 1;
        while next < marks.len() && marks[next] == mark {
            next += 1;
        }
        let start = base + (from + seg) as Address;
        let end = base + (from + next) as Address;
        let class = if mark.is_some() {
            Classification::Data
        } else {
            Classification::Unknown
        };
        if regions.last().map_or(false, |last| last.class == class) {
            if let Some(last) = regions.last_mut() {
                last.end = end;
            }
        } else {
            regions.push(Region {
                start,
                end,
                class,
                evidence: None,
                spans: Vec::new(),
            });
        }
        if let (Some(signature), Some(last)) = (mark, regions.last_mut()) {
            last.spans.push(DataSpan { start, end, signature });
        }
        seg = next;
    }

    for region in &mut regions {
        let lo = (region.start - base) as usize;
        let hi = (region.end - base) as usize;
        let mut evidence = measure(image, flow, status, lo, hi, config);
        evidence.signature = region.spans.first().map(|span| span.signature);
        region.evidence = Some(evidence);
    }
    regions
}

/// Per-byte signature marks for a run that shows no signature as a whole.
///
/// Pointer tables are claimed first, then text, then fill; a byte keeps the first
/// signature that claims it.
fn mark_signatures(
    bytes: &[u8],
    flow: &FlowMap,
    start: Address,
    config: &AnalysisConfig,
) -> Vec<Option<DataSignature>> {
    let mut marks: Vec<Option<DataSignature>> = vec![None; bytes.len()];

    for align in 0..2 {
        let words: Vec<bool> = bytes
            .get(align..)
            .unwrap_or_default()
            .chunks_exact(2)
            .map(|w| flow.instructions.contains_key(&(u16::from_le_bytes([w[0], w[1]]) as Address)))
            .collect();
        let mut i = 0;
        while i < words.len() {
            if !words[i] {
                i += 1;
                continue;
            }
            let mut j = i;
            while j < words.len() && words[j] {
                j += 1;
            }
            let lo = align + 2 * i;
            let hi = align + 2 * j;
            let mut targets: Vec<u16> = bytes[lo..hi]
                .chunks_exact(2)
                .map(|w| u16::from_le_bytes([w[0], w[1]]))
                .collect();
            targets.sort_unstable();
            targets.dedup();
            if targets.len() >= config.min_table_words && marks[lo..hi].iter().all(Option::is_none) {
                marks[lo..hi].fill(Some(DataSignature::PointerTable));
                log::trace!(
                    "Pointer table span at 0x{:04x}, {} words",
                    start + lo as Address,
                    j - i
                );
            }
            i = j;
        }
    }

    claim_runs(bytes, &mut marks, config.min_text_len, DataSignature::Text, |a, b| {
        is_printable(a) && is_printable(b)
    });
    claim_runs(bytes, &mut marks, config.min_fill_len, DataSignature::Fill, |a, b| a == b);
    marks
}

/// Mark maximal unclaimed runs of at least `min_len` bytes in which every byte pairs
/// with the first under `same`.
fn claim_runs(
    bytes: &[u8],
    marks: &mut [Option<DataSignature>],
    min_len: usize,
    signature: DataSignature,
    same: impl Fn(u8, u8) -> bool,
) {
    let mut i = 0;
    while i < bytes.len() {
        if marks[i].is_some() || !same(bytes[i], bytes[i]) {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < bytes.len() && marks[j].is_none() && same(bytes[i], bytes[j]) {
            j += 1;
        }
        if j - i >= min_len.max(1) {
            marks[i..j].fill(Some(signature));
        }
        i = j;
    }
}

/// Measure image offsets `[from, to)`.
fn measure(
    image: &ByteImage,
    flow: &FlowMap,
    status: &[AddressStatus],
    from: usize,
    to: usize,
    config: &AnalysisConfig,
) -> Evidence {
    let bytes = &image.bytes()[from..to];

    let (pointer_density, distinct_targets) = pointer_table(bytes, flow);
    let printable = bytes.iter().filter(|&&b| is_printable(b)).count();
    let text_density = printable as f32 / bytes.len() as f32;
    let undecodable = status[from..to]
        .iter()
        .filter(|&&s| s == AddressStatus::Undecodable)
        .count();

    let signature = if distinct_targets >= config.min_table_words
        && pointer_density >= config.pointer_density
    {
        Some(DataSignature::PointerTable)
    } else if bytes.len() >= config.min_text_len && text_density >= config.text_density {
        Some(DataSignature::Text)
    } else if bytes.len() >= config.min_fill_len && bytes.iter().all(|&b| b == bytes[0]) {
        Some(DataSignature::Fill)
    } else {
        None
    };

    Evidence {
        signature,
        pointer_density,
        text_density,
        undecodable,
    }
}

/// Best pointer density over both word alignments, with the number of distinct
/// instruction starts hit at that alignment.
fn pointer_table(bytes: &[u8], flow: &FlowMap) -> (f32, usize) {
    let mut best = (0.0f32, 0usize);
    for align in 0..2 {
        let words: Vec<Address> = bytes
            .get(align..)
            .unwrap_or_default()
            .chunks_exact(2)
            .map(|w| u16::from_le_bytes([w[0], w[1]]) as Address)
            .collect();
        if words.is_empty() {
            continue;
        }
        let mut hits: Vec<Address> = words
            .iter()
            .copied()
            .filter(|w| flow.instructions.contains_key(w))
            .collect();
        let density = hits.len() as f32 / words.len() as f32;
        hits.sort_unstable();
        hits.dedup();
        if density > best.0 {
            best = (density, hits.len());
        }
    }
    best
}

fn is_printable(b: u8) -> bool {
    (0x20..=0x7e).contains(&b) || b == b'\r' || b == b'\n'
}
