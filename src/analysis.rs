//! Analysis runs: configuration, the shared context, and the combined result.

use std::time::Instant;

use rayon::prelude::*;
use serde::Serialize;

use crate::callgraph::{self, CallGraph};
use crate::decoder::DecoderError;
use crate::image::ByteImage;
use crate::region::{self, Classification, RegionMap};
use crate::strategy::{Strategy, WorkOrder};
use crate::{Address, AnalysisError, Decoder, FlowMap};

/// Options for one analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Entry points; the image base is used when empty
    pub seeds: Vec<Address>,
    /// Flow-recovery strategy
    pub strategy: Strategy,
    /// Worklist discipline for recursive descent
    pub order: WorkOrder,
    /// Follow the byte after `RST` as if the restart returned
    pub restart_returns: bool,
    /// Re-decode every recovered instruction in parallel and report mismatches
    pub verify: bool,
    /// Minimum number of words for a pointer table
    pub min_table_words: usize,
    /// Fraction of words that must point at decoded instructions
    pub pointer_density: f32,
    /// Fraction of bytes that must be printable ASCII for a text run
    pub text_density: f32,
    /// Minimum length of a text run
    pub min_text_len: usize,
    /// Minimum length of a run of one repeated byte
    pub min_fill_len: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            seeds: Vec::new(),
            strategy: Strategy::Recursive,
            order: WorkOrder::BreadthFirst,
            restart_returns: false,
            verify: false,
            min_table_words: 2,
            pointer_density: 0.5,
            text_density: 0.85,
            min_text_len: 4,
            min_fill_len: 8,
        }
    }
}

/// Everything a component needs for one run: the image, the decoder, the options
/// and the validated seed list.
pub struct AnalysisContext<'a> {
    /// Image under analysis
    pub image: &'a ByteImage,
    /// Instruction decoder
    pub decoder: &'a dyn Decoder,
    /// Run options
    pub config: &'a AnalysisConfig,
    seeds: Vec<Address>,
    dropped_seeds: Vec<Address>,
}

impl<'a> AnalysisContext<'a> {
    /// Validate the seeds against the image.
    ///
    /// Seeds outside the image are dropped with a warning; if none survive the run
    /// cannot start.
    pub fn new(
        image: &'a ByteImage,
        decoder: &'a dyn Decoder,
        config: &'a AnalysisConfig,
    ) -> Result<Self, AnalysisError> {
        let requested = if config.seeds.is_empty() {
            vec![image.base()]
        } else {
            config.seeds.clone()
        };

        let (mut seeds, dropped): (Vec<_>, Vec<_>) =
            requested.iter().copied().partition(|&s| image.contains(s));
        for s in &dropped {
            log::warn!(
                "Seed 0x{:04x} is outside the image (0x{:04x}..0x{:04x}), ignoring",
                s,
                image.base(),
                image.end()
            );
        }
        seeds.dedup();
        if seeds.is_empty() {
            return Err(AnalysisError::NoValidSeed {
                tried: requested.len(),
                start: image.base(),
                end: image.end(),
            });
        }

        Ok(Self {
            image,
            decoder,
            config,
            seeds,
            dropped_seeds: dropped,
        })
    }

    /// Seeds inside the image, in the order given
    pub fn seeds(&self) -> &[Address] {
        &self.seeds
    }

    /// Seeds that were rejected
    pub fn dropped_seeds(&self) -> &[Address] {
        &self.dropped_seeds
    }
}

/// Counters describing how much of the result is trustworthy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Diagnostics {
    /// Addresses where decoding hit an invalid opcode
    pub invalid_opcodes: Vec<Address>,
    /// Instructions cut off by the end of the image
    pub truncated: usize,
    /// Calls and jumps whose target is computed at run time
    pub unresolved_targets: usize,
    /// Static edges leaving the image (ROM calls, wrapped jumps)
    pub external_targets: usize,
    /// Seeds outside the image
    pub dropped_seeds: Vec<Address>,
    /// Addresses that decoded differently on re-verification
    pub verification_mismatches: Vec<Address>,
    /// Bytes in code regions
    pub code_bytes: usize,
    /// Bytes in data regions
    pub data_bytes: usize,
    /// Bytes in unknown regions
    pub unknown_bytes: usize,
}

impl Diagnostics {
    /// Number of invalid-opcode failures
    pub fn invalid_opcode_count(&self) -> usize {
        self.invalid_opcodes.len()
    }

    /// Total bytes classified
    pub fn total_bytes(&self) -> usize {
        self.code_bytes + self.data_bytes + self.unknown_bytes
    }
}

/// The result of a run, handed out as an immutable snapshot.
#[derive(Debug, Clone)]
pub struct Analysis {
    /// Strategy that produced the flow map
    pub strategy: Strategy,
    /// Discovered instructions and flow edges
    pub flow: FlowMap,
    /// Subroutines and call edges
    pub call_graph: CallGraph,
    /// Code/data/unknown partition of the image
    pub regions: RegionMap,
    /// Counters
    pub diagnostics: Diagnostics,
}

/// Run the whole pipeline over `image`.
pub fn analyze(
    image: &ByteImage,
    decoder: &dyn Decoder,
    config: &AnalysisConfig,
) -> Result<Analysis, AnalysisError> {
    let ctx = AnalysisContext::new(image, decoder, config)?;
    let start_time = Instant::now();

    let flow = config.strategy.run(&ctx)?;
    let call_graph = callgraph::build(&ctx, &flow);
    let regions = region::classify(&ctx, &flow);

    let mut diagnostics = Diagnostics {
        dropped_seeds: ctx.dropped_seeds().to_vec(),
        unresolved_targets: call_graph.unresolved().len(),
        external_targets: flow.external_edges(image).count(),
        code_bytes: regions.bytes_in(Classification::Code),
        data_bytes: regions.bytes_in(Classification::Data),
        unknown_bytes: regions.bytes_in(Classification::Unknown),
        ..Diagnostics::default()
    };
    for (addr, err) in &flow.undecodable {
        match err {
            DecoderError::InvalidOpcode { .. } => diagnostics.invalid_opcodes.push(*addr),
            DecoderError::Truncated(_) => diagnostics.truncated += 1,
            DecoderError::OutOfRange(_) => {}
        }
    }
    if config.verify {
        diagnostics.verification_mismatches = verify(&ctx, &flow);
    }

    log::info!(
        "{} over {} bytes in {:?}: {} instructions, {} subroutines, {} invalid opcodes, {} unknown bytes",
        config.strategy,
        image.len(),
        start_time.elapsed(),
        flow.instruction_count(),
        call_graph.len(),
        diagnostics.invalid_opcode_count(),
        diagnostics.unknown_bytes
    );

    Ok(Analysis {
        strategy: config.strategy,
        flow,
        call_graph,
        regions,
        diagnostics,
    })
}

/// Re-decode every recovered instruction in parallel and return the addresses whose
/// second decode disagrees with the first.
pub fn verify(ctx: &AnalysisContext<'_>, flow: &FlowMap) -> Vec<Address> {
    let mut mismatches: Vec<Address> = flow
        .instructions
        .par_iter()
        .filter(|(addr, insn)| ctx.decoder.decode(ctx.image, **addr).as_ref() != Ok(*insn))
        .map(|(addr, _)| *addr)
        .collect();
    mismatches.sort_unstable();
    if !mismatches.is_empty() {
        log::warn!("{} instruction(s) failed re-verification", mismatches.len());
    }
    mismatches
}
