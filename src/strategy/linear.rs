//! Linear-sweep disassembly strategy

use std::time::Instant;

use crate::analysis::AnalysisContext;
use crate::strategy::successors;
use crate::{Address, AnalysisError, FlowEdge, FlowMap};

/// Linear-sweep disassembly
///
/// Decodes back to back from the image base. A byte that does not start a valid
/// instruction is recorded as undecodable and the sweep resumes at the next byte.
/// Everything decoded counts as code, whether or not control can reach it.
///
/// # Arguments
/// * `ctx` - Image and decoder for the run
///
/// # Returns
/// The decoded instructions and the edges they imply
pub fn run(ctx: &AnalysisContext<'_>) -> Result<FlowMap, AnalysisError> {
    let image = ctx.image;
    log::debug!("Starting linear sweep on {} bytes", image.len());
    let start_time = Instant::now();

    let mut flow = FlowMap::new(ctx.seeds().to_vec());
    let mut at: Address = image.base();
    let mut skipped = 0usize;

    while at < image.end() {
        match ctx.decoder.decode(image, at) {
            Ok(insn) => {
                for (to, kind) in successors(&insn, ctx.config.restart_returns) {
                    flow.edges.push(FlowEdge { from: at, to, kind });
                }
                at += insn.size as Address;
                flow.instructions.insert(insn.addr, insn);
            }
            Err(err) => {
                flow.undecodable.insert(at, err);
                at += 1;
                skipped += 1;
            }
        }
    }
    flow.finish();

    log::debug!(
        "Linear sweep completed in {:?}: {} instructions, skipped {} bytes",
        start_time.elapsed(),
        flow.instructions.len(),
        skipped
    );
    Ok(flow)
}
