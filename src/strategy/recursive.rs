//! Recursive descent flow recovery

use std::collections::VecDeque;
use std::time::Instant;

use crate::analysis::AnalysisContext;
use crate::strategy::{successors, WorkOrder};
use crate::{Address, AddressStatus, AnalysisError, FlowEdge, FlowMap};

/// Recursive-descent flow recovery.
///
/// Starts from the context's seed addresses and follows every statically known
/// successor until the worklist is empty. Addresses that fail to decode are recorded
/// and become dead ends; the pass itself never fails once the context is valid.
///
/// # Arguments
/// * `ctx` - Image, decoder, seeds and options for the run
///
/// # Returns
/// The discovered-instruction map with its flow edges
pub fn run(ctx: &AnalysisContext<'_>) -> Result<FlowMap, AnalysisError> {
    log::debug!(
        "Starting recursive descent over {} bytes from {} seed(s)",
        ctx.image.len(),
        ctx.seeds().len()
    );
    let start_time = Instant::now();

    let mut recoverer = FlowRecoverer::new(ctx);
    for &seed in ctx.seeds() {
        recoverer.enqueue(seed);
    }
    recoverer.drain();
    let flow = recoverer.finish();

    log::debug!(
        "Recursive descent complete in {:?}: {} instructions, {} undecodable",
        start_time.elapsed(),
        flow.instructions.len(),
        flow.undecodable.len()
    );
    Ok(flow)
}

/// Worklist state for one recursive-descent pass.
pub struct FlowRecoverer<'c, 'a> {
    ctx: &'c AnalysisContext<'a>,
    status: Vec<AddressStatus>,
    worklist: VecDeque<Address>,
    flow: FlowMap,
}

impl<'c, 'a> FlowRecoverer<'c, 'a> {
    /// Create a recoverer with every address unvisited.
    pub fn new(ctx: &'c AnalysisContext<'a>) -> Self {
        Self {
            ctx,
            status: vec![AddressStatus::Unvisited; ctx.image.len()],
            worklist: VecDeque::new(),
            flow: FlowMap::new(ctx.seeds().to_vec()),
        }
    }

    /// Status of the instruction that would start at `addr`.
    pub fn status(&self, addr: Address) -> Option<AddressStatus> {
        self.ctx.image.offset_of(addr).map(|off| self.status[off])
    }

    /// Put `addr` on the worklist unless it is outside the image or already seen.
    pub fn enqueue(&mut self, addr: Address) -> bool {
        let Some(off) = self.ctx.image.offset_of(addr) else {
            return false;
        };
        if self.status[off] != AddressStatus::Unvisited {
            return false;
        }
        self.status[off] = AddressStatus::Queued;
        self.worklist.push_back(addr);
        true
    }

    fn pop(&mut self) -> Option<Address> {
        match self.ctx.config.order {
            WorkOrder::BreadthFirst => self.worklist.pop_front(),
            WorkOrder::DepthFirst => self.worklist.pop_back(),
        }
    }

    /// Decode one address and queue its successors.
    pub fn step(&mut self, addr: Address) {
        let Some(off) = self.ctx.image.offset_of(addr) else {
            return;
        };
        if matches!(self.status[off], AddressStatus::Code | AddressStatus::Undecodable) {
            return;
        }

        match self.ctx.decoder.decode(self.ctx.image, addr) {
            Ok(insn) => {
                log::trace!("0x{:04x}: {}", addr, insn);
                self.status[off] = AddressStatus::Code;
                for (to, kind) in successors(&insn, self.ctx.config.restart_returns) {
                    self.flow.edges.push(FlowEdge { from: addr, to, kind });
                    if !self.ctx.image.contains(to) {
                        log::trace!("0x{:04x}: {:?} edge leaves the image at 0x{:04x}", addr, kind, to);
                        continue;
                    }
                    self.enqueue(to);
                }
                self.flow.instructions.insert(addr, insn);
            }
            Err(err) => {
                log::trace!("0x{:04x}: {}", addr, err);
                self.status[off] = AddressStatus::Undecodable;
                self.flow.undecodable.insert(addr, err);
            }
        }
    }

    /// Process the worklist until it is empty.
    pub fn drain(&mut self) {
        while let Some(addr) = self.pop() {
            self.step(addr);
        }
    }

    /// Hand over the discovered-instruction map.
    pub fn finish(mut self) -> FlowMap {
        self.flow.finish();
        self.flow
    }
}
