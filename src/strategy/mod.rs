//! Flow-recovery strategies

use std::fmt;
use clap::ValueEnum;
use crate::analysis::AnalysisContext;
use crate::{Address, AnalysisError, ControlKind, EdgeKind, FlowMap, Instruction};

/// Available flow-recovery strategies.
#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Recursive descent from the seed addresses (control-flow analysis)
    #[default]
    Recursive,
    /// Linear sweep from the image base, resynchronising after bad bytes
    Linear,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Recursive => write!(f, "Recursive descent"),
            Strategy::Linear => write!(f, "Linear sweep"),
        }
    }
}

impl Strategy {
    /// Run the selected strategy over the context's image.
    pub fn run(&self, ctx: &AnalysisContext<'_>) -> Result<FlowMap, AnalysisError> {
        match self {
            Strategy::Recursive => recursive::run(ctx),
            Strategy::Linear => linear::run(ctx),
        }
    }

    /// Return all available strategies
    pub fn all() -> &'static [Strategy] {
        &[Strategy::Recursive, Strategy::Linear]
    }
}

/// Worklist discipline for recursive descent.
///
/// The recovered instruction set is the same either way; only the order in which
/// addresses are visited (and logged) differs.
#[derive(Copy, Clone, ValueEnum, Debug, PartialEq, Eq, Default)]
pub enum WorkOrder {
    /// FIFO queue
    #[default]
    BreadthFirst,
    /// LIFO stack
    DepthFirst,
}

/// Successor addresses of `insn` and the kind of edge leading to each.
///
/// Targets are not range-checked; a call into ROM yields an edge that leaves the image.
pub fn successors(insn: &Instruction, restart_returns: bool) -> Vec<(Address, EdgeKind)> {
    let mut out = Vec::with_capacity(2);
    let target = insn.target();

    match insn.kind {
        ControlKind::Jump => out.extend(target.map(|t| (t, EdgeKind::Jump))),
        ControlKind::ConditionalJump => out.extend(target.map(|t| (t, EdgeKind::Branch))),
        ControlKind::Call | ControlKind::ConditionalCall => {
            out.extend(target.map(|t| (t, EdgeKind::Call)))
        }
        ControlKind::Restart => out.extend(target.map(|t| (t, EdgeKind::Restart))),
        ControlKind::Sequential | ControlKind::Return | ControlKind::ConditionalReturn => {}
    }
    if insn.kind.falls_through(restart_returns) {
        out.push((insn.next_addr(), EdgeKind::FallThrough));
    }
    out
}

pub mod recursive;
pub mod linear;
