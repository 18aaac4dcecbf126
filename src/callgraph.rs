//! Subroutine discovery and call-frequency statistics.
//!
//! Every `CALL`/`CALL cc` with a literal target becomes a call edge, and the first
//! edge to reach an address creates the [`Subroutine`] for it. Instructions are
//! visited in ascending address order, so the call-site list of each subroutine is
//! ascending as well and frequency reports are reproducible.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::analysis::AnalysisContext;
use crate::{Address, ControlKind, FlowMap, ADDRESS_SPACE};

/// A routine reached by at least one `CALL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subroutine {
    /// Entry address (the call target)
    pub entry: Address,
    /// Addresses of the `CALL` instructions reaching this entry, ascending
    pub call_sites: Vec<Address>,
    /// Addresses of `JP`/`JR` instructions that also land on this entry
    pub jump_sites: Vec<Address>,
    /// First `RET`, `RETI` or `RETN` found walking forward from the entry; `RET cc` is skipped
    pub first_return: Option<Address>,
    /// Entry lies outside the image (firmware jumpblock, ROM)
    pub external: bool,
}

impl Subroutine {
    fn new(entry: Address, external: bool) -> Self {
        Self {
            entry,
            call_sites: Vec::new(),
            jump_sites: Vec::new(),
            first_return: None,
            external,
        }
    }

    /// Number of call sites
    pub fn call_count(&self) -> usize {
        self.call_sites.len()
    }
}

/// One resolved call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallEdge {
    /// Address of the `CALL` instruction
    pub site: Address,
    /// Entry address of the callee
    pub target: Address,
    /// `CALL cc,nn`
    pub conditional: bool,
}

/// A call or jump whose destination is computed at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UnresolvedTarget {
    /// Address of the instruction
    pub site: Address,
    /// How it transfers control
    pub kind: ControlKind,
}

/// Subroutines keyed by entry address, plus every call edge in site order.
#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    subroutines: BTreeMap<Address, Subroutine>,
    edges: Vec<CallEdge>,
    unresolved: Vec<UnresolvedTarget>,
}

impl CallGraph {
    /// Subroutine with the given entry address
    pub fn get(&self, entry: Address) -> Option<&Subroutine> {
        self.subroutines.get(&entry)
    }

    /// Subroutines in entry-address order
    pub fn subroutines(&self) -> impl Iterator<Item = &Subroutine> {
        self.subroutines.values()
    }

    /// Call edges in ascending site order
    pub fn edges(&self) -> &[CallEdge] {
        &self.edges
    }

    /// Dynamic calls and jumps, in ascending site order
    pub fn unresolved(&self) -> &[UnresolvedTarget] {
        &self.unresolved
    }

    /// Number of subroutines
    pub fn len(&self) -> usize {
        self.subroutines.len()
    }

    /// Returns true if no call was found
    pub fn is_empty(&self) -> bool {
        self.subroutines.is_empty()
    }

    /// Subroutines sorted by call count (descending), then entry address (ascending).
    pub fn by_frequency(&self) -> Vec<&Subroutine> {
        let mut subs: Vec<&Subroutine> = self.subroutines.values().collect();
        subs.sort_by(|a, b| b.call_count().cmp(&a.call_count()).then(a.entry.cmp(&b.entry)));
        subs
    }

    /// The `n` most frequently called subroutines.
    pub fn top(&self, n: usize) -> Vec<&Subroutine> {
        let mut subs = self.by_frequency();
        subs.truncate(n);
        subs
    }

    fn record_call(&mut self, site: Address, target: Address, conditional: bool, external: bool) {
        self.edges.push(CallEdge {
            site,
            target,
            conditional,
        });
        self.subroutines
            .entry(target)
            .or_insert_with(|| Subroutine::new(target, external))
            .call_sites
            .push(site);
    }
}

/// Build the call graph from a finished flow map.
///
/// `RST` vectors are not treated as subroutines; they show up as restart edges in
/// the flow map instead.
pub fn build(ctx: &AnalysisContext<'_>, flow: &FlowMap) -> CallGraph {
    let mut graph = CallGraph::default();

    for insn in flow.instructions.values() {
        match (insn.kind.is_call(), insn.target()) {
            (true, Some(target)) => graph.record_call(
                insn.addr,
                target,
                insn.kind == ControlKind::ConditionalCall,
                !ctx.image.contains(target),
            ),
            _ if insn.is_dynamic() => {
                log::debug!("0x{:04x}: unresolved {} ({})", insn.addr, insn.kind, insn);
                graph.unresolved.push(UnresolvedTarget {
                    site: insn.addr,
                    kind: insn.kind,
                });
            }
            _ => {}
        }
    }

    // Jumps onto a known entry (tail calls, shared exits)
    for insn in flow.instructions.values().filter(|i| i.kind.is_jump()) {
        if let Some(sub) = insn.target().and_then(|t| graph.subroutines.get_mut(&t)) {
            sub.jump_sites.push(insn.addr);
        }
    }

    for sub in graph.subroutines.values_mut().filter(|s| !s.external) {
        sub.first_return = first_return(flow, sub.entry);
    }

    log::debug!(
        "Call graph: {} subroutines, {} call edges, {} unresolved",
        graph.subroutines.len(),
        graph.edges.len(),
        graph.unresolved.len()
    );
    graph
}

/// Walk contiguous decoded instructions from `entry` to the first `RET`/`RETI`/`RETN`.
///
/// A conditional `RET cc` does not end the walk; `RETI` and `RETN` do. Stops at the
/// first gap in decoded code, so a routine that jumps away before returning yields
/// `None`. The walk wraps at `&FFFF` and gives up once it has covered the whole
/// address space.
fn first_return(flow: &FlowMap, entry: Address) -> Option<Address> {
    let mut at = entry;
    let mut walked: Address = 0;
    loop {
        let insn = flow.instruction_at(at)?;
        if insn.kind == ControlKind::Return {
            return Some(at);
        }
        walked += insn.size as Address;
        if walked >= ADDRESS_SPACE {
            return None;
        }
        at = insn.next_addr();
    }
}
