//! Core IR, traits, and dispatch for the Z80 call-graph analyser.
//!
//! This library takes a raw Z80 machine-code image (an Amstrad CPC program, typically),
//! recovers instruction boundaries by following control flow from seed entry points,
//! builds a subroutine call graph with call-frequency statistics, and partitions the
//! image into code, data, and unknown regions.
//!
//! # Basic Usage
//!
//! ```rust,no_run
//! use z80_callgraph::{
//!     analysis::{analyze, AnalysisConfig},
//!     decoder::Z80Decoder,
//!     image::load_file,
//! };
//!
//! // Load the image (AMSDOS headers are detected and stripped)
//! let loaded = load_file("game.bin", None).unwrap();
//!
//! let mut config = AnalysisConfig::default();
//! config.seeds.push(loaded.entry_point.unwrap_or(loaded.image.base()));
//!
//! let analysis = analyze(&loaded.image, &Z80Decoder::new(), &config).unwrap();
//!
//! for sub in analysis.call_graph.top(20) {
//!     println!("L{:04X}: {} calls", sub.entry, sub.call_count());
//! }
//! ```

pub mod image;
pub mod decoder;
pub mod strategy;
pub mod callgraph;
pub mod region;
pub mod analysis;
pub mod format;
mod large_tests;
#[cfg(feature = "extension-module")]
pub mod python;

use std::collections::BTreeMap;
use std::fmt;

use crate::decoder::DecoderError;
use crate::image::{ByteImage, ImageError};

/// Represents an address in the Z80 address space.
///
/// Wider than 16 bits so that the exclusive end of an image loaded flush against the
/// top of memory (`0x10000`) is still representable.
pub type Address = u32;

/// Size of the Z80 address space in bytes.
pub const ADDRESS_SPACE: Address = 0x1_0000;

/// Maximum instruction size in bytes
pub const MAX_INSTRUCTION_SIZE: usize = 4;

/// How an instruction affects the address executed next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlKind {
    /// Execution continues at the next instruction
    Sequential,
    /// `JP nn`, `JR e`, `JP (HL)`
    Jump,
    /// `JP cc,nn`, `JR cc,e`, `DJNZ e`
    ConditionalJump,
    /// `CALL nn`
    Call,
    /// `CALL cc,nn`
    ConditionalCall,
    /// `RET`, `RETI`, `RETN`
    Return,
    /// `RET cc`
    ConditionalReturn,
    /// `RST p`
    Restart,
}

impl ControlKind {
    /// Returns true for `CALL` and `CALL cc`.
    pub fn is_call(&self) -> bool {
        matches!(self, ControlKind::Call | ControlKind::ConditionalCall)
    }

    /// Returns true for `JP`/`JR`/`DJNZ` in both forms.
    pub fn is_jump(&self) -> bool {
        matches!(self, ControlKind::Jump | ControlKind::ConditionalJump)
    }

    /// Returns true if control may reach the next sequential instruction.
    pub fn falls_through(&self, restart_returns: bool) -> bool {
        match self {
            ControlKind::Jump | ControlKind::Return => false,
            ControlKind::Restart => restart_returns,
            _ => true,
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlKind::Sequential => "sequential",
            ControlKind::Jump => "jump",
            ControlKind::ConditionalJump => "conditional-jump",
            ControlKind::Call => "call",
            ControlKind::ConditionalCall => "conditional-call",
            ControlKind::Return => "return",
            ControlKind::ConditionalReturn => "conditional-return",
            ControlKind::Restart => "restart",
        };
        f.write_str(name)
    }
}

/// One instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// Register or register pair (`A`, `HL`, `IXH`, `AF'`)
    Reg(&'static str),
    /// Register-indirect memory or port (`(HL)`, `(SP)`, `(C)`)
    Indirect(&'static str),
    /// Indexed memory (`(IX+d)`)
    Indexed(&'static str, i8),
    /// 8-bit immediate
    Imm8(u8),
    /// 16-bit immediate
    Imm16(u16),
    /// Absolute memory operand (`(nn)`)
    Mem(u16),
    /// Immediate I/O port (`(n)`)
    Port(u8),
    /// Branch condition (`NZ`, `PE`, ...)
    Cond(&'static str),
    /// Bit number for `BIT`/`SET`/`RES`
    Bit(u8),
    /// Interrupt mode for `IM`
    Mode(u8),
    /// Statically known branch or call target
    Target(u16),
    /// Restart vector for `RST`
    Vector(u8),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => f.write_str(r),
            Operand::Indirect(r) => write!(f, "({})", r),
            Operand::Indexed(r, d) if *d < 0 => write!(f, "({}-&{:02X})", r, d.unsigned_abs()),
            Operand::Indexed(r, d) => write!(f, "({}+&{:02X})", r, d),
            Operand::Imm8(n) => write!(f, "&{:02X}", n),
            Operand::Imm16(nn) => write!(f, "&{:04X}", nn),
            Operand::Mem(nn) => write!(f, "(&{:04X})", nn),
            Operand::Port(n) => write!(f, "(&{:02X})", n),
            Operand::Cond(c) => f.write_str(c),
            Operand::Bit(b) => write!(f, "{}", b),
            Operand::Mode(m) => write!(f, "{}", m),
            Operand::Target(t) => write!(f, "&{:04X}", t),
            Operand::Vector(v) => write!(f, "&{:02X}", v),
        }
    }
}

/// One decoded Z80 instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Address of the instruction
    pub addr: Address,
    /// Size of the instruction in bytes (1-4)
    pub size: u8,
    /// Instruction mnemonic (e.g., "LD", "CALL")
    pub mnemonic: &'static str,
    /// Operands in assembler order
    pub operands: Vec<Operand>,
    /// Control-flow classification
    pub kind: ControlKind,
    /// Raw bytes of the instruction (up to MAX_INSTRUCTION_SIZE)
    pub bytes: [u8; MAX_INSTRUCTION_SIZE],
}

impl Instruction {
    /// Returns the instruction bytes, up to the actual instruction size.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.size as usize]
    }

    /// Address of the next sequential instruction, wrapping from `&FFFF` to `&0000`.
    pub fn next_addr(&self) -> Address {
        (self.addr + self.size as Address) % ADDRESS_SPACE
    }

    /// The branch, call or restart target, if it can be read off the encoding.
    ///
    /// `JP (HL)` and friends have no static target.
    pub fn target(&self) -> Option<Address> {
        self.operands.iter().find_map(|op| match op {
            Operand::Target(t) => Some(*t as Address),
            Operand::Vector(v) => Some(*v as Address),
            _ => None,
        })
    }

    /// Returns true if this instruction transfers control to a computed address.
    pub fn is_dynamic(&self) -> bool {
        matches!(self.kind, ControlKind::Jump | ControlKind::Call | ControlKind::ConditionalCall
            | ControlKind::ConditionalJump | ControlKind::Restart)
            && self.target().is_none()
    }

    /// Returns true if this instruction touches an I/O port.
    pub fn is_io(&self) -> bool {
        matches!(
            self.mnemonic,
            "IN" | "OUT" | "INI" | "IND" | "INIR" | "INDR" | "OUTI" | "OUTD" | "OTIR" | "OTDR"
        )
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic)?;
        for (i, op) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { "," })?;
            write!(f, "{}", op)?;
        }
        Ok(())
    }
}

/// Decoder trait: turns bytes at an address into an [`Instruction`].
pub trait Decoder: Send + Sync {
    /// Decode a single instruction at `at`.
    ///
    /// # Arguments
    /// * `image` - The image to decode from
    /// * `at` - Absolute address of the first byte
    ///
    /// # Returns
    /// The instruction, or why no instruction starts at `at`
    fn decode(&self, image: &ByteImage, at: Address) -> Result<Instruction, DecoderError>;
}

/// Decode status of one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressStatus {
    /// Never reached by flow recovery
    Unvisited,
    /// On the worklist, not yet decoded
    Queued,
    /// Start or body byte of a decoded instruction
    Code,
    /// Decoding was attempted here and failed
    Undecodable,
}

/// Why control passes from one address to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// Next sequential instruction
    FallThrough,
    /// Unconditional jump
    Jump,
    /// Taken side of a conditional jump
    Branch,
    /// Call (conditional or not)
    Call,
    /// `RST` vector
    Restart,
}

/// One recovered control-flow edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowEdge {
    /// Address of the instruction the edge leaves
    pub from: Address,
    /// Successor address (may lie outside the image)
    pub to: Address,
    /// Edge classification
    pub kind: EdgeKind,
}

/// Output of a flow-recovery strategy: every decoded instruction and every failure.
#[derive(Debug, Clone, Default)]
pub struct FlowMap {
    /// Seeds the traversal started from
    pub seeds: Vec<Address>,
    /// Decoded instructions keyed by address
    pub instructions: BTreeMap<Address, Instruction>,
    /// Addresses where decoding failed
    pub undecodable: BTreeMap<Address, DecoderError>,
    /// Control-flow edges, sorted by `(from, to, kind)`
    pub edges: Vec<FlowEdge>,
}

impl FlowMap {
    /// Create an empty map for a traversal starting at `seeds`.
    pub fn new(seeds: Vec<Address>) -> Self {
        Self {
            seeds,
            ..Self::default()
        }
    }

    /// Get the number of decoded instructions
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// Get the instruction starting at `addr`
    pub fn instruction_at(&self, addr: Address) -> Option<&Instruction> {
        self.instructions.get(&addr)
    }

    /// Edges whose target lies outside `image`.
    pub fn external_edges<'a>(&'a self, image: &'a ByteImage) -> impl Iterator<Item = &'a FlowEdge> + 'a {
        self.edges.iter().filter(move |e| !image.contains(e.to))
    }

    /// Per-byte status over `image`: bytes covered by any decoded instruction are
    /// `Code`, failed decode addresses outside any instruction are `Undecodable`,
    /// everything else is `Unvisited`.
    pub fn coverage(&self, image: &ByteImage) -> Vec<AddressStatus> {
        let mut status = vec![AddressStatus::Unvisited; image.len()];
        for addr in self.undecodable.keys() {
            if let Some(off) = image.offset_of(*addr) {
                status[off] = AddressStatus::Undecodable;
            }
        }
        for insn in self.instructions.values() {
            for i in 0..insn.size as Address {
                if let Some(off) = image.offset_of((insn.addr + i) % ADDRESS_SPACE) {
                    status[off] = AddressStatus::Code;
                }
            }
        }
        status
    }

    /// Put edges into canonical order so results do not depend on traversal order.
    pub fn finish(&mut self) {
        self.edges.sort_unstable();
        self.edges.dedup();
    }
}

/// Parse an address written as `0x1234`, `&1234`, `$1234`, `1234h` or bare hex.
pub fn parse_address(text: &str) -> Result<Address, AnalysisError> {
    let t = text.trim();
    let digits = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .or_else(|| t.strip_prefix('&'))
        .or_else(|| t.strip_prefix('$'))
        .or_else(|| t.strip_suffix('h'))
        .or_else(|| t.strip_suffix('H'))
        .unwrap_or(t);
    let value = u32::from_str_radix(digits, 16)
        .map_err(|_| AnalysisError::Generic(format!("invalid address: {}", text)))?;
    if value >= ADDRESS_SPACE {
        return Err(AnalysisError::Generic(format!("address out of Z80 range: {}", text)));
    }
    Ok(value)
}

/// Error type for analysis runs
#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// The image could not be constructed or read
    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    /// None of the supplied seed addresses lies inside the image
    #[error("No valid seed address (tried {tried} seed(s), image spans 0x{start:04x}..0x{end:04x})")]
    NoValidSeed {
        tried: usize,
        start: Address,
        end: Address,
    },

    /// Output formatting failed
    #[error("Format error: {0}")]
    Format(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Generic(String),
}
