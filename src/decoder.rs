//! Table-driven Z80 instruction decoder.
//!
//! Opcodes are split into the usual `x`/`y`/`z`/`p`/`q` bit fields and decoded per
//! prefix group (unprefixed, `CB`, `ED`, `DD`/`FD`, `DDCB`/`FDCB`). Undocumented but
//! well-defined forms (`SLL`, `IXH`/`IXL` halves, `IN F,(C)`, `OUT (C),0`, the `NEG`
//! and `RETN` mirrors) are accepted. Sequences the CPU treats as no-ops are rejected:
//! an index prefix in front of an opcode that never touches `HL`, `H`, `L` or `(HL)`,
//! the empty regions of the `ED` table, and `DDCB` forms that also write a register.

use std::fmt;

use crate::image::ByteImage;
use crate::{Address, ControlKind, Decoder, Instruction, Operand, ADDRESS_SPACE, MAX_INSTRUCTION_SIZE};

use ControlKind::*;
use Operand::*;

/// Errors that can occur during decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecoderError {
    /// No Z80 encoding matches the bytes
    #[error("Invalid opcode 0x{opcode:02x} at 0x{address:04x} (offending byte 0x{offending:02x})")]
    InvalidOpcode {
        /// Address of the first byte
        address: Address,
        /// First byte of the sequence
        opcode: u8,
        /// The byte that failed to complete the encoding
        offending: u8,
    },

    /// Decoding was requested outside the image
    #[error("Address 0x{0:04x} is outside the image bounds")]
    OutOfRange(Address),

    /// The instruction's operands run past the end of the image
    #[error("Instruction at 0x{0:04x} is truncated by the end of the image")]
    Truncated(Address),
}

impl DecoderError {
    /// Address the error refers to
    pub fn address(&self) -> Address {
        match self {
            DecoderError::InvalidOpcode { address, .. } => *address,
            DecoderError::OutOfRange(a) | DecoderError::Truncated(a) => *a,
        }
    }
}

const R: [&str; 8] = ["B", "C", "D", "E", "H", "L", "(HL)", "A"];
const RP: [&str; 4] = ["BC", "DE", "HL", "SP"];
const RP2: [&str; 4] = ["BC", "DE", "HL", "AF"];
const CC: [&str; 8] = ["NZ", "Z", "NC", "C", "PO", "PE", "P", "M"];
const ALU: [&str; 8] = ["ADD", "ADC", "SUB", "SBC", "AND", "XOR", "OR", "CP"];
const ROT: [&str; 8] = ["RLC", "RRC", "RL", "RR", "SLA", "SRA", "SLL", "SRL"];
const ACC: [&str; 8] = ["RLCA", "RRCA", "RLA", "RRA", "DAA", "CPL", "SCF", "CCF"];
const IM: [u8; 8] = [0, 0, 1, 2, 0, 0, 1, 2];
const BLOCK: [[&str; 4]; 4] = [
    ["LDI", "CPI", "INI", "OUTI"],
    ["LDD", "CPD", "IND", "OUTD"],
    ["LDIR", "CPIR", "INIR", "OTIR"],
    ["LDDR", "CPDR", "INDR", "OTDR"],
];

/// Which register pair stands in for `HL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Index {
    HL,
    IX,
    IY,
}

/// Decoder for the Z80 instruction set.
#[derive(Debug, Default, Clone, Copy)]
pub struct Z80Decoder;

impl Z80Decoder {
    /// Create a decoder
    pub fn new() -> Self {
        Z80Decoder
    }
}

impl fmt::Display for Z80Decoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Z80Decoder")
    }
}

impl Decoder for Z80Decoder {
    fn decode(&self, image: &ByteImage, at: Address) -> Result<Instruction, DecoderError> {
        if !image.contains(at) {
            return Err(DecoderError::OutOfRange(at));
        }
        let mut d = Decoding::new(image, at);
        match d.next()? {
            0xcb => d.cb(),
            0xed => d.ed(),
            prefix @ (0xdd | 0xfd) => {
                d.index = if prefix == 0xdd { Index::IX } else { Index::IY };
                match d.next()? {
                    0xcb => d.index_cb(),
                    op @ (0xdd | 0xed | 0xfd) => Err(d.invalid(op)),
                    op => d.main(op),
                }
            }
            op => d.main(op),
        }
    }
}

/// State for one in-progress decode.
struct Decoding<'a> {
    image: &'a ByteImage,
    start: Address,
    bytes: [u8; MAX_INSTRUCTION_SIZE],
    len: usize,
    index: Index,
    // Set once an operand actually used the index register.
    substituted: bool,
}

impl<'a> Decoding<'a> {
    fn new(image: &'a ByteImage, start: Address) -> Self {
        Self {
            image,
            start,
            bytes: [0; MAX_INSTRUCTION_SIZE],
            len: 0,
            index: Index::HL,
            substituted: false,
        }
    }

    fn next(&mut self) -> Result<u8, DecoderError> {
        if self.len >= MAX_INSTRUCTION_SIZE {
            return Err(self.invalid(self.bytes[self.len - 1]));
        }
        let b = self
            .image
            .read((self.start + self.len as Address) % ADDRESS_SPACE)
            .map_err(|_| DecoderError::Truncated(self.start))?;
        self.bytes[self.len] = b;
        self.len += 1;
        Ok(b)
    }

    fn word(&mut self) -> Result<u16, DecoderError> {
        let lo = self.next()?;
        let hi = self.next()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Relative branch target; only used by 2-byte unprefixed instructions.
    fn rel(&mut self) -> Result<u16, DecoderError> {
        let e = self.next()? as i8;
        Ok((self.start as i32 + 2 + e as i32) as u16)
    }

    fn invalid(&self, offending: u8) -> DecoderError {
        DecoderError::InvalidOpcode {
            address: self.start,
            opcode: self.bytes[0],
            offending,
        }
    }

    fn hl(&mut self) -> &'static str {
        match self.index {
            Index::HL => "HL",
            Index::IX => {
                self.substituted = true;
                "IX"
            }
            Index::IY => {
                self.substituted = true;
                "IY"
            }
        }
    }

    fn half(&mut self, high: bool) -> &'static str {
        match (self.index, high) {
            (Index::HL, true) => "H",
            (Index::HL, false) => "L",
            (Index::IX, h) => {
                self.substituted = true;
                if h { "IXH" } else { "IXL" }
            }
            (Index::IY, h) => {
                self.substituted = true;
                if h { "IYH" } else { "IYL" }
            }
        }
    }

    fn hl_mem(&mut self) -> Result<Operand, DecoderError> {
        if self.index == Index::HL {
            return Ok(Indirect("HL"));
        }
        let reg = self.hl();
        let d = self.next()? as i8;
        Ok(Indexed(reg, d))
    }

    /// 8-bit register operand. `halves` is false when the same instruction also
    /// names `(HL)`, in which case a prefix leaves `H` and `L` alone.
    fn r(&mut self, i: u8, halves: bool) -> Result<Operand, DecoderError> {
        Ok(match i {
            4 if halves => Reg(self.half(true)),
            5 if halves => Reg(self.half(false)),
            6 => self.hl_mem()?,
            _ => Reg(R[i as usize]),
        })
    }

    fn rp(&mut self, p: u8) -> &'static str {
        if p == 2 { self.hl() } else { RP[p as usize] }
    }

    fn rp2(&mut self, p: u8) -> &'static str {
        if p == 2 { self.hl() } else { RP2[p as usize] }
    }

    fn emit(
        &self,
        mnemonic: &'static str,
        operands: Vec<Operand>,
        kind: ControlKind,
    ) -> Result<Instruction, DecoderError> {
        if self.index != Index::HL && !self.substituted {
            return Err(self.invalid(self.bytes[1]));
        }
        Ok(Instruction {
            addr: self.start,
            size: self.len as u8,
            mnemonic,
            operands,
            kind,
            bytes: self.bytes,
        })
    }

    fn alu(&self, y: u8, src: Operand) -> Result<Instruction, DecoderError> {
        let operands = match y {
            0 | 1 | 3 => vec![Reg("A"), src],
            _ => vec![src],
        };
        self.emit(ALU[y as usize], operands, Sequential)
    }

    /// Unprefixed table, also used behind `DD`/`FD`.
    fn main(mut self, op: u8) -> Result<Instruction, DecoderError> {
        let (x, y, z) = (op >> 6, (op >> 3) & 7, op & 7);
        let (p, q) = (y >> 1, y & 1);

        match x {
            0 => match z {
                0 => match y {
                    0 => self.emit("NOP", vec![], Sequential),
                    1 => self.emit("EX", vec![Reg("AF"), Reg("AF'")], Sequential),
                    2 => {
                        let t = self.rel()?;
                        self.emit("DJNZ", vec![Target(t)], ConditionalJump)
                    }
                    3 => {
                        let t = self.rel()?;
                        self.emit("JR", vec![Target(t)], Jump)
                    }
                    _ => {
                        let t = self.rel()?;
                        self.emit("JR", vec![Cond(CC[(y - 4) as usize]), Target(t)], ConditionalJump)
                    }
                },
                1 if q == 0 => {
                    let dst = self.rp(p);
                    let nn = self.word()?;
                    self.emit("LD", vec![Reg(dst), Imm16(nn)], Sequential)
                }
                1 => {
                    let dst = self.hl();
                    let src = self.rp(p);
                    self.emit("ADD", vec![Reg(dst), Reg(src)], Sequential)
                }
                2 => {
                    let operands = match (q, p) {
                        (0, 0) => vec![Indirect("BC"), Reg("A")],
                        (0, 1) => vec![Indirect("DE"), Reg("A")],
                        (0, 2) => {
                            let nn = self.word()?;
                            vec![Mem(nn), Reg(self.hl())]
                        }
                        (0, _) => vec![Mem(self.word()?), Reg("A")],
                        (_, 0) => vec![Reg("A"), Indirect("BC")],
                        (_, 1) => vec![Reg("A"), Indirect("DE")],
                        (_, 2) => {
                            let dst = self.hl();
                            vec![Reg(dst), Mem(self.word()?)]
                        }
                        _ => vec![Reg("A"), Mem(self.word()?)],
                    };
                    self.emit("LD", operands, Sequential)
                }
                3 => {
                    let reg = self.rp(p);
                    self.emit(if q == 0 { "INC" } else { "DEC" }, vec![Reg(reg)], Sequential)
                }
                4 => {
                    let dst = self.r(y, true)?;
                    self.emit("INC", vec![dst], Sequential)
                }
                5 => {
                    let dst = self.r(y, true)?;
                    self.emit("DEC", vec![dst], Sequential)
                }
                6 => {
                    let dst = self.r(y, true)?;
                    let n = self.next()?;
                    self.emit("LD", vec![dst, Imm8(n)], Sequential)
                }
                _ => self.emit(ACC[y as usize], vec![], Sequential),
            },
            1 if y == 6 && z == 6 => self.emit("HALT", vec![], Sequential),
            1 => {
                let halves = y != 6 && z != 6;
                let dst = self.r(y, halves)?;
                let src = self.r(z, halves)?;
                self.emit("LD", vec![dst, src], Sequential)
            }
            2 => {
                let src = self.r(z, true)?;
                self.alu(y, src)
            }
            _ => match z {
                0 => self.emit("RET", vec![Cond(CC[y as usize])], ConditionalReturn),
                1 if q == 0 => {
                    let reg = self.rp2(p);
                    self.emit("POP", vec![Reg(reg)], Sequential)
                }
                1 => match p {
                    0 => self.emit("RET", vec![], Return),
                    1 => self.emit("EXX", vec![], Sequential),
                    2 => {
                        let reg = self.hl();
                        self.emit("JP", vec![Indirect(reg)], Jump)
                    }
                    _ => {
                        let reg = self.hl();
                        self.emit("LD", vec![Reg("SP"), Reg(reg)], Sequential)
                    }
                },
                2 => {
                    let nn = self.word()?;
                    self.emit("JP", vec![Cond(CC[y as usize]), Target(nn)], ConditionalJump)
                }
                3 => match y {
                    0 => {
                        let nn = self.word()?;
                        self.emit("JP", vec![Target(nn)], Jump)
                    }
                    2 => {
                        let n = self.next()?;
                        self.emit("OUT", vec![Port(n), Reg("A")], Sequential)
                    }
                    3 => {
                        let n = self.next()?;
                        self.emit("IN", vec![Reg("A"), Port(n)], Sequential)
                    }
                    4 => {
                        let reg = self.hl();
                        self.emit("EX", vec![Indirect("SP"), Reg(reg)], Sequential)
                    }
                    5 => self.emit("EX", vec![Reg("DE"), Reg("HL")], Sequential),
                    6 => self.emit("DI", vec![], Sequential),
                    7 => self.emit("EI", vec![], Sequential),
                    // CB is dispatched before reaching the main table
                    _ => Err(self.invalid(op)),
                },
                4 => {
                    let nn = self.word()?;
                    self.emit("CALL", vec![Cond(CC[y as usize]), Target(nn)], ConditionalCall)
                }
                5 if q == 0 => {
                    let reg = self.rp2(p);
                    self.emit("PUSH", vec![Reg(reg)], Sequential)
                }
                5 if p == 0 => {
                    let nn = self.word()?;
                    self.emit("CALL", vec![Target(nn)], Call)
                }
                // DD, ED and FD are dispatched before reaching the main table
                5 => Err(self.invalid(op)),
                6 => {
                    let n = self.next()?;
                    self.alu(y, Imm8(n))
                }
                _ => self.emit("RST", vec![Vector(y * 8)], Restart),
            },
        }
    }

    fn bit_op(&self, op: u8, target: Operand) -> Result<Instruction, DecoderError> {
        let (x, y) = (op >> 6, (op >> 3) & 7);
        match x {
            0 => self.emit(ROT[y as usize], vec![target], Sequential),
            1 => self.emit("BIT", vec![Bit(y), target], Sequential),
            2 => self.emit("RES", vec![Bit(y), target], Sequential),
            _ => self.emit("SET", vec![Bit(y), target], Sequential),
        }
    }

    fn cb(mut self) -> Result<Instruction, DecoderError> {
        let op = self.next()?;
        let target = self.r(op & 7, false)?;
        self.bit_op(op, target)
    }

    fn index_cb(mut self) -> Result<Instruction, DecoderError> {
        let d = self.next()? as i8;
        let op = self.next()?;
        if op & 7 != 6 {
            return Err(self.invalid(op));
        }
        let reg = self.hl();
        self.bit_op(op, Indexed(reg, d))
    }

    fn ed(mut self) -> Result<Instruction, DecoderError> {
        let op = self.next()?;
        let (x, y, z) = (op >> 6, (op >> 3) & 7, op & 7);
        let (p, q) = (y >> 1, y & 1);

        match (x, z) {
            (1, 0) => {
                let dst = if y == 6 { Reg("F") } else { Reg(R[y as usize]) };
                self.emit("IN", vec![dst, Indirect("C")], Sequential)
            }
            (1, 1) => {
                let src = if y == 6 { Imm8(0) } else { Reg(R[y as usize]) };
                self.emit("OUT", vec![Indirect("C"), src], Sequential)
            }
            (1, 2) => {
                let m = if q == 0 { "SBC" } else { "ADC" };
                self.emit(m, vec![Reg("HL"), Reg(RP[p as usize])], Sequential)
            }
            (1, 3) => {
                let nn = self.word()?;
                let operands = if q == 0 {
                    vec![Mem(nn), Reg(RP[p as usize])]
                } else {
                    vec![Reg(RP[p as usize]), Mem(nn)]
                };
                self.emit("LD", operands, Sequential)
            }
            (1, 4) => self.emit("NEG", vec![], Sequential),
            (1, 5) if y == 1 => self.emit("RETI", vec![], Return),
            (1, 5) => self.emit("RETN", vec![], Return),
            (1, 6) => self.emit("IM", vec![Mode(IM[y as usize])], Sequential),
            (1, 7) => match y {
                0 => self.emit("LD", vec![Reg("I"), Reg("A")], Sequential),
                1 => self.emit("LD", vec![Reg("R"), Reg("A")], Sequential),
                2 => self.emit("LD", vec![Reg("A"), Reg("I")], Sequential),
                3 => self.emit("LD", vec![Reg("A"), Reg("R")], Sequential),
                4 => self.emit("RRD", vec![], Sequential),
                5 => self.emit("RLD", vec![], Sequential),
                _ => Err(self.invalid(op)),
            },
            (2, z) if z <= 3 && y >= 4 => {
                self.emit(BLOCK[(y - 4) as usize][z as usize], vec![], Sequential)
            }
            _ => Err(self.invalid(op)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decode_bytes(bytes: &[u8]) -> Result<Instruction, DecoderError> {
        let image = ByteImage::new(0x100, bytes.to_vec()).unwrap();
        Z80Decoder::new().decode(&image, 0x100)
    }

    #[rstest]
    #[case(&[0x00], "NOP", ControlKind::Sequential)]
    #[case(&[0x08], "EX AF,AF'", ControlKind::Sequential)]
    #[case(&[0x3e, 0x41], "LD A,&41", ControlKind::Sequential)]
    #[case(&[0x36, 0x00], "LD (HL),&00", ControlKind::Sequential)]
    #[case(&[0x22, 0x00, 0x40], "LD (&4000),HL", ControlKind::Sequential)]
    #[case(&[0x3a, 0x34, 0x12], "LD A,(&1234)", ControlKind::Sequential)]
    #[case(&[0xc6, 0x01], "ADD A,&01", ControlKind::Sequential)]
    #[case(&[0xfe, 0x20], "CP &20", ControlKind::Sequential)]
    #[case(&[0x90], "SUB B", ControlKind::Sequential)]
    #[case(&[0x76], "HALT", ControlKind::Sequential)]
    #[case(&[0xd3, 0xbc], "OUT (&BC),A", ControlKind::Sequential)]
    #[case(&[0xdb, 0xf4], "IN A,(&F4)", ControlKind::Sequential)]
    #[case(&[0xcd, 0x00, 0x10], "CALL &1000", ControlKind::Call)]
    #[case(&[0xc4, 0x34, 0x12], "CALL NZ,&1234", ControlKind::ConditionalCall)]
    #[case(&[0xc3, 0x00, 0x20], "JP &2000", ControlKind::Jump)]
    #[case(&[0xca, 0x00, 0x20], "JP Z,&2000", ControlKind::ConditionalJump)]
    #[case(&[0x18, 0xfe], "JR &0100", ControlKind::Jump)]
    #[case(&[0x20, 0x05], "JR NZ,&0107", ControlKind::ConditionalJump)]
    #[case(&[0x10, 0xfe], "DJNZ &0100", ControlKind::ConditionalJump)]
    #[case(&[0xc9], "RET", ControlKind::Return)]
    #[case(&[0xc0], "RET NZ", ControlKind::ConditionalReturn)]
    #[case(&[0xff], "RST &38", ControlKind::Restart)]
    #[case(&[0xe9], "JP (HL)", ControlKind::Jump)]
    #[case(&[0xcb, 0x7f], "BIT 7,A", ControlKind::Sequential)]
    #[case(&[0xcb, 0x36], "SLL (HL)", ControlKind::Sequential)]
    #[case(&[0xed, 0xb0], "LDIR", ControlKind::Sequential)]
    #[case(&[0xed, 0x4d], "RETI", ControlKind::Return)]
    #[case(&[0xed, 0x45], "RETN", ControlKind::Return)]
    #[case(&[0xed, 0x56], "IM 1", ControlKind::Sequential)]
    #[case(&[0xed, 0x78], "IN A,(C)", ControlKind::Sequential)]
    #[case(&[0xed, 0x71], "OUT (C),&00", ControlKind::Sequential)]
    #[case(&[0xed, 0x73, 0x00, 0xc0], "LD (&C000),SP", ControlKind::Sequential)]
    #[case(&[0xdd, 0xe9], "JP (IX)", ControlKind::Jump)]
    #[case(&[0xdd, 0x21, 0x34, 0x12], "LD IX,&1234", ControlKind::Sequential)]
    #[case(&[0xfd, 0x36, 0x05, 0x7f], "LD (IY+&05),&7F", ControlKind::Sequential)]
    #[case(&[0xdd, 0x7e, 0xfe], "LD A,(IX-&02)", ControlKind::Sequential)]
    #[case(&[0xdd, 0x66, 0x01], "LD H,(IX+&01)", ControlKind::Sequential)]
    #[case(&[0xdd, 0x7c], "LD A,IXH", ControlKind::Sequential)]
    #[case(&[0xdd, 0x09], "ADD IX,BC", ControlKind::Sequential)]
    #[case(&[0xdd, 0x29], "ADD IX,IX", ControlKind::Sequential)]
    #[case(&[0xfd, 0xe3], "EX (SP),IY", ControlKind::Sequential)]
    #[case(&[0xfd, 0xe5], "PUSH IY", ControlKind::Sequential)]
    #[case(&[0xdd, 0xcb, 0x02, 0x46], "BIT 0,(IX+&02)", ControlKind::Sequential)]
    #[case(&[0xfd, 0xcb, 0xff, 0xfe], "SET 7,(IY-&01)", ControlKind::Sequential)]
    fn test_decode_valid(#[case] bytes: &[u8], #[case] text: &str, #[case] kind: ControlKind) {
        let insn = decode_bytes(bytes).unwrap();
        assert_eq!(insn.to_string(), text);
        assert_eq!(insn.size as usize, bytes.len());
        assert_eq!(insn.bytes(), bytes);
        assert_eq!(insn.kind, kind);
    }

    #[rstest]
    #[case(&[0xed, 0x00])]
    #[case(&[0xed, 0x77])]
    #[case(&[0xed, 0xff])]
    #[case(&[0xdd, 0x00])]
    #[case(&[0xdd, 0xeb])]
    #[case(&[0xfd, 0xd9])]
    #[case(&[0xdd, 0xdd, 0x21, 0x00])]
    #[case(&[0xfd, 0xed, 0xb0])]
    #[case(&[0xdd, 0xcb, 0x00, 0x47])]
    fn test_decode_invalid(#[case] bytes: &[u8]) {
        match decode_bytes(bytes) {
            Err(DecoderError::InvalidOpcode { address, opcode, .. }) => {
                assert_eq!(address, 0x100);
                assert_eq!(opcode, bytes[0]);
            }
            other => panic!("expected InvalidOpcode, got {:?}", other),
        }
    }

    #[rstest]
    #[case(&[0xcd, 0x00])]
    #[case(&[0xdd])]
    #[case(&[0xed])]
    #[case(&[0x18])]
    fn test_decode_truncated(#[case] bytes: &[u8]) {
        assert_eq!(decode_bytes(bytes), Err(DecoderError::Truncated(0x100)));
    }

    #[test]
    fn test_decode_out_of_range() {
        let image = ByteImage::new(0x100, vec![0x00]).unwrap();
        let decoder = Z80Decoder::new();
        assert_eq!(decoder.decode(&image, 0x101), Err(DecoderError::OutOfRange(0x101)));
        assert_eq!(decoder.decode(&image, 0xff), Err(DecoderError::OutOfRange(0xff)));
    }

    #[test]
    fn test_relative_target_wraps() {
        let image = ByteImage::new(0xfffe, vec![0x18, 0x7f]).unwrap();
        let insn = Z80Decoder::new().decode(&image, 0xfffe).unwrap();
        assert_eq!(insn.target(), Some(0x007f));
    }

    #[test]
    fn test_operands_wrap_past_top_of_memory() {
        let mut bytes = vec![0u8; 0x1_0000];
        bytes[0xffff] = 0xc3;
        bytes[0] = 0x00;
        bytes[1] = 0x10;
        let image = ByteImage::new(0, bytes).unwrap();

        let insn = Z80Decoder::new().decode(&image, 0xffff).unwrap();
        assert_eq!(insn.to_string(), "JP &1000");
        assert_eq!(insn.size, 3);
        assert_eq!(insn.next_addr(), 0x0002);

        // Without the low bytes in the image the operand is missing
        let image = ByteImage::new(0xffff, vec![0xc3]).unwrap();
        assert_eq!(Z80Decoder::new().decode(&image, 0xffff), Err(DecoderError::Truncated(0xffff)));
    }

    #[test]
    fn test_unprefixed_table_is_total() {
        for op in 0..=255u8 {
            if matches!(op, 0xcb | 0xdd | 0xed | 0xfd) {
                continue;
            }
            let insn = decode_bytes(&[op, 0x00, 0x00, 0x00]).unwrap();
            assert!(insn.size >= 1 && insn.size <= 3, "opcode 0x{:02x}", op);
            assert_eq!(insn.bytes[0], op);
        }
    }

    #[test]
    fn test_cb_table_is_total() {
        for op in 0..=255u8 {
            let insn = decode_bytes(&[0xcb, op]).unwrap();
            assert_eq!(insn.size, 2);
        }
    }

    #[test]
    fn test_ed_table_coverage() {
        let valid = (0..=255u8)
            .filter(|&op| decode_bytes(&[0xed, op, 0x00, 0x00]).is_ok())
            .count();
        // 62 in the 0x40-0x7f block (ED 77 and ED 7F are empty) plus 16 block ops
        assert_eq!(valid, 78);
    }

    #[test]
    fn test_index_prefix_lengths() {
        for op in 0..=255u8 {
            if let Ok(insn) = decode_bytes(&[0xdd, op, 0x00, 0x00]) {
                assert!(insn.size >= 2 && insn.size <= 4, "DD {:02x}", op);
                assert!(
                    insn.operands.iter().any(|o| matches!(
                        o,
                        Reg("IX") | Reg("IXH") | Reg("IXL") | Indirect("IX") | Indexed("IX", _)
                    )),
                    "DD {:02x} decoded without touching IX: {}",
                    op,
                    insn
                );
            }
        }
    }

    #[test]
    fn test_decode_is_idempotent() {
        let image = ByteImage::new(0, vec![0xdd, 0x36, 0x05, 0x7f, 0xcd, 0x00, 0x10]).unwrap();
        let decoder = Z80Decoder::new();
        for at in 0..image.len() as Address {
            assert_eq!(decoder.decode(&image, at), decoder.decode(&image, at));
        }
    }
}
