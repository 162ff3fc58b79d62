//! Decoded micro-ops: the operand and opcode information slicing consumes.

use crate::formula::{Coeff, Formula, TermKey};
use crate::register::{Addr, Register};

/// Broad instruction type of a micro-op
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UopKind {
    Move,
    Copy,
    /// Address computation (no memory access)
    Lea,
    Load,
    Store,
    Branch,
    Div,
    Alu,
    Other,
}

/// Canonical arithmetic/logic behavior of a micro-op. `Invalid` marks semantics that are not
/// modeled; slicing treats the result as opaque.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CanonicalOp {
    Add,
    Sub,
    Mov,
    Not,
    And,
    Or,
    Xor,
    AndN,
    OrN,
    XNor,
    Mul,
    Div,
    Sll,
    Srl,
    Sra,
    Invalid,
}

/// A memory operand `[base + index*scale + disp]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemOperand {
    /// Index of this memory operand within its instruction
    pub opidx: i32,
    pub base: Option<Register>,
    pub index: Option<Register>,
    pub scale: i64,
    pub disp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    /// A micro-op internal temporary, by index
    Internal(u32),
    Immediate(i64),
    Memory(MemOperand),
}

/// One micro-op of a decoded instruction
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MicroOp {
    pub pc: Addr,
    /// Index of this micro-op within its instruction
    pub idx: i32,
    /// Length of the instruction in bytes
    pub len: u32,
    pub kind: UopKind,
    pub op: CanonicalOp,
    /// Operation width in bits
    pub width: u8,
    pub srcs: Vec<Operand>,
    pub dests: Vec<Operand>,
    pub is_call: bool,
    pub conditional_move: bool,
    pub branch_target: Option<Addr>,
}

impl MicroOp {
    pub fn new(pc: Addr, idx: i32, kind: UopKind, op: CanonicalOp) -> Self {
        Self {
            pc,
            idx,
            len: 4,
            kind,
            op,
            width: 64,
            srcs: vec![],
            dests: vec![],
            is_call: false,
            conditional_move: false,
            branch_target: None,
        }
    }

    pub fn next_pc(&self) -> Addr {
        self.pc + Addr::from(self.len)
    }

    pub fn is_load(&self) -> bool {
        self.kind == UopKind::Load
    }

    pub fn is_store(&self) -> bool {
        self.kind == UopKind::Store
    }

    pub fn is_branch(&self) -> bool {
        self.kind == UopKind::Branch
    }

    /// The register named by a register or internal operand
    pub fn operand_register(&self, op: &Operand) -> Option<Register> {
        match op {
            Operand::Register(r) => Some(*r),
            Operand::Internal(i) => Some(Register::temp(*i, self.width)),
            Operand::Immediate(_) | Operand::Memory(_) => None,
        }
    }

    /// If this micro-op writes some bits of `reg`, the register it actually writes
    pub fn writes(&self, reg: &Register) -> Option<Register> {
        self.dests
            .iter()
            .filter_map(|d| self.operand_register(d))
            .map(|r| r.canonical())
            .find(|r| r.overlaps(reg))
    }

    /// Whether any source (including address registers of memory sources) overlaps `reg`
    pub fn reads(&self, reg: &Register) -> bool {
        self.source_registers().iter().any(|r| r.overlaps(reg))
    }

    /// All registers read by this micro-op, in operand order, as named by the decoder
    pub fn source_registers(&self) -> Vec<Register> {
        let mut res = vec![];
        for s in &self.srcs {
            match s {
                Operand::Memory(m) => res.extend(m.base.iter().chain(m.index.iter()).copied()),
                _ => res.extend(self.operand_register(s)),
            }
        }
        res
    }

    /// The value of `reg` if it is hardwired at this micro-op
    pub fn hardwired_value(&self, reg: &Register) -> Option<i64> {
        reg.hardwired_value(self.next_pc())
    }

    pub fn immediates(&self) -> impl Iterator<Item = i64> + '_ {
        self.srcs.iter().filter_map(|s| match s {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        })
    }

    pub fn memory_src(&self) -> Option<&MemOperand> {
        self.srcs.iter().find_map(|s| match s {
            Operand::Memory(m) => Some(m),
            _ => None,
        })
    }

    pub fn memory_dest(&self) -> Option<&MemOperand> {
        self.dests.iter().find_map(|s| match s {
            Operand::Memory(m) => Some(m),
            _ => None,
        })
    }

    /// All memory operands, sources first
    pub fn memory_operands(&self) -> impl Iterator<Item = &MemOperand> {
        self.srcs.iter().chain(self.dests.iter()).filter_map(|s| match s {
            Operand::Memory(m) => Some(m),
            _ => None,
        })
    }

    /// The address of `mem` as `base + scale*index + disp`, with registers left as opaque
    /// REGISTER terms seen by this micro-op.
    pub fn generic_formula_for_memory_operand(&self, mem: &MemOperand) -> Formula {
        let mut f = Formula::constant(mem.disp);
        let origin = Some((self.pc, self.idx));
        for (reg, scale) in [(mem.base, 1), (mem.index, mem.scale)] {
            if let Some(reg) = reg {
                f.add_term(
                    TermKey::Register {
                        pc: self.pc,
                        idx: self.idx,
                        reg: reg.canonical(),
                    },
                    Coeff::from(scale),
                    origin,
                );
            }
        }
        f
    }
}

impl std::fmt::Display for MemOperand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        let mut first = true;
        if let Some(b) = self.base {
            write!(f, "{}", b)?;
            first = false;
        }
        if let Some(i) = self.index {
            if !first {
                write!(f, "+")?;
            }
            write!(f, "{}*{}", i, self.scale)?;
            first = false;
        }
        if self.disp != 0 || first {
            if !first && self.disp >= 0 {
                write!(f, "+")?;
            }
            write!(f, "{}", self.disp)?;
        }
        write!(f, "]@{}", self.opidx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(s: &str) -> Register {
        Register::from_name(s).unwrap()
    }

    #[test]
    fn partial_writes_report_written_register() {
        let mut u = MicroOp::new(0x10, 0, UopKind::Move, CanonicalOp::Mov);
        u.dests.push(Operand::Register(reg("eax")));
        u.srcs.push(Operand::Immediate(1));
        let w = u.writes(&reg("rax")).unwrap();
        assert_eq!(w.name, reg("rax").name);
        assert_eq!(w.msb, 31);
        assert!(u.writes(&reg("rbx")).is_none());
        assert_eq!(u.immediates().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn memory_sources_are_read() {
        let mut u = MicroOp::new(0x10, 0, UopKind::Load, CanonicalOp::Mov);
        let m = MemOperand {
            opidx: 0,
            base: Some(reg("rbx")),
            index: Some(reg("rcx")),
            scale: 8,
            disp: -16,
        };
        u.srcs.push(Operand::Memory(m.clone()));
        u.dests.push(Operand::Register(reg("rax")));
        assert!(u.reads(&reg("ecx")));
        assert_eq!(u.source_registers().len(), 2);
        assert_eq!(
            format!("{}", u.generic_formula_for_memory_operand(&m)),
            "R{rbx@0x10:0} + 8*R{rcx@0x10:0} + -16"
        );
        assert_eq!(format!("{}", m), "[rbx+rcx*8-16]@0");
    }
}
