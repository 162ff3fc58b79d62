//! The backward register slicing engine.
//!
//! Slicing starts at a use of a register inside a block and walks the block's micro-ops backward
//! looking for the definition. Each defining micro-op has its own source registers sliced
//! recursively. When the start of a block is reached without finding a full definition, the walk
//! continues into a predecessor block. A [`Slicer`] decides, through its hooks, which micro-ops,
//! edges and registers are followed, and records whatever values it computes along the way; the
//! engine itself carries no value state.

use crate::cfg::{Cfg, EdgeId, NodeId};
use crate::error::{SliceError, SliceResult};
use crate::formula::{Formula, RefFormulasMap};
use crate::insn::{MicroOp, Operand};
use crate::log::*;
use crate::register::{Addr, Register};

/// How hard it is to compute the value a micro-op defines
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SliceEffect {
    /// No register inputs, e.g., a move of an immediate
    Easy,
    /// Computed from register inputs
    Normal,
    /// A load from memory
    Hard,
    /// A call; nothing is known about what the callee returns
    Impossible,
}

/// Classify the micro-op defining a sliced register
pub fn slice_effect(uop: &MicroOp) -> SliceEffect {
    if uop.is_branch() && uop.is_call {
        return SliceEffect::Impossible;
    }
    if uop.is_load() {
        return SliceEffect::Hard;
    }
    let mut count = 0;
    for r in uop.source_registers() {
        let r = r.canonical();
        if r.is_none() || r.is_pseudo() || r.is_flag_or_status() {
            continue;
        }
        if r.is_stack() {
            warn!("Register stack input while classifying micro-op";
                  "pc" => format!("{:#x}", uop.pc), "reg" => %r);
        }
        count += 1;
    }
    if count > 0 {
        SliceEffect::Normal
    } else {
        SliceEffect::Easy
    }
}

/// The address window of the current slice invocation. `to_pc` of 0 means unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceBounds {
    pub start_pc: Addr,
    pub to_pc: Addr,
}

/// A client of the slicing engine. The default hook implementations follow every register
/// definition and every edge, and record nothing.
pub trait Slicer<'a> {
    fn cfg(&self) -> &'a Cfg;

    fn bounds(&self) -> SliceBounds;

    fn set_bounds(&mut self, bounds: SliceBounds);

    /// Memory operand formulas computed so far, consulted when following spills
    fn ref_formulas(&self) -> &RefFormulasMap;

    /// Whether decoder coverage gaps are hard errors
    fn strict(&self) -> bool;

    /// Entry point for slicing `reg` backward from micro-op `from_uop` (exclusive) of block `b`.
    /// Also used for every nested slice on the source registers of a definition, so implementors
    /// may wrap [`base_slice`] with their own bookkeeping.
    fn slice(
        &mut self,
        b: NodeId,
        from_uop: usize,
        reg: Register,
        start_pc: Addr,
        to_pc: Addr,
    ) -> SliceResult<()> {
        base_slice(self, b, from_uop, reg, start_pc, to_pc)
    }

    /// Whether the micro-op defines (some bits of) `reg`; if so, the register actually written
    fn should_slice_uop(&self, uop: &MicroOp, reg: &Register) -> Option<Register> {
        if uop.conditional_move {
            None
        } else {
            uop.writes(reg)
        }
    }

    /// Whether a definition ends the walk for `reg`. Partial writes also terminate, since values
    /// of overlapping writes are not combined.
    fn uop_terminates_slice(&self, uop: &MicroOp, reg: &Register) -> bool {
        !uop.conditional_move && uop.writes(reg).is_some()
    }

    fn should_slice_register(&self, reg: &Register) -> bool {
        !reg.is_flag_or_status()
    }

    /// Called on a definition of `reg`; returning `true` slices its source registers
    fn slice_in_uop(&mut self, _b: NodeId, _uop_idx: usize, _reg: Register) -> SliceResult<bool> {
        Ok(true)
    }

    /// Called after the sources of a definition have been handled
    fn slice_out_uop(&mut self, _b: NodeId, _uop_idx: usize, _reg: Register) -> SliceResult<()> {
        Ok(())
    }

    /// Whether to follow edge `e` backward
    fn slice_in_edge(&mut self, _e: EdgeId, _reg: &Register) -> bool {
        true
    }

    fn slice_out_edge(&mut self, _e: EdgeId, _reg: &Register) {}

    /// Called when the start of block `b` is reached; returning `false` stops here
    fn slice_next_in(&mut self, _b: NodeId, _reg: &Register) -> bool {
        true
    }

    /// Called when no incoming edge of `b` was followed
    fn slice_next_out(&mut self, _b: NodeId, _reg: &Register) {}

    /// Whether to explore further incoming edges after following `e`
    fn slice_multiple_paths(&self, _e: EdgeId, _reg: &Register) -> bool {
        false
    }

    /// A source register of `uop` is hardwired to `value`
    fn record_register_value(&mut self, _reg: Register, _uop: &MicroOp, _value: i64) {}
}

/// Slice `reg` backward from micro-op `from_uop` (exclusive) of block `b`, continuing into
/// predecessors when the block start is reached.
pub fn base_slice<'a, S: Slicer<'a> + ?Sized>(
    s: &mut S,
    b: NodeId,
    from_uop: usize,
    reg: Register,
    start_pc: Addr,
    to_pc: Addr,
) -> SliceResult<()> {
    s.set_bounds(SliceBounds { start_pc, to_pc });
    let cfg = s.cfg();
    let node = cfg.node(b);
    let from = from_uop.min(node.uops.len());

    for iu in (0..from).rev() {
        let uop = &node.uops[iu];
        if let Some(areg) = s.should_slice_uop(uop, &reg) {
            trace!("Slicing into definition";
                   "pc" => format!("{:#x}", uop.pc), "uop" => uop.idx, "reg" => %areg);
            if s.slice_in_uop(b, iu, areg)? {
                for src in uop.source_registers() {
                    let src = src.canonical();
                    if src.is_none() || src.is_pseudo() || !s.should_slice_register(&src) {
                        continue;
                    }
                    if let Some(value) = uop.hardwired_value(&src) {
                        s.record_register_value(src, uop, value);
                        continue;
                    }
                    if src.is_stack() {
                        SliceError::UnexpectedRegisterClass {
                            pc: uop.pc,
                            idx: uop.idx,
                            reg: src.to_string(),
                        }
                        .report(s.strict())?;
                    }
                    s.slice(b, iu, src, uop.pc, 0)?;
                }
            }
            s.slice_out_uop(b, iu, areg)?;
        }
        if s.uop_terminates_slice(uop, &reg) {
            return Ok(());
        }
    }
    slice_next(s, b, reg)
}

/// Continue slicing `reg` into the predecessors of `b`, keeping the current bounds
pub fn slice_next<'a, S: Slicer<'a> + ?Sized>(
    s: &mut S,
    b: NodeId,
    reg: Register,
) -> SliceResult<()> {
    if !s.slice_next_in(b, &reg) {
        return Ok(());
    }
    let cfg = s.cfg();
    for e in cfg.incoming_by_rank_desc(b) {
        if s.slice_in_edge(e, &reg) {
            let SliceBounds { start_pc, to_pc } = s.bounds();
            base_slice(s, cfg.edge(e).source, usize::MAX, reg, start_pc, to_pc)?;
            s.slice_out_edge(e, &reg);
            if !s.slice_multiple_paths(e, &reg) {
                return Ok(());
            }
        }
    }
    s.slice_next_out(b, &reg);
    Ok(())
}

/// Look backward from micro-op `from_uop` of `b` for a store to the address described by
/// `address`. If found, slices the stored value and returns the register that now carries it;
/// stored immediates (and hardwired registers) are handed over through a synthesized temporary
/// via [`Slicer::record_register_value`].
pub fn slice_follow_save<'a, S: Slicer<'a> + ?Sized>(
    s: &mut S,
    b: NodeId,
    from_uop: usize,
    address: &Formula,
) -> SliceResult<Option<Register>> {
    let cfg = s.cfg();
    let node = cfg.node(b);
    let from = from_uop.min(node.uops.len());

    for iu in (0..from).rev() {
        let uop = &node.uops[iu];
        if !uop.is_store() {
            continue;
        }
        let same_location = uop
            .memory_dest()
            .and_then(|m| s.ref_formulas().get(uop.pc, m.opidx))
            .and_then(|rf| rf.base.as_ref())
            .map_or(false, |base| (address.clone() - base).is_constant_value(0));
        if !same_location {
            continue;
        }
        debug!("Found matching store"; "pc" => format!("{:#x}", uop.pc), "address" => %address);

        if uop.srcs.len() != 1 {
            SliceError::UnexpectedOperandCount {
                pc: uop.pc,
                idx: uop.idx,
                count: uop.srcs.len(),
            }
            .report(s.strict())?;
            return Ok(None);
        }
        let stored = match &uop.srcs[0] {
            Operand::Internal(_) => uop.operand_register(&uop.srcs[0]).map(Ok),
            Operand::Register(r) => {
                let r = r.canonical();
                match uop.hardwired_value(&r) {
                    Some(v) => Some(Err(v)),
                    None => {
                        if r.is_stack() || r.is_pseudo() {
                            SliceError::UnexpectedRegisterClass {
                                pc: uop.pc,
                                idx: uop.idx,
                                reg: r.to_string(),
                            }
                            .report(s.strict())?;
                        }
                        Some(Ok(r))
                    }
                }
            }
            Operand::Immediate(v) => Some(Err(*v)),
            Operand::Memory(_) => None,
        };
        return match stored {
            Some(Ok(reg)) => {
                s.slice(b, iu, reg, uop.pc, 0)?;
                Ok(Some(reg))
            }
            Some(Err(value)) => {
                let fake = Register::temp(100, uop.width);
                s.record_register_value(fake, uop, value);
                Ok(Some(fake))
            }
            None => {
                SliceError::MissingOperand {
                    pc: uop.pc,
                    idx: uop.idx,
                    operand: 0,
                }
                .report(s.strict())?;
                Ok(None)
            }
        };
    }

    let none = Register::none();
    if !s.slice_next_in(b, &none) {
        return Ok(None);
    }
    for &e in node.incoming() {
        if s.slice_in_edge(e, &none) {
            let found = slice_follow_save(s, cfg.edge(e).source, usize::MAX, address)?;
            s.slice_out_edge(e, &none);
            if found.is_some() {
                return Ok(found);
            }
            if !s.slice_multiple_paths(e, &none) {
                return Ok(None);
            }
        }
    }
    s.slice_next_out(b, &none);
    Ok(None)
}
