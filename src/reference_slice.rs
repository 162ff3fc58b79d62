//! Symbolic address formulas for memory operands.
//!
//! A [`ReferenceSlicer`] slices the registers of a memory operand's address backward and folds
//! the arithmetic it meets into one [`Formula`] per register. Values that cannot be expressed in
//! terms of earlier values (loads that do not match a spill, call results, registers live on
//! entry to the routine) become opaque terms.

use crate::cfg::{Cfg, EdgeId, NodeId, NodeKind};
use crate::containers::unordered::UnorderedMap;
use crate::error::{SliceError, SliceResult};
use crate::formula::{Formula, RefFormulasMap, TermKey};
use crate::insn::{CanonicalOp, MicroOp, Operand, UopKind};
use crate::log::*;
use crate::register::{Addr, Register};
use crate::slice::{slice_effect, slice_follow_save, SliceBounds, SliceEffect, Slicer};
use crate::slice_config::CONFIG;
use crate::value_stack::ValueStack;

pub struct ReferenceSlicer<'a> {
    cfg: &'a Cfg,
    bounds: SliceBounds,
    values: ValueStack<Formula>,
    /// Formulas of already computed definitions, by `(pc, micro-op)`. Lives as long as the
    /// slicer, across memory operands.
    cache: UnorderedMap<(Addr, i32), Formula>,
    ref_formulas: RefFormulasMap,
    strict: bool,
    follow_spills: bool,
}

impl<'a> ReferenceSlicer<'a> {
    pub fn new(cfg: &'a Cfg) -> Self {
        Self::with_ref_formulas(cfg, RefFormulasMap::new())
    }

    /// A slicer that follows spills using the base formulas already present in `ref_formulas`
    pub fn with_ref_formulas(cfg: &'a Cfg, ref_formulas: RefFormulasMap) -> Self {
        Self {
            cfg,
            bounds: SliceBounds::default(),
            values: ValueStack::new(),
            cache: UnorderedMap::new(),
            ref_formulas,
            strict: CONFIG.strict_invariants,
            follow_spills: CONFIG.follow_spills,
        }
    }

    pub fn with_strictness(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_spill_following(mut self, follow_spills: bool) -> Self {
        self.follow_spills = follow_spills;
        self
    }

    pub fn ref_formulas_mut(&mut self) -> &mut RefFormulasMap {
        &mut self.ref_formulas
    }

    pub fn into_ref_formulas(self) -> RefFormulasMap {
        self.ref_formulas
    }

    /// Pending values. Values pushed by a slice stay here until claimed.
    pub fn values(&self) -> &ValueStack<Formula> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueStack<Formula> {
        &mut self.values
    }

    /// Drop all pending values. The definition cache is kept.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// The address formula of memory operand `opidx` of micro-op `uop_idx` in block `b`. Each
    /// register in the address is sliced from the micro-op itself; registers with no computable
    /// value stay as opaque terms.
    pub fn compute_formula_for_memory_operand(
        &mut self,
        b: NodeId,
        uop_idx: usize,
        opidx: i32,
    ) -> SliceResult<Formula> {
        let cfg = self.cfg;
        let uop = &cfg.node(b).uops[uop_idx];
        let mem = uop
            .memory_operands()
            .find(|m| m.opidx == opidx)
            .ok_or(SliceError::MissingMemoryOperand {
                pc: uop.pc,
                idx: uop.idx,
            })?;

        let mut res = Formula::zero();
        for (key, term) in uop.generic_formula_for_memory_operand(mem).terms() {
            let reg = match key {
                TermKey::Register { reg, .. } => *reg,
                _ => {
                    res.add_term(*key, term.coeff, term.origin);
                    continue;
                }
            };
            let value = match uop.hardwired_value(&reg) {
                Some(v) => Some(Formula::constant(v)),
                None => {
                    self.clear();
                    self.slice(b, uop_idx, reg, uop.pc, 0)?;
                    self.values.claim_register(&reg)
                }
            };
            if let Some(mut f) = value {
                f.scale(term.coeff);
                let sum = res.clone() + &f;
                if !sum.overflowed() {
                    res = sum;
                    continue;
                }
                warn!("Address formula overflows, keeping the register opaque";
                      "pc" => format!("{:#x}", uop.pc), "reg" => %reg);
            }
            res.add_term(*key, term.coeff, term.origin);
        }
        debug!("Computed address formula";
               "pc" => format!("{:#x}", uop.pc), "operand" => %mem, "formula" => %res);
        Ok(res)
    }

    fn opaque(uop: &MicroOp, reg: Register) -> Formula {
        Formula::register(uop.pc, uop.idx, reg)
    }

    /// Claim the value of source operand `i`
    fn operand_value(&mut self, uop: &MicroOp, i: usize) -> Option<Formula> {
        match uop.srcs.get(i)? {
            Operand::Immediate(v) => Some(Formula::constant(*v)),
            Operand::Memory(_) => None,
            op => {
                let r = uop.operand_register(op)?.canonical();
                self.values.claim_register(&r)
            }
        }
    }

    /// Value defined by a micro-op that reads no registers
    fn easy_value(&mut self, uop: &MicroOp, reg: Register) -> SliceResult<Formula> {
        if !matches!(uop.kind, UopKind::Move | UopKind::Copy) {
            SliceError::NonMoveWithoutSources {
                pc: uop.pc,
                idx: uop.idx,
            }
            .report(self.strict)?;
            return Ok(Self::opaque(uop, reg));
        }
        let imms: Vec<i64> = uop.immediates().collect();
        if imms.len() != 1 {
            SliceError::UnexpectedOperandCount {
                pc: uop.pc,
                idx: uop.idx,
                count: imms.len(),
            }
            .report(self.strict)?;
            return Ok(Self::opaque(uop, reg));
        }
        Ok(Formula::constant(imms[0]))
    }

    /// Value defined by an arithmetic micro-op, from the claimed values of its sources
    fn normal_value(&mut self, uop: &MicroOp, reg: Register) -> SliceResult<Formula> {
        let opaque = Self::opaque(uop, reg);
        // Trailing flag inputs (carry-in and the like) do not contribute
        let num_src = uop.srcs.len()
            - uop
                .srcs
                .iter()
                .rev()
                .take_while(|s| matches!(s, Operand::Register(r) if r.is_flag_or_status()))
                .count();
        // Only divisions and double shifts take a third input
        let three_ok =
            uop.kind == UopKind::Div || matches!(uop.op, CanonicalOp::Invalid | CanonicalOp::Sll);
        let too_many = num_src > 3 || (num_src == 3 && !three_ok);
        if num_src == 0 || too_many {
            SliceError::UnexpectedOperandCount {
                pc: uop.pc,
                idx: uop.idx,
                count: num_src,
            }
            .report(self.strict)?;
            return Ok(opaque);
        }

        if uop.kind == UopKind::Lea {
            let mem = match &uop.srcs[0] {
                Operand::Memory(m) if num_src == 1 => m,
                _ => {
                    SliceError::UnexpectedOperandCount {
                        pc: uop.pc,
                        idx: uop.idx,
                        count: num_src,
                    }
                    .report(self.strict)?;
                    return Ok(opaque);
                }
            };
            let mut res = Formula::zero();
            for (key, term) in uop.generic_formula_for_memory_operand(mem).terms() {
                let claimed = match key {
                    TermKey::Register { reg, .. } => self.values.claim_register(reg),
                    _ => None,
                };
                match claimed {
                    Some(mut f) => {
                        f.scale(term.coeff);
                        res += &f;
                    }
                    None => res.add_term(*key, term.coeff, term.origin),
                }
            }
            return Ok(res);
        }

        if uop.op == CanonicalOp::Invalid {
            return Ok(opaque);
        }

        let f1 = match self.operand_value(uop, 0) {
            Some(f) => f,
            None => {
                SliceError::MissingOperand {
                    pc: uop.pc,
                    idx: uop.idx,
                    operand: 0,
                }
                .report(self.strict)?;
                return Ok(opaque);
            }
        };

        if num_src == 3 {
            let f1b = self.operand_value(uop, 1);
            let f2 = self.operand_value(uop, 2);
            let (f1b, f2) = match (f1b, f2) {
                (Some(a), Some(b)) if uop.kind != UopKind::Div => (a, b),
                _ => return Ok(opaque),
            };
            if uop.op != CanonicalOp::Sll {
                SliceError::UnexpectedOperandCount {
                    pc: uop.pc,
                    idx: uop.idx,
                    count: num_src,
                }
                .report(self.strict)?;
                return Ok(opaque);
            }
            return Ok(Self::double_shift(uop, &f1, &f1b, &f2).unwrap_or(opaque));
        }

        let f2 = if num_src > 1 {
            match self.operand_value(uop, 1) {
                Some(f) => f,
                None => {
                    SliceError::MissingOperand {
                        pc: uop.pc,
                        idx: uop.idx,
                        operand: 1,
                    }
                    .report(self.strict)?;
                    return Ok(opaque);
                }
            }
        } else {
            if !matches!(uop.op, CanonicalOp::Mov | CanonicalOp::Not) {
                SliceError::UnexpectedOperandCount {
                    pc: uop.pc,
                    idx: uop.idx,
                    count: num_src,
                }
                .report(self.strict)?;
                return Ok(opaque);
            }
            Formula::zero()
        };

        Ok(match uop.op {
            CanonicalOp::Add => f1 + &f2,
            CanonicalOp::Sub => {
                if num_src > 1 && f1.same_terms(&f2) {
                    debug!("Subtracting a value from itself"; "pc" => format!("{:#x}", uop.pc));
                }
                f1 - &f2
            }
            CanonicalOp::Mov => f1,
            CanonicalOp::Not => match f1.constant_value() {
                Some(c) => Formula::constant(!c.value()),
                None => opaque,
            },
            CanonicalOp::Xor if f1.same_terms(&f2) => {
                debug!("XOR of a value with itself"; "pc" => format!("{:#x}", uop.pc));
                Formula::zero()
            }
            op => process_operation(op, &f1, &f2).unwrap_or(opaque),
        })
    }

    /// `f1` shifted left by constant `f2`, with the vacated bits filled from the top of the
    /// constant `f1b`
    fn double_shift(uop: &MicroOp, f1: &Formula, f1b: &Formula, f2: &Formula) -> Option<Formula> {
        let (c1b, c2) = (f1b.constant_value()?, f2.constant_value()?);
        if c1b.is_fractional() || c2.is_fractional() {
            return None;
        }
        let (v1b, v2) = (c1b.value(), c2.value());
        // The filling operand is only known as a 64-bit constant
        let width = i64::from(uop.width);
        if width > 64 || v2 < 0 || v2 >= width || v2 >= 63 {
            return None;
        }
        let fill = if v2 == 0 {
            0
        } else {
            (v1b as u64).checked_shr((width - v2) as u32)? & ((1u64 << v2) - 1)
        };
        Some(f1.clone() * (1i64 << v2) + &Formula::constant(fill as i64))
    }

    /// Value defined by a call: the callee's return value
    fn call_value(&self, b: NodeId, uop: &MicroOp) -> Formula {
        let cfg = self.cfg;
        let surrogate_target = cfg
            .node(b)
            .outgoing()
            .first()
            .and_then(|e| match cfg.node(cfg.edge(*e).sink).kind {
                NodeKind::CallSurrogate { target } => Some(target),
                NodeKind::Code => None,
            });
        let target = surrogate_target.or(uop.branch_target).unwrap_or(0);
        Formula::call(uop.pc, uop.idx, target)
    }

    /// Resolve the value of a load: either the value stored to the same address earlier, or an
    /// opaque term. The result is parked at the load's site.
    fn resolve_load(&mut self, b: NodeId, uop_idx: usize, reg: Register) -> SliceResult<()> {
        let cfg = self.cfg;
        let uop = &cfg.node(b).uops[uop_idx];
        let load = Formula::load(uop.pc, uop.idx, reg);
        let base = uop
            .memory_src()
            .and_then(|m| self.ref_formulas.get(uop.pc, m.opidx))
            .and_then(|rf| rf.base.clone())
            .filter(|f| !f.is_constant_value(0));
        let base = match base {
            Some(base) => base,
            None => {
                trace!("No usable address formula for load"; "pc" => format!("{:#x}", uop.pc));
                self.values.push_site(uop.pc, uop.idx, load);
                return Ok(());
            }
        };

        let spilled = if self.follow_spills {
            self.bounds.start_pc = uop.pc;
            slice_follow_save(self, b, uop_idx, &base)?
        } else {
            None
        };
        let value = match spilled {
            Some(saved) => match self.values.claim_register(&saved) {
                Some(f) if !f.defined_before_pc(self.bounds.to_pc) => {
                    debug!("Load reads back a spilled value";
                           "pc" => format!("{:#x}", uop.pc), "value" => %f);
                    f
                }
                _ => load,
            },
            None => match base.constant_value() {
                Some(c) => Formula::reference(uop.pc, uop.idx, c.value()),
                None => load,
            },
        };
        self.values.push_site(uop.pc, uop.idx, value);
        Ok(())
    }
}

/// Fold a binary operation whose operands are not both plain sums. Returns `None` when the
/// result is not affine in the operands.
fn process_operation(op: CanonicalOp, f1: &Formula, f2: &Formula) -> Option<Formula> {
    use CanonicalOp::*;
    let integral = |f: &Formula| f.constant_value().filter(|c| !c.is_fractional()).map(|c| c.value());
    let v1 = integral(f1);
    let v2 = integral(f2).filter(|v| !(matches!(op, Sll | Srl | Sra) && *v < 0));

    if let (Some(a), Some(b)) = (v1, v2) {
        if let Some(v) = fold_constants(op, a, b) {
            return Some(Formula::constant(v));
        }
    }
    if let Some(b) = v2 {
        let shift = |b: i64| (b < 63).then(|| 1i64 << b);
        let simple = |f: Formula| (!f.has_complex_denominator()).then(|| f);
        return match op {
            Sll => shift(b).map(|k| f1.clone() * k),
            Srl | Sra => shift(b).and_then(|k| {
                let mut f = f1.clone();
                f /= k;
                simple(f)
            }),
            Or | AndN if b == 0 => Some(f1.clone()),
            Mul => Some(f1.clone() * b),
            Div if b != 0 => {
                let mut f = f1.clone();
                f /= b;
                simple(f)
            }
            _ => None,
        };
    }
    if let Some(a) = v1 {
        return match op {
            Or if a == 0 => Some(f2.clone()),
            Mul => Some(f2.clone() * a),
            _ => None,
        };
    }
    None
}

fn fold_constants(op: CanonicalOp, a: i64, b: i64) -> Option<i64> {
    use CanonicalOp::*;
    Some(match op {
        Or => a | b,
        OrN => a | !b,
        AndN => a & !b,
        And => a & b,
        Xor => a ^ b,
        XNor => !(a ^ b),
        Sll if b < 64 => a.wrapping_shl(b as u32),
        Srl if b < 64 => ((a as u64) >> b) as i64,
        Sra if b < 64 => a >> b,
        Mul => a.wrapping_mul(b),
        Div if b != 0 => a.wrapping_div(b),
        _ => return None,
    })
}

impl<'a> Slicer<'a> for ReferenceSlicer<'a> {
    fn cfg(&self) -> &'a Cfg {
        self.cfg
    }

    fn bounds(&self) -> SliceBounds {
        self.bounds
    }

    fn set_bounds(&mut self, bounds: SliceBounds) {
        self.bounds = bounds;
    }

    fn ref_formulas(&self) -> &RefFormulasMap {
        &self.ref_formulas
    }

    fn strict(&self) -> bool {
        self.strict
    }

    fn slice_in_uop(&mut self, b: NodeId, uop_idx: usize, reg: Register) -> SliceResult<bool> {
        let cfg = self.cfg;
        let uop = &cfg.node(b).uops[uop_idx];
        if uop.pc < self.bounds.to_pc || self.cache.contains_key(&(uop.pc, uop.idx)) {
            return Ok(false);
        }
        match slice_effect(uop) {
            SliceEffect::Easy | SliceEffect::Impossible => Ok(false),
            SliceEffect::Normal => {
                if uop.op == CanonicalOp::Invalid {
                    warn!("Micro-op with unmodeled semantics"; "pc" => format!("{:#x}", uop.pc));
                }
                Ok(uop.op != CanonicalOp::Invalid)
            }
            SliceEffect::Hard => {
                self.resolve_load(b, uop_idx, reg)?;
                Ok(false)
            }
        }
    }

    fn slice_out_uop(&mut self, b: NodeId, uop_idx: usize, reg: Register) -> SliceResult<()> {
        let cfg = self.cfg;
        let uop = &cfg.node(b).uops[uop_idx];
        if uop.pc < self.bounds.to_pc {
            self.values
                .push_register(reg, Formula::register(self.bounds.to_pc, -1, reg));
            return Ok(());
        }
        if let Some(f) = self.cache.get(&(uop.pc, uop.idx)) {
            self.values.push_register(reg, f.clone());
            return Ok(());
        }

        let f = match slice_effect(uop) {
            SliceEffect::Easy => self.easy_value(uop, reg)?,
            SliceEffect::Normal => self.normal_value(uop, reg)?,
            SliceEffect::Hard => match self.values.claim_site(uop.pc, uop.idx) {
                Some(f) => f,
                None => {
                    SliceError::MissingLoadValue {
                        pc: uop.pc,
                        idx: uop.idx,
                    }
                    .report(self.strict)?;
                    Formula::load(uop.pc, uop.idx, reg)
                }
            },
            SliceEffect::Impossible => {
                if uop.conditional_move {
                    Self::opaque(uop, reg)
                } else {
                    self.call_value(b, uop)
                }
            }
        };
        let f = if f.overflowed() {
            warn!("Definition value overflows, keeping it opaque";
                  "pc" => format!("{:#x}", uop.pc), "uop" => uop.idx, "reg" => %reg);
            Self::opaque(uop, reg)
        } else {
            f
        };
        trace!("Definition value";
               "pc" => format!("{:#x}", uop.pc), "uop" => uop.idx, "reg" => %reg, "value" => %f);
        self.cache.insert((uop.pc, uop.idx), f.clone());
        self.values.push_register(reg, f);
        if CONFIG.debug_print_value_stack {
            self.values.dump();
        }
        Ok(())
    }

    fn slice_in_edge(&mut self, e: EdgeId, _reg: &Register) -> bool {
        let edge = self.cfg.edge(e);
        !edge.back_edge && self.cfg.node(edge.source).end > self.bounds.to_pc
    }

    fn slice_next_in(&mut self, b: NodeId, reg: &Register) -> bool {
        let node = self.cfg.node(b);
        if node.start <= self.bounds.to_pc {
            let to_pc = self.bounds.to_pc;
            self.values
                .push_register(*reg, Formula::register(to_pc, 0, *reg));
            return false;
        }
        if node.is_entry {
            self.values
                .push_register(*reg, Formula::register(node.start, 0, *reg));
            return false;
        }
        true
    }

    fn slice_next_out(&mut self, b: NodeId, reg: &Register) {
        let start = self.cfg.node(b).start;
        self.values
            .push_register(*reg, Formula::register(start, 0, *reg));
    }

    fn record_register_value(&mut self, reg: Register, _uop: &MicroOp, value: i64) {
        self.values.push_register(reg, Formula::constant(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::MemOperand;

    fn reg(s: &str) -> Register {
        Register::from_name(s).unwrap().canonical()
    }

    fn uop(pc: Addr, kind: UopKind, op: CanonicalOp, dests: &[&str], srcs: Vec<Operand>) -> MicroOp {
        let mut u = MicroOp::new(pc, 0, kind, op);
        u.dests = dests.iter().map(|d| Operand::Register(reg(d))).collect();
        u.srcs = srcs;
        u
    }

    fn r(s: &str) -> Operand {
        Operand::Register(reg(s))
    }

    fn mem(base: &str, disp: i64) -> MemOperand {
        MemOperand {
            opidx: 0,
            base: Some(reg(base)),
            index: None,
            scale: 1,
            disp,
        }
    }

    #[test]
    fn constant_operations_fold() {
        use CanonicalOp::*;
        let c = Formula::constant;
        assert_eq!(process_operation(Or, &c(12), &c(3)), Some(c(15)));
        assert_eq!(process_operation(AndN, &c(15), &c(3)), Some(c(12)));
        assert_eq!(process_operation(XNor, &c(0), &c(0)), Some(c(-1)));
        assert_eq!(process_operation(Sll, &c(3), &c(4)), Some(c(48)));
        assert_eq!(process_operation(Sll, &c(3), &c(-1)), None);
    }

    #[test]
    fn operations_on_symbolic_values() {
        use CanonicalOp::*;
        let x = Formula::register(0x10, 0, reg("rdi"));
        let c = Formula::constant;
        assert_eq!(process_operation(Sll, &x, &c(3)), Some(x.clone() * 8));
        assert_eq!(process_operation(Mul, &c(6), &x), Some(x.clone() * 6));
        assert_eq!(process_operation(Or, &x, &c(0)), Some(x.clone()));
        assert_eq!(process_operation(Or, &x, &c(1)), None);
        assert_eq!(process_operation(Srl, &x, &c(1)), None);
        assert_eq!(process_operation(Div, &(x.clone() * 8), &c(-4)), Some(x.clone() * -2));
        assert_eq!(process_operation(And, &x, &x), None);
    }

    #[test]
    fn lea_chain_folds_into_one_formula() {
        // rax = rdi + 16; rbx = rax*2; load [rbx+8]
        let mut cfg = Cfg::new("lea");
        let mut lea = uop(0x10, UopKind::Lea, CanonicalOp::Add, &["rax"], vec![]);
        lea.srcs.push(Operand::Memory(mem("rdi", 16)));
        let mut lea2 = uop(0x14, UopKind::Lea, CanonicalOp::Add, &["rbx"], vec![]);
        lea2.srcs.push(Operand::Memory(MemOperand {
            opidx: 0,
            base: None,
            index: Some(reg("rax")),
            scale: 2,
            disp: 0,
        }));
        let ld = uop(
            0x18,
            UopKind::Load,
            CanonicalOp::Mov,
            &["rcx"],
            vec![Operand::Memory(mem("rbx", 8))],
        );
        let b = cfg.add_block(0, 0, vec![lea, lea2, ld]);
        cfg.set_entry(b);

        let mut s = ReferenceSlicer::new(&cfg).with_strictness(true);
        let f = s.compute_formula_for_memory_operand(b, 2, 0).unwrap();
        let rdi = Formula::register(0x10, 0, reg("rdi"));
        assert_eq!(f, rdi * 2 + &Formula::constant(40));
        assert!(s.values().is_empty());
    }

    #[test]
    fn entry_register_becomes_opaque_term() {
        let mut cfg = Cfg::new("entry");
        let ld = uop(
            0x40,
            UopKind::Load,
            CanonicalOp::Mov,
            &["rax"],
            vec![Operand::Memory(mem("rsi", 0))],
        );
        let b = cfg.add_block(0, 0, vec![ld]);
        cfg.set_entry(b);
        let mut s = ReferenceSlicer::new(&cfg);
        let f = s.compute_formula_for_memory_operand(b, 0, 0).unwrap();
        assert_eq!(f, Formula::register(0x40, 0, reg("rsi")));
        assert!(s.compute_formula_for_memory_operand(b, 0, 3).is_err());
    }

    #[test]
    fn unmodeled_shape_is_strictness_dependent() {
        let mut cfg = Cfg::new("gap");
        // A three-source ADD has no rule
        let add = uop(
            0x10,
            UopKind::Alu,
            CanonicalOp::Add,
            &["rax"],
            vec![r("rbx"), r("rcx"), r("rdx")],
        );
        let ld = uop(
            0x14,
            UopKind::Load,
            CanonicalOp::Mov,
            &["rdx"],
            vec![Operand::Memory(mem("rax", 0))],
        );
        let b = cfg.add_block(0, 0, vec![add, ld]);
        cfg.set_entry(b);

        let mut lax = ReferenceSlicer::new(&cfg).with_strictness(false);
        let f = lax.compute_formula_for_memory_operand(b, 1, 0).unwrap();
        assert_eq!(f, Formula::register(0x10, 0, reg("rax")));

        let mut strict = ReferenceSlicer::new(&cfg).with_strictness(true);
        assert!(matches!(
            strict.compute_formula_for_memory_operand(b, 1, 0),
            Err(SliceError::UnexpectedOperandCount { count: 3, .. })
        ));
    }

    #[test]
    fn double_shift_fills_from_second_operand() {
        let mut u = MicroOp::new(0x10, 0, UopKind::Alu, CanonicalOp::Sll);
        u.width = 64;
        let x = Formula::register(0x8, 0, reg("rdi"));
        let top = Formula::constant(-1);
        let f = ReferenceSlicer::double_shift(&u, &x, &top, &Formula::constant(4)).unwrap();
        assert_eq!(f, x.clone() * 16 + &Formula::constant(15));
        assert!(ReferenceSlicer::double_shift(&u, &x, &x, &Formula::constant(4)).is_none());
        u.width = 32;
        let f = ReferenceSlicer::double_shift(&u, &x, &top, &Formula::constant(4)).unwrap();
        assert_eq!(f, x.clone() * 16 + &Formula::constant(15));
        u.width = 128;
        assert!(ReferenceSlicer::double_shift(&u, &x, &top, &Formula::constant(4)).is_none());
    }
}
