//! Per-iteration strides of memory operand addresses.
//!
//! A [`StrideSlicer`] works on one loop. It slices an address register backward along a single
//! cyclic path through the loop (see [`CyclicPath`]). When the walk comes back around the back
//! edge to a micro-op that is still being computed, a value cycle has been found. The cycle is
//! seeded with a zero formula and the definitions along it add up to the change of the register
//! over one iteration.
//!
//! Every definition's result carries a [`StrideKind`], which tells whether the formula is a
//! loop-invariant value, a partial sum along an open cycle, or a finished stride.

use crate::cfg::{Cfg, EdgeId, NodeId};
use crate::containers::unordered::UnorderedMap;
use crate::cyclic_path::{is_loop_back_edge, CyclicPath};
use crate::error::{SliceError, SliceResult};
use crate::formula::{Formula, RefFormulasMap, TermKey};
use crate::insn::{CanonicalOp, MicroOp, Operand, UopKind};
use crate::log::*;
use crate::register::{Addr, Register, NO_ADDRESS};
use crate::slice::{base_slice, slice_effect, slice_follow_save, SliceBounds, SliceEffect, Slicer};
use crate::slice_config::CONFIG;
use crate::value_stack::ValueStack;

/// What a definition's formula describes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StrideKind {
    /// The value itself, which does not change across iterations
    #[default]
    Invariant,
    /// A partial sum along a value cycle that has not been closed yet
    Partial,
    /// The change of the value over one iteration
    Stride,
}

impl StrideKind {
    /// Kind of a value computed from operands of kinds `a` and `b`
    fn join(a: Self, b: Self) -> Self {
        if a == StrideKind::Partial || b == StrideKind::Partial {
            StrideKind::Partial
        } else {
            a.max(b)
        }
    }

    fn is_partial(self) -> bool {
        self == StrideKind::Partial
    }
}

/// Slicing state of one micro-op
#[derive(Clone, Debug, Default)]
pub struct StrideInst {
    /// Non-zero while the micro-op is being computed: one more than the number of back edges
    /// traversed when it was entered
    pub loop_cnt: u32,
    /// The register sliced from this micro-op, if it consumed one
    pub loop_reg: Option<Register>,
    pub formula: Option<Formula>,
    pub kind: StrideKind,
    /// Visit order within the current slice
    pub dfs_index: u64,
    /// Visit order of the cycle start this formula still depends on; 0 for none
    pub dfs_target: u64,
    pub use_cached: bool,
    /// Slice during which the formula was computed
    pub cache_key: u64,
}

/// A pending register value: the micro-op that defined it, or [`NO_ADDRESS`] when the value
/// comes from outside the iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegCache {
    pub def_pc: Addr,
    pub idx: i32,
    pub target_dfs: u64,
}

impl RegCache {
    fn invariant() -> Self {
        Self {
            def_pc: NO_ADDRESS,
            idx: 0,
            target_dfs: 0,
        }
    }
}

/// A value cycle that is still open
#[derive(Clone, Debug)]
struct CycleInfo {
    pc: Addr,
    idx: i32,
    count: u32,
    reg: Option<Register>,
}

/// Counters that must stay consistent across all stride slicers of one analysis
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SliceSession {
    pub dfs_count: u64,
    pub slice_key: u64,
}

/// A formula along with the slicing facts needed to combine it
#[derive(Clone, Debug)]
struct OperandInfo {
    formula: Formula,
    kind: StrideKind,
    target: u64,
}

impl OperandInfo {
    fn invariant(formula: Formula) -> Self {
        Self {
            formula,
            kind: StrideKind::Invariant,
            target: 0,
        }
    }
}

fn min_target(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, t) | (t, 0) => t,
        (a, b) => a.min(b),
    }
}

pub struct StrideSlicer<'a> {
    cfg: &'a Cfg,
    ref_formulas: &'a RefFormulasMap,
    marker: u32,
    bounds: SliceBounds,
    values: ValueStack<RegCache>,
    insts: UnorderedMap<(Addr, i32), StrideInst>,
    /// Open cycles, most recently entered micro-op first
    cycles: Vec<(u64, CycleInfo)>,
    path: Option<CyclicPath>,
    back_edged: i32,
    start_be: i32,
    start_rank: i32,
    session: SliceSession,
    strict: bool,
    follow_spills: bool,
}

impl<'a> StrideSlicer<'a> {
    /// A slicer for the loop with marker `marker`
    pub fn new(
        cfg: &'a Cfg,
        ref_formulas: &'a RefFormulasMap,
        marker: u32,
        session: SliceSession,
    ) -> Self {
        Self {
            cfg,
            ref_formulas,
            marker,
            bounds: SliceBounds::default(),
            values: ValueStack::new(),
            insts: UnorderedMap::new(),
            cycles: vec![],
            path: None,
            back_edged: 0,
            start_be: 0,
            start_rank: 0,
            session,
            strict: CONFIG.strict_invariants,
            follow_spills: CONFIG.follow_spills,
        }
    }

    pub fn with_strictness(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn marker(&self) -> u32 {
        self.marker
    }

    pub fn session(&self) -> SliceSession {
        self.session
    }

    pub fn into_session(self) -> SliceSession {
        self.session
    }

    /// Continue with counters left behind by another slicer of the same analysis
    pub fn resume(&mut self, session: SliceSession) {
        self.session = session;
    }

    pub fn values(&self) -> &ValueStack<RegCache> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut ValueStack<RegCache> {
        &mut self.values
    }

    /// The slicing state recorded for micro-op `(pc, idx)`
    pub fn stride_inst(&self, pc: Addr, idx: i32) -> Option<&StrideInst> {
        self.insts.get(&(pc, idx))
    }

    pub fn cyclic_path(&self) -> Option<&CyclicPath> {
        self.path.as_ref()
    }

    /// Reset the per-slice state. Computed micro-op formulas and the cyclic path are kept.
    pub fn clear(&mut self) {
        self.values.clear();
        self.cycles.clear();
        self.back_edged = 0;
        self.bounds.start_pc = 0;
        self.start_be = 0;
        self.session.dfs_count = 0;
    }

    /// Start a new top-level slice of `reg` from micro-op `from_uop` of `b`, building a cyclic
    /// path through `b` first if the current one does not cover it.
    pub fn start_slice(
        &mut self,
        b: NodeId,
        from_uop: usize,
        reg: Register,
        start_pc: Addr,
        to_pc: Addr,
    ) -> SliceResult<()> {
        if !self.cycles.is_empty() {
            warn!("Leftover value cycles from a previous slice"; "count" => self.cycles.len());
            self.cycles.clear();
        }
        self.session.dfs_count = 0;
        self.session.slice_key += 1;
        if !self.path.as_ref().map_or(false, |p| p.contains(b)) {
            self.path = None;
            self.path = Some(CyclicPath::build(self.cfg, b, self.marker)?);
        }
        self.slice(b, from_uop, reg, start_pc, to_pc)
    }

    /// The change over one iteration of the address of memory operand `opidx` of micro-op
    /// `uop_idx` in block `b`
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
                _ => continue,
            };
            // Hardwired registers only depend on the encoding
            if uop.hardwired_value(&reg).is_some() {
                continue;
            }
            self.clear();
            self.start_slice(b, uop_idx, reg, uop.pc, 0)?;
            let mut stride = self.get_stride_for_reg(&reg);
            stride.scale(term.coeff);
            let sum = res.clone() + &stride;
            if sum.overflowed() {
                warn!("Stride formula overflows, keeping the register opaque";
                      "pc" => format!("{:#x}", uop.pc), "reg" => %reg);
                let mut opaque = Formula::register(uop.pc, uop.idx, reg);
                opaque.set_irregular_access();
                res += &opaque;
            } else {
                res = sum;
            }
        }
        debug!("Computed stride formula";
               "pc" => format!("{:#x}", uop.pc), "operand" => %mem,
               "marker" => self.marker, "stride" => %res);
        Ok(res)
    }

    /// The stride of the pending value of `reg`
    pub fn get_stride_for_reg(&mut self, reg: &Register) -> Formula {
        let rc = match self.values.claim_register(reg) {
            Some(rc) => rc,
            None => {
                warn!("No pending value for register"; "reg" => %reg);
                return Formula::zero();
            }
        };
        if rc.def_pc == NO_ADDRESS {
            return Formula::zero();
        }
        let si = match self.insts.get(&(rc.def_pc, rc.idx)) {
            Some(si) => si,
            None => return Formula::zero(),
        };
        if si.kind.is_partial() {
            warn!("Stride taken from a cycle that was never closed";
                  "pc" => format!("{:#x}", rc.def_pc), "reg" => %reg);
        }
        match (&si.formula, si.kind) {
            (Some(f), StrideKind::Invariant) => {
                let mut z = Formula::zero();
                z.inherit_access(f);
                z
            }
            (Some(f), _) => f.clone(),
            (None, _) => Formula::zero(),
        }
    }

    fn path_rank(&self, b: NodeId) -> i32 {
        self.path.as_ref().map_or(0, |p| p.path_rank(b))
    }

    /// Whether position `pos` in a block of path rank `rank` lies beyond one iteration from the
    /// slice start
    fn outside_window(&self, rank: i32, pos: Addr, inclusive: bool) -> bool {
        let before_start = if inclusive {
            pos <= self.bounds.start_pc
        } else {
            pos < self.bounds.start_pc
        };
        (self.back_edged > self.start_be
            && (rank < self.start_rank || (rank == self.start_rank && before_start)))
            || self.back_edged - self.start_be > 1
    }

    fn target_in_stack(values: &ValueStack<RegCache>, dfs: u64) -> bool {
        dfs != 0 && values.iter().any(|(_, rc)| rc.target_dfs == dfs)
    }

    fn push(&mut self, reg: Register, def_pc: Addr, idx: i32, target_dfs: u64) {
        self.values.push_register(
            reg,
            RegCache {
                def_pc,
                idx,
                target_dfs,
            },
        );
    }

    fn insert_cycle(&mut self, dfs: u64, cycle: CycleInfo) {
        let pos = self
            .cycles
            .iter()
            .position(|(d, _)| *d < dfs)
            .unwrap_or(self.cycles.len());
        self.cycles.insert(pos, (dfs, cycle));
    }

    /// Resolve a load, preferring the value stored to the same address earlier in the iteration
    fn resolve_load(&mut self, b: NodeId, uop_idx: usize, reg: Register) -> SliceResult<()> {
        let cfg = self.cfg;
        let uop = &cfg.node(b).uops[uop_idx];
        let key = (uop.pc, uop.idx);
        let base = uop
            .memory_src()
            .and_then(|m| self.ref_formulas.get(uop.pc, m.opidx))
            .and_then(|rf| rf.base.clone())
            .filter(|f| !f.is_constant_value(0));

        let mut spilled: Option<OperandInfo> = None;
        if let Some(base) = base.as_ref().filter(|_| self.follow_spills) {
            self.bounds.start_pc = uop.pc;
            if let Some(saved) = slice_follow_save(self, b, uop_idx, base)? {
                if let Some(rc) = self.values.claim_register(&saved) {
                    if rc.def_pc != NO_ADDRESS {
                        spilled = self.insts.get(&(rc.def_pc, rc.idx)).and_then(|s| {
                            Some(OperandInfo {
                                formula: s.formula.clone()?,
                                kind: s.kind,
                                target: s.dfs_target,
                            })
                        });
                    }
                }
            }
        }

        let si = self.insts.entry(key).or_default();
        match spilled {
            Some(OperandInfo {
                mut formula,
                kind,
                target,
            }) => {
                debug!("Load reads back a spilled value";
                       "pc" => format!("{:#x}", uop.pc), "value" => %formula);
                formula.set_indirect_access(uop.pc, uop.idx);
                si.formula = Some(formula);
                si.kind = kind;
                si.dfs_target = target;
            }
            None => {
                let mut f = match base.and_then(|b| b.constant_value()) {
                    Some(c) => Formula::reference(uop.pc, uop.idx, c.value()),
                    None => Formula::load(uop.pc, uop.idx, reg),
                };
                f.set_indirect_access(uop.pc, uop.idx);
                si.formula = Some(f);
                si.kind = StrideKind::Invariant;
            }
        }
        si.use_cached = true;
        Ok(())
    }

    /// Claim source operand `i` together with its stride facts
    fn operand_info(&mut self, uop: &MicroOp, i: usize) -> Option<OperandInfo> {
        let op = uop.srcs.get(i)?;
        let reg = match op {
            Operand::Immediate(v) => return Some(OperandInfo::invariant(Formula::constant(*v))),
            Operand::Memory(_) => return None,
            Operand::Register(r) => {
                let r = r.canonical();
                if let Some(v) = uop.hardwired_value(&r) {
                    return Some(OperandInfo::invariant(Formula::constant(v)));
                }
                r
            }
            Operand::Internal(_) => uop.operand_register(op)?,
        };
        let rc = match self.values.claim_register(&reg) {
            Some(rc) => rc,
            None => {
                debug!("No pending value for operand";
                       "pc" => format!("{:#x}", uop.pc), "operand" => i, "reg" => %reg);
                return None;
            }
        };
        if rc.def_pc == NO_ADDRESS {
            return Some(OperandInfo {
                formula: Formula::register(uop.pc, -1, reg),
                kind: StrideKind::Invariant,
                target: rc.target_dfs,
            });
        }
        let (formula, kind) = match self.insts.get(&(rc.def_pc, rc.idx)) {
            Some(StrideInst {
                formula: Some(f),
                kind,
                ..
            }) => (f.clone(), *kind),
            _ => (
                Formula::register(rc.def_pc, rc.idx, reg),
                StrideKind::Invariant,
            ),
        };
        Some(OperandInfo {
            formula,
            kind,
            target: rc.target_dfs,
        })
    }

    /// The value of source operand `i` as seen by `uop`, without consulting the slice
    fn operand_formula(uop: &MicroOp, i: usize) -> Formula {
        match uop.srcs.get(i) {
            Some(Operand::Immediate(v)) => Formula::constant(*v),
            Some(op @ Operand::Register(_)) | Some(op @ Operand::Internal(_)) => {
                match uop.operand_register(op) {
                    Some(r) => Formula::register(uop.pc, uop.idx, r.canonical()),
                    None => Formula::zero(),
                }
            }
            _ => Formula::zero(),
        }
    }

    fn easy_value(&self, uop: &MicroOp, reg: Register) -> SliceResult<Formula> {
        if !matches!(uop.kind, UopKind::Move | UopKind::Copy) {
            SliceError::NonMoveWithoutSources {
                pc: uop.pc,
                idx: uop.idx,
            }
            .report(self.strict)?;
            return Ok(Formula::register(uop.pc, uop.idx, reg));
        }
        let imms: Vec<i64> = uop.immediates().collect();
        if imms.len() != 1 {
            SliceError::UnexpectedOperandCount {
                pc: uop.pc,
                idx: uop.idx,
                count: imms.len(),
            }
            .report(self.strict)?;
            return Ok(Formula::register(uop.pc, uop.idx, reg));
        }
        Ok(Formula::constant(imms[0]))
    }

    /// An address computation: every register term contributes its own stride
    fn lea_value(&mut self, uop: &MicroOp) -> OperandInfo {
        let mem = match uop.srcs.first() {
            Some(Operand::Memory(m)) => m,
            _ => return OperandInfo::invariant(Formula::zero()),
        };
        let mut acc = OperandInfo::invariant(Formula::zero());
        let mut flags = Formula::zero();
        for (key, term) in uop.generic_formula_for_memory_operand(mem).terms() {
            let as_is = Formula::from_term(*key, term.coeff, term.origin);
            let part = match key {
                TermKey::Register { reg, .. } => {
                    if let Some(v) = uop.hardwired_value(reg) {
                        let mut c = Formula::constant(v);
                        c.scale(term.coeff);
                        OperandInfo::invariant(c)
                    } else {
                        match self.values.claim_register(reg) {
                            None => {
                                debug!("No pending value for address register";
                                       "pc" => format!("{:#x}", uop.pc), "reg" => %reg);
                                OperandInfo::invariant(as_is)
                            }
                            Some(rc) if rc.def_pc == NO_ADDRESS => OperandInfo {
                                formula: as_is,
                                kind: StrideKind::Invariant,
                                target: rc.target_dfs,
                            },
                            Some(rc) => match self.insts.get(&(rc.def_pc, rc.idx)) {
                                Some(StrideInst {
                                    formula: Some(f),
                                    kind,
                                    ..
                                }) => {
                                    let mut f = f.clone();
                                    f.scale(term.coeff);
                                    OperandInfo {
                                        formula: f,
                                        kind: *kind,
                                        target: rc.target_dfs,
                                    }
                                }
                                _ => OperandInfo {
                                    formula: as_is,
                                    kind: StrideKind::Invariant,
                                    target: rc.target_dfs,
                                },
                            },
                        }
                    }
                }
                _ => OperandInfo::invariant(as_is),
            };

            acc.target = min_target(acc.target, part.target);
            flags.inherit_access(&part.formula);
            if acc.kind.is_partial() || part.kind.is_partial() {
                acc.formula += &part.formula;
                acc.kind = StrideKind::Partial;
            } else if acc.kind == part.kind {
                acc.formula += &part.formula;
            } else {
                // One side is a stride, the other is invariant and does not change it
                if acc.kind == StrideKind::Invariant {
                    acc.formula = part.formula;
                }
                acc.kind = StrideKind::Stride;
            }
        }
        acc.formula.inherit_access(&flags);
        acc
    }

    /// Value of an arithmetic micro-op, from the pending values of its sources
    fn normal_value(&mut self, uop: &MicroOp, reg: Register) -> SliceResult<OperandInfo> {
        let opaque = || OperandInfo::invariant(Formula::register(uop.pc, uop.idx, reg));
        let num_src = uop.srcs.len()
            - uop
                .srcs
                .iter()
                .rev()
                .take_while(|s| matches!(s, Operand::Register(r) if r.is_flag_or_status()))
                .count();
        let three_ok =
            uop.kind == UopKind::Div || matches!(uop.op, CanonicalOp::Invalid | CanonicalOp::Sll);
        if num_src == 0 || num_src > 3 || (num_src == 3 && !three_ok) {
            SliceError::UnexpectedOperandCount {
                pc: uop.pc,
                idx: uop.idx,
                count: num_src,
            }
            .report(self.strict)?;
            return Ok(opaque());
        }
        if uop.kind == UopKind::Lea {
            return Ok(self.lea_value(uop));
        }
        if uop.op == CanonicalOp::Invalid {
            return Ok(opaque());
        }

        let missing = |s: &Self, operand: usize| -> SliceResult<OperandInfo> {
            SliceError::MissingOperand {
                pc: uop.pc,
                idx: uop.idx,
                operand,
            }
            .report(s.strict)?;
            Ok(opaque())
        };
        let o1 = match self.operand_info(uop, 0) {
            Some(o) => o,
            None => return missing(self, 0),
        };
        let o1b = if num_src == 3 {
            match self.operand_info(uop, 1) {
                Some(o) => Some(o),
                None => return missing(self, 1),
            }
        } else {
            None
        };
        let second = if num_src == 3 { 2 } else { 1 };
        let o2 = if num_src > 1 {
            match self.operand_info(uop, second) {
                Some(o) => o,
                None => return missing(self, second),
            }
        } else {
            if !matches!(uop.op, CanonicalOp::Mov | CanonicalOp::Not) {
                SliceError::UnexpectedOperandCount {
                    pc: uop.pc,
                    idx: uop.idx,
                    count: num_src,
                }
                .report(self.strict)?;
            }
            OperandInfo::invariant(Formula::zero())
        };
        Ok(combine_operands(uop, reg, num_src, second, o1, o1b, o2))
    }
}

/// Combine the operands of a two (or three) source operation. Values that are not affine in the
/// iteration count come out as an opaque register marked irregular.
fn combine_operands(
    uop: &MicroOp,
    reg: Register,
    num_src: usize,
    second: usize,
    o1: OperandInfo,
    o1b: Option<OperandInfo>,
    o2: OperandInfo,
) -> OperandInfo {
    use CanonicalOp::*;
    use StrideKind::*;

    let OperandInfo {
        formula: mut f1,
        kind: mut k1,
        target: t1,
    } = o1;
    let OperandInfo {
        formula: mut f2,
        kind: mut k2,
        target: t2,
    } = o2;
    let c1 = f1.constant_value();
    let c2 = f2.constant_value();

    let mut irregular = false;
    // A finished stride combined with an open cycle: the stride operand is really a value here
    if k1 == Partial && k2 == Stride {
        irregular |= c2.map_or(true, |c| !c.is_zero());
        f2 += &StrideSlicer::operand_formula(uop, second);
        k2 = Invariant;
    } else if k1 == Stride && k2 == Partial {
        irregular |= c1.map_or(true, |c| !c.is_zero());
        f1 += &StrideSlicer::operand_formula(uop, 0);
        k1 = Invariant;
    }
    let target = min_target(t1, t2);

    let mut flags = Formula::zero();
    flags.inherit_access(&f1);
    flags.inherit_access(&f2);
    if let Some(o1b) = &o1b {
        flags.inherit_access(&o1b.formula);
        k1 = StrideKind::join(k1, o1b.kind);
    }
    if irregular {
        flags.set_irregular_access();
    }

    let joined = StrideKind::join(k1, k2);
    let either_partial = k1.is_partial() || k2.is_partial();
    let opaque = || Formula::register(uop.pc, uop.idx, reg);
    let opaque_irregular = || {
        let mut f = opaque();
        f.set_irregular_access();
        f
    };
    let finish = |mut formula: Formula, kind: StrideKind| {
        formula.inherit_access(&flags);
        OperandInfo {
            formula,
            kind,
            target,
        }
    };

    match uop.op {
        Add | Mov => {
            return if either_partial {
                finish(f1 + &f2, Partial)
            } else if k1 == k2 {
                finish(f1 + &f2, k1)
            } else if k1 == Stride {
                finish(f1, Stride)
            } else {
                finish(f2, Stride)
            };
        }
        Sub => {
            return if k1 == k2 || k1 == Partial {
                finish(f1 - &f2, k1)
            } else if k2 == Partial {
                if c1.map_or(false, |c| c.is_zero()) {
                    finish(-f2, Partial)
                } else {
                    finish(opaque_irregular(), Partial)
                }
            } else if k1 == Stride {
                finish(f1, Stride)
            } else {
                finish(-f2, Stride)
            };
        }
        _ => {}
    }

    if (c1.is_none() && c2.is_none()) || (num_src == 3 && uop.op == Sll) {
        let f = if either_partial {
            opaque_irregular()
        } else {
            opaque()
        };
        return finish(f, joined);
    }

    let v1 = c1.map(|c| c.value());
    let v2 = c2.map(|c| c.value());

    if let Some(v2) = v2 {
        match uop.op {
            Sll => {
                let f = if v2 != 0 || k2 != Invariant {
                    if k1 == Partial || k2 != Invariant || !(0..63).contains(&v2) {
                        opaque_irregular()
                    } else {
                        f1 * (1i64 << v2)
                    }
                } else {
                    f1
                };
                return finish(f, joined);
            }
            Srl | Sra => {
                let f = if v2 != 0 || k2 != Invariant {
                    if k1 != Invariant || k2 != Invariant || !(0..63).contains(&v2) {
                        opaque_irregular()
                    } else {
                        let mut f = f1;
                        f /= 1i64 << v2;
                        if f.has_complex_denominator() {
                            opaque()
                        } else {
                            f
                        }
                    }
                } else {
                    f1
                };
                return finish(f, joined);
            }
            Or | AndN if v2 == 0 && k2 == Invariant => return finish(f1, k1),
            Mul => {
                return if either_partial {
                    finish(opaque_irregular(), Partial)
                } else {
                    finish(f1 * v2, k1.max(k2))
                };
            }
            Div => {
                let f = if k1 == Partial || k2 != Invariant {
                    opaque_irregular()
                } else if num_src == 3 || v2 == 0 {
                    opaque()
                } else {
                    let mut f = f1;
                    f /= v2;
                    if f.has_complex_denominator() {
                        opaque()
                    } else {
                        f
                    }
                };
                return finish(f, joined);
            }
            _ => {}
        }
    }

    if let Some(v1) = v1 {
        match uop.op {
            Or if v1 == 0 && k1 == Invariant => return finish(f2, k2),
            Mul => {
                return if either_partial {
                    finish(opaque_irregular(), Partial)
                } else {
                    finish(f2 * v1, k1.max(k2))
                };
            }
            _ => {}
        }
    }

    if let (Some(a), Some(b)) = (v1, v2) {
        let folded = match uop.op {
            Not => Some(!a),
            Or => Some(a | b),
            OrN => Some(a | !b),
            AndN => Some(a & !b),
            And => Some(a & b),
            Xor => Some(a ^ b),
            XNor => Some(!(a ^ b)),
            _ => None,
        };
        if let Some(v) = folded {
            let varies = k1 != Invariant || (uop.op != Not && k2 != Invariant);
            let f = if varies {
                opaque_irregular()
            } else {
                Formula::constant(v)
            };
            let kind = if uop.op == Not { k1 } else { joined };
            return finish(f, kind);
        }
    }

    let f = if either_partial {
        opaque_irregular()
    } else {
        opaque()
    };
    finish(f, joined)
}

impl<'a> Slicer<'a> for StrideSlicer<'a> {
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
        self.ref_formulas
    }

    fn strict(&self) -> bool {
        self.strict
    }

    fn slice(
        &mut self,
        b: NodeId,
        from_uop: usize,
        reg: Register,
        start_pc: Addr,
        to_pc: Addr,
    ) -> SliceResult<()> {
        self.start_be = self.back_edged;
        self.start_rank = self.path_rank(b);
        if let Some(uop) = self.cfg.node(b).uops.get(from_uop) {
            self.insts.entry((uop.pc, uop.idx)).or_default().loop_reg = Some(reg);
        }
        base_slice(self, b, from_uop, reg, start_pc, to_pc)
    }

    fn slice_in_uop(&mut self, b: NodeId, uop_idx: usize, reg: Register) -> SliceResult<bool> {
        let cfg = self.cfg;
        let uop = &cfg.node(b).uops[uop_idx];
        if self.outside_window(self.path_rank(b), uop.pc, false) {
            return Ok(false);
        }
        let back_edged = self.back_edged;
        let slice_key = self.session.slice_key;
        let si = self.insts.entry((uop.pc, uop.idx)).or_default();
        // Already being computed further up: this is a value cycle
        if si.loop_cnt > 0 {
            return Ok(false);
        }
        si.loop_cnt = back_edged as u32 + 1;
        self.session.dfs_count += 1;
        si.dfs_index = self.session.dfs_count;

        let reusable = si.formula.is_some()
            && (si.kind != StrideKind::Partial
                || (si.cache_key == slice_key
                    && Self::target_in_stack(&self.values, si.dfs_target)));
        si.use_cached = reusable;
        if reusable {
            return Ok(false);
        }
        si.formula = None;

        match slice_effect(uop) {
            SliceEffect::Easy | SliceEffect::Impossible => Ok(false),
            SliceEffect::Normal => {
                if uop.op == CanonicalOp::Invalid {
                    warn!("Micro-op with unmodeled semantics"; "pc" => format!("{:#x}", uop.pc));
                    return Ok(false);
                }
                let same_registers = matches!(
                    (uop.srcs.first(), uop.srcs.get(1)),
                    (Some(Operand::Register(a)), Some(Operand::Register(b))) if a == b
                );
                if matches!(uop.op, CanonicalOp::Xor | CanonicalOp::Sub) && same_registers {
                    debug!("Operation on identical registers yields zero";
                           "pc" => format!("{:#x}", uop.pc));
                    si.formula = Some(Formula::zero());
                    si.kind = StrideKind::Invariant;
                    si.dfs_target = 0;
                    si.use_cached = true;
                    return Ok(false);
                }
                Ok(true)
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
        let key = (uop.pc, uop.idx);
        if self.outside_window(self.path_rank(b), uop.pc, false) {
            self.insts.entry(key).or_default().loop_cnt = 0;
            self.values.push_register(reg, RegCache::invariant());
            return SliceError::OutsideIterationWindow {
                pc: uop.pc,
                idx: uop.idx,
            }
            .report(self.strict);
        }

        let back_edged = self.back_edged as u32;
        let slice_key = self.session.slice_key;
        let si = self.insts.entry(key).or_default();
        if si.loop_cnt > 0 && si.loop_cnt < back_edged + 1 {
            // Back around the loop to a micro-op still being computed: seed a new cycle
            let tracked = uop.is_load() || si.loop_reg.map_or(false, |r| uop.reads(&r));
            si.formula = Some(Formula::zero());
            si.kind = StrideKind::Partial;
            si.cache_key = slice_key;
            si.dfs_target = si.dfs_index;
            let dfs = si.dfs_index;
            let cycle = CycleInfo {
                pc: uop.pc,
                idx: uop.idx,
                count: back_edged + 1 - si.loop_cnt,
                reg: si.loop_reg,
            };
            trace!("Value cycle found";
                   "pc" => format!("{:#x}", uop.pc), "uop" => uop.idx,
                   "iterations" => cycle.count, "reg" => ?cycle.reg);
            self.push(reg, uop.pc, uop.idx, dfs);
            self.insert_cycle(dfs, cycle);
            if !tracked {
                SliceError::CycleWithoutTrackedRegister {
                    pc: uop.pc,
                    idx: uop.idx,
                }
                .report(self.strict)?;
            }
            return Ok(());
        }

        let at_cycle_start = self
            .cycles
            .first()
            .map_or(false, |(_, c)| c.pc == uop.pc && c.idx == uop.idx);
        let mut result: Option<OperandInfo> = None;
        if at_cycle_start {
            if uop.is_load() {
                result = Some(OperandInfo {
                    formula: si.formula.clone().unwrap_or_default(),
                    kind: si.kind,
                    target: si.dfs_target,
                });
            }
        } else if si.formula.is_some() {
            if si.use_cached {
                let target = si.dfs_target;
                si.loop_cnt = 0;
                self.push(reg, uop.pc, uop.idx, target);
                return Ok(());
            }
            si.formula = None;
        }

        let result = match result {
            Some(r) => r,
            None => match slice_effect(uop) {
                SliceEffect::Easy => OperandInfo::invariant(self.easy_value(uop, reg)?),
                SliceEffect::Normal => self.normal_value(uop, reg)?,
                SliceEffect::Hard => {
                    SliceError::MissingLoadValue {
                        pc: uop.pc,
                        idx: uop.idx,
                    }
                    .report(self.strict)?;
                    OperandInfo::invariant(Formula::load(uop.pc, uop.idx, reg))
                }
                SliceEffect::Impossible => {
                    // Nothing is known about what the callee returns
                    let mut f = Formula::register(uop.pc, uop.idx, reg);
                    f.set_guaranteed_indirect();
                    OperandInfo::invariant(f)
                }
            },
        };

        let OperandInfo {
            mut formula,
            kind,
            mut target,
        } = result;
        if formula.overflowed() {
            warn!("Stride definition overflows, keeping it opaque";
                  "pc" => format!("{:#x}", uop.pc), "uop" => uop.idx, "reg" => %reg);
            formula = Formula::register(uop.pc, uop.idx, reg);
            formula.set_irregular_access();
        }
        let si = self.insts.entry(key).or_default();
        si.formula = Some(formula);
        si.cache_key = slice_key;
        if at_cycle_start {
            // The cycle is closed once the combined value depends on nothing but itself
            if target == si.dfs_index {
                si.kind = StrideKind::Stride;
                target = 0;
            }
            while self
                .cycles
                .first()
                .map_or(false, |(_, c)| c.pc == uop.pc && c.idx == uop.idx)
            {
                self.cycles.remove(0);
            }
        } else {
            si.kind = kind;
        }
        si.dfs_target = target;
        si.loop_cnt = 0;
        trace!("Stride definition";
               "pc" => format!("{:#x}", uop.pc), "uop" => uop.idx, "reg" => %reg,
               "formula" => ?si.formula, "kind" => ?si.kind, "target" => target);
        self.push(reg, uop.pc, uop.idx, target);
        if CONFIG.debug_print_value_stack {
            self.values.dump();
        }
        Ok(())
    }

    fn slice_in_edge(&mut self, e: EdgeId, _reg: &Register) -> bool {
        let takes = self
            .path
            .as_ref()
            .map_or(false, |p| p.takes_edge(self.cfg, e));
        if !takes {
            return false;
        }
        if is_loop_back_edge(self.cfg, e, self.marker) {
            self.back_edged += 1;
        }
        true
    }

    fn slice_out_edge(&mut self, e: EdgeId, _reg: &Register) {
        if is_loop_back_edge(self.cfg, e, self.marker) {
            self.back_edged -= 1;
        }
    }

    fn slice_next_in(&mut self, b: NodeId, reg: &Register) -> bool {
        let start = self.cfg.node(b).start;
        if self.outside_window(self.path_rank(b), start, true) {
            self.values.push_register(*reg, RegCache::invariant());
            return false;
        }
        true
    }

    fn slice_next_out(&mut self, _b: NodeId, reg: &Register) {
        self.values.push_register(*reg, RegCache::invariant());
    }

    fn record_register_value(&mut self, reg: Register, uop: &MicroOp, value: i64) {
        // Stores create no value of their own, so their site can hold the stored constant
        if !uop.is_store() {
            return;
        }
        self.push(reg, uop.pc, uop.idx, 0);
        let si = self.insts.entry((uop.pc, uop.idx)).or_default();
        si.formula = Some(Formula::constant(value));
        si.kind = StrideKind::Invariant;
        si.dfs_target = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(s: &str) -> Register {
        Register::from_name(s).unwrap().canonical()
    }

    fn info(formula: Formula, kind: StrideKind, target: u64) -> OperandInfo {
        OperandInfo {
            formula,
            kind,
            target,
        }
    }

    fn alu(op: CanonicalOp, srcs: Vec<Operand>) -> MicroOp {
        let mut u = MicroOp::new(0x40, 0, UopKind::Alu, op);
        u.dests = vec![Operand::Register(reg("rax"))];
        u.srcs = srcs;
        u
    }

    #[test]
    fn adding_an_invariant_to_an_open_cycle_accumulates() {
        let u = alu(
            CanonicalOp::Add,
            vec![Operand::Register(reg("rax")), Operand::Immediate(4)],
        );
        let r = combine_operands(
            &u,
            reg("rax"),
            2,
            1,
            info(Formula::zero(), StrideKind::Partial, 3),
            None,
            info(Formula::constant(4), StrideKind::Invariant, 0),
        );
        assert_eq!(r.formula, Formula::constant(4));
        assert_eq!(r.kind, StrideKind::Partial);
        assert_eq!(r.target, 3);
    }

    #[test]
    fn scaling_a_stride_and_an_open_cycle() {
        let u = alu(
            CanonicalOp::Sll,
            vec![Operand::Register(reg("rax")), Operand::Immediate(3)],
        );
        let stride = combine_operands(
            &u,
            reg("rax"),
            2,
            1,
            info(Formula::constant(2), StrideKind::Stride, 0),
            None,
            info(Formula::constant(3), StrideKind::Invariant, 0),
        );
        assert_eq!(stride.formula, Formula::constant(16));
        assert_eq!(stride.kind, StrideKind::Stride);

        let mul = alu(
            CanonicalOp::Mul,
            vec![Operand::Register(reg("rax")), Operand::Immediate(2)],
        );
        let geometric = combine_operands(
            &mul,
            reg("rax"),
            2,
            1,
            info(Formula::zero(), StrideKind::Partial, 1),
            None,
            info(Formula::constant(2), StrideKind::Invariant, 0),
        );
        assert!(geometric.formula.is_irregular());
        assert_eq!(geometric.kind, StrideKind::Partial);
    }

    #[test]
    fn subtracting_from_zero_negates_the_cycle() {
        let u = alu(
            CanonicalOp::Sub,
            vec![Operand::Immediate(0), Operand::Register(reg("rax"))],
        );
        let r = combine_operands(
            &u,
            reg("rax"),
            2,
            1,
            info(Formula::constant(0), StrideKind::Invariant, 0),
            None,
            info(Formula::constant(8), StrideKind::Partial, 2),
        );
        assert_eq!(r.formula, Formula::constant(-8));
        assert_eq!(r.kind, StrideKind::Partial);
    }

    #[test]
    fn cycles_are_ordered_by_visit() {
        let cfg = Cfg::new("empty");
        let rf = RefFormulasMap::new();
        let mut s = StrideSlicer::new(&cfg, &rf, 1, SliceSession::default());
        for dfs in [2, 5, 3] {
            s.insert_cycle(
                dfs,
                CycleInfo {
                    pc: dfs,
                    idx: 0,
                    count: 1,
                    reg: None,
                },
            );
        }
        let order: Vec<_> = s.cycles.iter().map(|(d, _)| *d).collect();
        assert_eq!(order, vec![5, 3, 2]);
        s.clear();
        assert!(s.cycles.is_empty());
    }

    /// rbx = rax + 8; rax = rbx + 4 on every iteration
    fn two_step_loop() -> Cfg {
        crate::cfg_lifter::lift_from(
            "LOOPS 0
             BLOCK 0 rank=0 marker=0 entry
             0x10 4 move mov rax <- #0
             BLOCK 1 rank=1 marker=1
             0x20 4 alu add rbx rflags <- rax #8
             0x24 4 alu add rax rflags <- rbx #4
             0x28 4 load mov rcx <- [rax]@0
             0x2c 4 load mov rdx <- [rbx]@0
             BLOCK 2 rank=2 marker=0
             EDGE 0 1
             EDGE 1 1 back
             EDGE 1 2",
        )
        .unwrap()
    }

    fn seeded(formula: i64, kind: StrideKind, cache_key: u64) -> StrideInst {
        StrideInst {
            formula: Some(Formula::constant(formula)),
            kind,
            cache_key,
            ..Default::default()
        }
    }

    #[test]
    fn partial_sum_from_an_earlier_slice_is_recomputed() {
        let cfg = two_step_loop();
        let rf = RefFormulasMap::new();
        let mut s = StrideSlicer::new(&cfg, &rf, 1, SliceSession::default()).with_strictness(true);
        s.insts.insert((0x20, 0), seeded(999, StrideKind::Partial, 0));

        let stride = s.compute_formula_for_memory_operand(NodeId(1), 2, 0).unwrap();
        assert_eq!(stride, Formula::constant(12));
        let rbx = s.stride_inst(0x20, 0).unwrap();
        assert_eq!(rbx.formula, Some(Formula::constant(8)));
        assert_eq!(rbx.kind, StrideKind::Partial);
        assert_eq!(rbx.cache_key, 1);
    }

    #[test]
    fn finished_stride_is_reused_in_later_slices() {
        let cfg = two_step_loop();
        let rf = RefFormulasMap::new();
        let mut s = StrideSlicer::new(&cfg, &rf, 1, SliceSession::default()).with_strictness(true);
        s.insts.insert((0x20, 0), seeded(999, StrideKind::Stride, 0));

        let stride = s.compute_formula_for_memory_operand(NodeId(1), 2, 0).unwrap();
        assert_eq!(stride, Formula::constant(999));
        let rbx = s.stride_inst(0x20, 0).unwrap();
        assert_eq!(rbx.formula, Some(Formula::constant(999)));
        assert_eq!(rbx.cache_key, 0);
    }
}
