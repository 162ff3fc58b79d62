//! Routine-level driver: base and stride formulas for every memory operand of a routine.

use crate::cfg::{Cfg, NodeId};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::{SliceError, SliceResult};
use crate::formula::{Formula, RefFormulasMap};
use crate::insn::UopKind;
use crate::log::*;
use crate::reference_slice::ReferenceSlicer;
use crate::register::Addr;
use crate::stride_slice::{SliceSession, StrideSlicer};

/// Where a memory operand lives in the graph
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperandSite {
    pub block: NodeId,
    pub uop_idx: usize,
    pub pc: Addr,
    pub opidx: i32,
    /// Innermost loop containing the operand; 0 outside loops
    pub marker: u32,
}

/// All address formulas of a routine, along with the order in which operands were visited
#[derive(Debug)]
pub struct RoutineFormulas {
    pub name: String,
    pub sites: Vec<OperandSite>,
    pub ref_formulas: RefFormulasMap,
}

impl RoutineFormulas {
    pub fn base(&self, pc: Addr, opidx: i32) -> Option<&Formula> {
        self.ref_formulas.get(pc, opidx)?.base.as_ref()
    }

    /// Strides of the operand, innermost loop first
    pub fn strides(&self, pc: Addr, opidx: i32) -> &[Formula] {
        self.ref_formulas
            .get(pc, opidx)
            .map_or(&[][..], |rf| rf.strides())
    }
}

impl std::fmt::Display for RoutineFormulas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "routine {}", self.name)?;
        for site in &self.sites {
            write!(f, "{:#x}@{} B{}", site.pc, site.opidx, site.block.0)?;
            match self.base(site.pc, site.opidx) {
                Some(base) => write!(f, " base={}", base)?,
                None => write!(f, " base=?")?,
            }
            for (level, stride) in self.strides(site.pc, site.opidx).iter().enumerate() {
                write!(f, " stride[{}]={}", level, stride)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Memory operands of the routine, block by block in rank order
fn operand_sites(cfg: &Cfg) -> Vec<OperandSite> {
    let mut blocks: Vec<_> = cfg.nodes().collect();
    blocks.sort_by_key(|n| (n.rank, n.id));
    let mut sites = vec![];
    let mut seen = UnorderedSet::new();
    for node in blocks {
        for (uop_idx, uop) in node.uops.iter().enumerate() {
            // Address computations do not touch memory
            if uop.kind == UopKind::Lea {
                continue;
            }
            for mem in uop.memory_operands() {
                if !seen.insert((uop.pc, mem.opidx)) {
                    continue;
                }
                sites.push(OperandSite {
                    block: node.id,
                    uop_idx,
                    pc: uop.pc,
                    opidx: mem.opidx,
                    marker: node.marker,
                });
            }
        }
    }
    sites
}

/// Compute the base formula of every memory operand of `cfg`, and its stride with respect to
/// every loop enclosing it.
pub fn analyze_routine(cfg: &Cfg) -> SliceResult<RoutineFormulas> {
    info!("Analyzing routine"; "routine" => &cfg.name, "blocks" => cfg.num_nodes());
    let sites = operand_sites(cfg);

    // Bases first, in rank order, so that spill matching sees the bases of earlier stores
    let mut reference = ReferenceSlicer::new(cfg);
    for site in &sites {
        let base =
            reference.compute_formula_for_memory_operand(site.block, site.uop_idx, site.opidx)?;
        reference.ref_formulas_mut().get_or_insert(site.pc, site.opidx).base = Some(base);
    }
    let mut ref_formulas = reference.into_ref_formulas();

    let mut strides: Vec<(OperandSite, usize, Formula)> = vec![];
    {
        let rf = &ref_formulas;
        let mut slicers: UnorderedMap<u32, StrideSlicer> = UnorderedMap::new();
        let mut session = SliceSession::default();
        for site in sites.iter().filter(|s| s.marker > 0) {
            if rf.get(site.pc, site.opidx).and_then(|r| r.base.as_ref()).is_none() {
                return Err(SliceError::MissingBaseFormula {
                    pc: site.pc,
                    opidx: site.opidx,
                });
            }
            let mut marker = site.marker;
            let mut level = 0;
            while marker > 0 {
                let slicer = slicers
                    .entry(marker)
                    .or_insert_with(|| StrideSlicer::new(cfg, rf, marker, session));
                slicer.resume(session);
                let res = slicer.compute_formula_for_memory_operand(
                    site.block,
                    site.uop_idx,
                    site.opidx,
                );
                session = slicer.session();
                match res {
                    Ok(stride) => strides.push((*site, level, stride)),
                    Err(e @ SliceError::NoCyclicPath { .. }) => {
                        warn!("Skipping outer loop levels"; "pc" => format!("{:#x}", site.pc),
                              "opidx" => site.opidx, "reason" => %e);
                        break;
                    }
                    Err(e) => return Err(e),
                }
                marker = cfg.loop_parent(marker).unwrap_or(0);
                level += 1;
            }
        }
    }

    for (site, level, stride) in strides {
        ref_formulas
            .get_or_insert(site.pc, site.opidx)
            .record_stride(site.pc, site.opidx, level, stride)?;
    }

    Ok(RoutineFormulas {
        name: cfg.name.clone(),
        sites,
        ref_formulas,
    })
}
