use crate::analysis::analyze_routine;
use crate::cfg::{Cfg, NodeId};
use crate::cfg_lifter::lift_from;
use crate::error::SliceError;
use crate::formula::Formula;
use crate::reference_slice::ReferenceSlicer;
use crate::register::Register;
use crate::stride_slice::{SliceSession, StrideKind, StrideSlicer};

fn reg(s: &str) -> Register {
    Register::from_name(s).unwrap().canonical()
}

fn lift(text: &str) -> Cfg {
    lift_from(text).unwrap()
}

/// A one-block loop stepping `rax` by `step`, and loading through it
fn stepping_loop(step: &str) -> Cfg {
    lift(&format!(
        "CFG stepping
         LOOPS 0
         BLOCK 0 rank=0 marker=0 entry
         0x10 4 move mov rax <- #0
         BLOCK 1 rank=1 marker=1
         0x20 4 alu {} rax rflags <- rax #{}
         0x24 4 load mov rcx <- [rax]@0
         BLOCK 2 rank=2 marker=0
         EDGE 0 1
         EDGE 1 1 back
         EDGE 1 2",
        if step.starts_with('*') { "mul" } else { "add" },
        &step[1..],
    ))
}

#[test]
fn xor_of_a_register_with_itself_is_zero() {
    let cfg = lift(
        "BLOCK 0 rank=0 marker=0 entry
         0x10 4 alu xor rax rflags <- rax rax
         0x14 4 load mov rcx <- [rax]@0",
    );
    let mut s = ReferenceSlicer::new(&cfg).with_strictness(true);
    let f = s.compute_formula_for_memory_operand(NodeId(0), 1, 0).unwrap();
    assert!(f.is_constant_value(0));
    assert!(s.values().is_empty());
}

#[test]
fn reference_slicing_does_not_cross_back_edges() {
    let cfg = lift(
        "LOOPS 0
         BLOCK 0 rank=0 marker=1
         0x40 4 load mov rcx <- [rax+8]@0
         EDGE 0 0 back",
    );
    let mut s = ReferenceSlicer::new(&cfg).with_strictness(true);
    let f = s.compute_formula_for_memory_operand(NodeId(0), 0, 0).unwrap();
    assert_eq!(f, Formula::register(0x40, 0, reg("rax")) + &Formula::constant(8));

    // Nothing in the loop changes rax, so its stride is zero
    let formulas = analyze_routine(&cfg).unwrap();
    assert_eq!(formulas.strides(0x40, 0), &[Formula::zero()]);
}

#[test]
fn affine_stride() {
    let cfg = stepping_loop("+4");
    let formulas = analyze_routine(&cfg).unwrap();
    assert_eq!(formulas.base(0x24, 0), Some(&Formula::constant(4)));
    assert_eq!(formulas.strides(0x24, 0), &[Formula::constant(4)]);
    assert!(formulas.to_string().contains("0x24@0 B1 base=4 stride[0]=4"));

    let rf = &formulas.ref_formulas;
    let mut s = StrideSlicer::new(&cfg, rf, 1, SliceSession::default()).with_strictness(true);
    let stride = s.compute_formula_for_memory_operand(NodeId(1), 1, 0).unwrap();
    assert_eq!(stride, Formula::constant(4));
    let def = s.stride_inst(0x20, 0).unwrap();
    assert_eq!(def.kind, StrideKind::Stride);
    assert_eq!(def.loop_cnt, 0);
    assert_eq!(s.session().slice_key, 1);
}

#[test]
fn geometric_stride_is_irregular() {
    let cfg = stepping_loop("*2");
    let formulas = analyze_routine(&cfg).unwrap();
    let strides = formulas.strides(0x24, 0);
    assert_eq!(strides.len(), 1);
    assert!(strides[0].is_irregular());
    assert!(strides[0].same_terms(&Formula::register(0x20, 0, reg("rax"))));
    assert!(strides[0].constant_value().is_none());
}

#[test]
fn spilled_register_is_read_back() {
    let cfg = lift(
        "CFG spill
         BLOCK 0 rank=0 marker=0 entry
         0x10 4 store mov [rsp-8]@0 <- rdi
         0x14 4 alu add rbx rflags <- rbx #1
         0x18 4 load mov rax <- [rsp-8]@0
         0x1c 4 load mov rcx <- [rax+16]@0",
    );
    let formulas = analyze_routine(&cfg).unwrap();
    let slot = Formula::register(0x10, 0, reg("rsp")) - &Formula::constant(8);
    assert_eq!(formulas.base(0x10, 0), Some(&slot));
    assert_eq!(formulas.base(0x18, 0), Some(&slot));
    assert_eq!(
        formulas.base(0x1c, 0),
        Some(&(Formula::register(0x10, 0, reg("rdi")) + &Formula::constant(16)))
    );
    assert!(formulas.strides(0x1c, 0).is_empty());
}

#[test]
fn call_results_are_opaque() {
    let cfg = lift(
        "CFG caller
         BLOCK 0 rank=0 marker=0 entry
         0x10 4 branch invalid rax <- call target=0x6000
         BLOCK 1 rank=1 marker=0 surrogate=0x5000 at=0x14
         BLOCK 2 rank=2 marker=0
         0x20 4 load mov rcx <- [rax+8]@0
         EDGE 0 1
         EDGE 1 2",
    );
    let formulas = analyze_routine(&cfg).unwrap();
    // The surrogate's target wins over the one recorded on the branch
    assert_eq!(
        formulas.base(0x20, 0),
        Some(&(Formula::call(0x10, 0, 0x5000) + &Formula::constant(8)))
    );
}

/// rbx = rax + 8; rax = rbx + 4 on every iteration
fn two_step_loop() -> Cfg {
    lift(
        "CFG two_step
         LOOPS 0
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
}

#[test]
fn partial_sums_are_not_reused_across_slices() {
    let cfg = two_step_loop();
    let formulas = analyze_routine(&cfg).unwrap();
    assert_eq!(formulas.strides(0x28, 0), &[Formula::constant(12)]);
    assert_eq!(formulas.strides(0x2c, 0), &[Formula::constant(12)]);

    let rf = &formulas.ref_formulas;
    let mut s = StrideSlicer::new(&cfg, rf, 1, SliceSession::default()).with_strictness(true);
    s.compute_formula_for_memory_operand(NodeId(1), 2, 0).unwrap();
    // rbx is only part way around the cycle that starts at the definition of rax
    let rbx = s.stride_inst(0x20, 0).unwrap();
    assert_eq!(rbx.kind, StrideKind::Partial);
    assert_eq!(rbx.formula, Some(Formula::constant(8)));
    assert_eq!(rbx.cache_key, 1);

    let stride = s.compute_formula_for_memory_operand(NodeId(1), 3, 0).unwrap();
    assert_eq!(stride, Formula::constant(12));
    let rbx = s.stride_inst(0x20, 0).unwrap();
    assert_eq!(rbx.kind, StrideKind::Stride);
    assert_eq!(rbx.cache_key, 2);
}

#[test]
fn nested_loops_get_one_stride_per_level() {
    // for (rsi = 0; ; rsi += 64) for (rcx = 0; ; rcx++) load [rsi + rcx*4]
    let cfg = lift(
        "CFG nested
         LOOPS 0 1
         BLOCK 0 rank=0 marker=0 entry
         0x10 4 move mov rsi <- #0
         BLOCK 1 rank=1 marker=1
         0x20 4 move mov rcx <- #0
         BLOCK 2 rank=2 marker=2
         0x30 4 alu add rcx rflags <- rcx #1
         0x34 4 lea add rdx <- [rsi+rcx*4]@0
         0x38 4 load mov rax <- [rdx]@0
         BLOCK 3 rank=3 marker=1
         0x40 4 alu add rsi rflags <- rsi #64
         BLOCK 4 rank=4 marker=0
         EDGE 0 1
         EDGE 1 2
         EDGE 2 2 back
         EDGE 2 3
         EDGE 3 1 back
         EDGE 3 4",
    );
    let formulas = analyze_routine(&cfg).unwrap();
    assert_eq!(formulas.base(0x38, 0), Some(&Formula::constant(4)));
    assert_eq!(
        formulas.strides(0x38, 0),
        &[Formula::constant(4), Formula::constant(64)]
    );
    // Address computations are not memory accesses
    assert!(formulas.base(0x34, 0).is_none());
}

#[test]
fn loop_without_cyclic_path_has_no_strides() {
    let cfg = lift(
        "LOOPS 0
         BLOCK 0 rank=0 marker=0 entry
         0x10 4 move mov rax <- #0x100
         BLOCK 1 rank=1 marker=1
         0x20 4 load mov rcx <- [rax]@0
         EDGE 0 1",
    );
    let formulas = analyze_routine(&cfg).unwrap();
    assert_eq!(formulas.base(0x20, 0), Some(&Formula::constant(0x100)));
    assert!(formulas.strides(0x20, 0).is_empty());
}

#[test]
fn analysis_is_deterministic() {
    let cfg = two_step_loop();
    let first = analyze_routine(&cfg).unwrap().to_string();
    let second = analyze_routine(&cfg).unwrap().to_string();
    assert_eq!(first, second);

    let mut a = ReferenceSlicer::new(&cfg);
    let mut b = ReferenceSlicer::new(&cfg);
    assert_eq!(
        a.compute_formula_for_memory_operand(NodeId(1), 3, 0).unwrap(),
        b.compute_formula_for_memory_operand(NodeId(1), 3, 0).unwrap()
    );
}

#[test]
fn loop_tree_rejects_parents_that_do_not_enclose() {
    let mut cfg = Cfg::new("nest");
    assert_eq!(
        cfg.set_loop_parents(&[0, 2]),
        Err(SliceError::BadLoopParent {
            marker: 2,
            parent: 2
        })
    );
    assert_eq!(cfg.loop_parent(1), None);
    cfg.set_loop_parents(&[0, 1, 1]).unwrap();
    assert_eq!(cfg.loop_parent(3), Some(1));
}

#[test]
fn negating_the_smallest_constant_stays_opaque() {
    let cfg = lift(
        "BLOCK 0 rank=0 marker=0 entry
         0x10 4 move mov rax <- #0x4000000000000000
         0x14 4 alu mul rax <- rax #2
         0x18 4 alu sub rbx rflags <- #0 rax
         0x1c 4 load mov rcx <- [rbx]@0",
    );
    let formulas = analyze_routine(&cfg).unwrap();
    assert_eq!(
        formulas.base(0x1c, 0),
        Some(&Formula::register(0x18, 0, reg("rbx")))
    );
}

#[test]
fn overflowing_coefficients_stay_opaque() {
    let cfg = lift(
        "BLOCK 0 rank=0 marker=0 entry
         0x10 4 alu mul rax <- rdi #0x10000000000
         0x14 4 alu mul rax <- rax #0x10000000000
         0x18 4 load mov rcx <- [rax]@0",
    );
    let formulas = analyze_routine(&cfg).unwrap();
    let base = formulas.base(0x18, 0).unwrap();
    assert!(!base.overflowed());
    assert_eq!(base, &Formula::register(0x14, 0, reg("rax")));
}

#[test]
fn wide_double_shift_is_opaque() {
    let cfg = lift(
        "BLOCK 0 rank=0 marker=0 entry
         0x10 4 move mov rbx <- #-1
         0x14 4 alu sll rax <- rdi rbx #4 width=128
         0x18 4 load mov rcx <- [rax]@0",
    );
    let formulas = analyze_routine(&cfg).unwrap();
    assert_eq!(
        formulas.base(0x18, 0),
        Some(&Formula::register(0x14, 0, reg("rax")))
    );
}

#[test]
fn read_modify_write_is_one_site() {
    let cfg = lift(
        "BLOCK 0 rank=0 marker=0 entry
         0x10 4 load mov t0 <- [rdi]@0
         0x10 4 alu add t0 rflags <- t0 #1
         0x10 4 store mov [rdi]@0 <- t0",
    );
    let formulas = analyze_routine(&cfg).unwrap();
    assert_eq!(formulas.sites.len(), 1);
    assert_eq!(formulas.sites[0].uop_idx, 0);
    assert!(formulas.base(0x10, 0).is_some());
}
