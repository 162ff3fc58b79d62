//! Symbolic affine formulas over tagged terms, together with the per-memory-operand store of base
//! and stride formulas.

use std::collections::{BTreeMap, BTreeSet};

use crate::containers::unordered::UnorderedMap;
use crate::error::{SliceError, SliceResult};
use crate::register::{Addr, Register};

fn gcd(a: i128, b: i128) -> i128 {
    let (mut a, mut b) = (a.abs(), b.abs());
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// A rational coefficient, always kept reduced with a positive denominator.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Coeff {
    pub num: i64,
    pub den: i64,
}

impl Coeff {
    pub const ZERO: Coeff = Coeff { num: 0, den: 1 };
    pub const ONE: Coeff = Coeff { num: 1, den: 1 };

    /// `num / den`, or `None` if `den` is zero or the reduced fraction does not fit
    pub fn new(num: i64, den: i64) -> Option<Self> {
        Self::reduced(num.into(), den.into())
    }

    fn reduced(num: i128, den: i128) -> Option<Self> {
        if den == 0 {
            return None;
        }
        let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
        let g = gcd(num, den).max(1);
        Some(Self {
            num: i64::try_from(num / g).ok()?,
            den: i64::try_from(den / g).ok()?,
        })
    }

    pub fn is_zero(&self) -> bool {
        self.num == 0
    }

    /// Integer quotient of the coefficient, truncating towards zero
    pub fn value(&self) -> i64 {
        self.num / self.den
    }

    /// The coefficient is not an integer
    pub fn is_fractional(&self) -> bool {
        self.den != 1
    }

    fn checked_add(self, o: Self) -> Option<Self> {
        Self::reduced(
            i128::from(self.num) * i128::from(o.den) + i128::from(o.num) * i128::from(self.den),
            i128::from(self.den) * i128::from(o.den),
        )
    }

    fn checked_mul(self, o: Self) -> Option<Self> {
        Self::reduced(
            i128::from(self.num) * i128::from(o.num),
            i128::from(self.den) * i128::from(o.den),
        )
    }

    fn checked_neg(self) -> Option<Self> {
        Some(Self {
            num: self.num.checked_neg()?,
            den: self.den,
        })
    }
}

impl From<i64> for Coeff {
    fn from(v: i64) -> Self {
        Self { num: v, den: 1 }
    }
}

impl std::fmt::Display for Coeff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.den == 1 {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

impl std::fmt::Debug for Coeff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Identity of a term. Terms with equal keys are merged by adding their coefficients. The variant
/// order is significant: it is the order in which terms are kept and printed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TermKey {
    /// Value returned by a call to `target`, made by micro-op `(pc, idx)`
    Call { pc: Addr, idx: i32, target: Addr },
    /// A load from a constant address
    Reference { aux: i64 },
    /// A stack slot
    Stack { aux: i64 },
    /// An unresolved load
    Load { pc: Addr, idx: i32, reg: Register },
    /// The unresolved value of `reg` at micro-op `(pc, idx)`
    Register { pc: Addr, idx: i32, reg: Register },
    Constant,
}

impl TermKey {
    pub fn is_constant(&self) -> bool {
        matches!(self, TermKey::Constant)
    }
}

/// A coefficient together with the micro-op that first produced the term
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Term {
    pub coeff: Coeff,
    pub origin: Option<(Addr, i32)>,
}

impl Term {
    /// The program point at which the term was defined, if it has one
    pub fn def_pc(&self, key: &TermKey) -> Option<Addr> {
        match key {
            TermKey::Call { pc, .. } | TermKey::Load { pc, .. } | TermKey::Register { pc, .. } => {
                Some(*pc)
            }
            TermKey::Reference { .. } | TermKey::Stack { .. } => self.origin.map(|(pc, _)| pc),
            TermKey::Constant => None,
        }
    }
}

/// Whether an access goes through an address that was itself loaded from memory
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum IndirectAccess {
    #[default]
    None,
    /// Indirect, regardless of what the loads listed elsewhere turn out to be
    Guaranteed,
    /// Indirect if any of the loads at these `(pc, micro-op)` locations is itself indirect
    Deferred(BTreeSet<(Addr, i32)>),
}

impl IndirectAccess {
    fn merge(&mut self, other: &IndirectAccess) {
        match other {
            IndirectAccess::None => {}
            IndirectAccess::Guaranteed => *self = IndirectAccess::Guaranteed,
            IndirectAccess::Deferred(o) => match *self {
                IndirectAccess::Guaranteed => {}
                IndirectAccess::Deferred(ref mut s) => s.extend(o.iter().copied()),
                IndirectAccess::None => *self = IndirectAccess::Deferred(o.clone()),
            },
        }
    }
}

/// Side information carried along with a formula
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AccessInfo {
    pub irregular: bool,
    pub indirect: IndirectAccess,
}

/// A sum of tagged terms with rational coefficients. An empty formula is the constant 0.
///
/// Coefficients that no longer fit in 64 bits leave the formula marked as overflowed; its terms
/// are then meaningless, and consumers replace it with an opaque term.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Formula {
    terms: BTreeMap<TermKey, Term>,
    access: AccessInfo,
    overflow: bool,
}

impl Formula {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn constant(v: i64) -> Self {
        Self::from_term(TermKey::Constant, Coeff::from(v), None)
    }

    pub fn from_term(key: TermKey, coeff: Coeff, origin: Option<(Addr, i32)>) -> Self {
        let mut r = Self::zero();
        r.add_term(key, coeff, origin);
        r
    }

    /// The opaque value of `reg` as seen by micro-op `(pc, idx)`
    pub fn register(pc: Addr, idx: i32, reg: Register) -> Self {
        Self::from_term(TermKey::Register { pc, idx, reg }, Coeff::ONE, Some((pc, idx)))
    }

    /// The opaque value loaded into `reg` by micro-op `(pc, idx)`
    pub fn load(pc: Addr, idx: i32, reg: Register) -> Self {
        Self::from_term(TermKey::Load { pc, idx, reg }, Coeff::ONE, Some((pc, idx)))
    }

    /// The value stored at constant address `aux`, loaded by micro-op `(pc, idx)`
    pub fn reference(pc: Addr, idx: i32, aux: i64) -> Self {
        Self::from_term(TermKey::Reference { aux }, Coeff::ONE, Some((pc, idx)))
    }

    pub fn call(pc: Addr, idx: i32, target: Addr) -> Self {
        Self::from_term(TermKey::Call { pc, idx, target }, Coeff::ONE, Some((pc, idx)))
    }

    /// Add `coeff * key`, dropping the term if its coefficient cancels out.
    pub fn add_term(&mut self, key: TermKey, coeff: Coeff, origin: Option<(Addr, i32)>) {
        if coeff.is_zero() {
            return;
        }
        use std::collections::btree_map::Entry;
        match self.terms.entry(key) {
            Entry::Vacant(v) => {
                v.insert(Term { coeff, origin });
            }
            Entry::Occupied(mut o) => match o.get().coeff.checked_add(coeff) {
                Some(c) if c.is_zero() => {
                    o.remove();
                }
                Some(c) => o.get_mut().coeff = c,
                None => self.overflow = true,
            },
        }
    }

    pub fn terms(&self) -> impl Iterator<Item = (&TermKey, &Term)> {
        self.terms.iter()
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    /// If every term is a constant, the value of the formula
    pub fn constant_value(&self) -> Option<Coeff> {
        if self.overflow {
            return None;
        }
        let mut r = Coeff::ZERO;
        for (k, t) in &self.terms {
            if !k.is_constant() {
                return None;
            }
            r = r.checked_add(t.coeff)?;
        }
        Some(r)
    }

    /// Some coefficient arithmetic on the way to this formula overflowed
    pub fn overflowed(&self) -> bool {
        self.overflow
    }

    pub fn is_constant(&self) -> bool {
        self.terms.keys().all(TermKey::is_constant)
    }

    /// Whether the formula is exactly the constant `v`
    pub fn is_constant_value(&self, v: i64) -> bool {
        self.constant_value() == Some(Coeff::from(v))
    }

    /// Structural equality of the terms, ignoring access side information
    pub fn same_terms(&self, other: &Self) -> bool {
        self.terms.len() == other.terms.len()
            && self
                .terms
                .iter()
                .zip(other.terms.iter())
                .all(|((k1, t1), (k2, t2))| k1 == k2 && t1.coeff == t2.coeff)
    }

    /// A non-constant term is divided by something that does not divide its coefficient
    pub fn has_complex_denominator(&self) -> bool {
        self.terms
            .iter()
            .any(|(k, t)| !k.is_constant() && t.coeff.is_fractional())
    }

    /// Some non-constant term was defined at an address below `pc`
    pub fn defined_before_pc(&self, pc: Addr) -> bool {
        self.terms
            .iter()
            .any(|(k, t)| t.def_pc(k).map_or(false, |d| d < pc))
    }

    pub fn access(&self) -> &AccessInfo {
        &self.access
    }

    pub fn set_irregular_access(&mut self) {
        self.access.irregular = true;
    }

    pub fn is_irregular(&self) -> bool {
        self.access.irregular
    }

    pub fn set_guaranteed_indirect(&mut self) {
        self.access.indirect = IndirectAccess::Guaranteed;
    }

    /// Mark the formula as depending on the value loaded by micro-op `(pc, idx)`
    pub fn set_indirect_access(&mut self, pc: Addr, idx: i32) {
        match self.access.indirect {
            IndirectAccess::Guaranteed => {}
            IndirectAccess::Deferred(ref mut pcs) => {
                pcs.insert((pc, idx));
            }
            IndirectAccess::None => {
                self.access.indirect = IndirectAccess::Deferred([(pc, idx)].into_iter().collect())
            }
        }
    }

    pub fn set_indirect_pcs(&mut self, pcs: &BTreeSet<(Addr, i32)>) {
        if pcs.is_empty() {
            return;
        }
        self.access
            .indirect
            .merge(&IndirectAccess::Deferred(pcs.clone()));
    }

    /// Copy irregular and indirect markings from `other` into `self`
    pub fn inherit_access(&mut self, other: &Formula) {
        if other.access.irregular {
            self.access.irregular = true;
        }
        self.access.indirect.merge(&other.access.indirect);
    }

    /// Divide every coefficient by `k`. Dividing by zero overflows.
    pub fn div_by(&mut self, k: i64) {
        match Coeff::new(1, k) {
            Some(inv) => self.scale(inv),
            None => self.overflow = true,
        }
    }

    /// Multiply by an arbitrary rational. Multiplying by zero also drops access markings.
    pub fn scale(&mut self, c: Coeff) {
        if c.is_zero() {
            let overflow = self.overflow;
            *self = Self::zero();
            self.overflow = overflow;
            return;
        }
        self.map_coeffs(|t| t.checked_mul(c));
    }

    fn map_coeffs(&mut self, f: impl Fn(Coeff) -> Option<Coeff>) {
        for t in self.terms.values_mut() {
            match f(t.coeff) {
                Some(c) => t.coeff = c,
                None => self.overflow = true,
            }
        }
    }
}

impl std::ops::AddAssign<&Formula> for Formula {
    fn add_assign(&mut self, rhs: &Formula) {
        for (k, t) in &rhs.terms {
            self.add_term(*k, t.coeff, t.origin);
        }
        self.access.irregular |= rhs.access.irregular;
        self.access.indirect.merge(&rhs.access.indirect);
        self.overflow |= rhs.overflow;
    }
}

impl std::ops::SubAssign<&Formula> for Formula {
    fn sub_assign(&mut self, rhs: &Formula) {
        *self += &(-rhs.clone());
    }
}

impl std::ops::MulAssign<i64> for Formula {
    fn mul_assign(&mut self, rhs: i64) {
        self.scale(Coeff::from(rhs));
    }
}

impl std::ops::DivAssign<i64> for Formula {
    fn div_assign(&mut self, rhs: i64) {
        self.div_by(rhs);
    }
}

impl std::ops::Neg for Formula {
    type Output = Formula;
    fn neg(mut self) -> Formula {
        self.map_coeffs(Coeff::checked_neg);
        self
    }
}

impl std::ops::Add<&Formula> for Formula {
    type Output = Formula;
    fn add(mut self, rhs: &Formula) -> Formula {
        self += rhs;
        self
    }
}

impl std::ops::Sub<&Formula> for Formula {
    type Output = Formula;
    fn sub(mut self, rhs: &Formula) -> Formula {
        self -= rhs;
        self
    }
}

impl std::ops::Mul<i64> for Formula {
    type Output = Formula;
    fn mul(mut self, rhs: i64) -> Formula {
        self *= rhs;
        self
    }
}

impl std::fmt::Display for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.terms.is_empty() {
            write!(f, "0")?;
        }
        for (i, (k, t)) in self.terms.iter().enumerate() {
            if i > 0 {
                write!(f, " + ")?;
            }
            if k.is_constant() {
                write!(f, "{}", t.coeff)?;
                continue;
            }
            if t.coeff != Coeff::ONE {
                write!(f, "{}*", t.coeff)?;
            }
            match k {
                TermKey::Call { pc, idx, target } => write!(f, "C{{{:#x}:{}->{:#x}}}", pc, idx, target)?,
                TermKey::Reference { aux } => write!(f, "M{{{:#x}}}", aux)?,
                TermKey::Stack { aux } => write!(f, "S{{{}}}", aux)?,
                TermKey::Load { pc, idx, reg } => write!(f, "L{{{}@{:#x}:{}}}", reg, pc, idx)?,
                TermKey::Register { pc, idx, reg } => {
                    write!(f, "R{{{}@{:#x}:{}}}", reg, pc, idx)?
                }
                TermKey::Constant => unreachable!(),
            }
        }
        if self.access.irregular {
            write!(f, " [irregular]")?;
        }
        if self.overflow {
            write!(f, " [overflow]")?;
        }
        match &self.access.indirect {
            IndirectAccess::None => {}
            IndirectAccess::Guaranteed => write!(f, " [indirect]")?,
            IndirectAccess::Deferred(pcs) => write!(
                f,
                " [indirect via {}]",
                itertools::join(pcs.iter().map(|(pc, i)| format!("{:#x}:{}", pc, i)), ",")
            )?,
        }
        Ok(())
    }
}

impl std::fmt::Debug for Formula {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// The address formulas of one memory operand: its base address, and its stride for each
/// enclosing loop, innermost first.
#[derive(Clone, Debug, Default)]
pub struct RefFormulas {
    pub base: Option<Formula>,
    strides: Vec<Formula>,
}

impl RefFormulas {
    pub fn strides(&self) -> &[Formula] {
        &self.strides
    }

    /// Record the stride at loop nesting `level` (0 = innermost). Strides must be recorded in
    /// nesting order, and each only once.
    pub fn record_stride(
        &mut self,
        pc: Addr,
        opidx: i32,
        level: usize,
        stride: Formula,
    ) -> SliceResult<()> {
        if self.strides.len() != level {
            return Err(SliceError::StrideCountMismatch {
                pc,
                opidx,
                expected: level,
                found: self.strides.len(),
            });
        }
        self.strides.push(stride);
        Ok(())
    }
}

/// All memory-operand formulas of a routine, keyed by `(pc, memory operand index)`
#[derive(Debug, Default)]
pub struct RefFormulasMap {
    map: UnorderedMap<(Addr, i32), RefFormulas>,
}

impl RefFormulasMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, pc: Addr, opidx: i32) -> Option<&RefFormulas> {
        self.map.get(&(pc, opidx))
    }

    pub fn get_or_insert(&mut self, pc: Addr, opidx: i32) -> &mut RefFormulas {
        self.map.entry((pc, opidx)).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(Addr, i32), &RefFormulas)> {
        self.map.iter()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rax() -> Register {
        Register::from_name("rax").unwrap()
    }

    #[test]
    fn terms_merge_and_cancel() {
        let r = Formula::register(0x10, 0, rax());
        let mut f = r.clone() * 3 + &Formula::constant(8);
        f -= &(r.clone() * 3);
        assert_eq!(f.constant_value(), Some(Coeff::from(8)));
        f -= &Formula::constant(8);
        assert!(f.is_constant_value(0));
        assert_eq!(f.num_terms(), 0);
    }

    #[test]
    fn division_and_complex_denominators() {
        let mut f = Formula::register(0x10, 0, rax()) * 6 + &Formula::constant(3);
        f /= 4;
        assert!(f.has_complex_denominator());
        let mut g = Formula::register(0x10, 0, rax()) * 8;
        g /= 4;
        assert!(!g.has_complex_denominator());
        assert_eq!(format!("{}", g), "2*R{rax@0x10:0}");
        let mut c = Formula::constant(-7);
        c /= 2;
        assert_eq!(c.constant_value().unwrap().value(), -3);
    }

    #[test]
    fn access_markings_merge() {
        let mut a = Formula::load(0x20, 1, rax());
        a.set_indirect_access(0x20, 1);
        let mut b = Formula::constant(4);
        b.set_irregular_access();
        b.set_indirect_access(0x30, 0);
        a += &b;
        assert!(a.is_irregular());
        assert_eq!(
            a.access().indirect,
            IndirectAccess::Deferred([(0x20, 1), (0x30, 0)].into_iter().collect())
        );
        let mut g = Formula::zero();
        g.set_guaranteed_indirect();
        a += &g;
        assert_eq!(a.access().indirect, IndirectAccess::Guaranteed);
        a *= 0;
        assert_eq!(a, Formula::zero());
    }

    #[test]
    fn term_order_and_definition_points() {
        let f = Formula::constant(1)
            + &Formula::register(0x40, 0, rax())
            + &Formula::call(0x30, 0, 0x1000);
        let kinds: Vec<_> = f.terms().map(|(k, _)| *k).collect();
        assert!(matches!(kinds[0], TermKey::Call { .. }));
        assert!(kinds[2].is_constant());
        assert!(f.defined_before_pc(0x35));
        assert!(!f.defined_before_pc(0x30));
    }

    #[test]
    fn stride_count_is_checked() {
        let mut rf = RefFormulas::default();
        assert!(rf.record_stride(0x10, 0, 0, Formula::constant(4)).is_ok());
        assert_eq!(
            rf.record_stride(0x10, 0, 0, Formula::constant(4)),
            Err(SliceError::StrideCountMismatch {
                pc: 0x10,
                opidx: 0,
                expected: 0,
                found: 1
            })
        );
        assert!(rf.record_stride(0x10, 0, 1, Formula::constant(64)).is_ok());
        assert_eq!(rf.strides().len(), 2);
    }

    #[test]
    fn coefficient_overflow_is_flagged() {
        let min = -Formula::constant(i64::MIN);
        assert!(min.overflowed());
        assert_eq!(min.constant_value(), None);
        assert!(min.to_string().ends_with("[overflow]"));

        let big = Formula::register(0x10, 0, rax()) * (1 << 40);
        assert!(!big.overflowed());
        assert!((big.clone() * (1 << 40)).overflowed());
        // The flag survives later arithmetic
        let sum = Formula::constant(1) + &(big * (1 << 40));
        assert!(sum.overflowed());
        assert!((sum * 0).overflowed());

        let mut f = Formula::constant(6);
        f /= 0;
        assert!(f.overflowed());
        assert_eq!(Coeff::new(1, i64::MIN), None);
        assert_eq!(Coeff::new(3, -6), Some(Coeff { num: -1, den: 2 }));
    }
}
