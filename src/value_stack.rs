//! The stack of pending values that slice steps hand over to their consumers.
//!
//! A producer pushes the value it computed for a register (or for a micro-op site); the consumer
//! claims it, which removes the entry. Lookups by register return the most recently pushed entry
//! that overlaps the requested register, so a later definition always shadows an earlier one.

use crate::log::*;
use crate::register::{Addr, Register};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ValueKey {
    Register(Register),
    /// A value attached to micro-op `idx` of the instruction at `pc`
    Site { pc: Addr, idx: i32 },
}

#[derive(Clone, Debug)]
pub struct ValueStack<V> {
    entries: Vec<(ValueKey, V)>,
}

impl<V> Default for ValueStack<V> {
    fn default() -> Self {
        Self { entries: vec![] }
    }
}

impl<V: std::fmt::Debug> ValueStack<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the value of `reg`. Values for the absent register are dropped, since nothing can
    /// claim them.
    pub fn push_register(&mut self, reg: Register, v: V) {
        if reg.is_none() {
            return;
        }
        self.entries.push((ValueKey::Register(reg), v));
    }

    pub fn push_site(&mut self, pc: Addr, idx: i32, v: V) {
        self.entries.push((ValueKey::Site { pc, idx }, v));
    }

    /// Remove and return the most recent value overlapping `reg`
    pub fn claim_register(&mut self, reg: &Register) -> Option<V> {
        let pos = self.entries.iter().rposition(|(k, _)| match k {
            ValueKey::Register(r) => r.overlaps(reg),
            ValueKey::Site { .. } => false,
        })?;
        let (k, v) = self.entries.remove(pos);
        if let ValueKey::Register(r) = k {
            if !r.includes_range(reg) {
                trace!("Claimed a value that only partially covers the register";
                       "claimed" => %r, "wanted" => %reg);
            }
        }
        Some(v)
    }

    /// Remove and return the most recent value attached to micro-op site `(pc, idx)`
    pub fn claim_site(&mut self, pc: Addr, idx: i32) -> Option<V> {
        let key = ValueKey::Site { pc, idx };
        let pos = self.entries.iter().rposition(|(k, _)| *k == key)?;
        Some(self.entries.remove(pos).1)
    }

    pub fn clear(&mut self) {
        self.entries.clear()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first
    pub fn iter(&self) -> impl Iterator<Item = &(ValueKey, V)> {
        self.entries.iter()
    }

    /// Log the pending entries, newest first
    pub fn dump(&self) {
        for (k, v) in self.entries.iter().rev() {
            trace!("Pending value"; "key" => ?k, "value" => ?v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reg(s: &str) -> Register {
        Register::from_name(s).unwrap().canonical()
    }

    #[test]
    fn most_recent_overlapping_value_wins() {
        let mut st = ValueStack::new();
        st.push_register(reg("rax"), 1);
        st.push_register(reg("rbx"), 2);
        st.push_register(reg("eax"), 3);
        assert_eq!(st.claim_register(&reg("rax")), Some(3));
        assert_eq!(st.claim_register(&reg("rax")), Some(1));
        assert_eq!(st.claim_register(&reg("rax")), None);
        assert_eq!(st.len(), 1);
    }

    #[test]
    fn sites_and_registers_are_distinct() {
        let mut st = ValueStack::new();
        st.push_site(0x10, 1, "load");
        st.push_register(Register::none(), "dropped");
        assert!(st.claim_register(&reg("rcx")).is_none());
        let loaded = st.claim_site(0x10, 1).unwrap();
        st.push_register(reg("rcx"), loaded);
        assert_eq!(st.claim_site(0x10, 1), None);
        assert_eq!(st.claim_register(&reg("ecx")), Some("load"));
        assert!(st.is_empty());
    }
}
