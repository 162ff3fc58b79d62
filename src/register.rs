//! Machine registers, their bit ranges, and the name tables that canonicalize sub-registers into
//! their containing architectural register.

use crate::containers::unordered::UnorderedMap;

/// A code address
pub type Addr = u64;

/// Marks a definition that was not found inside the analyzed window (e.g., a loop-invariant value
/// when computing strides).
pub const NO_ADDRESS: Addr = Addr::MAX;

/// Coarse classification of registers, used to decide whether slicing should follow them at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RegisterClass {
    /// No register at all
    None,
    General,
    /// Individual condition flags (and the flags register itself)
    Flag,
    /// Status/control registers (e.g., `mxcsr`)
    Status,
    /// Registers that exist only for decoder bookkeeping
    Pseudo,
    /// The x87 top-of-stack pointer
    StackOperation,
    /// The x87 register stack
    StackReg,
    /// Micro-op internal temporaries, identified by index
    Temp,
    /// Hardwired to the address of the next instruction
    InstructionPointer,
    /// Hardwired to zero
    Zero,
}

/// A register identity: a name plus the range of bits `[lsb, msb]` being referred to.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Register {
    pub class: RegisterClass,
    /// Index into the name table, or the temporary's index for [`RegisterClass::Temp`]
    pub name: u32,
    pub lsb: u8,
    pub msb: u8,
}

struct NameEntry {
    text: &'static str,
    parent: &'static str,
    class: RegisterClass,
    lsb: u8,
    msb: u8,
}

macro_rules! gpr {
    ($q:literal, $d:literal, $w:literal, $b:literal) => {
        [
            ($q, $q, RegisterClass::General, 0, 63),
            ($d, $q, RegisterClass::General, 0, 31),
            ($w, $q, RegisterClass::General, 0, 15),
            ($b, $q, RegisterClass::General, 0, 7),
        ]
    };
}

lazy_static::lazy_static! {
    static ref NAMES: Vec<NameEntry> = {
        use RegisterClass::*;
        let mut v: Vec<(&'static str, &'static str, RegisterClass, u8, u8)> = vec![];
        v.extend(gpr!("rax", "eax", "ax", "al"));
        v.extend(gpr!("rbx", "ebx", "bx", "bl"));
        v.extend(gpr!("rcx", "ecx", "cx", "cl"));
        v.extend(gpr!("rdx", "edx", "dx", "dl"));
        v.extend(gpr!("rsi", "esi", "si", "sil"));
        v.extend(gpr!("rdi", "edi", "di", "dil"));
        v.extend(gpr!("rbp", "ebp", "bp", "bpl"));
        v.extend(gpr!("rsp", "esp", "sp", "spl"));
        v.extend(gpr!("r8", "r8d", "r8w", "r8b"));
        v.extend(gpr!("r9", "r9d", "r9w", "r9b"));
        v.extend(gpr!("r10", "r10d", "r10w", "r10b"));
        v.extend(gpr!("r11", "r11d", "r11w", "r11b"));
        v.extend(gpr!("r12", "r12d", "r12w", "r12b"));
        v.extend(gpr!("r13", "r13d", "r13w", "r13b"));
        v.extend(gpr!("r14", "r14d", "r14w", "r14b"));
        v.extend(gpr!("r15", "r15d", "r15w", "r15b"));
        v.extend([
            ("ah", "rax", General, 8, 15),
            ("bh", "rbx", General, 8, 15),
            ("ch", "rcx", General, 8, 15),
            ("dh", "rdx", General, 8, 15),
            ("rip", "rip", InstructionPointer, 0, 63),
            ("eip", "rip", InstructionPointer, 0, 31),
            ("rflags", "rflags", Flag, 0, 63),
            ("cf", "rflags", Flag, 0, 0),
            ("pf", "rflags", Flag, 2, 2),
            ("zf", "rflags", Flag, 6, 6),
            ("sf", "rflags", Flag, 7, 7),
            ("of", "rflags", Flag, 11, 11),
            ("mxcsr", "mxcsr", Status, 0, 31),
            ("fpsw", "fpsw", Status, 0, 15),
            ("fptop", "fptop", StackOperation, 0, 2),
            ("zero", "zero", Zero, 0, 63),
            ("seg", "seg", Pseudo, 0, 15),
        ]);
        for st in ["st0", "st1", "st2", "st3", "st4", "st5", "st6", "st7"] {
            v.push((st, st, StackReg, 0, 79));
        }
        v.into_iter()
            .map(|(text, parent, class, lsb, msb)| NameEntry {
                text,
                parent,
                class,
                lsb,
                msb,
            })
            .collect()
    };
    static ref NAME_INDEX: UnorderedMap<&'static str, u32> = NAMES
        .iter()
        .enumerate()
        .map(|(i, e)| (e.text, i as u32))
        .collect();
}

impl Register {
    /// The absent register
    pub fn none() -> Self {
        Self {
            class: RegisterClass::None,
            name: 0,
            lsb: 0,
            msb: 0,
        }
    }

    /// A micro-op internal temporary of `width` bits (a width of 0 is treated as a full 64-bit
    /// temporary).
    pub fn temp(index: u32, width: u8) -> Self {
        Self {
            class: RegisterClass::Temp,
            name: index,
            lsb: 0,
            msb: if width == 0 || width > 64 {
                63
            } else {
                width - 1
            },
        }
    }

    /// Look up a register by its assembly name (`eax`, `r10w`, `rip`, ...). Sub-registers keep
    /// their own bit range; use [`Self::canonical`] to obtain the containing register.
    pub fn from_name(text: &str) -> Option<Self> {
        let idx = *NAME_INDEX.get(text)?;
        let e = &NAMES[idx as usize];
        Some(Self {
            class: e.class,
            name: idx,
            lsb: e.lsb,
            msb: e.msb,
        })
    }

    /// Rename to the containing architectural register, keeping the referenced bit range.
    pub fn canonical(&self) -> Self {
        match self.class {
            RegisterClass::None | RegisterClass::Temp => *self,
            _ => {
                let parent = NAMES[self.name as usize].parent;
                Self {
                    name: NAME_INDEX.get(parent).copied().unwrap_or(self.name),
                    ..*self
                }
            }
        }
    }

    pub fn is_none(&self) -> bool {
        self.class == RegisterClass::None
    }

    pub fn is_pseudo(&self) -> bool {
        self.class == RegisterClass::Pseudo
    }

    pub fn is_flag_or_status(&self) -> bool {
        matches!(self.class, RegisterClass::Flag | RegisterClass::Status)
    }

    /// Registers belonging to the x87 stack machinery, which slicing does not model
    pub fn is_stack(&self) -> bool {
        matches!(
            self.class,
            RegisterClass::StackOperation | RegisterClass::StackReg
        )
    }

    /// The value of a hardwired register at an instruction whose successor starts at `next_pc`
    pub fn hardwired_value(&self, next_pc: Addr) -> Option<i64> {
        match self.class {
            RegisterClass::InstructionPointer => Some(next_pc as i64),
            RegisterClass::Zero => Some(0),
            _ => None,
        }
    }

    pub fn bit_width(&self) -> u32 {
        u32::from(self.msb) - u32::from(self.lsb) + 1
    }

    /// Whether both refer to some common bit of the same architectural register
    pub fn overlaps(&self, other: &Self) -> bool {
        if self.is_none() || other.is_none() {
            return false;
        }
        let (a, b) = (self.canonical(), other.canonical());
        a.class == b.class && a.name == b.name && a.lsb <= b.msb && b.lsb <= a.msb
    }

    /// Whether `self` covers every bit of `other` (which must overlap `self`)
    pub fn includes_range(&self, other: &Self) -> bool {
        self.lsb <= other.lsb && self.msb >= other.msb
    }

    fn text(&self) -> String {
        match self.class {
            RegisterClass::None => "<none>".into(),
            RegisterClass::Temp => format!("t{}", self.name),
            _ => NAMES[self.name as usize].text.into(),
        }
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let natural = match self.class {
            RegisterClass::None | RegisterClass::Temp => true,
            _ => {
                let e = &NAMES[self.name as usize];
                e.lsb == self.lsb && e.msb == self.msb
            }
        };
        if natural {
            write!(f, "{}", self.text())
        } else {
            write!(f, "{}[{}:{}]", self.text(), self.msb, self.lsb)
        }
    }
}

impl std::fmt::Debug for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_registers_canonicalize_and_overlap() {
        let eax = Register::from_name("eax").unwrap();
        let rax = Register::from_name("rax").unwrap();
        let ah = Register::from_name("ah").unwrap();
        let al = Register::from_name("al").unwrap();
        assert_eq!(eax.canonical().name, rax.name);
        assert_eq!(eax.canonical().msb, 31);
        assert!(eax.overlaps(&rax));
        assert!(rax.includes_range(&eax));
        assert!(!ah.overlaps(&al));
        assert_eq!(format!("{}", eax.canonical()), "rax[31:0]");
    }

    #[test]
    fn classification() {
        assert!(Register::from_name("zf").unwrap().is_flag_or_status());
        assert!(Register::from_name("st3").unwrap().is_stack());
        assert_eq!(
            Register::from_name("rip").unwrap().hardwired_value(0x400010),
            Some(0x400010)
        );
        assert_eq!(Register::from_name("rbx").unwrap().hardwired_value(4), None);
        assert!(!Register::temp(1, 64).overlaps(&Register::temp(2, 64)));
        assert!(Register::temp(1, 32).overlaps(&Register::temp(1, 64)));
        assert!(!Register::none().overlaps(&Register::none()));
    }
}
