//! A lifter from the textual CFG description format.
//!
//! ```text
//! CFG <name>
//! LOOPS <parent-of-marker-1> <parent-of-marker-2> ...
//! BLOCK <id> rank=<r> marker=<m> [entry] [surrogate=<target> [at=<addr>]]
//! <pc> <len> <kind> <op> <dests...> <- <srcs...> [call] [cmov] [target=<addr>] [width=<bits>]
//! EDGE <src-id> <dst-id> [back]
//! ```
//!
//! Operands are register names, `t<n>` internal temporaries, `#<imm>` immediates, and memory
//! operands `[base+index*scale+disp]@<opidx>`. Consecutive micro-op lines with the same pc form
//! one instruction. Lines starting with `#` are comments.

use crate::cfg::{Cfg, NodeId};
use crate::containers::unordered::UnorderedMap;
use crate::error::LiftError;
use crate::insn::{CanonicalOp, MemOperand, MicroOp, Operand, UopKind};
use crate::log::*;
use crate::register::{Addr, Register};

fn parse_num(line: usize, text: &str) -> Result<i64, LiftError> {
    let bad = || LiftError::BadNumber {
        line,
        text: text.into(),
    };
    let (neg, digits) = match text.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, text),
    };
    let v = if let Some(hex) = digits.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).map_err(|_| bad())?
    } else {
        digits.parse::<i64>().map_err(|_| bad())?
    };
    Ok(if neg { -v } else { v })
}

/// A number that must fit in `T`, such as a block id or an operation width
fn parse_int<T: TryFrom<i64>>(line: usize, text: &str) -> Result<T, LiftError> {
    T::try_from(parse_num(line, text)?).map_err(|_| LiftError::BadNumber {
        line,
        text: text.into(),
    })
}

fn parse_addr(line: usize, text: &str) -> Result<Addr, LiftError> {
    parse_int(line, text)
}

fn parse_register(line: usize, text: &str) -> Result<Register, LiftError> {
    Register::from_name(text).ok_or_else(|| LiftError::UnknownRegister {
        line,
        name: text.into(),
    })
}

fn parse_kind(line: usize, text: &str) -> Result<UopKind, LiftError> {
    Ok(match text {
        "move" => UopKind::Move,
        "copy" => UopKind::Copy,
        "lea" => UopKind::Lea,
        "load" => UopKind::Load,
        "store" => UopKind::Store,
        "branch" => UopKind::Branch,
        "div" => UopKind::Div,
        "alu" => UopKind::Alu,
        "other" => UopKind::Other,
        _ => {
            return Err(LiftError::UnknownKeyword {
                line,
                what: "micro-op kind",
                text: text.into(),
            })
        }
    })
}

fn parse_op(line: usize, text: &str) -> Result<CanonicalOp, LiftError> {
    use CanonicalOp::*;
    Ok(match text {
        "add" => Add,
        "sub" => Sub,
        "mov" => Mov,
        "not" => Not,
        "and" => And,
        "or" => Or,
        "xor" => Xor,
        "andn" => AndN,
        "orn" => OrN,
        "xnor" => XNor,
        "mul" => Mul,
        "div" => Div,
        "sll" => Sll,
        "srl" => Srl,
        "sra" => Sra,
        "invalid" => Invalid,
        _ => {
            return Err(LiftError::UnknownKeyword {
                line,
                what: "opcode",
                text: text.into(),
            })
        }
    })
}

/// Parse `[base+index*scale+disp]@opidx`
fn parse_memory(line: usize, text: &str) -> Result<MemOperand, LiftError> {
    let bad = || LiftError::BadOperand {
        line,
        text: text.into(),
    };
    let (inner, opidx) = match text.rsplit_once("]@") {
        Some((inner, idx)) => (inner, parse_int(line, idx)?),
        None => (text.strip_suffix(']').ok_or_else(bad)?, 0),
    };
    let inner = inner.strip_prefix('[').ok_or_else(bad)?;

    let mut mem = MemOperand {
        opidx,
        base: None,
        index: None,
        scale: 1,
        disp: 0,
    };
    // Split into signed parts, keeping the sign with the part that follows it
    let mut parts: Vec<String> = vec![];
    for c in inner.chars() {
        match c {
            '+' => parts.push(String::new()),
            '-' => parts.push("-".into()),
            ' ' => {}
            _ => match parts.last_mut() {
                Some(p) => p.push(c),
                None => parts.push(c.to_string()),
            },
        }
    }
    for part in parts.iter().filter(|p| !p.is_empty()) {
        if part.starts_with(|c: char| c == '-' || c.is_ascii_digit()) {
            mem.disp += parse_num(line, part)?;
        } else if let Some((r, s)) = part.split_once('*') {
            if mem.index.is_some() {
                return Err(bad());
            }
            mem.index = Some(parse_register(line, r)?);
            mem.scale = parse_num(line, s)?;
        } else if mem.base.is_none() {
            mem.base = Some(parse_register(line, part)?);
        } else if mem.index.is_none() {
            mem.index = Some(parse_register(line, part)?);
        } else {
            return Err(bad());
        }
    }
    Ok(mem)
}

fn parse_operand(line: usize, text: &str) -> Result<Operand, LiftError> {
    if let Some(imm) = text.strip_prefix('#') {
        return Ok(Operand::Immediate(parse_num(line, imm)?));
    }
    if text.starts_with('[') {
        return Ok(Operand::Memory(parse_memory(line, text)?));
    }
    if let Some(n) = text.strip_prefix('t') {
        if let Ok(n) = n.parse::<u32>() {
            return Ok(Operand::Internal(n));
        }
    }
    Ok(Operand::Register(parse_register(line, text)?))
}

/// `key=value` attribute lookup
fn attribute<'a>(words: &[&'a str], key: &str) -> Option<&'a str> {
    words.iter().find_map(|w| w.strip_prefix(key)?.strip_prefix('='))
}

struct PendingBlock {
    id: usize,
    line: usize,
    rank: i32,
    marker: u32,
    entry: bool,
    surrogate: Option<(Addr, Addr)>,
    uops: Vec<MicroOp>,
}

fn parse_block(line: usize, words: &[&str]) -> Result<PendingBlock, LiftError> {
    let id = words
        .get(1)
        .ok_or_else(|| LiftError::Malformed {
            line,
            text: words.join(" "),
        })
        .and_then(|w| parse_int(line, w))?;
    let rank = attribute(words, "rank")
        .map(|r| parse_int(line, r))
        .transpose()?
        .unwrap_or(0);
    let marker = attribute(words, "marker")
        .map(|m| parse_int(line, m))
        .transpose()?
        .unwrap_or(0);
    let surrogate = match attribute(words, "surrogate") {
        Some(t) => {
            let target = parse_addr(line, t)?;
            let at = attribute(words, "at")
                .map(|a| parse_addr(line, a))
                .transpose()?
                .unwrap_or(target);
            Some((at, target))
        }
        None => None,
    };
    Ok(PendingBlock {
        id,
        line,
        rank,
        marker,
        entry: words.contains(&"entry"),
        surrogate,
        uops: vec![],
    })
}

fn parse_uop(line: usize, words: &[&str]) -> Result<MicroOp, LiftError> {
    let malformed = || LiftError::Malformed {
        line,
        text: words.join(" "),
    };
    if words.len() < 4 {
        return Err(malformed());
    }
    let pc = parse_addr(line, words[0])?;
    let len = parse_int(line, words[1])?;
    let mut uop = MicroOp::new(pc, 0, parse_kind(line, words[2])?, parse_op(line, words[3])?);
    uop.len = len;

    let mut after_arrow = false;
    for &w in &words[4..] {
        match w {
            "<-" => after_arrow = true,
            "call" => uop.is_call = true,
            "cmov" => uop.conditional_move = true,
            _ if w.starts_with("target=") => {
                uop.branch_target = Some(parse_addr(line, &w["target=".len()..])?)
            }
            _ if w.starts_with("width=") => {
                let text = &w["width=".len()..];
                uop.width = parse_int(line, text)?;
                if uop.width == 0 {
                    return Err(LiftError::BadNumber {
                        line,
                        text: text.into(),
                    });
                }
            }
            _ => {
                let op = parse_operand(line, w)?;
                if after_arrow {
                    uop.srcs.push(op);
                } else {
                    uop.dests.push(op);
                }
            }
        }
    }
    if !after_arrow {
        return Err(malformed());
    }
    Ok(uop)
}

/// Lift a textual CFG description into a graph ready for slicing.
pub fn lift_from(text: &str) -> Result<Cfg, LiftError> {
    let mut cfg = Cfg::new("");
    let mut ids: UnorderedMap<usize, NodeId> = UnorderedMap::new();
    let mut edges: Vec<(usize, usize, usize, bool)> = vec![];
    let mut current: Option<PendingBlock> = None;

    let mut finish = |cfg: &mut Cfg, block: Option<PendingBlock>| {
        let block = match block {
            Some(b) => b,
            None => return,
        };
        let (id, line) = (block.id, block.line);
        let n = match block.surrogate {
            Some((at, target)) => cfg.add_call_surrogate(block.rank, block.marker, at, target),
            None => cfg.add_block(block.rank, block.marker, block.uops),
        };
        if block.entry {
            cfg.set_entry(n);
        }
        if ids.insert(id, n).is_some() {
            warn!("Block declared twice"; "id" => id, "line" => line);
        }
    };

    for (i, raw) in text.lines().enumerate() {
        let line = i + 1;
        let l = raw.trim();
        if l.is_empty() || l.starts_with('#') {
            continue;
        }
        let words: Vec<&str> = l.split_whitespace().collect();
        match words[0] {
            "CFG" => cfg.name = words[1..].join(" "),
            "LOOPS" => {
                let parents = words[1..]
                    .iter()
                    .map(|w| parse_int(line, w))
                    .collect::<Result<Vec<u32>, _>>()?;
                cfg.set_loop_parents(&parents)
                    .map_err(|source| LiftError::LoopTree { line, source })?;
            }
            "BLOCK" => {
                finish(&mut cfg, current.take());
                current = Some(parse_block(line, &words)?);
            }
            "EDGE" => {
                if words.len() < 3 {
                    return Err(LiftError::Malformed {
                        line,
                        text: l.into(),
                    });
                }
                let src = parse_int(line, words[1])?;
                let dst = parse_int(line, words[2])?;
                edges.push((line, src, dst, words[3..].contains(&"back")));
            }
            _ => {
                let block = current
                    .as_mut()
                    .ok_or(LiftError::OrphanMicroOp { line })?;
                let mut uop = parse_uop(line, &words)?;
                if let Some(prev) = block.uops.last() {
                    if prev.pc == uop.pc {
                        uop.idx = prev.idx + 1;
                    }
                }
                block.uops.push(uop);
            }
        }
    }
    finish(&mut cfg, current.take());
    drop(finish);

    for (line, src, dst, back) in edges {
        let lookup = |id: usize| {
            ids.get(&id)
                .copied()
                .ok_or(LiftError::UnknownBlock { line, id })
        };
        let (s, d) = (lookup(src)?, lookup(dst)?);
        cfg.add_edge(s, d, back);
    }
    debug!("Lifted CFG"; "routine" => &cfg.name, "blocks" => cfg.num_nodes());
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::NodeKind;
    use crate::error::SliceError;

    fn reg(s: &str) -> Register {
        Register::from_name(s).unwrap()
    }

    #[test]
    fn lifts_blocks_edges_and_loops() {
        let cfg = lift_from(
            "CFG walk
             LOOPS 0
             # a simple counted loop
             BLOCK 0 rank=0 marker=0 entry
             0x10 4 move mov rax <- #0
             BLOCK 1 rank=1 marker=1
             0x14 4 alu add rax rflags <- rax #8 rflags
             0x14 4 load mov rcx <- [rax+rbx*4-16]@1
             0x18 4 branch invalid <- rax target=0x14
             BLOCK 2 rank=2 marker=0 surrogate=0x5000 at=0x1c
             EDGE 0 1
             EDGE 1 1 back
             EDGE 1 2",
        )
        .unwrap();
        assert_eq!(cfg.name, "walk");
        assert_eq!(cfg.num_nodes(), 3);
        assert_eq!(cfg.loop_parent(1), Some(0));

        let body = cfg.node(NodeId(1));
        assert_eq!((body.start, body.end), (0x14, 0x1c));
        assert_eq!(body.marker, 1);
        assert_eq!(body.uops[1].idx, 1);
        assert_eq!(body.uops[2].idx, 0);
        assert_eq!(body.uops[0].srcs[1], Operand::Immediate(8));
        assert_eq!(body.uops[2].branch_target, Some(0x14));
        assert_eq!(
            body.uops[1].srcs[0],
            Operand::Memory(MemOperand {
                opidx: 1,
                base: Some(reg("rax")),
                index: Some(reg("rbx")),
                scale: 4,
                disp: -16,
            })
        );
        assert!(cfg.node(NodeId(0)).is_entry);

        let call = cfg.node(NodeId(2));
        assert_eq!(call.kind, NodeKind::CallSurrogate { target: 0x5000 });
        assert_eq!(call.start, 0x1c);
        assert_eq!(cfg.edges().filter(|e| e.back_edge).count(), 1);
    }

    #[test]
    fn reports_the_offending_line() {
        assert_eq!(
            lift_from("BLOCK 0\n0x10 4 alu add rax <- rzz").unwrap_err(),
            LiftError::UnknownRegister {
                line: 2,
                name: "rzz".into()
            }
        );
        assert_eq!(
            lift_from("0x10 4 alu add rax <- rax").unwrap_err(),
            LiftError::OrphanMicroOp { line: 1 }
        );
        assert_eq!(
            lift_from("BLOCK 0\nEDGE 0 7").unwrap_err(),
            LiftError::UnknownBlock { line: 2, id: 7 }
        );
        assert!(matches!(
            lift_from("BLOCK 0\n0x10 4 alu frob rax <- rax"),
            Err(LiftError::UnknownKeyword { line: 2, .. })
        ));
    }

    #[test]
    fn rejects_numbers_out_of_range() {
        let bad = |line, text: &str| LiftError::BadNumber {
            line,
            text: text.into(),
        };
        assert_eq!(
            lift_from("BLOCK 0\n0x10 4 alu add rax <- rax width=256").unwrap_err(),
            bad(2, "256")
        );
        assert_eq!(
            lift_from("BLOCK 0\n0x10 4 alu add rax <- rax width=0").unwrap_err(),
            bad(2, "0")
        );
        assert_eq!(lift_from("BLOCK 0\nEDGE 0 -1").unwrap_err(), bad(2, "-1"));
        assert_eq!(lift_from("BLOCK 0 marker=-1").unwrap_err(), bad(1, "-1"));
        assert_eq!(lift_from("LOOPS 0 -2").unwrap_err(), bad(1, "-2"));
        let cfg = lift_from("BLOCK 0\n0x10 4 alu add rax <- rax width=128").unwrap();
        assert_eq!(cfg.node(NodeId(0)).uops[0].width, 128);
    }

    #[test]
    fn loop_parents_must_enclose() {
        assert_eq!(
            lift_from("LOOPS 1\nBLOCK 0").unwrap_err(),
            LiftError::LoopTree {
                line: 1,
                source: SliceError::BadLoopParent {
                    marker: 1,
                    parent: 1
                }
            }
        );
        assert!(matches!(
            lift_from("CFG nest\nLOOPS 0 1 3"),
            Err(LiftError::LoopTree { line: 2, .. })
        ));
        assert!(lift_from("LOOPS 0 1 1").is_ok());
    }

    #[test]
    fn redeclared_block_id_names_the_later_block() {
        let cfg = lift_from("BLOCK 3 rank=0\nBLOCK 3 rank=1\nEDGE 3 3").unwrap();
        assert_eq!(cfg.num_nodes(), 2);
        let e = cfg.edges().next().unwrap();
        assert_eq!((e.source, e.sink), (NodeId(1), NodeId(1)));
    }
}
