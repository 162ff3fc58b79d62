//! Single-iteration cyclic paths through a loop.
//!
//! Stride slicing may only follow one path around a loop: from the block holding the sliced
//! micro-op, backward around the loop's back edge, and back to the same block. The path is
//! picked once per starting block and remembered as the one incoming edge to take at every block
//! on it, together with a rank that orders the path's blocks from the loop head onward.

use crate::cfg::{Cfg, EdgeId, NodeId};
use crate::containers::unordered::UnorderedMap;
use crate::error::{SliceError, SliceResult};
use crate::log::*;
use crate::slice_config::CONFIG;

/// Lowest common ancestor of loops `m1`, `m2` and `m3` in the loop tree. `m3 == 0` is ignored.
/// Inner loops always have larger markers than the loops enclosing them, as enforced by
/// [`Cfg::set_loop_parents`].
pub fn loops_lca(loop_tree: &[u32], mut m1: u32, mut m2: u32, mut m3: u32) -> u32 {
    let n = loop_tree.len() as u32;
    if m1 >= n || m2 >= n || m3 >= n {
        return 0;
    }
    let parent = |m: u32| loop_tree[m as usize];
    while m1 != m2 {
        while m1 > m2 {
            m1 = parent(m1);
        }
        while m2 > m1 {
            m2 = parent(m2);
        }
    }
    if m1 > 0 && m3 > 0 {
        while m1 != m3 {
            while m1 > m3 {
                m1 = parent(m1);
            }
            while m3 > m1 {
                m3 = parent(m3);
            }
        }
    }
    m1
}

#[derive(Clone, Debug)]
pub struct CyclicPath {
    marker: u32,
    /// Blocks in backward order, starting with the block the path was built from
    blocks: Vec<NodeId>,
    incoming: UnorderedMap<NodeId, EdgeId>,
    path_rank: UnorderedMap<NodeId, i32>,
}

impl CyclicPath {
    /// Find a path that starts at `start`, goes backward through exactly one back edge of loop
    /// `marker`, and returns to `start`.
    pub fn build(cfg: &Cfg, start: NodeId, marker: u32) -> SliceResult<Self> {
        let mut search = PathSearch {
            cfg,
            start,
            marker,
            start_rank: cfg.node(start).rank,
            visits: UnorderedMap::new(),
            blocks: vec![],
            edges: vec![],
        };
        if !search.search(start, 0) {
            error!("Could not build a single-iteration cyclic path";
                   "routine" => &cfg.name, "block" => start.0, "marker" => marker);
            return Err(SliceError::NoCyclicPath {
                block: start.0,
                marker,
            });
        }
        let PathSearch { blocks, edges, .. } = search;
        debug_assert_eq!(blocks.len(), edges.len());

        // The block reached through the loop's back edge starts the iteration
        let head = edges
            .iter()
            .position(|e| is_loop_back_edge(cfg, *e, marker))
            .map(|i| i + 1)
            .ok_or(SliceError::NoCyclicPath {
                block: start.0,
                marker,
            })?;

        let incoming = blocks.iter().copied().zip(edges.iter().copied()).collect();
        let n = blocks.len();
        let path_rank = blocks[head..]
            .iter()
            .chain(blocks[..head].iter())
            .zip((1..=n as i32).rev())
            .map(|(b, r)| (*b, r))
            .collect();

        let path = Self {
            marker,
            blocks,
            incoming,
            path_rank,
        };
        if CONFIG.debug_print_cyclic_paths {
            info!("Found cyclic path"; "marker" => marker, "path" => %path.describe(cfg));
        }
        Ok(path)
    }

    pub fn marker(&self) -> u32 {
        self.marker
    }

    pub fn blocks(&self) -> &[NodeId] {
        &self.blocks
    }

    pub fn contains(&self, b: NodeId) -> bool {
        self.incoming.contains_key(&b)
    }

    /// Whether `e` is the edge the path takes into its sink
    pub fn takes_edge(&self, cfg: &Cfg, e: EdgeId) -> bool {
        self.incoming.get(&cfg.edge(e).sink) == Some(&e)
    }

    /// Position of `b` in the iteration, counting from the loop head. 0 for blocks off the path.
    pub fn path_rank(&self, b: NodeId) -> i32 {
        self.path_rank.get(&b).copied().unwrap_or(0)
    }

    fn describe(&self, cfg: &Cfg) -> String {
        itertools::join(
            self.blocks.iter().map(|b| {
                let n = cfg.node(*b);
                format!("B{} [{:#x},{:#x})", b.0, n.start, n.end)
            }),
            " <- ",
        )
    }
}

/// A back edge that belongs to loop `marker`
pub fn is_loop_back_edge(cfg: &Cfg, e: EdgeId, marker: u32) -> bool {
    let edge = cfg.edge(e);
    edge.back_edge
        && (cfg.node(edge.sink).marker == marker || cfg.node(edge.source).marker == marker)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Visit {
    OnPath,
    /// Fully explored without finding a path, before any back edge was taken
    DeadBefore,
    /// Fully explored without finding a path, after taking a back edge
    DeadAfter,
}

struct PathSearch<'a> {
    cfg: &'a Cfg,
    start: NodeId,
    marker: u32,
    start_rank: i32,
    visits: UnorderedMap<NodeId, Visit>,
    blocks: Vec<NodeId>,
    /// `edges[i]` enters `blocks[i]`
    edges: Vec<EdgeId>,
}

impl<'a> PathSearch<'a> {
    fn search(&mut self, b: NodeId, back_edges: u32) -> bool {
        match self.visits.get(&b) {
            Some(Visit::DeadBefore) if back_edges == 0 => return false,
            Some(Visit::DeadAfter) if back_edges > 0 => return false,
            Some(Visit::OnPath) => return self.closes_cycle(b, back_edges),
            _ => {}
        }
        let cfg = self.cfg;
        let node = cfg.node(b);
        // After the back edge, only blocks later in the iteration than the start are useful
        if back_edges > 0 && node.rank <= self.start_rank {
            return false;
        }

        self.visits.insert(b, Visit::OnPath);
        self.blocks.push(b);
        let old_start_rank = self.start_rank;
        // Entering an inner loop before the back edge lowers the bar
        if node.marker > self.marker && back_edges == 0 && self.start_rank > node.rank {
            self.start_rank = node.rank;
        }

        let start_marker = cfg.node(self.start).marker;
        for e in cfg.incoming_by_rank_desc(b) {
            let edge = cfg.edge(e);
            let bmarker = cfg.node(edge.source).marker;
            if bmarker < self.marker {
                continue;
            }
            // Back edges of inner loops are fine as long as those loops are not on the way
            // from the starting loop up to the sliced one
            if edge.back_edge
                && loops_lca(cfg.loop_tree(), start_marker, bmarker, node.marker) != self.marker
            {
                continue;
            }
            let delta =
                u32::from(edge.back_edge && (bmarker == self.marker || node.marker == self.marker));
            self.edges.push(e);
            if self.search(edge.source, back_edges + delta) {
                return true;
            }
            self.edges.pop();
        }

        self.blocks.pop();
        self.visits.insert(
            b,
            if back_edges > 0 {
                Visit::DeadAfter
            } else {
                Visit::DeadBefore
            },
        );
        self.start_rank = old_start_rank;
        false
    }

    /// `b` is already on the path. The path is good if walking back from its end reaches the
    /// loop's back edge before reaching `b`.
    fn closes_cycle(&self, b: NodeId, back_edges: u32) -> bool {
        if b == self.start && back_edges == 1 {
            return true;
        }
        if back_edges == 0 {
            return false;
        }
        let cfg = self.cfg;
        let mut src = b;
        for (&n, &e) in self.blocks.iter().zip(self.edges.iter()).rev() {
            if cfg.edge(e).back_edge
                && (cfg.node(src).marker == self.marker || cfg.node(n).marker == self.marker)
            {
                return true;
            }
            if n == b {
                return false;
            }
            src = n;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lca_climbs_the_loop_tree() {
        // 1 and 3 are top-level loops; 2 is inside 1; 4 is inside 3
        let tree = [0, 0, 1, 0, 3];
        assert_eq!(loops_lca(&tree, 2, 1, 0), 1);
        assert_eq!(loops_lca(&tree, 2, 4, 0), 0);
        assert_eq!(loops_lca(&tree, 2, 2, 1), 1);
        assert_eq!(loops_lca(&tree, 4, 4, 0), 4);
        assert_eq!(loops_lca(&tree, 7, 1, 0), 0);
    }

    /// pre -> head -> body -> latch -> head (back), latch -> exit
    fn diamond_free_loop() -> (Cfg, [NodeId; 5]) {
        let mut cfg = Cfg::new("loop");
        cfg.set_loop_parents(&[0]).unwrap();
        let pre = cfg.add_block(0, 0, vec![]);
        let head = cfg.add_block(1, 1, vec![]);
        let body = cfg.add_block(2, 1, vec![]);
        let latch = cfg.add_block(3, 1, vec![]);
        let exit = cfg.add_block(4, 0, vec![]);
        cfg.set_entry(pre);
        cfg.add_edge(pre, head, false);
        cfg.add_edge(head, body, false);
        cfg.add_edge(body, latch, false);
        cfg.add_edge(latch, head, true);
        cfg.add_edge(latch, exit, false);
        (cfg, [pre, head, body, latch, exit])
    }

    #[test]
    fn path_goes_around_the_back_edge_once() {
        let (cfg, [pre, head, body, latch, exit]) = diamond_free_loop();
        let p = CyclicPath::build(&cfg, body, 1).unwrap();
        assert_eq!(p.blocks(), &[body, head, latch]);
        assert!(p.contains(latch) && !p.contains(pre) && !p.contains(exit));
        // Ranks follow the iteration order starting from the loop head
        assert_eq!(p.path_rank(head), 1);
        assert_eq!(p.path_rank(body), 2);
        assert_eq!(p.path_rank(latch), 3);
        assert_eq!(p.path_rank(pre), 0);
        let taken: Vec<_> = cfg.edges().filter(|e| p.takes_edge(&cfg, e.id)).collect();
        assert_eq!(taken.len(), 3);
        assert!(taken.iter().any(|e| e.back_edge));
    }

    #[test]
    fn no_path_outside_a_loop() {
        let (cfg, [pre, ..]) = diamond_free_loop();
        assert_eq!(
            CyclicPath::build(&cfg, pre, 1).unwrap_err(),
            SliceError::NoCyclicPath {
                block: pre.0,
                marker: 1
            }
        );
    }
}
