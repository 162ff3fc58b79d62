//! The control flow graph slicing walks over: an arena of basic blocks and edges, with rank and
//! loop nesting information attached.

use itertools::Itertools;

use crate::error::{SliceError, SliceResult};
use crate::insn::MicroOp;
use crate::register::Addr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeId(pub usize);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Code,
    /// Stands in for a call's callee; its only interesting property is the call target
    CallSurrogate { target: Addr },
}

/// A basic block
#[derive(Clone, Debug)]
pub struct Node {
    pub id: NodeId,
    /// First address of the block
    pub start: Addr,
    /// One past the last address of the block
    pub end: Addr,
    /// Position in a topological order of the (back-edge free) graph
    pub rank: i32,
    /// Marker of the innermost loop containing this block; 0 is outside all loops
    pub marker: u32,
    pub is_entry: bool,
    pub kind: NodeKind,
    pub uops: Vec<MicroOp>,
    incoming: Vec<EdgeId>,
    outgoing: Vec<EdgeId>,
}

impl Node {
    pub fn incoming(&self) -> &[EdgeId] {
        &self.incoming
    }

    pub fn outgoing(&self) -> &[EdgeId] {
        &self.outgoing
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub sink: NodeId,
    pub back_edge: bool,
}

/// A routine's control flow graph
#[derive(Clone, Debug, Default)]
pub struct Cfg {
    pub name: String,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    /// `loop_tree[m]` is the marker of the loop enclosing loop `m`. Entry 0 is the routine itself.
    loop_tree: Vec<u32>,
}

impl Cfg {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: vec![],
            edges: vec![],
            loop_tree: vec![0],
        }
    }

    /// Add a code block. Its address range is derived from its micro-ops.
    pub fn add_block(&mut self, rank: i32, marker: u32, uops: Vec<MicroOp>) -> NodeId {
        let start = uops.first().map_or(0, |u| u.pc);
        let end = uops.iter().map(|u| u.next_pc()).max().unwrap_or(start);
        self.add_node(start, end, rank, marker, NodeKind::Code, uops)
    }

    /// Add a surrogate block, placed at address `at`, for a call to `target`
    pub fn add_call_surrogate(&mut self, rank: i32, marker: u32, at: Addr, target: Addr) -> NodeId {
        self.add_node(at, at, rank, marker, NodeKind::CallSurrogate { target }, vec![])
    }

    fn add_node(
        &mut self,
        start: Addr,
        end: Addr,
        rank: i32,
        marker: u32,
        kind: NodeKind,
        uops: Vec<MicroOp>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            start,
            end,
            rank,
            marker,
            is_entry: false,
            kind,
            uops,
            incoming: vec![],
            outgoing: vec![],
        });
        id
    }

    pub fn add_edge(&mut self, source: NodeId, sink: NodeId, back_edge: bool) -> EdgeId {
        let id = EdgeId(self.edges.len());
        self.edges.push(Edge {
            id,
            source,
            sink,
            back_edge,
        });
        self.nodes[source.0].outgoing.push(id);
        self.nodes[sink.0].incoming.push(id);
        id
    }

    pub fn set_entry(&mut self, n: NodeId) {
        self.nodes[n.0].is_entry = true;
    }

    /// Set the loop nesting tree, given the parent marker of each loop marker `1..`. A loop must
    /// be numbered after every loop enclosing it.
    pub fn set_loop_parents(&mut self, parents: &[u32]) -> SliceResult<()> {
        for (parent, marker) in parents.iter().copied().zip(1..) {
            if parent >= marker {
                return Err(SliceError::BadLoopParent { marker, parent });
            }
        }
        self.loop_tree = std::iter::once(0).chain(parents.iter().copied()).collect();
        Ok(())
    }

    pub fn loop_tree(&self) -> &[u32] {
        &self.loop_tree
    }

    /// The loop enclosing loop `marker`, or `None` for the routine level
    pub fn loop_parent(&self, marker: u32) -> Option<u32> {
        if marker == 0 {
            None
        } else {
            self.loop_tree.get(marker as usize).copied()
        }
    }

    pub fn node(&self, n: NodeId) -> &Node {
        &self.nodes[n.0]
    }

    pub fn node_mut(&mut self, n: NodeId) -> &mut Node {
        &mut self.nodes[n.0]
    }

    pub fn edge(&self, e: EdgeId) -> &Edge {
        &self.edges[e.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Incoming edges of `n`, ordered by decreasing source rank. Ties keep insertion order.
    ///
    /// When several back edges enter a block, this prefers the one whose source covers more of
    /// the loop. This is a heuristic ordering, not a proven one.
    pub fn incoming_by_rank_desc(&self, n: NodeId) -> Vec<EdgeId> {
        self.node(n)
            .incoming
            .iter()
            .copied()
            .sorted_by_key(|e| std::cmp::Reverse(self.node(self.edge(*e).source).rank))
            .collect()
    }

    /// Write the graph out as a `.dot` file
    pub fn write_dot(&self, w: &mut impl std::io::Write) -> std::io::Result<()> {
        struct Graph<'a> {
            cfg: &'a Cfg,
        }

        impl<'a> dot::Labeller<'a, NodeId, EdgeId> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("Cfg").unwrap()
            }
            fn node_id(&'a self, n: &NodeId) -> dot::Id<'a> {
                dot::Id::new(format!("b{}", n.0)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &NodeId) -> dot::LabelText<'b> {
                let node = self.cfg.node(*n);
                let head = match node.kind {
                    NodeKind::Code => format!("B{} [{:#x},{:#x})", n.0, node.start, node.end),
                    NodeKind::CallSurrogate { target } => format!("B{} call {:#x}", n.0, target),
                };
                dot::LabelText::escaped(format!(
                    "{}\\nrank={} loop={}",
                    head, node.rank, node.marker
                ))
            }
            fn node_shape(&'a self, n: &NodeId) -> Option<dot::LabelText<'a>> {
                match self.cfg.node(*n).kind {
                    NodeKind::Code => None,
                    NodeKind::CallSurrogate { .. } => Some(dot::LabelText::label("diamond")),
                }
            }
            fn edge_label<'b>(&'b self, e: &EdgeId) -> dot::LabelText<'b> {
                dot::LabelText::label(if self.cfg.edge(*e).back_edge {
                    "back"
                } else {
                    ""
                })
            }
            fn edge_style(&'a self, e: &EdgeId) -> dot::Style {
                if self.cfg.edge(*e).back_edge {
                    dot::Style::Dashed
                } else {
                    dot::Style::None
                }
            }
        }

        impl<'a> dot::GraphWalk<'a, NodeId, EdgeId> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, NodeId> {
                self.cfg.nodes.iter().map(|n| n.id).collect::<Vec<_>>().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, EdgeId> {
                self.cfg.edges.iter().map(|e| e.id).collect::<Vec<_>>().into()
            }
            fn source(&self, e: &EdgeId) -> NodeId {
                self.cfg.edge(*e).source
            }
            fn target(&self, e: &EdgeId) -> NodeId {
                self.cfg.edge(*e).sink
            }
        }

        dot::render(&Graph { cfg: self }, w)
    }

    /// Generate a `.dot` file representing this graph
    pub fn generate_dot(&self) -> String {
        let mut s: Vec<u8> = vec![];
        self.write_dot(&mut s).unwrap();
        String::from_utf8(s).unwrap()
    }
}
