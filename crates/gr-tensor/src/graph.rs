use std::collections::{HashMap, HashSet};

use crate::context::{Context, TensorId};
use crate::error::{Result, TensorError};

/// Default node capacity of a compute graph.
pub const GRAPH_DEFAULT_SIZE: usize = 2048;

/// Topologically ordered execution plan rooted at a set of outputs.
///
/// `nodes` holds every reachable op-produced tensor such that each node
/// comes after the nodes producing its inputs; `leafs` holds the reachable
/// leaf tensors in first-visit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputeGraph {
    nodes: Vec<TensorId>,
    leafs: Vec<TensorId>,
    outputs: Vec<TensorId>,
    capacity: usize,
}

impl ComputeGraph {
    /// An empty graph that can hold up to `capacity` nodes.
    pub fn with_capacity(capacity: usize) -> Self {
        ComputeGraph {
            nodes: Vec::new(),
            leafs: Vec::new(),
            outputs: Vec::new(),
            capacity,
        }
    }

    /// Builds the graph needed to produce `outputs`.
    pub fn build(ctx: &Context, outputs: &[TensorId]) -> Result<Self> {
        let mut graph = Self::with_capacity(GRAPH_DEFAULT_SIZE);
        for &out in outputs {
            graph.expand(ctx, out)?;
        }
        Ok(graph)
    }

    /// Adds `output` and everything it depends on.
    ///
    /// Depth-first from the output, inputs visited in edge order, each
    /// tensor emitted after all of its inputs.
    pub fn expand(&mut self, ctx: &Context, output: TensorId) -> Result<()> {
        ctx.tensor(output)?;
        if !self.outputs.contains(&output) {
            self.outputs.push(output);
        }

        let mut visited: HashSet<TensorId> =
            self.nodes.iter().chain(self.leafs.iter()).copied().collect();
        // (tensor, index of the next input to visit)
        let mut stack: Vec<(TensorId, usize)> = Vec::new();
        if !visited.contains(&output) {
            stack.push((output, 0));
            visited.insert(output);
        }

        while let Some((id, next)) = stack.pop() {
            let t = ctx.tensor(id)?;
            if let Some(&src) = t.src().get(next) {
                stack.push((id, next + 1));
                if visited.insert(src) {
                    stack.push((src, 0));
                }
                continue;
            }
            if t.is_leaf() {
                self.leafs.push(id);
            } else {
                if self.nodes.len() >= self.capacity {
                    return Err(TensorError::ContextExhausted {
                        needed: self.nodes.len() + 1,
                        available: self.capacity,
                    });
                }
                self.nodes.push(id);
            }
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[TensorId] {
        &self.nodes
    }

    pub fn leafs(&self) -> &[TensorId] {
        &self.leafs
    }

    pub fn outputs(&self) -> &[TensorId] {
        &self.outputs
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of graph nodes reading each tensor. An input listed twice by
    /// the same node counts twice.
    pub fn consumers(&self, ctx: &Context) -> Result<HashMap<TensorId, usize>> {
        let mut counts = HashMap::new();
        for &id in &self.nodes {
            for &src in ctx.tensor(id)?.src() {
                *counts.entry(src).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
