//! Deterministic pipeline rewrites, applied between verification and
//! enqueueing.
//!
//! Two rewrites run, in order:
//!
//! 1. **Duplicate elimination** — nodes sharing a fingerprint collapse onto
//!    the earliest occurrence; consumers of the duplicate are fanned out to
//!    the survivor and the collapsed ids are recorded as aliases.
//! 2. **Constant folding** — a `dfm.api.Constant` node is replaced at its
//!    consumers by its literal value; the node itself is dropped unless it is
//!    an output, carries ordering constraints, or is named in an `after` set.

use crate::error::Result;
use crate::fingerprint::{node_fingerprint, Fingerprint};
use crate::pipeline::{InputSource, Node, NodeId, Pipeline};
use crate::registry::api;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};

/// The optimized pipeline plus everything the ingress persists about it.
#[derive(Debug, Clone)]
pub struct OptimizeOutcome {
    pub pipeline: Pipeline,
    /// Fingerprint of every surviving node.
    pub fingerprints: BTreeMap<NodeId, Fingerprint>,
    /// Collapsed duplicate ids, mapped to their survivor.
    pub aliases: BTreeMap<NodeId, NodeId>,
}

/// Fingerprint contribution of a folded literal input.
///
/// A literal stands in for the `dfm.api.Constant` node it was folded from,
/// so folded and unfolded pipelines hash identically and share cache entries.
pub fn literal_fingerprint(literal: &serde_json::Value, provider: &str) -> Result<Fingerprint> {
    node_fingerprint(api::CONSTANT, &json!({"value": literal}), provider, &[])
}

/// Compute fingerprints for every node of a (verified, acyclic) pipeline in
/// topological order.
pub fn pipeline_fingerprints(pipeline: &Pipeline) -> Result<BTreeMap<NodeId, Fingerprint>> {
    let order = pipeline.topo_order()?;
    let mut fps: BTreeMap<NodeId, Fingerprint> = BTreeMap::new();

    for id in order {
        // topo_order only yields ids present in the pipeline
        let Some(node) = pipeline.node(&id) else {
            continue;
        };
        let mut upstream = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            match input {
                InputSource::Node(up) => {
                    if let Some(fp) = fps.get(up) {
                        upstream.push(*fp);
                    }
                }
                InputSource::Literal { literal } => {
                    upstream.push(literal_fingerprint(literal, &node.provider)?);
                }
            }
        }
        let fp = node_fingerprint(&node.api_class, &node.params, &node.provider, &upstream)?;
        fps.insert(id, fp);
    }

    Ok(fps)
}

/// Run both rewrites over a verified pipeline.
pub fn optimize_pipeline(pipeline: Pipeline) -> Result<OptimizeOutcome> {
    let (pipeline, aliases) = eliminate_duplicates(pipeline)?;
    let fingerprints = pipeline_fingerprints(&pipeline)?;
    let pipeline = fold_constants(pipeline);

    // Folding only removes constant nodes whose contribution is preserved in
    // the literal inputs, so surviving fingerprints are unchanged.
    let fingerprints = fingerprints
        .into_iter()
        .filter(|(id, _)| pipeline.node(id).is_some())
        .collect();

    Ok(OptimizeOutcome {
        pipeline,
        fingerprints,
        aliases,
    })
}

fn eliminate_duplicates(pipeline: Pipeline) -> Result<(Pipeline, BTreeMap<NodeId, NodeId>)> {
    let fps = pipeline_fingerprints(&pipeline)?;

    let mut survivor_of: HashMap<Fingerprint, NodeId> = HashMap::new();
    let mut aliases: BTreeMap<NodeId, NodeId> = BTreeMap::new();
    for node in &pipeline.nodes {
        let Some(fp) = fps.get(&node.node_id) else {
            continue;
        };
        match survivor_of.get(fp) {
            Some(survivor) => {
                aliases.insert(node.node_id.clone(), survivor.clone());
            }
            None => {
                survivor_of.insert(*fp, node.node_id.clone());
            }
        }
    }

    if aliases.is_empty() {
        return Ok((pipeline, aliases));
    }

    let resolve = |id: &NodeId| aliases.get(id).unwrap_or(id).clone();

    // Merged flags of each survivor: an output or forced duplicate makes the
    // survivor an output / forced, and ordering constraints are unioned so
    // collapsing never relaxes them.
    let mut merged: HashMap<NodeId, Node> = HashMap::new();
    for node in &pipeline.nodes {
        let target = resolve(&node.node_id);
        if target != node.node_id {
            if let Some(survivor) = merged.get_mut(&target) {
                survivor.is_output |= node.is_output;
                survivor.force_compute |= node.force_compute;
                for t in &node.after {
                    let t = resolve(t);
                    if t != survivor.node_id && !survivor.after.contains(&t) {
                        survivor.after.push(t);
                    }
                }
                survivor.not_before = match (survivor.not_before, node.not_before) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }
        } else {
            merged.insert(node.node_id.clone(), node.clone());
        }
    }

    let mut nodes = Vec::new();
    for node in &pipeline.nodes {
        if aliases.contains_key(&node.node_id) {
            continue;
        }
        let Some(mut node) = merged.remove(&node.node_id) else {
            continue;
        };
        for input in &mut node.inputs {
            if let InputSource::Node(up) = input {
                *up = resolve(up);
            }
        }
        let mut after = Vec::new();
        for t in &node.after {
            let t = resolve(t);
            if t != node.node_id && !after.contains(&t) {
                after.push(t);
            }
        }
        node.after = after;
        nodes.push(node);
    }

    Ok((Pipeline::new(nodes), aliases))
}

fn fold_constants(pipeline: Pipeline) -> Pipeline {
    let foldable: Vec<(NodeId, serde_json::Value)> = pipeline
        .nodes
        .iter()
        .filter(|n| {
            n.api_class == api::CONSTANT
                // Ordering constraints on the node would be lost by folding.
                && n.after.is_empty()
                && n.not_before.is_none()
        })
        .filter_map(|n| {
            n.params
                .get("value")
                .map(|v| (n.node_id.clone(), v.clone()))
        })
        .collect();

    if foldable.is_empty() {
        return pipeline;
    }

    let mut nodes = pipeline.nodes.clone();
    for (const_id, value) in &foldable {
        for node in &mut nodes {
            for input in &mut node.inputs {
                if input.node_id() == Some(const_id) {
                    *input = InputSource::Literal {
                        literal: value.clone(),
                    };
                }
            }
        }
    }

    // Drop folded constants nothing references anymore.
    let p = Pipeline::new(nodes.clone());
    let retained: Vec<Node> = nodes
        .into_iter()
        .filter(|n| {
            if !foldable.iter().any(|(id, _)| *id == n.node_id) {
                return true;
            }
            n.is_output
                || !p.consumers(&n.node_id).is_empty()
                || !p.after_dependents(&n.node_id).is_empty()
        })
        .collect();

    Pipeline::new(retained)
}
