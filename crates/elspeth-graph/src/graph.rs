//! The execution graph itself: construction and its validation passes.

use std::collections::{HashMap, HashSet};

use elspeth_core::value::ValueType;

use crate::edge::Edge;
use crate::error::GraphError;
use crate::node::{Node, NodePlugin, TransformBehavior};

/// Where a routing/gate decision resolves to: the precomputed
/// `(gate_node_id, route_label) -> destination` map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDestination {
    Sink(String),
    Continue,
    Fork,
}

pub struct ExecutionGraph {
    nodes: HashMap<String, Node>,
    /// Preserves construction order for deterministic traversal/tests.
    node_order: Vec<String>,
    edges: Vec<Edge>,
}

impl ExecutionGraph {
    /// Build a graph from plugin-backed nodes and their connecting edges.
    /// Returns every structural error found rather than failing on the
    /// first one, so a config author sees the whole picture at once.
    pub fn build(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self, Vec<GraphError>> {
        let mut map = HashMap::with_capacity(nodes.len());
        let mut order = Vec::with_capacity(nodes.len());
        let mut errors = Vec::new();

        for node in nodes {
            if map.contains_key(&node.id) {
                errors.push(GraphError::DuplicateNodeId(node.id.clone()));
                continue;
            }
            order.push(node.id.clone());
            map.insert(node.id.clone(), node);
        }

        for edge in &edges {
            if !map.contains_key(&edge.from) {
                errors.push(GraphError::UnknownNode(edge.from.clone()));
            }
            if !map.contains_key(&edge.to) {
                errors.push(GraphError::UnknownNode(edge.to.clone()));
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }

        let graph = ExecutionGraph { nodes: map, node_order: order, edges };
        let validation_errors = graph.validate();
        if validation_errors.is_empty() {
            tracing::info!(node_count = graph.node_order.len(), edge_count = graph.edges.len(), "execution graph validated");
            Ok(graph)
        } else {
            tracing::warn!(errors = ?validation_errors, "execution graph failed validation");
            Err(validation_errors)
        }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Mutable access to a node's plugin, for the orchestrator to drive
    /// `Source::next_row`/`Sink::write` (the only two plugin calls that
    /// need `&mut self`; every `Transform` call goes through the
    /// immutable `node()` accessor instead).
    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn node_ids(&self) -> &[String] {
        &self.node_order
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from == node_id).collect()
    }

    pub fn incoming(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.to == node_id).collect()
    }

    /// Run every structural/schema validation pass.
    pub fn validate(&self) -> Vec<GraphError> {
        let mut errors = Vec::new();
        errors.extend(self.check_single_source());
        errors.extend(self.check_acyclic());
        errors.extend(self.check_terminals());
        errors.extend(self.check_fork_partitions());
        errors.extend(self.check_coalesce_fan_in());
        errors.extend(self.check_schema_compatibility());
        errors
    }

    fn check_single_source(&self) -> Vec<GraphError> {
        let count = self.nodes.values().filter(|n| matches!(n.plugin, NodePlugin::Source(_))).count();
        if count == 1 {
            Vec::new()
        } else {
            vec![GraphError::SourceCount(count)]
        }
    }

    fn check_acyclic(&self) -> Vec<GraphError> {
        #[derive(PartialEq, Clone, Copy)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }
        let mut marks: HashMap<&str, Mark> =
            self.node_order.iter().map(|id| (id.as_str(), Mark::Unvisited)).collect();
        let mut errors = Vec::new();

        fn visit<'a>(
            graph: &'a ExecutionGraph,
            id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            errors: &mut Vec<GraphError>,
        ) {
            match marks.get(id) {
                Some(Mark::Done) => return,
                Some(Mark::InProgress) => {
                    errors.push(GraphError::Cycle(id.to_string()));
                    return;
                }
                _ => {}
            }
            marks.insert(id, Mark::InProgress);
            for edge in graph.outgoing(id) {
                visit(graph, edge.to.as_str(), marks, errors);
            }
            marks.insert(id, Mark::Done);
        }

        for id in &self.node_order {
            if marks.get(id.as_str()) == Some(&Mark::Unvisited) {
                visit(self, id.as_str(), &mut marks, &mut errors);
            }
        }
        errors
    }

    fn check_terminals(&self) -> Vec<GraphError> {
        self.node_order
            .iter()
            .filter(|id| self.outgoing(id).is_empty())
            .filter(|id| !matches!(self.nodes[id.as_str()].plugin, NodePlugin::Sink(_)))
            .map(|id| GraphError::DanglingTerminal(id.clone()))
            .collect()
    }

    fn check_fork_partitions(&self) -> Vec<GraphError> {
        let mut errors = Vec::new();
        for id in &self.node_order {
            let node = &self.nodes[id.as_str()];
            if !matches!(&node.plugin, NodePlugin::Transform(_, TransformBehavior::Fork)) {
                continue;
            }
            let mut seen = HashSet::new();
            for edge in self.outgoing(id) {
                match &edge.label {
                    None => errors.push(GraphError::UnlabelledForkEdge(id.clone())),
                    Some(label) => {
                        if !seen.insert(label.clone()) {
                            errors.push(GraphError::DuplicateForkLabel(id.clone(), label.clone()));
                        }
                    }
                }
            }
        }
        errors
    }

    fn check_coalesce_fan_in(&self) -> Vec<GraphError> {
        let mut errors = Vec::new();
        for id in &self.node_order {
            let node = &self.nodes[id.as_str()];
            if !matches!(node.plugin, NodePlugin::Coalesce(_)) {
                continue;
            }
            let branches: HashSet<Option<String>> = self.incoming(id).into_iter().map(|e| e.label.clone()).collect();
            if branches.len() < 2 {
                errors.push(GraphError::InsufficientCoalesceFanIn(id.clone()));
            }
        }
        errors
    }

    fn check_schema_compatibility(&self) -> Vec<GraphError> {
        let mut errors = Vec::new();
        for edge in &self.edges {
            let Some(producer) = self.nodes.get(&edge.from) else { continue };
            let Some(consumer) = self.nodes.get(&edge.to) else { continue };

            if producer.schema_config().is_dynamic || consumer.schema_config().is_dynamic {
                continue;
            }
            let (Some(out_schema), Some(in_schema)) = (producer.output_schema(), consumer.input_schema()) else {
                continue;
            };

            for required in in_schema.fields.iter().filter(|f| f.required) {
                match out_schema.fields.iter().find(|f| f.normalized_name == required.normalized_name) {
                    None => {
                        errors.push(GraphError::SchemaIncompatibleEdge(
                            edge.from.clone(),
                            edge.to.clone(),
                            required.normalized_name.clone(),
                        ));
                    }
                    Some(produced) => {
                        if !assignable(produced.value_type, required.value_type) {
                            errors.push(GraphError::SchemaIncompatibleEdge(
                                edge.from.clone(),
                                edge.to.clone(),
                                required.normalized_name.clone(),
                            ));
                        }
                    }
                }
            }
        }
        errors
    }

    /// Build the precomputed `(gate_node_id, route_label) -> destination`
    /// map from a set of `(node_id, label, target)` triples, validating
    /// every target resolves to an existing sink, `continue`, or `fork`.
    pub fn build_routing_table(
        &self,
        routes: &[(String, String, RouteDestination)],
    ) -> Result<HashMap<(String, String), RouteDestination>, Vec<GraphError>> {
        let mut table = HashMap::new();
        let mut errors = Vec::new();
        for (node_id, label, dest) in routes {
            if let RouteDestination::Sink(sink_name) = dest {
                let exists = self.nodes.get(sink_name).map(|n| matches!(n.plugin, NodePlugin::Sink(_))).unwrap_or(false);
                if !exists {
                    errors.push(GraphError::UnknownRouteTarget(sink_name.clone()));
                    continue;
                }
            }
            table.insert((node_id.clone(), label.clone()), dest.clone());
        }
        if errors.is_empty() {
            Ok(table)
        } else {
            Err(errors)
        }
    }
}

fn assignable(produced: ValueType, expected: ValueType) -> bool {
    elspeth_core::Value::assignable_to(produced, expected)
}
