//! Graph node: a typed wrapper around a plugin instance, part of a typed
//! DAG built from plugin instances.

use elspeth_core::config::{AggregationConfig, CoalesceConfig};
use elspeth_core::{SchemaConfig, SchemaContract, Sink, Source, Transform};

/// How a `transform`-kind node's output is interpreted by the row
/// processor. Fork and deaggregation are transform-shaped behaviors, not
/// separate plugin traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformBehavior {
    Regular,
    Fork,
    Deaggregation,
}

/// The plugin instance(s) and static config backing a node.
pub enum NodePlugin {
    Source(Box<dyn Source>),
    Transform(Box<dyn Transform>, TransformBehavior),
    Aggregation(Box<dyn Transform>, AggregationConfig),
    Coalesce(CoalesceConfig),
    Sink(Box<dyn Sink>),
}

impl NodePlugin {
    pub fn kind_name(&self) -> &'static str {
        match self {
            NodePlugin::Source(_) => "source",
            NodePlugin::Transform(_, _) => "transform",
            NodePlugin::Aggregation(_, _) => "aggregation",
            NodePlugin::Coalesce(_) => "coalesce",
            NodePlugin::Sink(_) => "sink",
        }
    }
}

pub struct Node {
    pub id: String,
    pub plugin: NodePlugin,
}

impl Node {
    pub fn new(id: impl Into<String>, plugin: NodePlugin) -> Self {
        Node { id: id.into(), plugin }
    }

    /// The schema a node is expected to *receive*, where applicable.
    /// Coalesce has no fixed input contract of its own (it merges
    /// whatever the arriving branches carry) so edge validation treats it
    /// as dynamic.
    pub fn input_schema(&self) -> Option<&SchemaContract> {
        match &self.plugin {
            NodePlugin::Transform(t, _) => Some(t.input_schema()),
            NodePlugin::Aggregation(t, _) => Some(t.input_schema()),
            NodePlugin::Sink(s) => Some(s.input_schema()),
            NodePlugin::Source(_) | NodePlugin::Coalesce(_) => None,
        }
    }

    pub fn output_schema(&self) -> Option<&SchemaContract> {
        match &self.plugin {
            NodePlugin::Source(s) => Some(s.output_schema()),
            NodePlugin::Transform(t, _) => Some(t.output_schema()),
            NodePlugin::Aggregation(t, _) => Some(t.output_schema()),
            NodePlugin::Sink(_) | NodePlugin::Coalesce(_) => None,
        }
    }

    pub fn schema_config(&self) -> SchemaConfig {
        match &self.plugin {
            NodePlugin::Source(s) => s.schema_config(),
            NodePlugin::Transform(t, _) => t.schema_config(),
            NodePlugin::Aggregation(t, _) => t.schema_config(),
            // Coalesce merges dynamically-arriving branch schemas; it is
            // always treated as a dynamic endpoint for edge validation.
            NodePlugin::Coalesce(_) => SchemaConfig { is_dynamic: true, adds_fields: true },
            NodePlugin::Sink(s) => s.schema_config(),
        }
    }
}
