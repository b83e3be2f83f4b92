//! # Elspeth Graph
//!
//! The typed execution DAG: nodes built from plugin instances, edges
//! carrying routing labels and move/copy fan-out modes, and the
//! structural/schema validation passes run at pipeline build time. A
//! graph that fails validation never starts a run.

pub mod edge;
pub mod error;
pub mod graph;
pub mod node;

pub use edge::{Edge, EdgeMode};
pub use error::GraphError;
pub use graph::{ExecutionGraph, RouteDestination};
pub use node::{Node, NodePlugin, TransformBehavior};

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use elspeth_core::schema::{DeclaredField, DeclaredSchema};
    use elspeth_core::{
        ElspethError, OnError, Operator, RoutePolicy, RunContext, SchemaConfig, SchemaContract, Sink, Source,
        SourceRow, Transform, TransformOutput, ValueType,
    };

    use super::*;

    struct StubSource {
        schema: SchemaContract,
        validation_route: RoutePolicy,
    }
    #[async_trait]
    impl Operator for StubSource {
        fn name(&self) -> &str {
            "source"
        }
    }
    #[async_trait]
    impl Source for StubSource {
        fn output_schema(&self) -> &SchemaContract {
            &self.schema
        }
        fn schema_config(&self) -> SchemaConfig {
            SchemaConfig::default()
        }
        fn on_validation_failure(&self) -> &RoutePolicy {
            &self.validation_route
        }
        async fn open(&mut self, _ctx: &RunContext) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn next_row(&mut self, _ctx: &RunContext) -> Result<Option<SourceRow>, ElspethError> {
            Ok(None)
        }
    }

    struct StubTransform {
        input: SchemaContract,
        output: SchemaContract,
        on_error: OnError,
    }
    #[async_trait]
    impl Operator for StubTransform {
        fn name(&self) -> &str {
            "transform"
        }
    }
    #[async_trait]
    impl Transform for StubTransform {
        fn input_schema(&self) -> &SchemaContract {
            &self.input
        }
        fn output_schema(&self) -> &SchemaContract {
            &self.output
        }
        fn schema_config(&self) -> SchemaConfig {
            SchemaConfig::default()
        }
        fn on_error(&self) -> &OnError {
            &self.on_error
        }
        async fn process(&self, row: elspeth_core::RowData, _ctx: &RunContext) -> Result<TransformOutput, ElspethError> {
            Ok(TransformOutput::Row(row))
        }
    }

    struct StubSink {
        schema: SchemaContract,
    }
    #[async_trait]
    impl Operator for StubSink {
        fn name(&self) -> &str {
            "sink"
        }
    }
    #[async_trait]
    impl Sink for StubSink {
        fn input_schema(&self) -> &SchemaContract {
            &self.schema
        }
        fn set_output_contract(&mut self, contract: SchemaContract) {
            self.schema = contract;
        }
        async fn write(
            &mut self,
            rows: Vec<elspeth_core::RowData>,
            _ctx: &RunContext,
        ) -> Result<elspeth_core::ArtifactDescriptor, ElspethError> {
            Ok(elspeth_core::ArtifactDescriptor { sink_name: "sink".into(), rows_written: rows.len(), details: None })
        }
        async fn flush(&mut self) -> Result<(), ElspethError> {
            Ok(())
        }
        async fn close(&mut self) -> Result<(), ElspethError> {
            Ok(())
        }
    }

    fn int_field(name: &str) -> DeclaredField {
        DeclaredField { normalized_name: name.into(), original_name: None, value_type: ValueType::Int, required: true }
    }

    #[test]
    fn linear_source_transform_sink_validates() {
        let schema =
            SchemaContract::create_output_contract_from_schema(&DeclaredSchema { fields: vec![int_field("id")], allow_extras: false });
        let source = Node::new("src", NodePlugin::Source(Box::new(StubSource { schema: schema.clone(), validation_route: RoutePolicy::Discard })));
        let transform = Node::new(
            "t1",
            NodePlugin::Transform(
                Box::new(StubTransform { input: schema.clone(), output: schema.clone(), on_error: OnError::Fatal }),
                TransformBehavior::Regular,
            ),
        );
        let sink = Node::new("sink", NodePlugin::Sink(Box::new(StubSink { schema: schema.clone() })));

        let edges = vec![
            Edge::new("src", "t1", None, EdgeMode::Move),
            Edge::new("t1", "sink", None, EdgeMode::Move),
        ];
        let graph = ExecutionGraph::build(vec![source, transform, sink], edges);
        assert!(graph.is_ok());
    }

    #[test]
    fn cycle_is_rejected() {
        let schema = SchemaContract::observed();
        let a = Node::new(
            "a",
            NodePlugin::Transform(Box::new(StubTransform { input: schema.clone(), output: schema.clone(), on_error: OnError::Fatal }), TransformBehavior::Regular),
        );
        let b = Node::new(
            "b",
            NodePlugin::Transform(Box::new(StubTransform { input: schema.clone(), output: schema.clone(), on_error: OnError::Fatal }), TransformBehavior::Regular),
        );
        let edges = vec![Edge::new("a", "b", None, EdgeMode::Move), Edge::new("b", "a", None, EdgeMode::Move)];
        let errors = ExecutionGraph::build(vec![a, b], edges).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, GraphError::Cycle(_))));
    }

    #[test]
    fn missing_required_field_across_edge_is_rejected() {
        let producer_schema = SchemaContract::observed();
        let consumer_schema =
            SchemaContract::create_output_contract_from_schema(&DeclaredSchema { fields: vec![int_field("id")], allow_extras: true });
        let source = Node::new("src", NodePlugin::Source(Box::new(StubSource { schema: producer_schema, validation_route: RoutePolicy::Discard })));
        let sink = Node::new("sink", NodePlugin::Sink(Box::new(StubSink { schema: consumer_schema })));
        let edges = vec![Edge::new("src", "sink", None, EdgeMode::Move)];
        let errors = ExecutionGraph::build(vec![source, sink], edges).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, GraphError::SchemaIncompatibleEdge(_, _, _))));
    }

    #[test]
    fn dynamic_endpoints_skip_schema_check() {
        struct DynamicSink {
            schema: SchemaContract,
        }
        #[async_trait]
        impl Operator for DynamicSink {
            fn name(&self) -> &str {
                "sink"
            }
        }
        #[async_trait]
        impl Sink for DynamicSink {
            fn input_schema(&self) -> &SchemaContract {
                &self.schema
            }
            fn set_output_contract(&mut self, contract: SchemaContract) {
                self.schema = contract;
            }
            fn schema_config(&self) -> SchemaConfig {
                SchemaConfig { is_dynamic: true, adds_fields: true }
            }
            async fn write(
                &mut self,
                rows: Vec<elspeth_core::RowData>,
                _ctx: &RunContext,
            ) -> Result<elspeth_core::ArtifactDescriptor, ElspethError> {
                Ok(elspeth_core::ArtifactDescriptor { sink_name: "sink".into(), rows_written: rows.len(), details: None })
            }
            async fn flush(&mut self) -> Result<(), ElspethError> {
                Ok(())
            }
            async fn close(&mut self) -> Result<(), ElspethError> {
                Ok(())
            }
        }
        let producer_schema = SchemaContract::observed();
        let consumer_schema =
            SchemaContract::create_output_contract_from_schema(&DeclaredSchema { fields: vec![int_field("id")], allow_extras: true });
        let source = Node::new("src", NodePlugin::Source(Box::new(StubSource { schema: producer_schema, validation_route: RoutePolicy::Discard })));
        let sink = Node::new("sink", NodePlugin::Sink(Box::new(DynamicSink { schema: consumer_schema })));
        let edges = vec![Edge::new("src", "sink", None, EdgeMode::Move)];
        let graph = ExecutionGraph::build(vec![source, sink], edges);
        assert!(graph.is_ok(), "dynamic sink should skip schema compatibility checks");
    }

    #[test]
    fn coalesce_requires_two_distinct_branches() {
        let schema = SchemaContract::observed();
        let source = Node::new("src", NodePlugin::Source(Box::new(StubSource { schema: schema.clone(), validation_route: RoutePolicy::Discard })));
        let coalesce = Node::new("c", NodePlugin::Coalesce(elspeth_core::config::CoalesceConfig {
            merge_policy: elspeth_core::config::MergePolicy::AllBranches,
            timeout_seconds: None,
            on_incomplete: elspeth_core::config::OnIncomplete::Fail,
            rule: elspeth_core::config::MergeRule::FirstWins,
            branch_priority: None,
        }));
        let sink = Node::new("sink", NodePlugin::Sink(Box::new(StubSink { schema: schema.clone() })));
        let edges = vec![
            Edge::new("src", "c", Some("only".into()), EdgeMode::Copy),
            Edge::new("c", "sink", None, EdgeMode::Move),
        ];
        let errors = ExecutionGraph::build(vec![source, coalesce, sink], edges).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, GraphError::InsufficientCoalesceFanIn(_))));
    }
}
