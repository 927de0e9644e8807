use std::collections::HashMap;

use petgraph::dot::Dot;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::graph::Graph;
use crate::ops::registry::OperatorId;
use crate::ops::tensor::TensorId;

impl Graph {
    /// Operator dependency graph with one edge per consumed tensor slot
    pub fn dependency_graph(&self) -> DiGraph<OperatorId, TensorId> {
        let mut graph = DiGraph::new();
        let mut index: HashMap<OperatorId, NodeIndex> = HashMap::new();

        for op in self.operators() {
            index.insert(op.guid(), graph.add_node(op.guid()));
        }
        for op in self.operators() {
            for &input in op.inputs() {
                let source = self.tensor(input).and_then(|t| t.source());
                if let Some(from) = source.and_then(|s| index.get(&s)) {
                    graph.add_edge(*from, index[&op.guid()], input);
                }
            }
        }
        graph
    }

    /// Graphviz rendering of the dependency graph, for debugging
    pub fn to_dot(&self) -> String {
        let graph = self.dependency_graph().map(
            |_, &op| self.operator(op).map_or_else(|| op.to_string(), |o| o.to_string()),
            |_, &tensor| format!("t{}", tensor),
        );
        format!("{}", Dot::new(&graph))
    }
}

#[cfg(test)]
mod tests {
    use petgraph::algo::toposort;

    use crate::graph::Graph;
    use crate::memory::CpuRuntime;
    use crate::ops::{DataType, OpKind};

    #[test]
    fn test_dependency_graph_edges() {
        let mut g = Graph::new(Box::new(CpuRuntime::default())).unwrap();
        let x = g.add_tensor(vec![2, 2], DataType::Float32);
        let relu = g.add_operator(OpKind::Relu, vec![x], None).unwrap();
        let y = g.operator(relu).unwrap().outputs()[0];
        g.add_operator(OpKind::Add, vec![y, y], None).unwrap();

        let deps = g.dependency_graph();
        assert_eq!(deps.node_count(), 2);
        assert_eq!(deps.edge_count(), 2);
        assert!(toposort(&deps, None).is_ok());

        let dot = g.to_dot();
        assert!(dot.contains("Relu(input=0,output=1)"));
        assert!(dot.contains("t1"));
    }
}
