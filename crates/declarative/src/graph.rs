//! Resource graph model
//!
//! Nodes are owned by the graph. Edges are derived exactly once, when the
//! graph is built, from the references embedded in attribute values and from
//! explicit `depends_on` lists.

use std::collections::{BTreeSet, HashMap};

use crate::error::ValidationError;
use crate::types::{Attributes, Reference, ResourceId, Value};

/// One declared resource and its desired attributes
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub id: ResourceId,
    /// Desired attributes; values may reference other nodes
    pub attributes: Attributes,
    /// Ordering-only dependencies that carry no attribute value
    pub depends_on: Vec<ResourceId>,
}

impl ResourceNode {
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            attributes: Attributes::new(),
            depends_on: Vec::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Builder-style explicit dependency
    pub fn after(mut self, id: ResourceId) -> Self {
        self.depends_on.push(id);
        self
    }

    /// Every reference in the attributes, paired with the attribute holding it
    pub fn references(&self) -> Vec<(&str, &Reference)> {
        self.attributes
            .iter()
            .flat_map(|(name, value)| {
                value
                    .references()
                    .into_iter()
                    .map(move |r| (name.as_str(), r))
            })
            .collect()
    }
}

/// Directed relation from a referencing node to the node it references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub from: ResourceId,
    pub to: ResourceId,
    /// Attribute that created the edge, `None` for `depends_on`
    pub attribute: Option<String>,
}

/// The desired resource graph, validated on construction
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    index: HashMap<ResourceId, usize>,
    edges: Vec<Edge>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl ResourceGraph {
    /// Build a graph from nodes in declaration order.
    ///
    /// Fails on malformed or duplicate identifiers and on references to
    /// nodes that are not part of the graph. Cycles are detected by the
    /// resolver.
    pub fn new(nodes: Vec<ResourceNode>) -> Result<Self, ValidationError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            node.id.validate()?;
            if index.insert(node.id.clone(), i).is_some() {
                return Err(ValidationError::DuplicateResource(node.id.clone()));
            }
        }

        let mut edges = Vec::new();
        let mut dependencies = vec![BTreeSet::new(); nodes.len()];
        let mut dependents = vec![BTreeSet::new(); nodes.len()];

        for (from, node) in nodes.iter().enumerate() {
            let referenced = node
                .references()
                .into_iter()
                .map(|(attr, r)| (Some(attr.to_string()), &r.target))
                .chain(node.depends_on.iter().map(|target| (None, target)));

            for (attribute, target) in referenced {
                let Some(&to) = index.get(target) else {
                    return Err(ValidationError::UnresolvedReference {
                        from: node.id.clone(),
                        attribute: attribute.unwrap_or_else(|| "depends_on".to_string()),
                        target: target.clone(),
                    });
                };
                dependencies[from].insert(to);
                dependents[to].insert(from);
                edges.push(Edge {
                    from: node.id.clone(),
                    to: target.clone(),
                    attribute,
                });
            }
        }

        log::debug!(
            "Built resource graph: {} nodes, {} edges",
            nodes.len(),
            edges.len()
        );

        Ok(Self {
            nodes,
            index,
            edges,
            dependencies: dependencies
                .into_iter()
                .map(|s| s.into_iter().collect())
                .collect(),
            dependents: dependents
                .into_iter()
                .map(|s| s.into_iter().collect())
                .collect(),
        })
    }

    /// A graph with no nodes; planning against it destroys everything
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order
    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn node(&self, id: &ResourceId) -> Option<&ResourceNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    /// Declaration index of a node
    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Nodes this node references (producers)
    pub fn dependencies(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.position(id)
            .map(|i| self.dependencies[i].iter().map(|&d| &self.nodes[d].id).collect())
            .unwrap_or_default()
    }

    /// Nodes referencing this node (consumers)
    pub fn dependents(&self, id: &ResourceId) -> Vec<&ResourceId> {
        self.position(id)
            .map(|i| self.dependents[i].iter().map(|&d| &self.nodes[d].id).collect())
            .unwrap_or_default()
    }

    pub(crate) fn dependency_indices(&self) -> &[Vec<usize>] {
        &self.dependencies
    }

    /// The given nodes plus everything they transitively depend on
    pub fn dependency_closure<'a>(
        &self,
        roots: impl IntoIterator<Item = &'a ResourceId>,
    ) -> BTreeSet<ResourceId> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = roots
            .into_iter()
            .filter_map(|id| self.position(id))
            .collect();

        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.dependencies[i].iter().copied());
            }
        }

        seen.into_iter().map(|i| self.nodes[i].id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str) -> ResourceId {
        ResourceId::new("test", name)
    }

    fn reference(name: &str, attr: &str) -> Reference {
        Reference::new(id(name), attr)
    }

    #[test]
    fn test_edges_derived_from_references() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")).with("size", 1),
            ResourceNode::new(id("b")).with("parent", reference("a", "id")),
            ResourceNode::new(id("c"))
                .with("list", Value::List(vec![Value::from(reference("b", "id"))]))
                .after(id("a")),
        ])
        .unwrap();

        assert_eq!(graph.edges().len(), 3);
        assert_eq!(graph.dependencies(&id("b")), vec![&id("a")]);
        assert_eq!(graph.dependencies(&id("c")), vec![&id("a"), &id("b")]);
        assert_eq!(graph.dependents(&id("a")), vec![&id("b"), &id("c")]);
        assert_eq!(graph.edges()[2].attribute, None);
    }

    #[test]
    fn test_unresolved_reference_rejected() {
        let err = ResourceGraph::new(vec![
            ResourceNode::new(id("b")).with("parent", reference("missing", "id")),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            ValidationError::UnresolvedReference {
                from: id("b"),
                attribute: "parent".into(),
                target: id("missing"),
            }
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = ResourceGraph::new(vec![ResourceNode::new(id("a")), ResourceNode::new(id("a"))])
            .unwrap_err();
        assert_eq!(err, ValidationError::DuplicateResource(id("a")));
    }

    #[test]
    fn test_dotted_name_rejected() {
        let err = ResourceGraph::new(vec![ResourceNode::new(ResourceId::new("test", "a.b"))])
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidId("test.a.b".into()));
    }

    #[test]
    fn test_dependency_closure() {
        let graph = ResourceGraph::new(vec![
            ResourceNode::new(id("a")),
            ResourceNode::new(id("b")).with("p", reference("a", "id")),
            ResourceNode::new(id("c")).with("p", reference("b", "id")),
            ResourceNode::new(id("d")),
        ])
        .unwrap();

        let closure = graph.dependency_closure([&id("c")]);
        assert_eq!(closure, BTreeSet::from([id("a"), id("b"), id("c")]));
    }
}
