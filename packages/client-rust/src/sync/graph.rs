//! Immutable calculated-field dependency graph.
//!
//! Built once at startup from every table's calculated-field declarations.
//! An edge runs from a dependency table to the table whose calculated field
//! reads it. The graph must be acyclic; a table reading its own rows counts
//! as a cycle.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use replica_core::{Dependency, Link, TableInfo};

use crate::error::SchemaError;

/// One calculated field of `table` that reads the edge's source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentEdge {
    pub table: String,
    pub field: String,
    pub dependency: Dependency,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    dependents: BTreeMap<String, Vec<DependentEdge>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Validates declarations and sorts tables topologically.
    ///
    /// # Errors
    ///
    /// A duplicate table, a dependency on an undeclared table, a link field
    /// without an index, or a cycle.
    pub fn build(tables: &[TableInfo]) -> Result<Self, SchemaError> {
        let mut by_name: BTreeMap<&str, &TableInfo> = BTreeMap::new();
        for info in tables {
            if by_name.insert(info.name.as_str(), info).is_some() {
                return Err(SchemaError::DuplicateTable {
                    table: info.name.clone(),
                });
            }
        }

        let mut dependents: BTreeMap<String, Vec<DependentEdge>> = BTreeMap::new();
        for info in tables {
            for (field, calc) in &info.calculated {
                for dep in &calc.dependencies {
                    let Some(source) = by_name.get(dep.table.as_str()) else {
                        return Err(SchemaError::UnknownDependency {
                            table: info.name.clone(),
                            field: field.clone(),
                            dependency: dep.table.clone(),
                        });
                    };
                    let (link_table, link_field) = match &dep.link {
                        Link::Forward { local_field } => (info, local_field),
                        Link::Reverse { remote_field } => (*source, remote_field),
                    };
                    if !link_table.is_indexed(link_field) {
                        return Err(SchemaError::UnindexedLink {
                            table: info.name.clone(),
                            field: field.clone(),
                            link_table: link_table.name.clone(),
                            link_field: link_field.clone(),
                        });
                    }
                    dependents.entry(dep.table.clone()).or_default().push(DependentEdge {
                        table: info.name.clone(),
                        field: field.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let order = topological_order(by_name.keys().copied(), &dependents)?;
        Ok(Self { dependents, order })
    }

    /// Calculated fields reading `table`.
    #[must_use]
    pub fn dependents_of(&self, table: &str) -> &[DependentEdge] {
        self.dependents.get(table).map_or(&[], Vec::as_slice)
    }

    /// Tables with every dependency before its dependents.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }
}

/// Kahn's algorithm. Tables left unsorted sit on or behind a cycle.
fn topological_order<'a>(
    names: impl Iterator<Item = &'a str>,
    dependents: &BTreeMap<String, Vec<DependentEdge>>,
) -> Result<Vec<String>, SchemaError> {
    let names: Vec<&str> = names.collect();
    let mut in_degree: BTreeMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();
    let mut targets: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for (source, edges) in dependents {
        for edge in edges {
            if targets.entry(source.as_str()).or_default().insert(edge.table.as_str()) {
                *in_degree.entry(edge.table.as_str()).or_default() += 1;
            }
        }
    }

    let mut ready: VecDeque<&str> = in_degree.iter().filter(|(_, d)| **d == 0).map(|(n, _)| *n).collect();
    let mut order = Vec::with_capacity(names.len());
    while let Some(name) = ready.pop_front() {
        order.push(name.to_string());
        for target in targets.get(name).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(target) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(*target);
                }
            }
        }
    }

    if order.len() < in_degree.len() {
        let sorted: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let tables = in_degree
            .keys()
            .filter(|n| !sorted.contains(*n))
            .map(ToString::to_string)
            .collect();
        return Err(SchemaError::Cycle { tables });
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use replica_core::{CalculatedField, Value};

    use super::*;

    fn count_of(table: &str, link: &str) -> CalculatedField {
        CalculatedField::new(vec![Dependency::reverse(table, link, &["id"])], |_, _| Value::Int(0))
    }

    fn name_of(table: &str, link: &str) -> CalculatedField {
        CalculatedField::new(vec![Dependency::forward(table, link, &["name"])], |_, _| Value::Null)
    }

    #[test]
    fn builds_edges_and_order() {
        let tables = vec![
            TableInfo::new("tasks", "id")
                .index("project_id")
                .calculated("project_name", name_of("projects", "project_id")),
            TableInfo::new("projects", "id").calculated("task_count", count_of("comments", "project_id")),
            TableInfo::new("comments", "id").index("project_id"),
        ];
        let graph = DependencyGraph::build(&tables).unwrap();

        let edges = graph.dependents_of("projects");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].table, "tasks");
        assert_eq!(edges[0].field, "project_name");
        assert!(graph.dependents_of("tasks").is_empty());

        let pos = |t: &str| graph.order().iter().position(|n| n == t).unwrap();
        assert!(pos("comments") < pos("projects"));
        assert!(pos("projects") < pos("tasks"));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let tables = vec![TableInfo::new("tasks", "id")
            .index("project_id")
            .calculated("project_name", name_of("projects", "project_id"))];
        let err = DependencyGraph::build(&tables).unwrap_err();
        assert!(matches!(err, SchemaError::UnknownDependency { .. }));
    }

    #[test]
    fn rejects_unindexed_links() {
        let forward = vec![
            TableInfo::new("tasks", "id").calculated("project_name", name_of("projects", "project_id")),
            TableInfo::new("projects", "id"),
        ];
        assert_eq!(
            DependencyGraph::build(&forward).unwrap_err(),
            SchemaError::UnindexedLink {
                table: "tasks".to_string(),
                field: "project_name".to_string(),
                link_table: "tasks".to_string(),
                link_field: "project_id".to_string(),
            }
        );

        let reverse = vec![
            TableInfo::new("projects", "id").calculated("task_count", count_of("tasks", "project_id")),
            TableInfo::new("tasks", "id"),
        ];
        assert!(matches!(
            DependencyGraph::build(&reverse).unwrap_err(),
            SchemaError::UnindexedLink { link_table, .. } if link_table == "tasks"
        ));
    }

    #[test]
    fn rejects_cycles() {
        let tables = vec![
            TableInfo::new("a", "id").index("b_id").calculated("x", name_of("b", "b_id")),
            TableInfo::new("b", "id").index("a_id").calculated("y", name_of("a", "a_id")),
            TableInfo::new("c", "id"),
        ];
        assert_eq!(
            DependencyGraph::build(&tables).unwrap_err(),
            SchemaError::Cycle {
                tables: vec!["a".to_string(), "b".to_string()],
            }
        );

        let selfish = vec![TableInfo::new("a", "id")
            .index("parent_id")
            .calculated("parent_name", name_of("a", "parent_id"))];
        assert!(matches!(
            DependencyGraph::build(&selfish).unwrap_err(),
            SchemaError::Cycle { .. }
        ));
    }

    #[test]
    fn rejects_duplicates() {
        let tables = vec![TableInfo::new("a", "id"), TableInfo::new("a", "key")];
        assert!(matches!(
            DependencyGraph::build(&tables).unwrap_err(),
            SchemaError::DuplicateTable { .. }
        ));
    }
}
