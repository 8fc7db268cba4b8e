use std::collections::{HashMap, HashSet, VecDeque};

use schema::{
    CompetencyEdge, CompetencyNode, GraphEdgeView, GraphNodeView, NodeStatus, ProgressStatus,
    StudentProgress,
};
use thiserror::Error;

/// Displayed in place of the real label for locked territory the learner has
/// not reached yet.
pub const FOG_LABEL: &str = "Unexplored zone";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("competency graph contains a cycle through: {}", nodes.join(", "))]
    CycleDetected { nodes: Vec<String> },
    #[error("edge references unknown node: {0}")]
    UnknownNode(String),
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Child -> parents map. An edge's `source_id` is a prerequisite (parent) of
/// its `target_id`.
pub fn reverse_adjacency<'a>(edges: &'a [CompetencyEdge]) -> HashMap<&'a str, Vec<&'a str>> {
    let mut parents: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        parents
            .entry(edge.target_id.as_str())
            .or_default()
            .push(edge.source_id.as_str());
    }
    parents
}

/// Kahn topological order over the competency DAG. Cycles are a
/// data-integrity bug, not a supported input: they are detected and reported
/// instead of silently degrading downstream level computation.
pub fn topological_order<'a>(
    nodes: &'a [CompetencyNode],
    edges: &'a [CompetencyEdge],
) -> Result<Vec<&'a str>, GraphError> {
    let known: HashSet<&str> = nodes.iter().map(|node| node.id.as_str()).collect();
    for edge in edges {
        if !known.contains(edge.source_id.as_str()) {
            return Err(GraphError::UnknownNode(edge.source_id.clone()));
        }
        if !known.contains(edge.target_id.as_str()) {
            return Err(GraphError::UnknownNode(edge.target_id.clone()));
        }
    }

    let mut in_degree: HashMap<&str, usize> =
        nodes.iter().map(|node| (node.id.as_str(), 0)).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in edges {
        *in_degree.entry(edge.target_id.as_str()).or_insert(0) += 1;
        children
            .entry(edge.source_id.as_str())
            .or_default()
            .push(edge.target_id.as_str());
    }

    let mut ready: VecDeque<&str> = nodes
        .iter()
        .map(|node| node.id.as_str())
        .filter(|id| in_degree[id] == 0)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(id) = ready.pop_front() {
        order.push(id);
        for child in children.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    ready.push_back(child);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let ordered: HashSet<&str> = order.iter().copied().collect();
        let mut cyclic: Vec<String> = nodes
            .iter()
            .map(|node| node.id.as_str())
            .filter(|id| !ordered.contains(id))
            .map(str::to_string)
            .collect();
        cyclic.sort();
        return Err(GraphError::CycleDetected { nodes: cyclic });
    }
    Ok(order)
}

/// Level of each node: the length of the longest path from any root.
/// level(root) = 1; level(n) = 1 + max(level(parent)). Runs only after the
/// graph is confirmed acyclic by the topological pre-pass, so it terminates
/// on any input.
pub fn node_levels(
    nodes: &[CompetencyNode],
    edges: &[CompetencyEdge],
) -> Result<HashMap<String, u32>, GraphError> {
    let order = topological_order(nodes, edges)?;
    let parents = reverse_adjacency(edges);

    let mut levels: HashMap<String, u32> = HashMap::with_capacity(nodes.len());
    for id in order {
        let level = parents
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|parent| levels.get(*parent))
            .max()
            .map(|deepest| deepest + 1)
            .unwrap_or(1);
        levels.insert(id.to_string(), level);
    }
    Ok(levels)
}

// ---------------------------------------------------------------------------
// Per-student status derivation
// ---------------------------------------------------------------------------

fn progress_unlocks(status: ProgressStatus) -> bool {
    matches!(
        status,
        ProgressStatus::Mastered | ProgressStatus::Completed
    )
}

/// Status of one node given the student's progress rows. Infection is
/// terminal and always wins; an unattempted node is AVAILABLE only when every
/// prerequisite is mastered or completed.
pub fn derive_status(
    node_id: &str,
    parents: &[&str],
    progress_by_competency: &HashMap<&str, &StudentProgress>,
) -> NodeStatus {
    if let Some(progress) = progress_by_competency.get(node_id) {
        match progress.status {
            ProgressStatus::Infected | ProgressStatus::Misconception => {
                return NodeStatus::Infected;
            }
            ProgressStatus::Mastered => return NodeStatus::Mastered,
            ProgressStatus::Completed => return NodeStatus::Completed,
        }
    }
    if parents.is_empty() {
        return NodeStatus::Available;
    }
    let all_parents_done = parents.iter().all(|parent| {
        progress_by_competency
            .get(*parent)
            .is_some_and(|progress| progress_unlocks(progress.status))
    });
    if all_parents_done {
        NodeStatus::Available
    } else {
        NodeStatus::Locked
    }
}

/// Full per-student render view: levels, statuses, and fog-of-war masking.
/// Re-derived from current progress on every call; nothing here is cached.
pub fn student_knowledge_map(
    nodes: &[CompetencyNode],
    edges: &[CompetencyEdge],
    progress: &[StudentProgress],
) -> Result<(Vec<GraphNodeView>, Vec<GraphEdgeView>), GraphError> {
    let levels = node_levels(nodes, edges)?;
    let parents = reverse_adjacency(edges);
    let progress_by_competency: HashMap<&str, &StudentProgress> = progress
        .iter()
        .map(|row| (row.competency_id.as_str(), row))
        .collect();

    let no_parents: Vec<&str> = Vec::new();
    let mut views = Vec::with_capacity(nodes.len());
    for node in nodes {
        let node_parents = parents.get(node.id.as_str()).unwrap_or(&no_parents);
        let status = derive_status(&node.id, node_parents, &progress_by_competency);

        // Fog of war: a LOCKED node adjacent to completed work stays fully
        // labeled (it is the immediate next step); one deeper in un-started
        // territory is masked. Roots are never masked.
        let any_parent_done = node_parents.iter().any(|parent| {
            progress_by_competency
                .get(*parent)
                .is_some_and(|row| progress_unlocks(row.status))
        });
        let masked = status == NodeStatus::Locked && !node_parents.is_empty() && !any_parent_done;

        let infection_reason = if status == NodeStatus::Infected {
            progress_by_competency
                .get(node.id.as_str())
                .and_then(|row| row.reason.clone())
        } else {
            None
        };

        views.push(GraphNodeView {
            id: node.id.clone(),
            label: if masked {
                FOG_LABEL.to_string()
            } else {
                node.title.clone()
            },
            description: if masked {
                String::new()
            } else {
                node.description.clone()
            },
            status,
            level: levels.get(&node.id).copied().unwrap_or(1),
            infection_reason,
        });
    }

    let edge_views = edges
        .iter()
        .map(|edge| GraphEdgeView {
            source_id: edge.source_id.clone(),
            target_id: edge.target_id.clone(),
        })
        .collect();
    Ok((views, edge_views))
}

// ---------------------------------------------------------------------------
// Global aggregate view
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalNodeStat {
    pub node_id: String,
    pub title: String,
    pub level: u32,
    pub students_probed: usize,
    pub mastery_count: usize,
    pub misconception_count: usize,
    /// Most frequent misconception ids for this node, most frequent first.
    pub top_misconceptions: Vec<String>,
    pub friction_score: f32,
}

const TOP_MISCONCEPTION_LIMIT: usize = 5;

/// Aggregate across all students' progress rows. `friction_score` flags
/// curriculum bottlenecks: disproportionate failure relative to success,
/// dampened for lightly-sampled nodes.
pub fn global_node_stats(
    nodes: &[CompetencyNode],
    edges: &[CompetencyEdge],
    progress: &[StudentProgress],
) -> Result<Vec<GlobalNodeStat>, GraphError> {
    let levels = node_levels(nodes, edges)?;

    let mut stats = Vec::with_capacity(nodes.len());
    for node in nodes {
        let rows: Vec<&StudentProgress> = progress
            .iter()
            .filter(|row| row.competency_id == node.id)
            .collect();
        let students_probed = rows
            .iter()
            .map(|row| row.student_id.as_str())
            .collect::<HashSet<_>>()
            .len();
        let mastery_count = rows
            .iter()
            .filter(|row| row.status == ProgressStatus::Mastered)
            .count();
        let misconception_count = rows
            .iter()
            .filter(|row| {
                matches!(
                    row.status,
                    ProgressStatus::Infected | ProgressStatus::Misconception
                )
            })
            .count();

        let mut bug_counts: HashMap<&str, usize> = HashMap::new();
        for row in &rows {
            if let Some(misconception_id) = row.misconception_id.as_deref() {
                *bug_counts.entry(misconception_id).or_insert(0) += 1;
            }
        }
        let mut ranked: Vec<(&str, usize)> = bug_counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        let top_misconceptions = ranked
            .into_iter()
            .take(TOP_MISCONCEPTION_LIMIT)
            .map(|(id, _)| id.to_string())
            .collect();

        let friction_score = 1.5 * misconception_count as f32 / (mastery_count as f32 + 1.0);

        stats.push(GlobalNodeStat {
            node_id: node.id.clone(),
            title: node.title.clone(),
            level: levels.get(&node.id).copied().unwrap_or(1),
            students_probed,
            mastery_count,
            misconception_count,
            top_misconceptions,
            friction_score,
        });
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> CompetencyNode {
        CompetencyNode {
            id: id.to_string(),
            title: format!("Node {id}"),
            description: format!("About {id}"),
        }
    }

    fn edge(source: &str, target: &str) -> CompetencyEdge {
        CompetencyEdge {
            source_id: source.to_string(),
            target_id: target.to_string(),
        }
    }

    fn mastered(student: &str, competency: &str) -> StudentProgress {
        StudentProgress {
            student_id: student.to_string(),
            competency_id: competency.to_string(),
            status: ProgressStatus::Mastered,
            misconception_id: None,
            reason: None,
        }
    }

    fn infected(student: &str, competency: &str, bug: &str) -> StudentProgress {
        StudentProgress {
            student_id: student.to_string(),
            competency_id: competency.to_string(),
            status: ProgressStatus::Infected,
            misconception_id: Some(bug.to_string()),
            reason: Some(format!("Detected specific conceptual error: {bug}")),
        }
    }

    #[test]
    fn computes_longest_path_levels_for_a_chain() {
        let nodes = vec![node("a"), node("b"), node("c")];
        let edges = vec![edge("a", "b"), edge("b", "c")];
        let levels = node_levels(&nodes, &edges).unwrap();
        assert_eq!(levels["a"], 1);
        assert_eq!(levels["b"], 2);
        assert_eq!(levels["c"], 3);
    }

    #[test]
    fn level_follows_the_longest_path_not_the_shortest() {
        // a -> c and a -> b -> c: c sits at level 3.
        let nodes = vec![node("a"), node("b"), node("c")];
        let edges = vec![edge("a", "c"), edge("a", "b"), edge("b", "c")];
        let levels = node_levels(&nodes, &edges).unwrap();
        assert_eq!(levels["c"], 3);
    }

    #[test]
    fn reports_cycles_instead_of_spinning() {
        let nodes = vec![node("a"), node("b")];
        let edges = vec![edge("a", "b"), edge("b", "a")];
        assert_eq!(
            node_levels(&nodes, &edges),
            Err(GraphError::CycleDetected {
                nodes: vec!["a".to_string(), "b".to_string()]
            })
        );
    }

    #[test]
    fn rejects_edges_to_unknown_nodes() {
        let nodes = vec![node("a")];
        let edges = vec![edge("a", "ghost")];
        assert_eq!(
            topological_order(&nodes, &edges),
            Err(GraphError::UnknownNode("ghost".to_string()))
        );
    }

    #[test]
    fn node_with_single_mastered_parent_is_available() {
        let nodes = vec![node("a"), node("b")];
        let edges = vec![edge("a", "b")];
        let progress = vec![mastered("stu", "a")];
        let (views, _) = student_knowledge_map(&nodes, &edges, &progress).unwrap();
        let b = views.iter().find(|view| view.id == "b").unwrap();
        assert_eq!(b.status, NodeStatus::Available);
    }

    #[test]
    fn node_with_one_unfinished_parent_stays_locked() {
        let nodes = vec![node("a"), node("x"), node("b")];
        let edges = vec![edge("a", "b"), edge("x", "b")];
        let progress = vec![mastered("stu", "a")];
        let (views, _) = student_knowledge_map(&nodes, &edges, &progress).unwrap();
        let b = views.iter().find(|view| view.id == "b").unwrap();
        assert_eq!(b.status, NodeStatus::Locked);
        // Adjacent to completed work, so still fully labeled.
        assert_eq!(b.label, "Node b");
    }

    #[test]
    fn infection_wins_over_mastery_prerequisites() {
        let nodes = vec![node("a")];
        let progress = vec![infected("stu", "a", "bug-7")];
        let (views, _) = student_knowledge_map(&nodes, &[], &progress).unwrap();
        assert_eq!(views[0].status, NodeStatus::Infected);
        assert_eq!(
            views[0].infection_reason.as_deref(),
            Some("Detected specific conceptual error: bug-7")
        );
    }

    #[test]
    fn deep_locked_territory_is_masked() {
        // a mastered; b locked but adjacent (labeled); c two hops out (masked).
        let nodes = vec![node("a"), node("b"), node("c")];
        let edges = vec![edge("a", "b"), edge("b", "c")];
        let progress = vec![mastered("stu", "a")];
        let (views, _) = student_knowledge_map(&nodes, &edges, &progress).unwrap();

        let b = views.iter().find(|view| view.id == "b").unwrap();
        let c = views.iter().find(|view| view.id == "c").unwrap();
        // b's only parent is mastered, so b is available and labeled.
        assert_eq!(b.status, NodeStatus::Available);
        assert_eq!(b.label, "Node b");
        // c's direct parent is itself untouched: masked.
        assert_eq!(c.status, NodeStatus::Locked);
        assert_eq!(c.label, FOG_LABEL);
        assert!(c.description.is_empty());
    }

    #[test]
    fn locked_node_next_to_completed_parent_keeps_its_label() {
        let nodes = vec![node("a"), node("x"), node("b")];
        let edges = vec![edge("a", "b"), edge("x", "b")];
        let progress = vec![StudentProgress {
            status: ProgressStatus::Completed,
            ..mastered("stu", "a")
        }];
        let (views, _) = student_knowledge_map(&nodes, &edges, &progress).unwrap();
        let b = views.iter().find(|view| view.id == "b").unwrap();
        assert_eq!(b.status, NodeStatus::Locked);
        assert_eq!(b.label, "Node b");
    }

    #[test]
    fn roots_without_progress_are_available() {
        let nodes = vec![node("a")];
        let (views, _) = student_knowledge_map(&nodes, &[], &[]).unwrap();
        assert_eq!(views[0].status, NodeStatus::Available);
    }

    #[test]
    fn friction_score_flags_failure_heavy_nodes() {
        let nodes = vec![node("a")];
        let progress = vec![
            infected("s1", "a", "bug-1"),
            infected("s2", "a", "bug-1"),
            infected("s3", "a", "bug-2"),
            mastered("s4", "a"),
        ];
        let stats = global_node_stats(&nodes, &[], &progress).unwrap();
        let stat = &stats[0];
        assert_eq!(stat.students_probed, 4);
        assert_eq!(stat.mastery_count, 1);
        assert_eq!(stat.misconception_count, 3);
        assert_eq!(stat.top_misconceptions, vec!["bug-1", "bug-2"]);
        assert!((stat.friction_score - 1.5 * 3.0 / 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn friction_score_is_zero_without_observations() {
        let nodes = vec![node("a")];
        let stats = global_node_stats(&nodes, &[], &[]).unwrap();
        assert_eq!(stats[0].friction_score, 0.0);
        assert_eq!(stats[0].students_probed, 0);
    }
}
