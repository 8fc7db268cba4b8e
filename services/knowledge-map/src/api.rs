use graph::GlobalNodeStat;
use schema::{GraphEdgeView, GraphNodeView};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StudentMapResponse {
    pub success: bool,
    pub student_id: String,
    pub nodes: Vec<GraphNodeView>,
    pub edges: Vec<GraphEdgeView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalNodePayload {
    pub id: String,
    pub title: String,
    pub level: u32,
    pub students_probed: usize,
    pub mastery_count: usize,
    pub misconception_count: usize,
    pub top_misconceptions: Vec<String>,
    pub friction_score: f32,
}

impl From<GlobalNodeStat> for GlobalNodePayload {
    fn from(stat: GlobalNodeStat) -> Self {
        Self {
            id: stat.node_id,
            title: stat.title,
            level: stat.level,
            students_probed: stat.students_probed,
            mastery_count: stat.mastery_count,
            misconception_count: stat.misconception_count,
            top_misconceptions: stat.top_misconceptions,
            friction_score: stat.friction_score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalMapResponse {
    pub success: bool,
    pub nodes: Vec<GlobalNodePayload>,
    pub edges: Vec<GraphEdgeView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}
