//! Identifiers shared by the coordinator and workers.
//!
//! Textual forms are dot separated: a stage is `<query>.<fragment>` and a
//! task is `<query>.<fragment>.<partition>.<attempt>`.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId(String);

impl QueryId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh query id. Dashes are stripped so that the id never
    /// collides with the separators used by stage and task ids.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of a plan fragment. Stage ids reuse the fragment id of the fragment they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanFragmentId(pub u32);

impl fmt::Display for PlanFragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlanNodeId(String);

impl PlanNodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlanNodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageId {
    query_id: QueryId,
    id: u32,
}

impl StageId {
    pub fn new(query_id: QueryId, id: u32) -> Self {
        Self { query_id, id }
    }

    pub fn from_fragment(query_id: QueryId, fragment_id: PlanFragmentId) -> Self {
        Self::new(query_id, fragment_id.0)
    }

    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn fragment_id(&self) -> PlanFragmentId {
        PlanFragmentId(self.id)
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.query_id, self.id)
    }
}

impl FromStr for StageId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [query, id] => Ok(StageId::new(QueryId::new(*query), parse_component(id, s)?)),
            _ => Err(Error::InvalidArgument(format!("Invalid stage id: {}", s))),
        }
    }
}

/// A task is one partition of a stage; re-executions of the same partition
/// get increasing attempt ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    stage_id: StageId,
    partition_id: u32,
    attempt_id: u32,
}

impl TaskId {
    pub fn new(stage_id: StageId, partition_id: u32, attempt_id: u32) -> Self {
        Self {
            stage_id,
            partition_id,
            attempt_id,
        }
    }

    pub fn stage_id(&self) -> &StageId {
        &self.stage_id
    }

    pub fn query_id(&self) -> &QueryId {
        self.stage_id.query_id()
    }

    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    pub fn attempt_id(&self) -> u32 {
        self.attempt_id
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.stage_id, self.partition_id, self.attempt_id)
    }
}

impl FromStr for TaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [query, stage, partition, attempt] => Ok(TaskId::new(
                StageId::new(QueryId::new(*query), parse_component(stage, s)?),
                parse_component(partition, s)?,
                parse_component(attempt, s)?,
            )),
            _ => Err(Error::InvalidArgument(format!("Invalid task id: {}", s))),
        }
    }
}

fn parse_component(value: &str, full: &str) -> Result<u32, Error> {
    value
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("Invalid id component '{}' in {}", value, full)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_display_and_parse() {
        let task_id = TaskId::new(StageId::new(QueryId::new("q1"), 3), 7, 2);
        assert_eq!(task_id.to_string(), "q1.3.7.2");
        let parsed: TaskId = "q1.3.7.2".parse().unwrap();
        assert_eq!(parsed, task_id);
        assert_eq!(parsed.stage_id().fragment_id(), PlanFragmentId(3));
    }

    #[test]
    fn test_invalid_ids_are_rejected() {
        assert!("q1.3".parse::<TaskId>().is_err());
        assert!("q1.x".parse::<StageId>().is_err());
        assert!("q1".parse::<StageId>().is_err());
    }

    #[test]
    fn test_random_query_id_has_no_separators() {
        let id = QueryId::random();
        assert!(!id.as_str().contains('.'));
        assert!(!id.as_str().contains('-'));
        assert_ne!(id, QueryId::random());
    }
}
