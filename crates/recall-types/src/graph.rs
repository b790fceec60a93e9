//! Relationship graph types.

use crate::error::RecallError;
use crate::memory::{MemoryEntry, MemoryId, RelationshipId};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Types of directed relationships between memories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Memories are related.
    RelatesTo,
    /// Source is the parent of the target.
    ParentOf,
    /// Source is a child of the target.
    ChildOf,
    /// Source references the target.
    References,
    /// Source replaces the target.
    Supersedes,
    /// Source implements the target.
    Implements,
    /// Source is an example of the target.
    ExampleOf,
}

impl RelationshipType {
    pub const ALL: [RelationshipType; 7] = [
        RelationshipType::RelatesTo,
        RelationshipType::ParentOf,
        RelationshipType::ChildOf,
        RelationshipType::References,
        RelationshipType::Supersedes,
        RelationshipType::Implements,
        RelationshipType::ExampleOf,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::RelatesTo => "relates_to",
            RelationshipType::ParentOf => "parent_of",
            RelationshipType::ChildOf => "child_of",
            RelationshipType::References => "references",
            RelationshipType::Supersedes => "supersedes",
            RelationshipType::Implements => "implements",
            RelationshipType::ExampleOf => "example_of",
        }
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationshipType {
    type Err = RecallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|rt| rt.as_str() == s)
            .ok_or_else(|| RecallError::Validation(format!("unknown relationship type '{s}'")))
    }
}

/// A directed edge between two memories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRelationship {
    pub id: RelationshipId,
    pub from_memory_id: MemoryId,
    pub to_memory_id: MemoryId,
    pub relationship_type: RelationshipType,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
}

impl MemoryRelationship {
    /// The endpoint opposite `id`, or `None` if `id` is not an endpoint.
    pub fn other_end(&self, id: MemoryId) -> Option<MemoryId> {
        if self.from_memory_id == id {
            Some(self.to_memory_id)
        } else if self.to_memory_id == id {
            Some(self.from_memory_id)
        } else {
            None
        }
    }
}

/// Which adjacency sets a traversal follows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Outgoing edges only.
    #[default]
    Out,
    /// Incoming edges only.
    In,
    /// Both directions.
    Both,
}

impl Direction {
    pub fn follows_out(&self) -> bool {
        matches!(self, Direction::Out | Direction::Both)
    }

    pub fn follows_in(&self) -> bool {
        matches!(self, Direction::In | Direction::Both)
    }
}

/// Options for a related-memories traversal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraversalOptions {
    /// Maximum number of hops from the root.
    pub depth: u32,
    /// Which edges to follow.
    #[serde(default)]
    pub direction: Direction,
    /// Only follow these relationship types. Empty means all.
    #[serde(default)]
    pub relationship_types: Vec<RelationshipType>,
}

impl Default for TraversalOptions {
    fn default() -> Self {
        Self {
            depth: 1,
            direction: Direction::Out,
            relationship_types: Vec::new(),
        }
    }
}

/// A memory reached by a traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedMemory {
    pub memory: MemoryEntry,
    /// The edge that led to this memory.
    pub relationship: MemoryRelationship,
    /// Hops from the root, starting at 1.
    pub depth: u32,
}

/// A bounded neighbourhood of a root memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryGraph {
    pub root_memory_id: MemoryId,
    /// Number of reached memories, excluding the root.
    pub total_nodes: usize,
    /// Deepest hop actually reached.
    pub max_depth_reached: u32,
    pub nodes: Vec<RelatedMemory>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relationship_type_parse() {
        for rt in RelationshipType::ALL {
            assert_eq!(rt.as_str().parse::<RelationshipType>().unwrap(), rt);
        }
        assert!("RELATES_TO".parse::<RelationshipType>().is_err());
    }

    #[test]
    fn test_other_end() {
        let a = MemoryId::new();
        let b = MemoryId::new();
        let rel = MemoryRelationship {
            id: RelationshipId::new(),
            from_memory_id: a,
            to_memory_id: b,
            relationship_type: RelationshipType::RelatesTo,
            created_at: 0,
        };
        assert_eq!(rel.other_end(a), Some(b));
        assert_eq!(rel.other_end(b), Some(a));
        assert_eq!(rel.other_end(MemoryId::new()), None);
    }

    #[test]
    fn test_direction_flags() {
        assert!(Direction::Both.follows_in() && Direction::Both.follows_out());
        assert!(!Direction::Out.follows_in());
        assert!(!Direction::In.follows_out());
    }
}
