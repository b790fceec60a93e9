//! Memory entity types: identifiers, context types, entries and patches.

use crate::error::{RecallError, RecallResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use uuid::Uuid;

/// Lowest accepted importance.
pub const MIN_IMPORTANCE: u8 = 1;
/// Highest accepted importance.
pub const MAX_IMPORTANCE: u8 = 10;
/// Importance given to memories created without an explicit value.
pub const DEFAULT_IMPORTANCE: u8 = 5;

/// Declares a UUIDv7-backed identifier. v7 ids sort lexically in creation order.
macro_rules! sortable_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new time-ordered id.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = RecallError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| {
                    RecallError::Validation(format!(
                        "invalid {} '{s}': {e}",
                        stringify!($name)
                    ))
                })
            }
        }
    };
}

sortable_id!(
    /// Unique identifier for a memory entry.
    MemoryId
);
sortable_id!(
    /// Unique identifier for a relationship edge.
    RelationshipId
);
sortable_id!(
    /// Unique identifier for a workflow.
    WorkflowId
);

/// What kind of fact a memory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Directive,
    Information,
    Heading,
    Decision,
    CodePattern,
    Requirement,
    Error,
    Todo,
    Insight,
    Preference,
}

impl ContextType {
    /// All context types, in declaration order.
    pub const ALL: [ContextType; 10] = [
        ContextType::Directive,
        ContextType::Information,
        ContextType::Heading,
        ContextType::Decision,
        ContextType::CodePattern,
        ContextType::Requirement,
        ContextType::Error,
        ContextType::Todo,
        ContextType::Insight,
        ContextType::Preference,
    ];

    /// The stable string form used in storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Directive => "directive",
            ContextType::Information => "information",
            ContextType::Heading => "heading",
            ContextType::Decision => "decision",
            ContextType::CodePattern => "code_pattern",
            ContextType::Requirement => "requirement",
            ContextType::Error => "error",
            ContextType::Todo => "todo",
            ContextType::Insight => "insight",
            ContextType::Preference => "preference",
        }
    }
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextType {
    type Err = RecallError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|ct| ct.as_str() == s)
            .ok_or_else(|| RecallError::Validation(format!("unknown context type '{s}'")))
    }
}

/// A single stored memory fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Unique ID.
    pub id: MemoryId,
    /// The textual content.
    pub content: String,
    /// What kind of fact this is.
    pub context_type: ContextType,
    /// Importance from 1 (trivia) to 10 (critical).
    pub importance: u8,
    /// Free-form tags.
    pub tags: BTreeSet<String>,
    /// Embedding vector, if one was attached at ingestion.
    pub embedding: Option<Vec<f32>>,
    /// Whether the memory lives in the global scope instead of a workspace.
    pub is_global: bool,
    /// Owning workspace (the creating workspace for global memories).
    pub workspace_id: String,
    /// Creation time, epoch milliseconds.
    pub created_at: i64,
    /// Last update time, epoch milliseconds.
    pub updated_at: i64,
}

/// Input for creating a memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMemory {
    pub content: String,
    pub context_type: ContextType,
    #[serde(default = "default_importance")]
    pub importance: u8,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub is_global: bool,
    #[serde(default)]
    pub category: Option<String>,
}

fn default_importance() -> u8 {
    DEFAULT_IMPORTANCE
}

impl NewMemory {
    /// A workspace-scoped memory with default importance and no tags.
    pub fn new(content: impl Into<String>, context_type: ContextType) -> Self {
        Self {
            content: content.into(),
            context_type,
            importance: DEFAULT_IMPORTANCE,
            tags: BTreeSet::new(),
            embedding: None,
            is_global: false,
            category: None,
        }
    }

    pub fn importance(mut self, importance: u8) -> Self {
        self.importance = importance;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn global(mut self) -> Self {
        self.is_global = true;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Check content and importance before anything is written.
    pub fn validate(&self) -> RecallResult<()> {
        if self.content.trim().is_empty() {
            return Err(RecallError::Validation(
                "memory content must not be empty".to_string(),
            ));
        }
        validate_importance(self.importance)?;
        validate_tags(&self.tags)
    }
}

/// A partial update of a memory. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUpdate {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub context_type: Option<ContextType>,
    #[serde(default)]
    pub importance: Option<u8>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
}

impl MemoryUpdate {
    pub fn validate(&self) -> RecallResult<()> {
        if let Some(ref content) = self.content {
            if content.trim().is_empty() {
                return Err(RecallError::Validation(
                    "memory content must not be empty".to_string(),
                ));
            }
        }
        if let Some(importance) = self.importance {
            validate_importance(importance)?;
        }
        if let Some(ref tags) = self.tags {
            validate_tags(tags)?;
        }
        Ok(())
    }
}

/// Reject importance values outside 1..=10.
pub fn validate_importance(importance: u8) -> RecallResult<()> {
    if (MIN_IMPORTANCE..=MAX_IMPORTANCE).contains(&importance) {
        Ok(())
    } else {
        Err(RecallError::Validation(format!(
            "importance must be between {MIN_IMPORTANCE} and {MAX_IMPORTANCE}, got {importance}"
        )))
    }
}

// Tags become key segments, so they may not be empty or contain the separator.
fn validate_tags(tags: &BTreeSet<String>) -> RecallResult<()> {
    for tag in tags {
        if tag.is_empty() || tag.contains(':') {
            return Err(RecallError::Validation(format!("invalid tag '{tag}'")));
        }
    }
    Ok(())
}
