//! The typed property-graph data model: nodes, edges, their metadata and
//! embeddings, aliases, sources, source-links, and per-user profiles.
//!
//! Every row is scoped by [`UserId`]. Rows that need their own address for
//! WAL/snapshot storage carry a [`TypeId`], even where the essential
//! attributes in the data model only name a foreign key (e.g.
//! `NodeMetadata` is keyed by `node_id` but still gets an `nmeta_` id of
//! its own for the repository to address it by).

use crate::typeid::TypeId;
use chrono::NaiveDate;

pub type NodeId = TypeId;
pub type EdgeId = TypeId;

pub const EMBEDDING_DIMS: usize = 1024;
pub const ATLAS_LABEL: &str = "Atlas";

/// External user identifier. Not a [`TypeId`] — users are named by
/// whatever id the calling system already uses for them.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    serde::Serialize,
    serde::Deserialize,
)]
#[archive(check_bytes)]
#[archive_attr(derive(PartialEq, Eq, Hash, Debug))]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for UserId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

macro_rules! wire_enum {
    ($name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Hash,
            rkyv::Archive, rkyv::Serialize, rkyv::Deserialize,
            serde::Serialize, serde::Deserialize,
        )]
        #[archive(check_bytes)]
        #[archive_attr(derive(PartialEq, Eq, Hash, Debug))]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_wire(&self) -> &'static str {
                match self {
                    $(Self::$variant => $wire),+
                }
            }

            pub fn from_wire(s: &str) -> Option<Self> {
                match s {
                    $($wire => Some(Self::$variant)),+,
                    _ => None,
                }
            }

            pub const ALL: &'static [$name] = &[$(Self::$variant),+];
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_wire())
            }
        }
    };
}

wire_enum!(NodeType {
    Person => "Person",
    Location => "Location",
    Event => "Event",
    Object => "Object",
    Emotion => "Emotion",
    Concept => "Concept",
    Media => "Media",
    Temporal => "Temporal",
    Conversation => "Conversation",
    Atlas => "Atlas",
    AssistantDream => "AssistantDream",
    Document => "Document",
});

wire_enum!(EdgeType {
    ParticipatedIn => "PARTICIPATED_IN",
    OccurredAt => "OCCURRED_AT",
    OccurredOn => "OCCURRED_ON",
    InvolvedItem => "INVOLVED_ITEM",
    ExhibitedEmotion => "EXHIBITED_EMOTION",
    TaggedWith => "TAGGED_WITH",
    OwnedBy => "OWNED_BY",
    MentionedIn => "MENTIONED_IN",
    Precedes => "PRECEDES",
    Follows => "FOLLOWS",
    RelatedTo => "RELATED_TO",
    CapturedIn => "CAPTURED_IN",
});

wire_enum!(SourceType {
    Conversation => "conversation",
    ConversationMessage => "conversation_message",
    Document => "document",
});

// `Processing` sits between `pending` and `completed` so extraction can
// claim a source before summarization looks at it.
wire_enum!(SourceStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Summarized => "summarized",
});

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct Node {
    pub id: NodeId,
    pub user_id: UserId,
    pub node_type: NodeType,
    pub created_at: i64,
}

impl Node {
    pub fn new(user_id: UserId, node_type: NodeType, created_at: i64) -> Self {
        Self {
            id: TypeId::node(),
            user_id,
            node_type,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct NodeMetadata {
    pub id: TypeId,
    pub node_id: NodeId,
    pub label: Option<String>,
    pub description: Option<String>,
    pub additional_data: Option<String>,
}

impl NodeMetadata {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            id: TypeId::node_metadata(),
            node_id,
            label: None,
            description: None,
            additional_data: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct Edge {
    pub id: EdgeId,
    pub user_id: UserId,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    pub edge_type: EdgeType,
    pub description: Option<String>,
    pub metadata: Option<String>,
    pub created_at: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EdgeValidationError {
    #[error("self-edges are forbidden: {0}")]
    SelfEdge(String),
}

impl Edge {
    pub fn new(
        user_id: UserId,
        source_node_id: NodeId,
        target_node_id: NodeId,
        edge_type: EdgeType,
        created_at: i64,
    ) -> Result<Self, EdgeValidationError> {
        if source_node_id == target_node_id {
            return Err(EdgeValidationError::SelfEdge(source_node_id.to_string()));
        }
        Ok(Self {
            id: TypeId::edge(),
            user_id,
            source_node_id,
            target_node_id,
            edge_type,
            description: None,
            metadata: None,
            created_at,
        })
    }

    /// The `(src, tgt, type)` triple the unique constraint is keyed on.
    pub fn conflict_key(&self) -> (NodeId, NodeId, EdgeType) {
        (
            self.source_node_id.clone(),
            self.target_node_id.clone(),
            self.edge_type,
        )
    }
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct NodeEmbedding {
    pub id: TypeId,
    pub node_id: NodeId,
    pub vector: Vec<f32>,
    pub model_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EmbeddingValidationError {
    #[error("embedding vector must have exactly {expected} dimensions, got {actual}")]
    WrongDimensions { expected: usize, actual: usize },
    #[error("embedding vector contains a non-finite value at index {0}")]
    NonFinite(usize),
}

fn validate_vector(vector: &[f32]) -> Result<(), EmbeddingValidationError> {
    if vector.len() != EMBEDDING_DIMS {
        return Err(EmbeddingValidationError::WrongDimensions {
            expected: EMBEDDING_DIMS,
            actual: vector.len(),
        });
    }
    for (i, v) in vector.iter().enumerate() {
        if !v.is_finite() {
            return Err(EmbeddingValidationError::NonFinite(i));
        }
    }
    Ok(())
}

impl NodeEmbedding {
    pub fn new(
        node_id: NodeId,
        vector: Vec<f32>,
        model_name: impl Into<String>,
    ) -> Result<Self, EmbeddingValidationError> {
        validate_vector(&vector)?;
        Ok(Self {
            id: TypeId::node_embedding(),
            node_id,
            vector,
            model_name: model_name.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct EdgeEmbedding {
    pub id: TypeId,
    pub edge_id: EdgeId,
    pub vector: Vec<f32>,
    pub model_name: String,
}

impl EdgeEmbedding {
    pub fn new(
        edge_id: EdgeId,
        vector: Vec<f32>,
        model_name: impl Into<String>,
    ) -> Result<Self, EmbeddingValidationError> {
        validate_vector(&vector)?;
        Ok(Self {
            id: TypeId::edge_embedding(),
            edge_id,
            vector,
            model_name: model_name.into(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct Alias {
    pub id: TypeId,
    pub user_id: UserId,
    pub text: String,
    pub canonical_node_id: NodeId,
}

impl Alias {
    pub fn new(user_id: UserId, text: impl Into<String>, canonical_node_id: NodeId) -> Self {
        Self {
            id: TypeId::alias(),
            user_id,
            text: text.into(),
            canonical_node_id,
        }
    }

    pub fn conflict_key(&self) -> (UserId, String, NodeId) {
        (
            self.user_id.clone(),
            self.text.clone(),
            self.canonical_node_id.clone(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct Source {
    pub id: TypeId,
    pub user_id: UserId,
    pub source_type: SourceType,
    pub external_id: String,
    pub parent_source: Option<TypeId>,
    pub last_ingested_at: i64,
    pub status: SourceStatus,
    pub metadata: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SourceValidationError {
    #[error("conversation_message sources must have a parent source of type conversation")]
    MissingConversationParent,
}

impl Source {
    pub fn new(
        user_id: UserId,
        source_type: SourceType,
        external_id: impl Into<String>,
        parent_source: Option<TypeId>,
        last_ingested_at: i64,
    ) -> Result<Self, SourceValidationError> {
        if matches!(source_type, SourceType::ConversationMessage) && parent_source.is_none() {
            return Err(SourceValidationError::MissingConversationParent);
        }
        Ok(Self {
            id: TypeId::source(),
            user_id,
            source_type,
            external_id: external_id.into(),
            parent_source,
            last_ingested_at,
            status: SourceStatus::Pending,
            metadata: None,
            content_type: None,
            content_length: None,
        })
    }

    pub fn conflict_key(&self) -> (UserId, SourceType, String) {
        (self.user_id.clone(), self.source_type, self.external_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct SourceLink {
    pub id: TypeId,
    pub source_id: TypeId,
    pub node_id: NodeId,
    pub specific_location: Option<String>,
}

impl SourceLink {
    pub fn new(source_id: TypeId, node_id: NodeId) -> Self {
        Self {
            id: TypeId::source_link(),
            source_id,
            node_id,
            specific_location: None,
        }
    }

    pub fn conflict_key(&self) -> (TypeId, NodeId) {
        (self.source_id.clone(), self.node_id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
#[archive(check_bytes)]
pub struct UserProfile {
    pub id: TypeId,
    pub user_id: UserId,
    pub content: String,
    pub last_updated_at: i64,
}

impl UserProfile {
    pub fn new(user_id: UserId, content: impl Into<String>, last_updated_at: i64) -> Self {
        Self {
            id: TypeId::user_profile(),
            user_id,
            content: content.into(),
            last_updated_at,
        }
    }
}

/// The label a Temporal day node must carry: `YYYY-MM-DD`.
pub fn day_label(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn parse_day_label(label: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(label, "%Y-%m-%d").ok()
}
