//! The Graph Repository: durable storage for the typed property graph,
//! backed by a write-ahead log, periodic snapshots, and an in-memory
//! `LinearAnnIndex` + `AdjacencyGraph` pair the retrieval engine reads
//! against.

use crate::crypto::{AtRestCipher, NoOpCipher};
use crate::index::LinearAnnIndex;
use crate::snapshot::{SnapshotError, SnapshotManager};
use crate::wal::{Wal, WalError};
use epigraph_core::model::{
    Alias, Edge, EdgeId, EdgeType, Node, NodeEmbedding, NodeId, NodeMetadata, NodeType, Source,
    SourceLink, SourceType, UserId, UserProfile,
};
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("serialization error")]
    Serialization,
    #[error("deserialization error")]
    Deserialization,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid snapshot id: {0}")]
    InvalidSnapshotId(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("snapshot manager is not configured")]
    SnapshotNotConfigured,
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("edge validation error: {0}")]
    EdgeValidation(#[from] epigraph_core::model::EdgeValidationError),
    #[error("source validation error: {0}")]
    SourceValidation(#[from] epigraph_core::model::SourceValidationError),
}

impl epigraph_core::error::MemoryError for RepoError {
    fn error_code(&self) -> epigraph_core::error::ErrorCode {
        use epigraph_core::error::ErrorCode;
        match self {
            RepoError::NotFound(_) => ErrorCode::NotFound,
            RepoError::EdgeValidation(_) | RepoError::SourceValidation(_) => {
                ErrorCode::InvalidArgument
            }
            _ => ErrorCode::Internal,
        }
    }
}

/// One atomic mutation against the graph. A WAL entry is a batch of these,
/// applied in order, so that multi-table sequences (ensure + metadata +
/// embedding; cleanup apply) survive as a single durable unit.
#[derive(Archive, Deserialize, Serialize, Debug, Clone)]
#[archive(check_bytes)]
pub enum WalOp {
    PutUser(UserId),
    PutNode(Node),
    PutNodeMetadata(NodeMetadata),
    DeleteNode(NodeId),
    PutEdge(Edge),
    DeleteEdge(EdgeId),
    PutNodeEmbedding(NodeEmbedding),
    PutEdgeEmbedding(epigraph_core::model::EdgeEmbedding),
    PutAlias(Alias),
    PutSource(Source),
    PutSourceLink(SourceLink),
    DeleteSourceLink(epigraph_core::typeid::TypeId),
    PutUserProfile(UserProfile),
}

type WalEntry = Vec<WalOp>;

#[derive(Archive, Deserialize, Serialize, Debug, Clone, Default)]
#[archive(check_bytes)]
struct RepositoryBackupSnapshot {
    lsn: u64,
    users: Vec<UserId>,
    nodes: Vec<Node>,
    node_metadata: Vec<NodeMetadata>,
    edges: Vec<Edge>,
    node_embeddings: Vec<NodeEmbedding>,
    edge_embeddings: Vec<epigraph_core::model::EdgeEmbedding>,
    aliases: Vec<Alias>,
    sources: Vec<Source>,
    source_links: Vec<SourceLink>,
    user_profiles: Vec<UserProfile>,
}

/// All in-memory state materialized from the WAL/snapshot. Indices are kept
/// alongside the canonical rows so lookups (singleton ensure, conflict-key
/// checks, cascades) don't require a full scan.
#[derive(Default)]
struct GraphState {
    users: HashSet<UserId>,
    nodes: HashMap<NodeId, Node>,
    node_metadata: HashMap<NodeId, NodeMetadata>,
    edges: HashMap<EdgeId, Edge>,
    edge_conflicts: HashSet<(NodeId, NodeId, EdgeType)>,
    // Newest embedding per (node, model) wins; retrieval queries the latest.
    node_embeddings: HashMap<NodeId, Vec<NodeEmbedding>>,
    edge_embeddings: HashMap<EdgeId, Vec<epigraph_core::model::EdgeEmbedding>>,
    aliases: Vec<Alias>,
    alias_conflicts: HashSet<(UserId, String, NodeId)>,
    sources: HashMap<epigraph_core::typeid::TypeId, Source>,
    source_conflicts: HashMap<(UserId, SourceType, String), epigraph_core::typeid::TypeId>,
    source_links: HashMap<epigraph_core::typeid::TypeId, SourceLink>,
    source_links_by_source: HashMap<epigraph_core::typeid::TypeId, Vec<epigraph_core::typeid::TypeId>>,
    source_links_by_node: HashMap<NodeId, Vec<epigraph_core::typeid::TypeId>>,
    link_conflicts: HashSet<(epigraph_core::typeid::TypeId, NodeId)>,
    user_profiles: HashMap<UserId, UserProfile>,
    node_vectors: LinearAnnIndex,
    edge_vectors: LinearAnnIndex,
    graph: crate::index::AdjacencyGraph,
}

impl GraphState {
    fn apply(&mut self, op: &WalOp) {
        match op {
            WalOp::PutUser(user) => {
                self.users.insert(user.clone());
            }
            WalOp::PutNode(node) => {
                self.nodes.insert(node.id.clone(), node.clone());
            }
            WalOp::PutNodeMetadata(meta) => {
                self.node_metadata.insert(meta.node_id.clone(), meta.clone());
            }
            WalOp::DeleteNode(id) => {
                self.nodes.remove(id);
                self.node_metadata.remove(id);
                self.node_embeddings.remove(id);
                self.node_vectors.delete(id);
                self.graph.remove_node(id);
                let removed: Vec<EdgeId> = self
                    .edges
                    .values()
                    .filter(|e| &e.source_node_id == id || &e.target_node_id == id)
                    .map(|e| e.id.clone())
                    .collect();
                for edge_id in removed {
                    self.remove_edge(&edge_id);
                }
                let link_ids = self.source_links_by_node.remove(id).unwrap_or_default();
                for link_id in link_ids {
                    self.remove_source_link(&link_id);
                }
            }
            WalOp::PutEdge(edge) => {
                self.edge_conflicts.insert(edge.conflict_key());
                self.graph.add_edge(
                    edge.source_node_id.clone(),
                    edge.target_node_id.clone(),
                    edge.edge_type,
                    1.0,
                );
                self.edges.insert(edge.id.clone(), edge.clone());
            }
            WalOp::DeleteEdge(id) => {
                self.remove_edge(id);
            }
            WalOp::PutNodeEmbedding(embedding) => {
                self.node_vectors
                    .insert(embedding.node_id.clone(), embedding.vector.clone());
                self.node_embeddings
                    .entry(embedding.node_id.clone())
                    .or_default()
                    .push(embedding.clone());
            }
            WalOp::PutEdgeEmbedding(embedding) => {
                self.edge_vectors
                    .insert(embedding.edge_id.clone(), embedding.vector.clone());
                self.edge_embeddings
                    .entry(embedding.edge_id.clone())
                    .or_default()
                    .push(embedding.clone());
            }
            WalOp::PutAlias(alias) => {
                self.alias_conflicts.insert(alias.conflict_key());
                self.aliases.push(alias.clone());
            }
            WalOp::PutSource(source) => {
                self.source_conflicts
                    .insert(source.conflict_key(), source.id.clone());
                self.sources.insert(source.id.clone(), source.clone());
            }
            WalOp::PutSourceLink(link) => {
                self.link_conflicts.insert(link.conflict_key());
                self.source_links_by_source
                    .entry(link.source_id.clone())
                    .or_default()
                    .push(link.id.clone());
                self.source_links_by_node
                    .entry(link.node_id.clone())
                    .or_default()
                    .push(link.id.clone());
                self.source_links.insert(link.id.clone(), link.clone());
            }
            WalOp::DeleteSourceLink(id) => {
                self.remove_source_link(id);
            }
            WalOp::PutUserProfile(profile) => {
                self.user_profiles.insert(profile.user_id.clone(), profile.clone());
            }
        }
    }

    fn remove_edge(&mut self, id: &EdgeId) {
        if let Some(edge) = self.edges.remove(id) {
            self.edge_conflicts.remove(&edge.conflict_key());
            self.graph.remove_edge(&edge.source_node_id, &edge.target_node_id);
        }
        self.edge_embeddings.remove(id);
        self.edge_vectors.delete(id);
    }

    fn remove_source_link(&mut self, id: &epigraph_core::typeid::TypeId) {
        if let Some(link) = self.source_links.remove(id) {
            self.link_conflicts.remove(&link.conflict_key());
            if let Some(v) = self.source_links_by_source.get_mut(&link.source_id) {
                v.retain(|x| x != id);
            }
            if let Some(v) = self.source_links_by_node.get_mut(&link.node_id) {
                v.retain(|x| x != id);
            }
        }
    }

    fn singleton_by_label(
        &self,
        user: &UserId,
        node_type: NodeType,
        label: &str,
    ) -> Option<NodeId> {
        self.nodes
            .values()
            .filter(|n| &n.user_id == user && n.node_type == node_type)
            .find_map(|n| {
                self.node_metadata
                    .get(&n.id)
                    .and_then(|m| m.label.as_deref())
                    .filter(|l| *l == label)
                    .map(|_| n.id.clone())
            })
    }

    fn to_backup(&self, lsn: u64) -> RepositoryBackupSnapshot {
        RepositoryBackupSnapshot {
            lsn,
            users: self.users.iter().cloned().collect(),
            nodes: self.nodes.values().cloned().collect(),
            node_metadata: self.node_metadata.values().cloned().collect(),
            edges: self.edges.values().cloned().collect(),
            node_embeddings: self.node_embeddings.values().flatten().cloned().collect(),
            edge_embeddings: self.edge_embeddings.values().flatten().cloned().collect(),
            aliases: self.aliases.clone(),
            sources: self.sources.values().cloned().collect(),
            source_links: self.source_links.values().cloned().collect(),
            user_profiles: self.user_profiles.values().cloned().collect(),
        }
    }

    fn from_backup(backup: RepositoryBackupSnapshot) -> Self {
        let mut state = GraphState::default();
        for user in backup.users {
            state.apply(&WalOp::PutUser(user));
        }
        for node in backup.nodes {
            state.apply(&WalOp::PutNode(node));
        }
        for meta in backup.node_metadata {
            state.apply(&WalOp::PutNodeMetadata(meta));
        }
        for edge in backup.edges {
            state.apply(&WalOp::PutEdge(edge));
        }
        for embedding in backup.node_embeddings {
            state.apply(&WalOp::PutNodeEmbedding(embedding));
        }
        for embedding in backup.edge_embeddings {
            state.apply(&WalOp::PutEdgeEmbedding(embedding));
        }
        for alias in backup.aliases {
            state.apply(&WalOp::PutAlias(alias));
        }
        for source in backup.sources {
            state.apply(&WalOp::PutSource(source));
        }
        for link in backup.source_links {
            state.apply(&WalOp::PutSourceLink(link));
        }
        for profile in backup.user_profiles {
            state.apply(&WalOp::PutUserProfile(profile));
        }
        state
    }
}

/// A one-hop neighbor of a seed node, as returned by [`Repository::one_hop`].
#[derive(Debug, Clone)]
pub struct OneHopNeighbor {
    pub node_id: NodeId,
    pub edge_type: EdgeType,
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
}

pub struct Repository {
    wal: Arc<Mutex<Wal>>,
    tx_lock: Arc<Mutex<()>>,
    snapshot_manager: Option<SnapshotManager>,
    state: Arc<RwLock<GraphState>>,
}

impl Repository {
    pub fn new(wal: Arc<Mutex<Wal>>) -> Self {
        Self {
            wal,
            tx_lock: Arc::new(Mutex::new(())),
            snapshot_manager: None,
            state: Arc::new(RwLock::new(GraphState::default())),
        }
    }

    pub async fn open(wal_path: impl AsRef<Path>) -> Result<Self, RepoError> {
        Self::open_with_cipher(wal_path, Arc::new(NoOpCipher)).await
    }

    pub async fn open_with_cipher(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
    ) -> Result<Self, RepoError> {
        Self::open_internal(wal_path.as_ref().to_path_buf(), cipher, None).await
    }

    pub async fn open_with_snapshots(
        wal_path: impl AsRef<Path>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        Self::open_with_cipher_and_snapshots(wal_path, Arc::new(NoOpCipher), snapshot_dir).await
    }

    pub async fn open_with_cipher_and_snapshots(
        wal_path: impl AsRef<Path>,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_dir: impl AsRef<Path>,
    ) -> Result<Self, RepoError> {
        let snapshot_manager = SnapshotManager::new(snapshot_dir.as_ref());
        Self::open_internal(wal_path.as_ref().to_path_buf(), cipher, Some(snapshot_manager)).await
    }

    async fn open_internal(
        wal_path: PathBuf,
        cipher: Arc<dyn AtRestCipher>,
        snapshot_manager: Option<SnapshotManager>,
    ) -> Result<Self, RepoError> {
        let (mut state, base_lsn) = load_state_from_backup(snapshot_manager.as_ref()).await?;

        let wal_instance = Wal::open_with_cipher(&wal_path, cipher).await?;
        let wal = Arc::new(Mutex::new(wal_instance));

        {
            let mut wal_lock = wal.lock().await;
            wal_lock
                .replay(|lsn, data| {
                    if lsn <= base_lsn {
                        return Ok(());
                    }
                    let archived = rkyv::check_archived_root::<WalEntry>(&data[..])
                        .map_err(|_| WalError::CorruptEntry)?;
                    let entry: WalEntry = archived
                        .deserialize(&mut rkyv::Infallible)
                        .map_err(|_| WalError::CorruptEntry)?;
                    for op in &entry {
                        state.apply(op);
                    }
                    Ok(())
                })
                .await?;
        }

        Ok(Self {
            wal,
            tx_lock: Arc::new(Mutex::new(())),
            snapshot_manager,
            state: Arc::new(RwLock::new(state)),
        })
    }

    /// Append and apply one transaction. Holds `tx_lock` for the duration
    /// so readers never observe a partially-applied batch, and so
    /// concurrent writers serialize around the same WAL offset.
    async fn commit(&self, ops: Vec<WalOp>) -> Result<(), RepoError> {
        if ops.is_empty() {
            return Ok(());
        }
        let _tx_guard = self.tx_lock.lock().await;
        let bytes = serialize_wal_entry(&ops)?;
        {
            let mut wal = self.wal.lock().await;
            wal.append(&bytes).await?;
            wal.flush().await?;
        }
        let mut state = self.state.write().await;
        for op in &ops {
            state.apply(op);
        }
        Ok(())
    }

    // ---- EnsureUser ----

    pub async fn ensure_user(&self, user: &UserId) -> Result<(), RepoError> {
        {
            let state = self.state.read().await;
            if state.users.contains(user) {
                return Ok(());
            }
        }
        let _tx_guard = self.tx_lock.lock().await;
        {
            let state = self.state.read().await;
            if state.users.contains(user) {
                return Ok(());
            }
        }
        drop(_tx_guard);
        self.commit(vec![WalOp::PutUser(user.clone())]).await
    }

    // ---- EnsureAtlasNode ----

    pub async fn ensure_atlas_node(&self, user: &UserId, label: &str) -> Result<NodeId, RepoError> {
        self.ensure_singleton(user, NodeType::Atlas, label).await
    }

    /// Ensures the assistant persona (a `Person` node) and its own
    /// assistant-scoped Atlas node both exist, plus the `OWNED_BY` edge
    /// from the assistant-Atlas to the persona node.
    pub async fn ensure_assistant_entity_and_atlas_node(
        &self,
        user: &UserId,
        assistant_id: &str,
        now: i64,
    ) -> Result<(NodeId, NodeId), RepoError> {
        let person_id = self.ensure_singleton(user, NodeType::Person, assistant_id).await?;
        let atlas_id = self.ensure_singleton(user, NodeType::Atlas, assistant_id).await?;

        let already_owned = {
            let state = self.state.read().await;
            state
                .edge_conflicts
                .contains(&(atlas_id.clone(), person_id.clone(), EdgeType::OwnedBy))
        };
        if !already_owned {
            if let Ok(edge) = Edge::new(
                user.clone(),
                atlas_id.clone(),
                person_id.clone(),
                EdgeType::OwnedBy,
                now,
            ) {
                self.commit(vec![WalOp::PutEdge(edge)]).await?;
            }
        }

        Ok((person_id, atlas_id))
    }

    // ---- EnsureDayNode ----

    pub async fn ensure_day_node(
        &self,
        user: &UserId,
        date: chrono::NaiveDate,
        now: i64,
    ) -> Result<NodeId, RepoError> {
        let label = epigraph_core::model::day_label(date);
        self.ensure_singleton_with_created_at(user, NodeType::Temporal, &label, now)
            .await
    }

    async fn ensure_singleton(
        &self,
        user: &UserId,
        node_type: NodeType,
        label: &str,
    ) -> Result<NodeId, RepoError> {
        self.ensure_singleton_with_created_at(user, node_type, label, 0)
            .await
    }

    /// Idempotent lookup-or-create for singleton nodes (Atlas, assistant
    /// persona, day nodes): looked up by `(user, nodeType, label)`; on a
    /// race the second caller rereads and gets the first writer's id.
    async fn ensure_singleton_with_created_at(
        &self,
        user: &UserId,
        node_type: NodeType,
        label: &str,
        created_at: i64,
    ) -> Result<NodeId, RepoError> {
        {
            let state = self.state.read().await;
            if let Some(id) = state.singleton_by_label(user, node_type, label) {
                return Ok(id);
            }
        }
        let _tx_guard = self.tx_lock.lock().await;
        // Reread under the lock: another writer may have just inserted it.
        {
            let state = self.state.read().await;
            if let Some(id) = state.singleton_by_label(user, node_type, label) {
                return Ok(id);
            }
        }
        let node = Node::new(user.clone(), node_type, created_at);
        let metadata = NodeMetadata::new(node.id.clone()).with_label(label.to_string());
        let node_id = node.id.clone();
        drop(_tx_guard);
        self.commit(vec![WalOp::PutNode(node), WalOp::PutNodeMetadata(metadata)])
            .await?;
        Ok(node_id)
    }

    pub async fn find_singleton_by_label(
        &self,
        user: &UserId,
        node_type: NodeType,
        label: &str,
    ) -> Option<NodeId> {
        self.state.read().await.singleton_by_label(user, node_type, label)
    }

    pub async fn find_day_node(&self, user: &UserId, date: chrono::NaiveDate) -> Option<NodeId> {
        let label = epigraph_core::model::day_label(date);
        self.find_singleton_by_label(user, NodeType::Temporal, &label).await
    }

    // ---- UpsertSource / InsertSources ----

    pub async fn upsert_source(&self, mut source: Source) -> Result<Source, RepoError> {
        let key = source.conflict_key();
        let existing_id = {
            let state = self.state.read().await;
            state.source_conflicts.get(&key).cloned()
        };
        if let Some(existing_id) = existing_id {
            let state = self.state.read().await;
            let existing = state.sources.get(&existing_id).cloned();
            drop(state);
            if let Some(mut existing) = existing {
                existing.last_ingested_at = source.last_ingested_at;
                existing.status = source.status;
                existing.metadata = source.metadata.take();
                existing.content_type = source.content_type.take();
                existing.content_length = source.content_length;
                self.commit(vec![WalOp::PutSource(existing.clone())]).await?;
                return Ok(existing);
            }
        }
        self.commit(vec![WalOp::PutSource(source.clone())]).await?;
        Ok(source)
    }

    pub async fn insert_sources(&self, sources: Vec<Source>) -> Result<Vec<Source>, RepoError> {
        let mut out = Vec::with_capacity(sources.len());
        for source in sources {
            out.push(self.upsert_source(source).await?);
        }
        Ok(out)
    }

    pub async fn get_source(&self, id: &epigraph_core::typeid::TypeId) -> Option<Source> {
        self.state.read().await.sources.get(id).cloned()
    }

    pub async fn find_source(
        &self,
        user: &UserId,
        source_type: SourceType,
        external_id: &str,
    ) -> Option<Source> {
        let state = self.state.read().await;
        state
            .source_conflicts
            .get(&(user.clone(), source_type, external_id.to_string()))
            .and_then(|id| state.sources.get(id).cloned())
    }

    /// Ordered child `conversation_message` sources of a parent conversation
    /// source, oldest first (by `last_ingested_at`, tie-broken by id).
    pub async fn child_sources(&self, parent: &epigraph_core::typeid::TypeId) -> Vec<Source> {
        let state = self.state.read().await;
        let mut children: Vec<Source> = state
            .sources
            .values()
            .filter(|s| s.parent_source.as_ref() == Some(parent))
            .cloned()
            .collect();
        children.sort_by(|a, b| {
            a.last_ingested_at
                .cmp(&b.last_ingested_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        children
    }

    pub async fn sources_for_user(&self, user: &UserId) -> Vec<Source> {
        let state = self.state.read().await;
        state.sources.values().filter(|s| &s.user_id == user).cloned().collect()
    }

    // ---- EnsureSourceNode ----

    /// Creates the node representing a source (conversation/document), a
    /// `SourceLink` to it, and an `OCCURRED_ON` edge to that day's
    /// Temporal node. Idempotent: a source already linked to a node
    /// returns that node's id rather than creating a second one.
    pub async fn ensure_source_node(
        &self,
        user: &UserId,
        source_id: epigraph_core::typeid::TypeId,
        timestamp: i64,
        node_type: NodeType,
    ) -> Result<NodeId, RepoError> {
        {
            let state = self.state.read().await;
            if let Some(links) = state.source_links_by_source.get(&source_id) {
                if let Some(link_id) = links.first() {
                    if let Some(link) = state.source_links.get(link_id) {
                        return Ok(link.node_id.clone());
                    }
                }
            }
        }

        let date = chrono::DateTime::from_timestamp(timestamp, 0)
            .map(|dt| dt.naive_utc().date())
            .unwrap_or_else(|| chrono::NaiveDate::from_ymd_opt(1970, 1, 1).unwrap());
        let day_node_id = self.ensure_day_node(user, date, timestamp).await?;

        let node = Node::new(user.clone(), node_type, timestamp);
        let node_id = node.id.clone();
        let link = SourceLink::new(source_id, node_id.clone());
        let edge = Edge::new(
            user.clone(),
            node_id.clone(),
            day_node_id,
            EdgeType::OccurredOn,
            timestamp,
        )?;

        self.commit(vec![
            WalOp::PutNode(node),
            WalOp::PutSourceLink(link),
            WalOp::PutEdge(edge),
        ])
        .await?;

        Ok(node_id)
    }

    // ---- InsertNodeWithMetadata ----

    pub async fn insert_node_with_metadata(
        &self,
        node: Node,
        metadata: NodeMetadata,
    ) -> Result<NodeId, RepoError> {
        debug_assert_eq!(node.id, metadata.node_id);
        let node_id = node.id.clone();
        self.commit(vec![WalOp::PutNode(node), WalOp::PutNodeMetadata(metadata)])
            .await?;
        Ok(node_id)
    }

    /// The node a source is linked to, if `EnsureSourceNode` has run for it.
    pub async fn node_for_source(&self, source_id: &epigraph_core::typeid::TypeId) -> Option<NodeId> {
        let state = self.state.read().await;
        let link_id = state.source_links_by_source.get(source_id)?.first()?;
        state.source_links.get(link_id).map(|l| l.node_id.clone())
    }

    /// Replaces a node's metadata row in place without touching the Node
    /// row itself — used by Atlas rewrites and cleanup merges, where the
    /// node's identity is preserved but its label/description changes.
    pub async fn update_node_metadata(&self, metadata: NodeMetadata) -> Result<(), RepoError> {
        self.commit(vec![WalOp::PutNodeMetadata(metadata)]).await
    }

    pub async fn insert_source_link(&self, link: SourceLink) -> Result<(), RepoError> {
        let exists = {
            let state = self.state.read().await;
            state.link_conflicts.contains(&link.conflict_key())
        };
        if exists {
            return Ok(());
        }
        self.commit(vec![WalOp::PutSourceLink(link)]).await
    }

    // ---- InsertEdges (onConflict = DoNothing) ----

    /// Inserts a batch of edges, skipping any whose `(src,tgt,type)` triple
    /// already exists or repeats within the batch, and any whose endpoints
    /// don't resolve to nodes owned by the edge's `userId` (a logic error,
    /// logged and skipped rather than failing the batch). Returns only the
    /// rows actually written.
    pub async fn insert_edges(&self, edges: Vec<Edge>) -> Result<Vec<Edge>, RepoError> {
        let state = self.state.read().await;
        let mut seen: HashSet<(NodeId, NodeId, EdgeType)> = HashSet::new();
        let mut accepted = Vec::new();
        for edge in edges {
            let key = edge.conflict_key();
            if state.edge_conflicts.contains(&key) || seen.contains(&key) {
                continue;
            }
            let src_ok = state
                .nodes
                .get(&edge.source_node_id)
                .is_some_and(|n| n.user_id == edge.user_id);
            let tgt_ok = state
                .nodes
                .get(&edge.target_node_id)
                .is_some_and(|n| n.user_id == edge.user_id);
            if !src_ok || !tgt_ok {
                tracing::warn!(edge_id = %edge.id, "dropping edge with unresolved or cross-user endpoint");
                continue;
            }
            seen.insert(key);
            accepted.push(edge);
        }
        drop(state);

        let ops: Vec<WalOp> = accepted.iter().cloned().map(WalOp::PutEdge).collect();
        self.commit(ops).await?;
        Ok(accepted)
    }

    // ---- DeleteNodeCascade ----

    pub async fn delete_node_cascade(&self, node_id: &NodeId) -> Result<(), RepoError> {
        self.commit(vec![WalOp::DeleteNode(node_id.clone())]).await
    }

    // ---- RewireEdges ----

    /// Repoints every edge incident to `from` so it's incident to `to`
    /// instead, preserving `(src,tgt,type)` uniqueness: if the rewired
    /// triple already exists, the stale edge is dropped rather than
    /// duplicated.
    pub async fn rewire_edges(&self, from: &NodeId, to: &NodeId, now: i64) -> Result<(), RepoError> {
        let incident: Vec<Edge> = {
            let state = self.state.read().await;
            state
                .edges
                .values()
                .filter(|e| &e.source_node_id == from || &e.target_node_id == from)
                .cloned()
                .collect()
        };

        let mut ops = Vec::new();
        for edge in incident {
            let new_src = if &edge.source_node_id == from {
                to.clone()
            } else {
                edge.source_node_id.clone()
            };
            let new_tgt = if &edge.target_node_id == from {
                to.clone()
            } else {
                edge.target_node_id.clone()
            };

            if new_src == new_tgt {
                ops.push(WalOp::DeleteEdge(edge.id.clone()));
                continue;
            }

            let new_key = (new_src.clone(), new_tgt.clone(), edge.edge_type);
            let collides = {
                let state = self.state.read().await;
                state.edge_conflicts.contains(&new_key) && new_key != edge.conflict_key()
            };
            if collides {
                ops.push(WalOp::DeleteEdge(edge.id.clone()));
                continue;
            }

            ops.push(WalOp::DeleteEdge(edge.id.clone()));
            if let Ok(rewired) = Edge::new(edge.user_id.clone(), new_src, new_tgt, edge.edge_type, now)
            {
                let mut rewired = rewired;
                rewired.description = edge.description.clone();
                rewired.metadata = edge.metadata.clone();
                ops.push(WalOp::PutEdge(rewired));
            }
        }
        self.commit(ops).await
    }

    // ---- RewireSourceLinks ----

    pub async fn rewire_source_links(&self, from: &NodeId, to: &NodeId) -> Result<(), RepoError> {
        let links: Vec<SourceLink> = {
            let state = self.state.read().await;
            state
                .source_links_by_node
                .get(from)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|id| state.source_links.get(&id).cloned())
                .collect()
        };

        let mut ops = Vec::new();
        for link in links {
            let new_key = (link.source_id.clone(), to.clone());
            let collides = {
                let state = self.state.read().await;
                state.link_conflicts.contains(&new_key)
            };
            ops.push(WalOp::DeleteSourceLink(link.id.clone()));
            if !collides {
                let mut rewired = SourceLink::new(link.source_id.clone(), to.clone());
                rewired.specific_location = link.specific_location.clone();
                ops.push(WalOp::PutSourceLink(rewired));
            }
        }
        self.commit(ops).await
    }

    // ---- Embeddings ----

    pub async fn insert_node_embedding(&self, embedding: NodeEmbedding) -> Result<(), RepoError> {
        self.commit(vec![WalOp::PutNodeEmbedding(embedding)]).await
    }

    pub async fn insert_edge_embedding(
        &self,
        embedding: epigraph_core::model::EdgeEmbedding,
    ) -> Result<(), RepoError> {
        self.commit(vec![WalOp::PutEdgeEmbedding(embedding)]).await
    }

    pub async fn has_node_embedding(&self, node_id: &NodeId) -> bool {
        self.state
            .read()
            .await
            .node_embeddings
            .get(node_id)
            .is_some_and(|v| !v.is_empty())
    }

    // ---- Reads used by the retrieval engine ----

    pub async fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.state.read().await.nodes.get(id).cloned()
    }

    pub async fn get_node_metadata(&self, id: &NodeId) -> Option<NodeMetadata> {
        self.state.read().await.node_metadata.get(id).cloned()
    }

    pub async fn get_edge(&self, id: &EdgeId) -> Option<Edge> {
        self.state.read().await.edges.get(id).cloned()
    }

    pub async fn nodes_by_ids(&self, ids: &[NodeId]) -> Vec<Node> {
        let state = self.state.read().await;
        ids.iter().filter_map(|id| state.nodes.get(id).cloned()).collect()
    }

    pub async fn node_ids_for_user(&self, user: &UserId) -> Vec<NodeId> {
        let state = self.state.read().await;
        let mut ids: Vec<NodeId> = state
            .nodes
            .values()
            .filter(|n| &n.user_id == user)
            .map(|n| n.id.clone())
            .collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub async fn search_node_vectors(
        &self,
        user: &UserId,
        query: &[f32],
        k: usize,
        exclude_types: &[NodeType],
    ) -> Vec<(NodeId, f32)> {
        let state = self.state.read().await;
        // Over-fetch since the user/type filter happens after the scan.
        let raw = state.node_vectors.search(query, k.saturating_mul(4).max(k) + 16);
        raw.into_iter()
            .filter(|(id, _)| {
                state
                    .nodes
                    .get(id)
                    .is_some_and(|n| &n.user_id == user && !exclude_types.contains(&n.node_type))
            })
            .take(k)
            .collect()
    }

    pub async fn search_edge_vectors(
        &self,
        user: &UserId,
        query: &[f32],
        k: usize,
    ) -> Vec<(EdgeId, f32)> {
        let state = self.state.read().await;
        let raw = state.edge_vectors.search(query, k.saturating_mul(4).max(k) + 16);
        raw.into_iter()
            .filter(|(id, _)| state.edges.get(id).is_some_and(|e| &e.user_id == user))
            .take(k)
            .collect()
    }

    /// One-hop neighbors of a single seed, each with the edge that connects
    /// them back to the seed.
    pub async fn one_hop(&self, seed: &NodeId) -> Vec<OneHopNeighbor> {
        let state = self.state.read().await;
        state
            .edges
            .values()
            .filter_map(|e| {
                if &e.source_node_id == seed {
                    Some(OneHopNeighbor {
                        node_id: e.target_node_id.clone(),
                        edge_type: e.edge_type,
                        source_node_id: e.source_node_id.clone(),
                        target_node_id: e.target_node_id.clone(),
                    })
                } else if &e.target_node_id == seed {
                    Some(OneHopNeighbor {
                        node_id: e.source_node_id.clone(),
                        edge_type: e.edge_type,
                        source_node_id: e.source_node_id.clone(),
                        target_node_id: e.target_node_id.clone(),
                    })
                } else {
                    None
                }
            })
            .collect()
    }

    pub async fn out_degree(&self, node_id: &NodeId) -> usize {
        self.state.read().await.graph.out_degree(node_id)
    }

    /// Nodes with the highest outgoing-edge count among those created
    /// since `since`, used by the cleanup engine to pick entry points.
    pub async fn fetch_entry_nodes(&self, user: &UserId, since: i64, limit: usize) -> Vec<NodeId> {
        let state = self.state.read().await;
        let mut candidates: Vec<(NodeId, usize)> = state
            .nodes
            .values()
            .filter(|n| &n.user_id == user && n.created_at >= since)
            .map(|n| (n.id.clone(), state.graph.out_degree(&n.id)))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        candidates.into_iter().take(limit).map(|(id, _)| id).collect()
    }

    // ---- Aliases ----

    pub async fn insert_alias(&self, alias: Alias) -> Result<(), RepoError> {
        let exists = self.state.read().await.alias_conflicts.contains(&alias.conflict_key());
        if exists {
            return Ok(());
        }
        self.commit(vec![WalOp::PutAlias(alias)]).await
    }

    pub async fn resolve_alias(&self, user: &UserId, text: &str) -> Option<NodeId> {
        let state = self.state.read().await;
        state
            .aliases
            .iter()
            .find(|a| &a.user_id == user && a.text == text)
            .map(|a| a.canonical_node_id.clone())
    }

    // ---- User profile ----

    pub async fn get_user_profile(&self, user: &UserId) -> Option<UserProfile> {
        self.state.read().await.user_profiles.get(user).cloned()
    }

    pub async fn put_user_profile(&self, profile: UserProfile) -> Result<(), RepoError> {
        self.commit(vec![WalOp::PutUserProfile(profile)]).await
    }

    // ---- TruncateLongLabels / GenerateMissingNodeEmbeddings helpers ----

    /// Returns `(nodeId, truncatedMetadata)` for every label over 255 chars.
    pub async fn labels_over_limit(&self, user: &UserId, limit: usize) -> Vec<NodeMetadata> {
        let state = self.state.read().await;
        state
            .node_metadata
            .values()
            .filter(|m| {
                state
                    .nodes
                    .get(&m.node_id)
                    .is_some_and(|n| &n.user_id == user)
                    && m.label.as_ref().is_some_and(|l| l.len() > limit)
            })
            .cloned()
            .collect()
    }

    pub async fn labeled_nodes_without_embedding(&self, user: &UserId) -> Vec<(NodeId, NodeMetadata)> {
        let state = self.state.read().await;
        state
            .node_metadata
            .values()
            .filter(|m| {
                m.label.is_some()
                    && state
                        .nodes
                        .get(&m.node_id)
                        .is_some_and(|n| &n.user_id == user)
                    && !state.node_embeddings.get(&m.node_id).is_some_and(|v| !v.is_empty())
            })
            .map(|m| (m.node_id.clone(), m.clone()))
            .collect()
    }

    // ---- Snapshot / backup management ----

    pub async fn current_snapshot_id(&self) -> Result<String, RepoError> {
        let lsn = self.wal.lock().await.current_lsn();
        Ok(format!("{:020}", lsn))
    }

    pub async fn create_backup_snapshot(&self) -> Result<String, RepoError> {
        let manager = self
            .snapshot_manager
            .as_ref()
            .ok_or(RepoError::SnapshotNotConfigured)?;
        let lsn = self.wal.lock().await.current_lsn();
        let backup = {
            let state = self.state.read().await;
            state.to_backup(lsn)
        };
        let bytes = serialize_backup(&backup)?;
        manager.create_snapshot(lsn, &bytes).await?;
        Ok(format!("{:020}", lsn))
    }

    pub async fn restore_from_latest_backup(&self) -> Result<(), RepoError> {
        let manager = self
            .snapshot_manager
            .as_ref()
            .ok_or(RepoError::SnapshotNotConfigured)?;
        let (_, path) = manager
            .latest_snapshot()
            .await?
            .ok_or_else(|| RepoError::SnapshotNotFound("no snapshots exist".to_string()))?;
        let bytes = tokio::fs::read(&path).await.map_err(WalError::Io)?;
        let backup = deserialize_backup(&bytes)?;
        let new_state = GraphState::from_backup(backup);
        *self.state.write().await = new_state;
        Ok(())
    }
}

async fn load_state_from_backup(
    snapshot_manager: Option<&SnapshotManager>,
) -> Result<(GraphState, u64), RepoError> {
    let Some(manager) = snapshot_manager else {
        return Ok((GraphState::default(), 0));
    };
    let Some((lsn, path)) = manager.latest_snapshot().await? else {
        return Ok((GraphState::default(), 0));
    };
    let bytes = tokio::fs::read(&path).await.map_err(WalError::Io)?;
    let backup = deserialize_backup(&bytes)?;
    Ok((GraphState::from_backup(backup), lsn))
}

fn serialize_wal_entry(entry: &WalEntry) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(entry)
        .map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

fn serialize_backup(snapshot: &RepositoryBackupSnapshot) -> Result<Vec<u8>, RepoError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(snapshot)
        .map_err(|_| RepoError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}

fn deserialize_backup(bytes: &[u8]) -> Result<RepositoryBackupSnapshot, RepoError> {
    let archived = rkyv::check_archived_root::<RepositoryBackupSnapshot>(bytes)
        .map_err(|_| RepoError::Deserialization)?;
    archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|_| RepoError::Deserialization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use epigraph_core::model::EMBEDDING_DIMS;
    use tempfile::tempdir;

    async fn new_repo() -> (Repository, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).await.unwrap();
        (Repository::new(Arc::new(Mutex::new(wal))), dir)
    }

    fn uid() -> UserId {
        UserId::new("u1")
    }

    #[tokio::test]
    async fn ensure_day_node_is_idempotent_under_concurrency() {
        let (repo, _dir) = new_repo().await;
        let repo = Arc::new(repo);
        let user = uid();
        repo.ensure_user(&user).await.unwrap();
        let date = chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            let repo = repo.clone();
            let user = user.clone();
            handles.push(tokio::spawn(
                async move { repo.ensure_day_node(&user, date, 100).await.unwrap() },
            ));
        }
        let mut ids = Vec::new();
        for h in handles {
            ids.push(h.await.unwrap());
        }
        assert!(ids.windows(2).all(|w| w[0] == w[1]));

        let nodes = repo.node_ids_for_user(&user).await;
        assert_eq!(nodes.len(), 1, "exactly one day node row must exist");
    }

    #[tokio::test]
    async fn insert_edges_skips_duplicate_conflict_keys() {
        let (repo, _dir) = new_repo().await;
        let user = uid();
        repo.ensure_user(&user).await.unwrap();
        let a = Node::new(user.clone(), NodeType::Person, 0);
        let b = Node::new(user.clone(), NodeType::Person, 0);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        repo.insert_node_with_metadata(a, NodeMetadata::new(a_id.clone()))
            .await
            .unwrap();
        repo.insert_node_with_metadata(b, NodeMetadata::new(b_id.clone()))
            .await
            .unwrap();

        let e1 = Edge::new(user.clone(), a_id.clone(), b_id.clone(), EdgeType::RelatedTo, 0).unwrap();
        let e2 = Edge::new(user.clone(), a_id.clone(), b_id.clone(), EdgeType::RelatedTo, 1).unwrap();

        let inserted_first = repo.insert_edges(vec![e1]).await.unwrap();
        assert_eq!(inserted_first.len(), 1);

        let inserted_second = repo.insert_edges(vec![e2]).await.unwrap();
        assert_eq!(inserted_second.len(), 0, "duplicate (src,tgt,type) must be a no-op");
    }

    #[tokio::test]
    async fn delete_node_cascade_removes_metadata_and_edges() {
        let (repo, _dir) = new_repo().await;
        let user = uid();
        repo.ensure_user(&user).await.unwrap();
        let a = Node::new(user.clone(), NodeType::Person, 0);
        let b = Node::new(user.clone(), NodeType::Person, 0);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        repo.insert_node_with_metadata(a, NodeMetadata::new(a_id.clone()))
            .await
            .unwrap();
        repo.insert_node_with_metadata(b, NodeMetadata::new(b_id.clone()))
            .await
            .unwrap();
        let edge = Edge::new(user.clone(), a_id.clone(), b_id.clone(), EdgeType::RelatedTo, 0).unwrap();
        repo.insert_edges(vec![edge]).await.unwrap();

        repo.delete_node_cascade(&a_id).await.unwrap();

        assert!(repo.get_node(&a_id).await.is_none());
        assert!(repo.get_node_metadata(&a_id).await.is_none());
        assert!(repo.one_hop(&b_id).await.is_empty());
    }

    #[tokio::test]
    async fn rewire_edges_preserves_type_uniqueness() {
        let (repo, _dir) = new_repo().await;
        let user = uid();
        repo.ensure_user(&user).await.unwrap();
        let john = Node::new(user.clone(), NodeType::Person, 0);
        let john_doe = Node::new(user.clone(), NodeType::Person, 0);
        let paris = Node::new(user.clone(), NodeType::Location, 0);
        let (john_id, john_doe_id, paris_id) = (john.id.clone(), john_doe.id.clone(), paris.id.clone());
        for (n, id) in [(john, &john_id), (john_doe, &john_doe_id), (paris, &paris_id)] {
            repo.insert_node_with_metadata(n, NodeMetadata::new(id.clone())).await.unwrap();
        }

        let e1 = Edge::new(user.clone(), john_id.clone(), paris_id.clone(), EdgeType::ParticipatedIn, 0).unwrap();
        let e2 = Edge::new(user.clone(), john_doe_id.clone(), paris_id.clone(), EdgeType::ParticipatedIn, 0).unwrap();
        repo.insert_edges(vec![e1, e2]).await.unwrap();

        repo.rewire_edges(&john_id, &john_doe_id, 10).await.unwrap();

        let neighbors = repo.one_hop(&paris_id).await;
        let from_john_doe = neighbors.iter().filter(|n| n.node_id == john_doe_id).count();
        assert_eq!(from_john_doe, 1, "rewired duplicate must collapse to one edge");
    }

    #[tokio::test]
    async fn find_one_hop_never_returns_seed() {
        let (repo, _dir) = new_repo().await;
        let user = uid();
        repo.ensure_user(&user).await.unwrap();
        let a = Node::new(user.clone(), NodeType::Person, 0);
        let b = Node::new(user.clone(), NodeType::Person, 0);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        repo.insert_node_with_metadata(a, NodeMetadata::new(a_id.clone())).await.unwrap();
        repo.insert_node_with_metadata(b, NodeMetadata::new(b_id.clone())).await.unwrap();
        let edge = Edge::new(user.clone(), a_id.clone(), b_id.clone(), EdgeType::RelatedTo, 0).unwrap();
        repo.insert_edges(vec![edge]).await.unwrap();

        let hop = repo.one_hop(&a_id).await;
        assert!(hop.iter().all(|n| n.node_id != a_id));
    }

    #[tokio::test]
    async fn node_embedding_round_trips_through_vector_search() {
        let (repo, _dir) = new_repo().await;
        let user = uid();
        repo.ensure_user(&user).await.unwrap();
        let node = Node::new(user.clone(), NodeType::Concept, 0);
        let node_id = node.id.clone();
        repo.insert_node_with_metadata(node, NodeMetadata::new(node_id.clone()).with_label("Rust"))
            .await
            .unwrap();

        let mut vector = vec![0.0f32; EMBEDDING_DIMS];
        vector[0] = 1.0;
        let embedding = NodeEmbedding::new(node_id.clone(), vector.clone(), "test-model").unwrap();
        repo.insert_node_embedding(embedding).await.unwrap();

        let results = repo.search_node_vectors(&user, &vector, 5, &[]).await;
        assert_eq!(results[0].0, node_id);
    }

    #[tokio::test]
    async fn node_for_source_resolves_the_linked_node() {
        let (repo, _dir) = new_repo().await;
        let user = uid();
        repo.ensure_user(&user).await.unwrap();
        let source = epigraph_core::model::Source::new(
            user.clone(),
            epigraph_core::model::SourceType::Document,
            "doc-1",
            None,
            0,
        )
        .unwrap();
        let source = repo.upsert_source(source).await.unwrap();
        let node_id = repo
            .ensure_source_node(&user, source.id.clone(), 0, NodeType::Document)
            .await
            .unwrap();
        assert_eq!(repo.node_for_source(&source.id).await, Some(node_id));
    }

    #[tokio::test]
    async fn update_node_metadata_replaces_description_in_place() {
        let (repo, _dir) = new_repo().await;
        let user = uid();
        repo.ensure_user(&user).await.unwrap();
        let node = Node::new(user.clone(), NodeType::Atlas, 0);
        let node_id = node.id.clone();
        repo.insert_node_with_metadata(node, NodeMetadata::new(node_id.clone()).with_label("Atlas"))
            .await
            .unwrap();

        repo.update_node_metadata(
            NodeMetadata::new(node_id.clone()).with_label("Atlas").with_description("rewritten"),
        )
        .await
        .unwrap();

        let metadata = repo.get_node_metadata(&node_id).await.unwrap();
        assert_eq!(metadata.description.as_deref(), Some("rewritten"));
    }

    #[tokio::test]
    async fn wal_replay_restores_state() {
        let dir = tempdir().unwrap();
        let wal_path = dir.path().join("wal.log");
        let user = uid();
        let node_id;
        {
            let wal = Wal::open(&wal_path).await.unwrap();
            let repo = Repository::new(Arc::new(Mutex::new(wal)));
            repo.ensure_user(&user).await.unwrap();
            let node = Node::new(user.clone(), NodeType::Person, 0);
            node_id = node.id.clone();
            repo.insert_node_with_metadata(node, NodeMetadata::new(node_id.clone()).with_label("Alice"))
                .await
                .unwrap();
        }

        let repo = Repository::open(&wal_path).await.unwrap();
        let metadata = repo.get_node_metadata(&node_id).await.unwrap();
        assert_eq!(metadata.label.as_deref(), Some("Alice"));
    }
}
