//! Versioned snapshot storage
//!
//! A snapshot for version `V` is the set of `Entity` nodes and `REL`
//! relationships whose `kg_version` property equals `V`. Snapshots of
//! different versions coexist in the same database and share no keys.
//!
//! Writes MERGE on the composite keys, so re-running a write for the same
//! version is idempotent. Writes are chunked to bound statement sizes; a
//! write is not one transaction, and a partially written version is never
//! visible to readers because promotion to `latest_ready_version` happens
//! only after the write completes.

use std::collections::HashMap;
use std::sync::Arc;

use graphloom_core::config::RetentionConfig;
use graphloom_core::domain::{Entity, EntityKey, KnowledgeGraph, Relationship, graph::DEFAULT_PREDICATE};
use graphloom_core::ports::{GraphDatabase, Row, StoreError};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::props::{prop_embedding, prop_str, prop_str_list, props_dict};

/// Rows per UNWIND statement.
const WRITE_BATCH_SIZE: usize = 500;

/// Snapshot-level counters for `/kg/stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphStats {
    pub entity_count: u64,
    pub relation_count: u64,
    pub entity_label_count: u64,
}

/// One node in a subgraph query response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryNode {
    pub id: String,
    pub types: Vec<String>,
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

/// One edge in a subgraph query response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEdge {
    pub id: String,
    #[serde(rename = "type")]
    pub predicate: String,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, Value>>,
}

/// Bounds and filters for a subgraph query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Case-insensitive substring to match entity names. Empty means "list
    /// the version" instead of seed-and-expand.
    pub q: Option<String>,
    pub entity_types: Option<Vec<String>>,
    pub relation_types: Option<Vec<String>>,
    pub limit_nodes: usize,
    pub limit_edges: usize,
    pub depth: u32,
    pub max_seed_nodes: usize,
    pub include_properties: bool,
}

/// Assembled subgraph plus the truncation flag.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub nodes: Vec<QueryNode>,
    pub edges: Vec<QueryEdge>,
    pub truncated: bool,
}

/// Snapshot reads and writes keyed by `kg_version`.
pub struct VersionedGraphStore {
    db: Arc<dyn GraphDatabase>,
    graph_name: String,
}

impl VersionedGraphStore {
    pub fn new(db: Arc<dyn GraphDatabase>, graph_name: impl Into<String>) -> Self {
        Self {
            db,
            graph_name: graph_name.into(),
        }
    }

    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Upserts the whole snapshot for `version`: entities first, then
    /// relationships (which MATCH both endpoints at the same version).
    pub async fn write_knowledge_graph(
        &self,
        version: &str,
        kg: &KnowledgeGraph,
    ) -> Result<(), StoreError> {
        let node_rows: Vec<Value> = kg
            .entities
            .iter()
            .map(|e| {
                json!({
                    "kg_version": version,
                    "entity_label": e.label,
                    "name": e.name,
                    "props": {
                        "kg_version": version,
                        "entity_label": e.label,
                        "name": e.name,
                        "embeddings": e.embedding,
                    },
                })
            })
            .collect();

        let rel_rows: Vec<Value> = kg
            .relationships
            .iter()
            .map(|r| {
                let predicate = if r.predicate.is_empty() {
                    DEFAULT_PREDICATE
                } else {
                    r.predicate.as_str()
                };
                json!({
                    "kg_version": version,
                    "start_label": r.source.label,
                    "start_name": r.source.name,
                    "end_label": r.target.label,
                    "end_name": r.target.name,
                    "predicate": predicate,
                    "props": {
                        "kg_version": version,
                        "predicate": predicate,
                        "atomic_facts": r.atomic_facts,
                        "t_obs": r.t_obs,
                        "t_start": r.t_start,
                        "t_end": r.t_end,
                        "embeddings": r.embedding,
                    },
                })
            })
            .collect();

        let node_query = "\
UNWIND $rows AS row
MERGE (e:Entity {kg_version: row.kg_version, entity_label: row.entity_label, name: row.name})
SET e += row.props
RETURN count(e) AS n";
        let rel_query = "\
UNWIND $rows AS row
MATCH (s:Entity {kg_version: row.kg_version, entity_label: row.start_label, name: row.start_name})
MATCH (t:Entity {kg_version: row.kg_version, entity_label: row.end_label, name: row.end_name})
MERGE (s)-[r:REL {kg_version: row.kg_version, predicate: row.predicate}]->(t)
SET r += row.props
RETURN count(r) AS n";

        for batch in node_rows.chunks(WRITE_BATCH_SIZE) {
            self.db.run(node_query, json!({"rows": batch})).await?;
        }
        for batch in rel_rows.chunks(WRITE_BATCH_SIZE) {
            self.db.run(rel_query, json!({"rows": batch})).await?;
        }

        info!(
            graph = %self.graph_name,
            version,
            entities = kg.entities.len(),
            relationships = kg.relationships.len(),
            "snapshot written"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Streams the full snapshot back, suitable as the prior graph for an
    /// incremental build. Unknown versions load as an empty graph.
    pub async fn load_knowledge_graph(&self, version: &str) -> Result<KnowledgeGraph, StoreError> {
        let node_query = "\
MATCH (e:Entity {kg_version: $v})
RETURN properties(e) AS e";
        let rel_query = "\
MATCH (s:Entity {kg_version: $v})-[r:REL {kg_version: $v}]->(t:Entity {kg_version: $v})
RETURN properties(s) AS s, properties(r) AS r, properties(t) AS t";

        let mut kg = KnowledgeGraph::new();
        let mut index: HashMap<EntityKey, ()> = HashMap::new();

        for row in self.db.run(node_query, json!({"v": version})).await? {
            let props = props_dict(row.get("e").unwrap_or(&Value::Null));
            let mut entity = Entity::new(
                prop_str(&props, "entity_label"),
                prop_str(&props, "name"),
            );
            entity.embedding = prop_embedding(&props, "embeddings");
            if index.insert(entity.key(), ()).is_none() {
                kg.entities.push(entity);
            }
        }

        for row in self.db.run(rel_query, json!({"v": version})).await? {
            let sp = props_dict(row.get("s").unwrap_or(&Value::Null));
            let tp = props_dict(row.get("t").unwrap_or(&Value::Null));
            let rp = props_dict(row.get("r").unwrap_or(&Value::Null));

            let source = EntityKey::new(prop_str(&sp, "entity_label"), prop_str(&sp, "name"));
            let target = EntityKey::new(prop_str(&tp, "entity_label"), prop_str(&tp, "name"));
            if !index.contains_key(&source) || !index.contains_key(&target) {
                continue;
            }

            let mut rel = Relationship::new(source, target, prop_str(&rp, "predicate"));
            rel.atomic_facts = prop_str_list(&rp, "atomic_facts");
            rel.t_obs = prop_str_list(&rp, "t_obs");
            rel.t_start = prop_str_list(&rp, "t_start");
            rel.t_end = prop_str_list(&rp, "t_end");
            rel.embedding = prop_embedding(&rp, "embeddings");
            kg.relationships.push(rel);
        }

        debug!(
            version,
            entities = kg.entities.len(),
            relationships = kg.relationships.len(),
            "snapshot loaded"
        );
        Ok(kg)
    }

    // ------------------------------------------------------------------
    // Types & stats
    // ------------------------------------------------------------------

    /// Distinct entity labels at `version`, sorted.
    pub async fn get_entity_types(&self, version: &str) -> Result<Vec<String>, StoreError> {
        let query = "\
MATCH (e:Entity {kg_version: $v})
RETURN DISTINCT e.entity_label AS t
ORDER BY t";
        Ok(self
            .db
            .run(query, json!({"v": version}))
            .await?
            .iter()
            .filter_map(|r| r.get("t").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Distinct predicates at `version`, sorted.
    pub async fn get_relation_types(&self, version: &str) -> Result<Vec<String>, StoreError> {
        let query = "\
MATCH ()-[r:REL {kg_version: $v}]->()
RETURN DISTINCT r.predicate AS t
ORDER BY t";
        Ok(self
            .db
            .run(query, json!({"v": version}))
            .await?
            .iter()
            .filter_map(|r| r.get("t").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    pub async fn get_stats(&self, version: &str) -> Result<GraphStats, StoreError> {
        let entity_query =
            "MATCH (e:Entity {kg_version: $v}) RETURN count(e) AS n, count(DISTINCT e.entity_label) AS t";
        let rel_query = "MATCH ()-[r:REL {kg_version: $v}]->() RETURN count(r) AS n";

        let entity_rows = self.db.run(entity_query, json!({"v": version})).await?;
        let rel_rows = self.db.run(rel_query, json!({"v": version})).await?;

        let get = |rows: &[Row], key: &str| -> u64 {
            rows.first()
                .and_then(|r| r.get(key))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        Ok(GraphStats {
            entity_count: get(&entity_rows, "n"),
            relation_count: get(&rel_rows, "n"),
            entity_label_count: get(&entity_rows, "t"),
        })
    }

    // ------------------------------------------------------------------
    // Subgraph query
    // ------------------------------------------------------------------

    /// Bounded subgraph query against one version.
    ///
    /// With a non-empty `q`: seed entities whose name contains `q`
    /// case-insensitively, then expand undirected REL paths up to `depth`,
    /// only over edges of the same version. Without `q`: list edges, falling
    /// back to entities when the version has no edges.
    ///
    /// Result sets are fetched one past the limit so truncation is
    /// detectable; trimmed nodes drag their edges out with them.
    pub async fn query_graph(
        &self,
        version: &str,
        opts: &QueryOptions,
    ) -> Result<QueryResult, StoreError> {
        let q = opts.q.as_deref().unwrap_or("").trim().to_string();
        let limit_nodes = opts.limit_nodes.max(1);
        let limit_edges = opts.limit_edges;
        let limit_nodes_plus = limit_nodes + 1;
        let limit_edges_plus = limit_edges + 1;
        let seed_limit = opts.max_seed_nodes.max(1);

        let entity_filter = opts
            .entity_types
            .as_ref()
            .filter(|types| !types.is_empty());
        let relation_filter = opts
            .relation_types
            .as_ref()
            .filter(|types| !types.is_empty());

        let mut assembler = SubgraphAssembler::new(opts.include_properties);

        if !q.is_empty() {
            let mut seed_query = String::from(
                "MATCH (s:Entity {kg_version: $v})\nWHERE toLower(s.name) CONTAINS toLower($q)",
            );
            if entity_filter.is_some() {
                seed_query.push_str("\n  AND s.entity_label IN $entity_types");
            }
            seed_query.push_str("\nRETURN properties(s) AS s\nLIMIT $seed_limit");

            let params = json!({
                "v": version,
                "q": q,
                "seed_limit": seed_limit,
                "entity_types": entity_filter,
            });
            let seed_rows = self.db.run(&seed_query, params).await?;
            for row in &seed_rows {
                assembler.add_node(row.get("s").unwrap_or(&Value::Null));
            }

            if opts.depth > 0 && limit_edges > 0 && !seed_rows.is_empty() {
                // Variable-length bounds cannot be parameters; depth is a
                // validated small integer inlined into the pattern.
                let mut expand_query = format!(
                    "MATCH (s:Entity {{kg_version: $v}})\n\
                     WHERE toLower(s.name) CONTAINS toLower($q)\n{}\
                     WITH s LIMIT $seed_limit\n\
                     MATCH (s)-[rels:REL*1..{}]-(n:Entity {{kg_version: $v}})\n\
                     WHERE ALL(r IN rels WHERE r.kg_version = $v)",
                    if entity_filter.is_some() {
                        "  AND s.entity_label IN $entity_types\n"
                    } else {
                        ""
                    },
                    opts.depth,
                );
                if relation_filter.is_some() {
                    expand_query.push_str("\n  AND ALL(r IN rels WHERE r.predicate IN $relation_types)");
                }
                expand_query.push_str(
                    "\nUNWIND rels AS r\n\
                     WITH DISTINCT r\n\
                     LIMIT $limit_edges\n\
                     MATCH (a)-[r]->(b)\n\
                     RETURN properties(a) AS s, properties(r) AS r, properties(b) AS t",
                );

                let params = json!({
                    "v": version,
                    "q": q,
                    "seed_limit": seed_limit,
                    "limit_edges": limit_edges_plus,
                    "entity_types": entity_filter,
                    "relation_types": relation_filter,
                });
                for row in self.db.run(&expand_query, params).await? {
                    assembler.add_edge_row(&row);
                }
            }
        } else {
            if limit_edges > 0 {
                let mut edge_query = String::from(
                    "MATCH (s:Entity {kg_version: $v})-[r:REL {kg_version: $v}]->(t:Entity {kg_version: $v})",
                );
                if relation_filter.is_some() {
                    edge_query.push_str("\nWHERE r.predicate IN $relation_types");
                }
                edge_query.push_str(
                    "\nRETURN properties(s) AS s, properties(r) AS r, properties(t) AS t\nLIMIT $limit_edges",
                );
                let params = json!({
                    "v": version,
                    "limit_edges": limit_edges_plus,
                    "relation_types": relation_filter,
                });
                for row in self.db.run(&edge_query, params).await? {
                    assembler.add_edge_row(&row);
                }
            }

            if assembler.nodes.is_empty() {
                let mut node_query = String::from("MATCH (e:Entity {kg_version: $v})");
                if entity_filter.is_some() {
                    node_query.push_str("\nWHERE e.entity_label IN $entity_types");
                }
                node_query.push_str("\nRETURN properties(e) AS e\nLIMIT $limit_nodes");
                let params = json!({
                    "v": version,
                    "limit_nodes": limit_nodes_plus,
                    "entity_types": entity_filter,
                });
                for row in self.db.run(&node_query, params).await? {
                    assembler.add_node(row.get("e").unwrap_or(&Value::Null));
                }
            }
        }

        Ok(assembler.finish(limit_nodes, limit_edges))
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    /// Deletes snapshots beyond the retention window.
    ///
    /// The candidate set is every version referenced by a task that finished
    /// without an error; the newest `max_versions` plus the current
    /// `latest_ready_version` survive. Returns the versions deleted.
    pub async fn cleanup_old_versions(
        &self,
        retention: &RetentionConfig,
    ) -> Result<Vec<String>, StoreError> {
        if !retention.enable_cleanup || retention.max_versions <= 0 {
            return Ok(Vec::new());
        }

        let query = "\
MATCH (s:KGState {graph_name: $graph_name})
WITH s.latest_ready_version AS latest
MATCH (t:KGTask)
WHERE t.finished_at IS NOT NULL AND (t.error IS NULL OR t.error = '')
WITH latest, collect(DISTINCT t.version) AS versions
RETURN latest, versions";
        let rows = self
            .db
            .run(query, json!({"graph_name": self.graph_name}))
            .await?;
        let row = match rows.first() {
            Some(row) => row,
            None => return Ok(Vec::new()),
        };

        let latest = row
            .get("latest")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut versions: Vec<String> = row
            .get("versions")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        // Versions are millisecond timestamps; non-numeric strings sort last.
        versions.sort_by_key(|v| std::cmp::Reverse(v.parse::<u64>().unwrap_or(0)));

        let mut keep: std::collections::HashSet<String> = versions
            .iter()
            .take(retention.max_versions as usize)
            .cloned()
            .collect();
        if let Some(latest) = latest {
            keep.insert(latest);
        }

        let to_delete: Vec<String> = versions
            .into_iter()
            .filter(|v| !keep.contains(v))
            .collect();
        for version in &to_delete {
            self.delete_version_data(version).await?;
        }
        if !to_delete.is_empty() {
            info!(graph = %self.graph_name, deleted = ?to_delete, "old snapshot versions pruned");
        }
        Ok(to_delete)
    }

    /// Detach-deletes every entity of one version, taking its edges along.
    pub async fn delete_version_data(&self, version: &str) -> Result<(), StoreError> {
        let query = "\
MATCH (e:Entity {kg_version: $v})
DETACH DELETE e
RETURN count(*) AS n";
        self.db.run(query, json!({"v": version})).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Subgraph assembly
// ---------------------------------------------------------------------------

/// Accumulates deduplicated nodes and edges in first-seen order, then applies
/// the limits.
struct SubgraphAssembler {
    include_properties: bool,
    nodes: Vec<QueryNode>,
    edges: Vec<QueryEdge>,
    node_ids: std::collections::HashSet<String>,
    edge_ids: std::collections::HashSet<String>,
}

impl SubgraphAssembler {
    fn new(include_properties: bool) -> Self {
        Self {
            include_properties,
            nodes: Vec::new(),
            edges: Vec::new(),
            node_ids: std::collections::HashSet::new(),
            edge_ids: std::collections::HashSet::new(),
        }
    }

    /// Projects a property map for clients: embeddings and the version tag
    /// never leave the store.
    fn cleaned(&self, props: &Map<String, Value>) -> Option<Map<String, Value>> {
        if !self.include_properties {
            return None;
        }
        Some(
            props
                .iter()
                .filter(|(k, _)| k.as_str() != "embeddings" && k.as_str() != "kg_version")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    fn add_node(&mut self, value: &Value) {
        let props = props_dict(value);
        let label = prop_str(&props, "entity_label");
        let name = prop_str(&props, "name");
        let id = format!("{label}:{name}");
        if !self.node_ids.insert(id.clone()) {
            return;
        }
        self.nodes.push(QueryNode {
            id,
            types: vec!["Entity".to_string(), label],
            name: if name.is_empty() { None } else { Some(name) },
            properties: self.cleaned(&props),
        });
    }

    fn add_edge_row(&mut self, row: &Row) {
        let source = row.get("s").cloned().unwrap_or(Value::Null);
        let rel = row.get("r").cloned().unwrap_or(Value::Null);
        let target = row.get("t").cloned().unwrap_or(Value::Null);

        let sp = props_dict(&source);
        let tp = props_dict(&target);
        let rp = props_dict(&rel);
        // A row without both endpoints cannot form an edge.
        if prop_str(&sp, "name").is_empty() || prop_str(&tp, "name").is_empty() {
            return;
        }
        self.add_node(&source);
        self.add_node(&target);

        let source_id = format!("{}:{}", prop_str(&sp, "entity_label"), prop_str(&sp, "name"));
        let target_id = format!("{}:{}", prop_str(&tp, "entity_label"), prop_str(&tp, "name"));
        let predicate = {
            let p = prop_str(&rp, "predicate");
            if p.is_empty() {
                DEFAULT_PREDICATE.to_string()
            } else {
                p
            }
        };
        let id = format!("{source_id}->{predicate}->{target_id}");
        if !self.edge_ids.insert(id.clone()) {
            return;
        }
        self.edges.push(QueryEdge {
            id,
            predicate,
            source: source_id,
            target: target_id,
            properties: self.cleaned(&rp),
        });
    }

    fn finish(mut self, limit_nodes: usize, limit_edges: usize) -> QueryResult {
        let mut truncated = false;
        if self.nodes.len() > limit_nodes {
            truncated = true;
            self.nodes.truncate(limit_nodes);
        }
        if self.edges.len() > limit_edges {
            truncated = true;
            self.edges.truncate(limit_edges);
        }

        let kept: std::collections::HashSet<&str> =
            self.nodes.iter().map(|n| n.id.as_str()).collect();
        self.edges
            .retain(|e| kept.contains(e.source.as_str()) && kept.contains(e.target.as_str()));

        QueryResult {
            nodes: self.nodes,
            edges: self.edges,
            truncated,
        }
    }
}
