//! Single-file embedded store.
//!
//! One SQLite database per workspace, opened in WAL mode with foreign keys
//! enforced, holds every persistent record: assets, atoms, chunks, vector
//! blobs, annotations, concepts, edges, jobs, and watched roots. The store
//! also owns the in-memory vector cache; any operation touching both the
//! `vectors` table and the cache acquires the cache write lock first and the
//! connection lock second, so the two are never observed diverging.
//!
//! Deterministic record IDs make `INSERT OR REPLACE` idempotent: re-running
//! a pipeline stage on unchanged inputs rewrites identical rows.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::ids;
use crate::model::{
    Annotation, AnnotationPayload, Asset, AssetStatus, AtomType, Chunk, ConceptNode, ContentAtom,
    EdgeType, EvidenceAnchor, GraphEdge, JobStatus, PipelineJob, VectorRecord, WatchedRoot,
};
use crate::vectors::{blob_to_vec, vec_to_blob, SearchHit, VectorCache};

pub struct Store {
    conn: Mutex<Connection>,
    cache: RwLock<VectorCache>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS assets (
    id            TEXT PRIMARY KEY,
    path          TEXT NOT NULL UNIQUE,
    filename      TEXT NOT NULL,
    size_bytes    INTEGER NOT NULL,
    mtime_ns      INTEGER NOT NULL,
    content_hash  TEXT NOT NULL,
    mime_type     TEXT NOT NULL,
    scan_version  INTEGER NOT NULL DEFAULT 1,
    status        TEXT NOT NULL,
    last_error    TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assets_status ON assets(status);

CREATE TABLE IF NOT EXISTS atoms (
    id          TEXT PRIMARY KEY,
    asset_id    TEXT NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    atom_type   TEXT NOT NULL,
    seq         INTEGER NOT NULL,
    text        TEXT,
    payload_ref TEXT,
    metadata    TEXT,
    anchor_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_atoms_asset ON atoms(asset_id, seq);

CREATE TABLE IF NOT EXISTS chunks (
    id               TEXT PRIMARY KEY,
    atom_id          TEXT NOT NULL,
    asset_id         TEXT NOT NULL REFERENCES assets(id) ON DELETE CASCADE,
    text             TEXT NOT NULL,
    token_count      INTEGER NOT NULL,
    chunk_index      INTEGER NOT NULL,
    anchor_json      TEXT NOT NULL,
    embedding_ref    TEXT,
    pipeline_version TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_chunks_asset ON chunks(asset_id, chunk_index);
CREATE INDEX IF NOT EXISTS idx_chunks_unembedded ON chunks(embedding_ref) WHERE embedding_ref IS NULL;

CREATE TABLE IF NOT EXISTS vectors (
    chunk_id         TEXT PRIMARY KEY,
    embedding        BLOB NOT NULL,
    text             TEXT NOT NULL,
    asset_id         TEXT NOT NULL,
    asset_path       TEXT NOT NULL,
    anchor_json      TEXT NOT NULL,
    pipeline_version TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vectors_asset ON vectors(asset_id);

CREATE TABLE IF NOT EXISTS annotations (
    id               TEXT PRIMARY KEY,
    chunk_id         TEXT NOT NULL,
    model_id         TEXT NOT NULL,
    prompt_id        TEXT NOT NULL,
    prompt_version   TEXT NOT NULL,
    pipeline_version TEXT NOT NULL,
    payload_json     TEXT NOT NULL,
    is_current       INTEGER NOT NULL DEFAULT 1,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_annotations_chunk ON annotations(chunk_id, is_current);

CREATE TABLE IF NOT EXISTS concepts (
    id               TEXT PRIMARY KEY,
    level            INTEGER NOT NULL,
    label            TEXT NOT NULL,
    description      TEXT NOT NULL,
    parent_id        TEXT,
    exemplars_json   TEXT NOT NULL,
    pipeline_version TEXT NOT NULL,
    model_id         TEXT NOT NULL,
    created_at       TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_concepts_level ON concepts(level);

CREATE TABLE IF NOT EXISTS edges (
    id               TEXT PRIMARY KEY,
    edge_type        TEXT NOT NULL,
    source_id        TEXT NOT NULL,
    target_id        TEXT NOT NULL,
    weight           REAL NOT NULL,
    evidence_json    TEXT,
    pipeline_version TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source_id);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target_id);
CREATE INDEX IF NOT EXISTS idx_edges_type ON edges(edge_type);

CREATE TABLE IF NOT EXISTS jobs (
    id            TEXT PRIMARY KEY,
    job_type      TEXT NOT NULL,
    status        TEXT NOT NULL,
    progress_json TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS watched_roots (
    id           TEXT PRIMARY KEY,
    path         TEXT NOT NULL UNIQUE,
    label        TEXT NOT NULL,
    added_at     TEXT NOT NULL,
    last_scan_at TEXT
);
";

impl Store {
    /// Open (or create) the store file and run the idempotent schema.
    pub fn open(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            cache: RwLock::new(VectorCache::new()),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", 1)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: RwLock::new(VectorCache::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Assets
    // -----------------------------------------------------------------------

    /// Insert or replace an asset keyed by its deterministic ID. When the
    /// path already exists under a different ID (the file changed on disk),
    /// the stale row and all of its dependents are removed first so the
    /// replacement starts clean.
    pub fn upsert_asset(&self, asset: &Asset) -> AppResult<()> {
        let old_id: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT id FROM assets WHERE path = ?1",
                params![asset.path],
                |row| row.get(0),
            )
            .optional()?
        };
        if let Some(old) = old_id {
            if old != asset.id {
                self.delete_asset_dependents(&old)?;
                let conn = self.conn.lock();
                conn.execute("DELETE FROM assets WHERE id = ?1", params![old])?;
            }
        }

        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO assets
             (id, path, filename, size_bytes, mtime_ns, content_hash, mime_type,
              scan_version, status, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                asset.id,
                asset.path,
                asset.filename,
                asset.size_bytes as i64,
                asset.mtime_ns,
                asset.content_hash,
                asset.mime_type,
                asset.scan_version,
                asset.status.as_str(),
                asset.last_error,
                asset.created_at.to_rfc3339(),
                asset.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_asset(&self, id: &str) -> AppResult<Option<Asset>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM assets WHERE id = ?1",
            params![id],
            row_to_asset,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn get_asset_by_path(&self, path: &str) -> AppResult<Option<Asset>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM assets WHERE path = ?1",
            params![path],
            row_to_asset,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_assets_by_status(&self, status: AssetStatus) -> AppResult<Vec<Asset>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM assets WHERE status = ?1 ORDER BY path")?;
        let rows = stmt.query_map(params![status.as_str()], row_to_asset)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn list_all_assets(&self) -> AppResult<Vec<Asset>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM assets ORDER BY path")?;
        let rows = stmt.query_map([], row_to_asset)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn update_asset_status(
        &self,
        id: &str,
        status: AssetStatus,
        error: Option<&str>,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE assets SET status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), error, Utc::now().to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn count_assets(&self) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM assets", [], |row| row.get(0))
            .map_err(AppError::from)
    }

    pub fn count_assets_by_status(&self) -> AppResult<Vec<(AssetStatus, i64)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM assets GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = Vec::new();
        for row in rows {
            let (status, count) = row?;
            if let Some(status) = AssetStatus::parse(&status) {
                counts.push((status, count));
            }
        }
        Ok(counts)
    }

    /// Remove every atom, chunk, and vector belonging to an asset: the
    /// prelude to re-extraction.
    pub fn delete_asset_dependents(&self, asset_id: &str) -> AppResult<()> {
        let mut cache = self.cache.write();
        let conn = self.conn.lock();
        conn.execute("DELETE FROM atoms WHERE asset_id = ?1", params![asset_id])?;
        conn.execute("DELETE FROM chunks WHERE asset_id = ?1", params![asset_id])?;
        conn.execute("DELETE FROM vectors WHERE asset_id = ?1", params![asset_id])?;
        let dropped = cache.remove_by_asset(asset_id);
        if dropped > 0 {
            debug!(asset_id, dropped, "evicted cached vectors");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Atoms
    // -----------------------------------------------------------------------

    pub fn insert_atoms(&self, atoms: &[ContentAtom]) -> AppResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for atom in atoms {
            tx.execute(
                "INSERT OR REPLACE INTO atoms
                 (id, asset_id, atom_type, seq, text, payload_ref, metadata, anchor_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    atom.id,
                    atom.asset_id,
                    atom.atom_type.as_str(),
                    atom.seq,
                    atom.text,
                    atom.payload_ref,
                    atom.metadata.as_ref().map(|m| m.to_string()),
                    atom.anchor.to_json(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_atoms_by_asset(&self, asset_id: &str) -> AppResult<Vec<ContentAtom>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM atoms WHERE asset_id = ?1 ORDER BY seq")?;
        let rows = stmt.query_map(params![asset_id], row_to_atom)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    pub fn insert_chunks(&self, chunks: &[Chunk]) -> AppResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for chunk in chunks {
            tx.execute(
                "INSERT OR REPLACE INTO chunks
                 (id, atom_id, asset_id, text, token_count, chunk_index, anchor_json,
                  embedding_ref, pipeline_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    chunk.id,
                    chunk.atom_id,
                    chunk.asset_id,
                    chunk.text,
                    chunk.token_count as i64,
                    chunk.chunk_index,
                    chunk.anchor.to_json(),
                    chunk.embedding_ref,
                    chunk.pipeline_version,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_chunk(&self, id: &str) -> AppResult<Option<Chunk>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM chunks WHERE id = ?1",
            params![id],
            row_to_chunk,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_chunks_by_asset(&self, asset_id: &str) -> AppResult<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM chunks WHERE asset_id = ?1 ORDER BY chunk_index")?;
        let rows = stmt.query_map(params![asset_id], row_to_chunk)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn list_unembedded_chunks(&self) -> AppResult<Vec<Chunk>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM chunks WHERE embedding_ref IS NULL ORDER BY asset_id, chunk_index",
        )?;
        let rows = stmt.query_map([], row_to_chunk)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn set_chunk_embedding_ref(&self, chunk_id: &str, embedding_ref: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE chunks SET embedding_ref = ?1 WHERE id = ?2",
            params![embedding_ref, chunk_id],
        )?;
        Ok(())
    }

    pub fn count_chunks(&self) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .map_err(AppError::from)
    }

    /// True when every chunk of the asset carries an embedding reference
    /// (and at least one chunk exists).
    pub fn asset_fully_embedded(&self, asset_id: &str) -> AppResult<bool> {
        let conn = self.conn.lock();
        let (total, embedded): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(embedding_ref) FROM chunks WHERE asset_id = ?1",
            params![asset_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(total > 0 && total == embedded)
    }

    // -----------------------------------------------------------------------
    // Annotations
    // -----------------------------------------------------------------------

    /// Insert a new annotation as current, atomically flipping any prior
    /// current annotation for the same chunk to non-current. External
    /// readers never observe two current annotations for one chunk.
    pub fn insert_annotation(&self, annotation: &Annotation) -> AppResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE annotations SET is_current = 0 WHERE chunk_id = ?1",
            params![annotation.chunk_id],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO annotations
             (id, chunk_id, model_id, prompt_id, prompt_version, pipeline_version,
              payload_json, is_current, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                annotation.id,
                annotation.chunk_id,
                annotation.model_id,
                annotation.prompt_id,
                annotation.prompt_version,
                annotation.pipeline_version,
                serde_json::to_string(&annotation.payload)?,
                annotation.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_current_annotation(&self, chunk_id: &str) -> AppResult<Option<Annotation>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM annotations WHERE chunk_id = ?1 AND is_current = 1",
            params![chunk_id],
            row_to_annotation,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn has_current_annotation_by_model(&self, chunk_id: &str, model_id: &str) -> AppResult<bool> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM annotations
             WHERE chunk_id = ?1 AND model_id = ?2 AND is_current = 1",
            params![chunk_id, model_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn count_current_annotations(&self) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM annotations WHERE is_current = 1",
            [],
            |row| row.get(0),
        )
        .map_err(AppError::from)
    }

    // -----------------------------------------------------------------------
    // Concepts
    // -----------------------------------------------------------------------

    pub fn upsert_concept(&self, concept: &ConceptNode) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO concepts
             (id, level, label, description, parent_id, exemplars_json,
              pipeline_version, model_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                concept.id,
                concept.level,
                concept.label,
                concept.description,
                concept.parent_id,
                serde_json::to_string(&concept.exemplar_chunk_ids)?,
                concept.pipeline_version,
                concept.model_id,
                concept.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_concept(&self, id: &str) -> AppResult<Option<ConceptNode>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM concepts WHERE id = ?1",
            params![id],
            row_to_concept,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_concepts(&self, level: Option<i64>) -> AppResult<Vec<ConceptNode>> {
        let conn = self.conn.lock();
        match level {
            Some(level) => {
                let mut stmt =
                    conn.prepare("SELECT * FROM concepts WHERE level = ?1 ORDER BY label")?;
                let rows = stmt.query_map(params![level], row_to_concept)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM concepts ORDER BY level, label")?;
                let rows = stmt.query_map([], row_to_concept)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
            }
        }
    }

    pub fn count_concepts(&self) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM concepts", [], |row| row.get(0))
            .map_err(AppError::from)
    }

    /// Member chunk IDs of a concept, resolved through concept_member edges.
    pub fn concept_member_chunk_ids(&self, concept_id: &str) -> AppResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT target_id FROM edges
             WHERE source_id = ?1 AND edge_type = 'concept_member'
             ORDER BY weight DESC",
        )?;
        let rows = stmt.query_map(params![concept_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    // -----------------------------------------------------------------------
    // Edges
    // -----------------------------------------------------------------------

    pub fn insert_edges(&self, edges: &[GraphEdge]) -> AppResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for edge in edges {
            tx.execute(
                "INSERT OR REPLACE INTO edges
                 (id, edge_type, source_id, target_id, weight, evidence_json, pipeline_version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    edge.id,
                    edge.edge_type.as_str(),
                    edge.source_id,
                    edge.target_id,
                    edge.weight,
                    edge.evidence.as_ref().map(|e| e.to_string()),
                    edge.pipeline_version,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn list_edges(&self, edge_type: Option<EdgeType>, limit: usize) -> AppResult<Vec<GraphEdge>> {
        let conn = self.conn.lock();
        match edge_type {
            Some(t) => {
                let mut stmt = conn.prepare(
                    "SELECT * FROM edges WHERE edge_type = ?1 ORDER BY weight DESC LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![t.as_str(), limit as i64], row_to_edge)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
            }
            None => {
                let mut stmt =
                    conn.prepare("SELECT * FROM edges ORDER BY weight DESC LIMIT ?1")?;
                let rows = stmt.query_map(params![limit as i64], row_to_edge)?;
                rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
            }
        }
    }

    /// Edges incident on a node, in either direction.
    pub fn edges_for_node(&self, node_id: &str) -> AppResult<Vec<GraphEdge>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM edges WHERE source_id = ?1 OR target_id = ?1 ORDER BY weight DESC",
        )?;
        let rows = stmt.query_map(params![node_id], row_to_edge)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn count_edges(&self) -> AppResult<i64> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM edges", [], |row| row.get(0))
            .map_err(AppError::from)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub fn upsert_job(&self, job: &PipelineJob) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO jobs (id, job_type, status, progress_json, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.id,
                job.job_type,
                job.status.as_str(),
                job.progress.to_string(),
                job.created_at.to_rfc3339(),
                job.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_job(
        &self,
        job_id: &str,
        status: JobStatus,
        progress: &serde_json::Value,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE jobs SET status = ?1, progress_json = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                status.as_str(),
                progress.to_string(),
                Utc::now().to_rfc3339(),
                job_id
            ],
        )?;
        Ok(())
    }

    pub fn get_latest_job(&self, job_type: Option<&str>) -> AppResult<Option<PipelineJob>> {
        let conn = self.conn.lock();
        match job_type {
            Some(t) => conn
                .query_row(
                    "SELECT * FROM jobs WHERE job_type = ?1 ORDER BY updated_at DESC LIMIT 1",
                    params![t],
                    row_to_job,
                )
                .optional()
                .map_err(AppError::from),
            None => conn
                .query_row(
                    "SELECT * FROM jobs ORDER BY updated_at DESC LIMIT 1",
                    [],
                    row_to_job,
                )
                .optional()
                .map_err(AppError::from),
        }
    }

    // -----------------------------------------------------------------------
    // Watched roots
    // -----------------------------------------------------------------------

    /// Add a watched root. Re-adding an existing path is a no-op that
    /// returns the stored record.
    pub fn add_watched_root(&self, path: &str, label: &str) -> AppResult<WatchedRoot> {
        if let Some(existing) = self.get_watched_root(path)? {
            return Ok(existing);
        }
        let root = WatchedRoot {
            id: ids::root_id(path),
            path: path.to_string(),
            label: label.to_string(),
            added_at: Utc::now(),
            last_scan_at: None,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR IGNORE INTO watched_roots (id, path, label, added_at, last_scan_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![root.id, root.path, root.label, root.added_at.to_rfc3339()],
        )?;
        Ok(root)
    }

    pub fn get_watched_root(&self, path: &str) -> AppResult<Option<WatchedRoot>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT * FROM watched_roots WHERE path = ?1",
            params![path],
            row_to_root,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_watched_roots(&self) -> AppResult<Vec<WatchedRoot>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT * FROM watched_roots ORDER BY path")?;
        let rows = stmt.query_map([], row_to_root)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::from)
    }

    pub fn remove_watched_root(&self, path: &str) -> AppResult<bool> {
        let conn = self.conn.lock();
        let removed = conn.execute("DELETE FROM watched_roots WHERE path = ?1", params![path])?;
        Ok(removed > 0)
    }

    pub fn touch_root_scanned(&self, path: &str) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE watched_roots SET last_scan_at = ?1 WHERE path = ?2",
            params![Utc::now().to_rfc3339(), path],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Vectors (persisted rows + cache, mutated together)
    // -----------------------------------------------------------------------

    /// Populate the cache from persisted blobs. The first vector fixes the
    /// cache dimension.
    pub fn load_vectors(&self) -> AppResult<usize> {
        let mut cache = self.cache.write();
        let conn = self.conn.lock();
        cache.clear();
        let mut stmt = conn.prepare(
            "SELECT chunk_id, embedding, text, asset_id, asset_path, anchor_json, pipeline_version
             FROM vectors",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(VectorRecord {
                chunk_id: row.get(0)?,
                vector: blob_to_vec(&row.get::<_, Vec<u8>>(1)?),
                text: row.get(2)?,
                asset_id: row.get(3)?,
                asset_path: row.get(4)?,
                anchor_json: row.get(5)?,
                pipeline_version: row.get(6)?,
            })
        })?;
        let mut loaded = 0usize;
        for row in rows {
            let record = row?;
            cache
                .push(&record)
                .map_err(|e| AppError::Parse(format!("cached vector rejected: {}", e)))?;
            loaded += 1;
        }
        if loaded > 0 {
            info!(loaded, dim = ?cache.dimension(), "vector cache loaded");
        }
        Ok(loaded)
    }

    pub fn set_vector_dimension(&self, dim: usize) {
        self.cache.write().set_dimension(dim);
    }

    /// Persist a batch of vector records and append them to the cache in
    /// one pass under the cache write lock.
    pub fn add_vectors(&self, records: &[VectorRecord]) -> AppResult<()> {
        let mut cache = self.cache.write();
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            for record in records {
                tx.execute(
                    "INSERT OR REPLACE INTO vectors
                     (chunk_id, embedding, text, asset_id, asset_path, anchor_json, pipeline_version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        record.chunk_id,
                        vec_to_blob(&record.vector),
                        record.text,
                        record.asset_id,
                        record.asset_path,
                        record.anchor_json,
                        record.pipeline_version,
                    ],
                )?;
            }
            tx.commit()?;
        }
        for record in records {
            cache
                .push(record)
                .map_err(|e| AppError::Parse(format!("vector rejected: {}", e)))?;
        }
        Ok(())
    }

    pub fn search_vectors(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        self.cache.read().search(query, k)
    }

    pub fn vectors_get_all(&self) -> (Vec<String>, Vec<Vec<f32>>, Vec<String>) {
        self.cache.read().get_all()
    }

    pub fn vector_count(&self) -> usize {
        self.cache.read().len()
    }

    pub fn vector_dimension(&self) -> Option<usize> {
        self.cache.read().dimension()
    }
}

// ---------------------------------------------------------------------------
// Row mappers
// ---------------------------------------------------------------------------

fn parse_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(column)?;
    Ok(DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now()))
}

fn parse_opt_ts(row: &Row<'_>, column: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(column)?;
    Ok(raw.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    }))
}

fn parse_anchor(raw: &str) -> EvidenceAnchor {
    serde_json::from_str(raw).unwrap_or_default()
}

fn row_to_asset(row: &Row<'_>) -> rusqlite::Result<Asset> {
    let status: String = row.get("status")?;
    Ok(Asset {
        id: row.get("id")?,
        path: row.get("path")?,
        filename: row.get("filename")?,
        size_bytes: row.get::<_, i64>("size_bytes")? as u64,
        mtime_ns: row.get("mtime_ns")?,
        content_hash: row.get("content_hash")?,
        mime_type: row.get("mime_type")?,
        scan_version: row.get("scan_version")?,
        status: AssetStatus::parse(&status).unwrap_or(AssetStatus::Pending),
        last_error: row.get("last_error")?,
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
    })
}

fn row_to_atom(row: &Row<'_>) -> rusqlite::Result<ContentAtom> {
    let atom_type: String = row.get("atom_type")?;
    let metadata: Option<String> = row.get("metadata")?;
    let anchor: String = row.get("anchor_json")?;
    Ok(ContentAtom {
        id: row.get("id")?,
        asset_id: row.get("asset_id")?,
        atom_type: AtomType::parse(&atom_type).unwrap_or(AtomType::Binary),
        seq: row.get("seq")?,
        text: row.get("text")?,
        payload_ref: row.get("payload_ref")?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        anchor: parse_anchor(&anchor),
    })
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<Chunk> {
    let anchor: String = row.get("anchor_json")?;
    Ok(Chunk {
        id: row.get("id")?,
        atom_id: row.get("atom_id")?,
        asset_id: row.get("asset_id")?,
        text: row.get("text")?,
        token_count: row.get::<_, i64>("token_count")? as usize,
        chunk_index: row.get("chunk_index")?,
        anchor: parse_anchor(&anchor),
        embedding_ref: row.get("embedding_ref")?,
        pipeline_version: row.get("pipeline_version")?,
    })
}

fn row_to_annotation(row: &Row<'_>) -> rusqlite::Result<Annotation> {
    let payload: String = row.get("payload_json")?;
    Ok(Annotation {
        id: row.get("id")?,
        chunk_id: row.get("chunk_id")?,
        model_id: row.get("model_id")?,
        prompt_id: row.get("prompt_id")?,
        prompt_version: row.get("prompt_version")?,
        pipeline_version: row.get("pipeline_version")?,
        payload: serde_json::from_str::<AnnotationPayload>(&payload).unwrap_or_default(),
        is_current: row.get::<_, i64>("is_current")? != 0,
        created_at: parse_ts(row, "created_at")?,
    })
}

fn row_to_concept(row: &Row<'_>) -> rusqlite::Result<ConceptNode> {
    let exemplars: String = row.get("exemplars_json")?;
    Ok(ConceptNode {
        id: row.get("id")?,
        level: row.get("level")?,
        label: row.get("label")?,
        description: row.get("description")?,
        parent_id: row.get("parent_id")?,
        exemplar_chunk_ids: serde_json::from_str(&exemplars).unwrap_or_default(),
        pipeline_version: row.get("pipeline_version")?,
        model_id: row.get("model_id")?,
        created_at: parse_ts(row, "created_at")?,
    })
}

fn row_to_edge(row: &Row<'_>) -> rusqlite::Result<GraphEdge> {
    let edge_type: String = row.get("edge_type")?;
    let evidence: Option<String> = row.get("evidence_json")?;
    Ok(GraphEdge {
        id: row.get("id")?,
        edge_type: EdgeType::parse(&edge_type).unwrap_or(EdgeType::Similarity),
        source_id: row.get("source_id")?,
        target_id: row.get("target_id")?,
        weight: row.get("weight")?,
        evidence: evidence.and_then(|e| serde_json::from_str(&e).ok()),
        pipeline_version: row.get("pipeline_version")?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<PipelineJob> {
    let status: String = row.get("status")?;
    let progress: String = row.get("progress_json")?;
    Ok(PipelineJob {
        id: row.get("id")?,
        job_type: row.get("job_type")?,
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Pending),
        progress: serde_json::from_str(&progress).unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(row, "created_at")?,
        updated_at: parse_ts(row, "updated_at")?,
    })
}

fn row_to_root(row: &Row<'_>) -> rusqlite::Result<WatchedRoot> {
    Ok(WatchedRoot {
        id: row.get("id")?,
        path: row.get("path")?,
        label: row.get("label")?,
        added_at: parse_ts(row, "added_at")?,
        last_scan_at: parse_opt_ts(row, "last_scan_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PIPELINE_VERSION;

    fn asset(id: &str, path: &str) -> Asset {
        Asset {
            id: id.to_string(),
            path: path.to_string(),
            filename: "a.txt".to_string(),
            size_bytes: 10,
            mtime_ns: 42,
            content_hash: "hash".to_string(),
            mime_type: "text/plain".to_string(),
            scan_version: 1,
            status: AssetStatus::Pending,
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn chunk(id: &str, asset_id: &str, index: i64) -> Chunk {
        Chunk {
            id: id.to_string(),
            atom_id: "atom".to_string(),
            asset_id: asset_id.to_string(),
            text: "some text".to_string(),
            token_count: 2,
            chunk_index: index,
            anchor: EvidenceAnchor::for_asset(asset_id),
            embedding_ref: None,
            pipeline_version: PIPELINE_VERSION.to_string(),
        }
    }

    fn vector(chunk_id: &str, asset_id: &str) -> VectorRecord {
        VectorRecord {
            chunk_id: chunk_id.to_string(),
            vector: vec![0.1, 0.2, 0.3, 0.4],
            text: "some text".to_string(),
            asset_id: asset_id.to_string(),
            asset_path: "/tmp/a.txt".to_string(),
            anchor_json: format!(r#"{{"asset_id":"{}"}}"#, asset_id),
            pipeline_version: PIPELINE_VERSION.to_string(),
        }
    }

    #[test]
    fn asset_upsert_and_lookup() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_asset(&asset("a1", "/tmp/a.txt")).unwrap();
        let found = store.get_asset_by_path("/tmp/a.txt").unwrap().unwrap();
        assert_eq!(found.id, "a1");
        assert_eq!(found.status, AssetStatus::Pending);

        store
            .update_asset_status("a1", AssetStatus::Extracted, None)
            .unwrap();
        let found = store.get_asset("a1").unwrap().unwrap();
        assert_eq!(found.status, AssetStatus::Extracted);
    }

    #[test]
    fn path_conflict_replaces_stale_asset() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_asset(&asset("old", "/tmp/a.txt")).unwrap();
        store.insert_chunks(&[chunk("c1", "old", 0)]).unwrap();

        store.upsert_asset(&asset("new", "/tmp/a.txt")).unwrap();
        assert!(store.get_asset("old").unwrap().is_none());
        assert!(store.get_asset("new").unwrap().is_some());
        assert!(store.list_chunks_by_asset("old").unwrap().is_empty());
    }

    #[test]
    fn annotation_current_flag_flips_atomically() {
        let store = Store::open_in_memory().unwrap();
        let mut first = Annotation {
            id: "ann1".to_string(),
            chunk_id: "c1".to_string(),
            model_id: "m1".to_string(),
            prompt_id: "p".to_string(),
            prompt_version: "1".to_string(),
            pipeline_version: PIPELINE_VERSION.to_string(),
            payload: AnnotationPayload::default(),
            is_current: true,
            created_at: Utc::now(),
        };
        store.insert_annotation(&first).unwrap();
        assert!(store.has_current_annotation_by_model("c1", "m1").unwrap());

        first.id = "ann2".to_string();
        first.model_id = "m2".to_string();
        store.insert_annotation(&first).unwrap();

        let current = store.get_current_annotation("c1").unwrap().unwrap();
        assert_eq!(current.id, "ann2");
        assert_eq!(store.count_current_annotations().unwrap(), 1);
        assert!(!store.has_current_annotation_by_model("c1", "m1").unwrap());
    }

    #[test]
    fn vectors_persist_and_reload() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_asset(&asset("a1", "/tmp/a.txt")).unwrap();
        store.add_vectors(&[vector("c1", "a1")]).unwrap();
        assert_eq!(store.vector_count(), 1);
        assert_eq!(store.vector_dimension(), Some(4));

        // Reload from persisted rows; cache must match.
        let loaded = store.load_vectors().unwrap();
        assert_eq!(loaded, 1);
        let hits = store.search_vectors(&[0.1, 0.2, 0.3, 0.4], 5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].score < 1e-5);
    }

    #[test]
    fn delete_dependents_clears_rows_and_cache() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_asset(&asset("a1", "/tmp/a.txt")).unwrap();
        store.insert_chunks(&[chunk("c1", "a1", 0)]).unwrap();
        store.add_vectors(&[vector("c1", "a1")]).unwrap();

        store.delete_asset_dependents("a1").unwrap();
        assert!(store.list_chunks_by_asset("a1").unwrap().is_empty());
        assert_eq!(store.vector_count(), 0);
        assert_eq!(store.load_vectors().unwrap(), 0);
    }

    #[test]
    fn unembedded_chunks_and_embedding_ref() {
        let store = Store::open_in_memory().unwrap();
        store.upsert_asset(&asset("a1", "/tmp/a.txt")).unwrap();
        store
            .insert_chunks(&[chunk("c1", "a1", 0), chunk("c2", "a1", 1)])
            .unwrap();
        assert_eq!(store.list_unembedded_chunks().unwrap().len(), 2);
        assert!(!store.asset_fully_embedded("a1").unwrap());

        store.set_chunk_embedding_ref("c1", "c1").unwrap();
        store.set_chunk_embedding_ref("c2", "c2").unwrap();
        assert!(store.list_unembedded_chunks().unwrap().is_empty());
        assert!(store.asset_fully_embedded("a1").unwrap());
    }

    #[test]
    fn watched_root_readd_is_noop() {
        let store = Store::open_in_memory().unwrap();
        let first = store.add_watched_root("/tmp/docs", "Docs").unwrap();
        let second = store.add_watched_root("/tmp/docs", "Other").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.label, "Docs");
        assert_eq!(store.list_watched_roots().unwrap().len(), 1);

        assert!(store.remove_watched_root("/tmp/docs").unwrap());
        assert!(!store.remove_watched_root("/tmp/docs").unwrap());
    }
}
