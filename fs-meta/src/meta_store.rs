use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use drv_lib::{chunk_list_size, ChunkDescriptor, DrvError, DrvResult};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension};

use crate::FsPath;

pub type NodeId = i64;

/// The root directory row is created at init with a fixed id.
pub const ROOT_NODE_ID: NodeId = 1;

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
}

impl ToSql for NodeKind {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let s = match self {
            NodeKind::Dir => "dir",
            NodeKind::File => "file",
        };
        Ok(s.into())
    }
}

impl FromSql for NodeKind {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_str()? {
            "file" => Ok(NodeKind::File),
            _ => Ok(NodeKind::Dir),
        }
    }
}

/// One row of the node tree: a file or directory.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub name: String,
    pub kind: NodeKind,
    /// Sum of chunk sizes; always 0 for directories.
    pub size: u64,
    pub mtime: u64,
}

impl NodeRecord {
    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }
}

/// Durable, transactional node tree over SQLite. Node attribute updates and
/// chunk-list replacement happen inside one transaction, so a reader never
/// sees a node whose size disagrees with its chunk list.
pub struct MetaStore {
    pub db_path: String,
    conn: Mutex<Connection>,
}

const NODE_COLUMNS: &str = "id, parent, name, kind, size, mtime";

fn node_from_row(row: &rusqlite::Row) -> rusqlite::Result<NodeRecord> {
    Ok(NodeRecord {
        id: row.get(0)?,
        parent: row.get(1)?,
        name: row.get(2)?,
        kind: row.get(3)?,
        size: row.get::<_, i64>(4)? as u64,
        mtime: row.get::<_, i64>(5)? as u64,
    })
}

fn chunk_from_row(row: &rusqlite::Row) -> rusqlite::Result<ChunkDescriptor> {
    Ok(ChunkDescriptor {
        seq: row.get::<_, i64>(0)? as u32,
        size: row.get::<_, i64>(1)? as u64,
        remote_ref: row.get(2)?,
        checksum: row.get(3)?,
        endpoint: row.get(4)?,
    })
}

fn db_err(context: &str) -> impl Fn(rusqlite::Error) -> DrvError + '_ {
    move |e| {
        warn!("MetaStore: {} failed! {}", context, e);
        DrvError::DbError(e.to_string())
    }
}

fn query_node(conn: &Connection, id: NodeId) -> DrvResult<Option<NodeRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS),
        params![id],
        node_from_row,
    )
    .optional()
    .map_err(db_err("query node"))
}

fn query_child(conn: &Connection, parent: NodeId, name: &str) -> DrvResult<Option<NodeRecord>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM nodes WHERE parent = ?1 AND name = ?2",
            NODE_COLUMNS
        ),
        params![parent, name],
        node_from_row,
    )
    .optional()
    .map_err(db_err("query child"))
}

fn query_chunks(conn: &Connection, node: NodeId) -> DrvResult<Vec<ChunkDescriptor>> {
    let mut stmt = conn
        .prepare(
            "SELECT seq, size, remote_ref, checksum, endpoint
             FROM chunks WHERE node = ?1 ORDER BY seq",
        )
        .map_err(db_err("prepare chunk query"))?;
    let rows = stmt
        .query_map(params![node], chunk_from_row)
        .map_err(db_err("query chunks"))?;
    let mut chunks = Vec::new();
    for row in rows {
        chunks.push(row.map_err(db_err("read chunk row"))?);
    }
    Ok(chunks)
}

fn require_dir(conn: &Connection, id: NodeId) -> DrvResult<NodeRecord> {
    let node =
        query_node(conn, id)?.ok_or_else(|| DrvError::NotFound(format!("node {}", id)))?;
    if !node.is_dir() {
        return Err(DrvError::Invalid(format!(
            "node {} ({}) is not a directory",
            id, node.name
        )));
    }
    Ok(node)
}

impl MetaStore {
    pub fn new(db_path: impl Into<String>) -> DrvResult<Self> {
        let db_path = db_path.into();
        debug!("MetaStore: open db at {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("MetaStore: open db failed! {}", e);
            DrvError::DbError(e.to_string())
        })?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .map_err(db_err("enable foreign keys"))?;
        Self::create_schema(&conn)?;
        Self::ensure_root(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    fn create_schema(conn: &Connection) -> DrvResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                parent INTEGER,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                size INTEGER NOT NULL DEFAULT 0,
                mtime INTEGER NOT NULL,
                UNIQUE(parent, name),
                FOREIGN KEY(parent) REFERENCES nodes(id)
            )",
            [],
        )
        .map_err(db_err("create nodes table"))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                node INTEGER NOT NULL,
                seq INTEGER NOT NULL,
                size INTEGER NOT NULL,
                remote_ref TEXT NOT NULL,
                checksum TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                UNIQUE(node, seq),
                FOREIGN KEY(node) REFERENCES nodes(id) ON DELETE CASCADE
            )",
            [],
        )
        .map_err(db_err("create chunks table"))?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chunks_node ON chunks(node)",
            [],
        )
        .map_err(db_err("create chunk index"))?;
        Ok(())
    }

    fn ensure_root(conn: &Connection) -> DrvResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO nodes (id, parent, name, kind, size, mtime)
             VALUES (?1, NULL, '', 'dir', 0, ?2)",
            params![ROOT_NODE_ID, unix_timestamp() as i64],
        )
        .map_err(db_err("create root dir"))?;
        Ok(())
    }

    pub fn get_node(&self, id: NodeId) -> DrvResult<Option<NodeRecord>> {
        let conn = self.conn.lock().unwrap();
        query_node(&conn, id)
    }

    pub fn lookup_child(&self, parent: NodeId, name: &str) -> DrvResult<Option<NodeRecord>> {
        let conn = self.conn.lock().unwrap();
        query_child(&conn, parent, name)
    }

    /// Walk the tree from the root along the path components.
    pub fn resolve_path(&self, path: &FsPath) -> DrvResult<NodeRecord> {
        let conn = self.conn.lock().unwrap();
        let mut node = query_node(&conn, ROOT_NODE_ID)?
            .ok_or_else(|| DrvError::Internal("root dir missing".to_string()))?;
        for comp in path.components() {
            if !node.is_dir() {
                return Err(DrvError::Invalid(format!(
                    "not a directory on path: {}",
                    path
                )));
            }
            node = query_child(&conn, node.id, comp)?
                .ok_or_else(|| DrvError::NotFound(path.as_str().to_string()))?;
        }
        Ok(node)
    }

    pub fn create_node(
        &self,
        parent: NodeId,
        name: &str,
        kind: NodeKind,
    ) -> DrvResult<NodeRecord> {
        if name.is_empty() || name.contains('/') {
            return Err(DrvError::Invalid(format!("bad node name: {:?}", name)));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;

        require_dir(&tx, parent)?;
        if query_child(&tx, parent, name)?.is_some() {
            return Err(DrvError::Conflict(format!(
                "name already exists: {}",
                name
            )));
        }
        let mtime = unix_timestamp();
        tx.execute(
            "INSERT INTO nodes (parent, name, kind, size, mtime) VALUES (?1, ?2, ?3, 0, ?4)",
            params![parent, name, kind, mtime as i64],
        )
        .map_err(db_err("insert node"))?;
        let id = tx.last_insert_rowid();
        tx.commit().map_err(db_err("commit"))?;

        Ok(NodeRecord {
            id,
            parent: Some(parent),
            name: name.to_string(),
            kind,
            size: 0,
            mtime,
        })
    }

    pub fn list_children(&self, dir: NodeId) -> DrvResult<Vec<NodeRecord>> {
        let conn = self.conn.lock().unwrap();
        require_dir(&conn, dir)?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM nodes WHERE parent = ?1 ORDER BY name",
                NODE_COLUMNS
            ))
            .map_err(db_err("prepare children query"))?;
        let rows = stmt
            .query_map(params![dir], node_from_row)
            .map_err(db_err("query children"))?;
        let mut children = Vec::new();
        for row in rows {
            children.push(row.map_err(db_err("read child row"))?);
        }
        Ok(children)
    }

    pub fn get_chunk_list(&self, node: NodeId) -> DrvResult<Vec<ChunkDescriptor>> {
        let conn = self.conn.lock().unwrap();
        query_chunks(&conn, node)
    }

    /// Replace a file's chunk list and size in one transaction, returning the
    /// replaced descriptors. No reader ever observes a partially-updated
    /// list.
    pub fn replace_chunk_list(
        &self,
        node: NodeId,
        chunks: &[ChunkDescriptor],
    ) -> DrvResult<Vec<ChunkDescriptor>> {
        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.seq as usize != i {
                return Err(DrvError::Invalid(format!(
                    "chunk list is not contiguous: seq {} at position {}",
                    chunk.seq, i
                )));
            }
        }

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;

        let record = query_node(&tx, node)?
            .ok_or_else(|| DrvError::NotFound(format!("node {}", node)))?;
        if !record.is_file() {
            return Err(DrvError::Invalid(format!(
                "node {} ({}) is not a file",
                node, record.name
            )));
        }

        let replaced = query_chunks(&tx, node)?;
        tx.execute("DELETE FROM chunks WHERE node = ?1", params![node])
            .map_err(db_err("delete old chunks"))?;
        for chunk in chunks {
            tx.execute(
                "INSERT INTO chunks (node, seq, size, remote_ref, checksum, endpoint)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    node,
                    chunk.seq as i64,
                    chunk.size as i64,
                    chunk.remote_ref,
                    chunk.checksum,
                    chunk.endpoint,
                ],
            )
            .map_err(db_err("insert chunk"))?;
        }
        tx.execute(
            "UPDATE nodes SET size = ?1, mtime = ?2 WHERE id = ?3",
            params![
                chunk_list_size(chunks) as i64,
                unix_timestamp() as i64,
                node
            ],
        )
        .map_err(db_err("update node size"))?;
        tx.commit().map_err(db_err("commit"))?;
        Ok(replaced)
    }

    /// Remove a node and everything below it in one transaction. Returns all
    /// removed chunk descriptors so the caller can schedule remote cleanup.
    pub fn delete_node(&self, id: NodeId) -> DrvResult<Vec<ChunkDescriptor>> {
        if id == ROOT_NODE_ID {
            return Err(DrvError::Invalid("cannot delete the root dir".to_string()));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;

        if query_node(&tx, id)?.is_none() {
            return Err(DrvError::NotFound(format!("node {}", id)));
        }

        // collect the subtree breadth-first; delete children before parents
        let mut order = vec![id];
        let mut cursor = 0;
        while cursor < order.len() {
            let current = order[cursor];
            cursor += 1;
            let mut stmt = tx
                .prepare("SELECT id FROM nodes WHERE parent = ?1")
                .map_err(db_err("prepare subtree query"))?;
            let rows = stmt
                .query_map(params![current], |row| row.get::<_, NodeId>(0))
                .map_err(db_err("query subtree"))?;
            for row in rows {
                order.push(row.map_err(db_err("read subtree row"))?);
            }
        }

        let mut removed = Vec::new();
        for node in order.iter() {
            removed.extend(query_chunks(&tx, *node)?);
        }
        for node in order.iter().rev() {
            tx.execute("DELETE FROM chunks WHERE node = ?1", params![node])
                .map_err(db_err("delete chunks"))?;
            tx.execute("DELETE FROM nodes WHERE id = ?1", params![node])
                .map_err(db_err("delete node"))?;
        }
        tx.commit().map_err(db_err("commit"))?;

        debug!(
            "delete_node {}: removed {} nodes, {} chunks",
            id,
            order.len(),
            removed.len()
        );
        Ok(removed)
    }

    /// Move/rename a node. Fails with a conflict on a sibling name collision
    /// and on any attempt to move a directory under its own descendant.
    pub fn rename(&self, id: NodeId, new_parent: NodeId, new_name: &str) -> DrvResult<()> {
        if id == ROOT_NODE_ID {
            return Err(DrvError::Invalid("cannot rename the root dir".to_string()));
        }
        if new_name.is_empty() || new_name.contains('/') {
            return Err(DrvError::Invalid(format!("bad node name: {:?}", new_name)));
        }
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(db_err("begin transaction"))?;

        let node = query_node(&tx, id)?
            .ok_or_else(|| DrvError::NotFound(format!("node {}", id)))?;
        require_dir(&tx, new_parent)?;

        if let Some(existing) = query_child(&tx, new_parent, new_name)? {
            if existing.id != id {
                return Err(DrvError::Conflict(format!(
                    "name already exists: {}",
                    new_name
                )));
            }
        }

        // a node may not become its own descendant
        let mut cursor = Some(new_parent);
        while let Some(current) = cursor {
            if current == id {
                return Err(DrvError::Conflict(format!(
                    "cannot move {} under its own subtree",
                    node.name
                )));
            }
            cursor = query_node(&tx, current)?.and_then(|n| n.parent);
        }

        tx.execute(
            "UPDATE nodes SET parent = ?1, name = ?2, mtime = ?3 WHERE id = ?4",
            params![new_parent, new_name, unix_timestamp() as i64, id],
        )
        .map_err(db_err("update node"))?;
        tx.commit().map_err(db_err("commit"))?;
        Ok(())
    }

    pub fn touch(&self, id: NodeId) -> DrvResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE nodes SET mtime = ?1 WHERE id = ?2",
            params![unix_timestamp() as i64, id],
        )
        .map_err(db_err("touch node"))?;
        Ok(())
    }
}
