use std::collections::BTreeMap;
use std::hash::Hasher;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};
use siphasher::sip::SipHasher13;
use tracing::{debug, warn};

use crate::backend::{KvStore, MutationResult};
use crate::error::{Result, Status};
use crate::item::{GetValue, Item};

const KV_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    vbucket INTEGER,
    vb_version INTEGER,
    k BLOB NOT NULL,
    flags INTEGER,
    exptime INTEGER,
    cas INTEGER,
    v BLOB
)";

const STATES_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS vbucket_states (
    vbucket INTEGER,
    vb_version INTEGER,
    state TEXT,
    PRIMARY KEY (vbucket, vb_version)
)";

/// SQLite-backed [`KvStore`].
///
/// With one shard all tables live in a single database file. With more,
/// the kv rows are spread across `<path>-<n>` shard files by key hash
/// while the vbucket-state table stays in the main file; transactions
/// span every connection.
pub struct SqliteKvStore {
    meta: Connection,
    shards: Vec<Connection>,
    in_transaction: bool,
}

impl SqliteKvStore {
    /// Opens (creating if needed) the database at `path` with `shards`
    /// kv shards. `init_file` / `post_init_file` are optional SQL
    /// batches run against the main database around schema creation.
    pub fn open(
        path: &Path,
        shards: usize,
        init_file: Option<&Path>,
        post_init_file: Option<&Path>,
    ) -> Result<Self> {
        let meta = Self::open_conn(path)?;
        if let Some(f) = init_file {
            meta.execute_batch(&std::fs::read_to_string(f)?)?;
        }
        meta.execute(STATES_SCHEMA, [])?;

        let mut shard_conns = Vec::new();
        if shards <= 1 {
            meta.execute(KV_SCHEMA, [])?;
        } else {
            for i in 0..shards {
                let shard_path = PathBuf::from(format!("{}-{}", path.display(), i));
                let conn = Self::open_conn(&shard_path)?;
                conn.execute(KV_SCHEMA, [])?;
                shard_conns.push(conn);
            }
        }
        if let Some(f) = post_init_file {
            meta.execute_batch(&std::fs::read_to_string(f)?)?;
        }
        debug!(path = %path.display(), shards, "kvstore.opened");
        Ok(SqliteKvStore {
            meta,
            shards: shard_conns,
            in_transaction: false,
        })
    }

    fn open_conn(path: &Path) -> Result<Connection> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    fn shard_for(&self, key: &[u8]) -> &Connection {
        if self.shards.is_empty() {
            &self.meta
        } else {
            let mut h = SipHasher13::new_with_keys(0, 0);
            h.write(key);
            &self.shards[(h.finish() % self.shards.len() as u64) as usize]
        }
    }

    fn kv_connections(&self) -> Vec<&Connection> {
        if self.shards.is_empty() {
            vec![&self.meta]
        } else {
            self.shards.iter().collect()
        }
    }

    fn all_connections(&self) -> Vec<&Connection> {
        let mut conns = vec![&self.meta];
        conns.extend(self.shards.iter());
        conns
    }
}

impl KvStore for SqliteKvStore {
    fn begin(&mut self) -> bool {
        if self.in_transaction {
            return true;
        }
        for conn in self.all_connections() {
            if let Err(e) = conn.execute_batch("BEGIN IMMEDIATE") {
                warn!(error = %e, "kvstore.begin_failed");
                for c in self.all_connections() {
                    let _ = c.execute_batch("ROLLBACK");
                }
                return false;
            }
        }
        self.in_transaction = true;
        true
    }

    fn commit(&mut self) -> bool {
        if !self.in_transaction {
            return true;
        }
        let mut ok = true;
        for conn in self.all_connections() {
            if let Err(e) = conn.execute_batch("COMMIT") {
                warn!(error = %e, "kvstore.commit_failed");
                ok = false;
            }
        }
        if ok {
            self.in_transaction = false;
        }
        ok
    }

    fn rollback(&mut self) {
        if self.in_transaction {
            self.in_transaction = false;
            for conn in self.all_connections() {
                let _ = conn.execute_batch("ROLLBACK");
            }
        }
    }

    fn set(&mut self, item: &Item, vb_version: u16) -> MutationResult {
        let conn = self.shard_for(item.key());
        if item.row_id() == -1 {
            let res = conn.execute(
                "INSERT INTO kv (vbucket, vb_version, k, flags, exptime, cas, v)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.vbucket(),
                    vb_version,
                    item.key().as_ref(),
                    item.flags(),
                    item.exptime(),
                    item.cas() as i64,
                    item.value().as_ref(),
                ],
            );
            match res {
                Ok(rows) => MutationResult {
                    rows: rows as i32,
                    new_row_id: conn.last_insert_rowid(),
                },
                Err(e) => {
                    warn!(error = %e, "kvstore.insert_failed");
                    MutationResult {
                        rows: -1,
                        new_row_id: 0,
                    }
                }
            }
        } else {
            let res = conn.execute(
                "UPDATE kv SET vbucket = ?1, vb_version = ?2, k = ?3, flags = ?4,
                 exptime = ?5, cas = ?6, v = ?7 WHERE id = ?8",
                params![
                    item.vbucket(),
                    vb_version,
                    item.key().as_ref(),
                    item.flags(),
                    item.exptime(),
                    item.cas() as i64,
                    item.value().as_ref(),
                    item.row_id(),
                ],
            );
            match res {
                Ok(rows) => MutationResult {
                    rows: rows as i32,
                    new_row_id: 0,
                },
                Err(e) => {
                    warn!(error = %e, "kvstore.update_failed");
                    MutationResult {
                        rows: -1,
                        new_row_id: 0,
                    }
                }
            }
        }
    }

    fn get(&mut self, key: &[u8], row_id: i64) -> GetValue {
        let conn = self.shard_for(key);
        let row = conn.query_row(
            "SELECT k, flags, exptime, cas, v, vbucket, vb_version FROM kv WHERE id = ?1",
            params![row_id],
            |row| {
                let key: Vec<u8> = row.get(0)?;
                let flags: u32 = row.get(1)?;
                let exptime: u32 = row.get(2)?;
                let cas: i64 = row.get(3)?;
                let value: Vec<u8> = row.get(4)?;
                let vbucket: u16 = row.get(5)?;
                let vb_version: u16 = row.get(6)?;
                Ok((key, flags, exptime, cas, value, vbucket, vb_version))
            },
        );
        match row {
            Ok((key, flags, exptime, cas, value, vbucket, vb_version)) => {
                let item = Item::with_meta(key, flags, exptime, value, cas as u64, row_id, vbucket);
                let mut gv = GetValue::hit(item, row_id);
                gv.vb_version = vb_version;
                gv
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => GetValue::miss(Status::KeyNotFound),
            Err(e) => {
                warn!(error = %e, "kvstore.get_failed");
                GetValue::miss(Status::Failed)
            }
        }
    }

    fn del(&mut self, key: &[u8], row_id: i64) -> i32 {
        let conn = self.shard_for(key);
        match conn.execute("DELETE FROM kv WHERE id = ?1", params![row_id]) {
            Ok(rows) => rows as i32,
            Err(e) => {
                warn!(error = %e, "kvstore.del_failed");
                -1
            }
        }
    }

    fn del_vbucket(&mut self, vbucket: u16, vb_version: u16, range: (i64, i64)) -> bool {
        let mut ok = true;
        for conn in self.kv_connections() {
            let res = conn.execute(
                "DELETE FROM kv WHERE vbucket = ?1 AND vb_version = ?2 AND id BETWEEN ?3 AND ?4",
                params![vbucket, vb_version, range.0, range.1],
            );
            if let Err(e) = res {
                warn!(error = %e, vbucket, "kvstore.del_vbucket_failed");
                ok = false;
            }
        }
        ok
    }

    fn snapshot_vbuckets(&mut self, states: &BTreeMap<(u16, u16), String>) -> bool {
        if let Err(e) = self.meta.execute("DELETE FROM vbucket_states", []) {
            warn!(error = %e, "kvstore.snapshot_clear_failed");
            return false;
        }
        for ((vbucket, version), state) in states {
            let res = self.meta.execute(
                "INSERT INTO vbucket_states (vbucket, vb_version, state) VALUES (?1, ?2, ?3)",
                params![vbucket, version, state],
            );
            if let Err(e) = res {
                warn!(error = %e, vbucket, "kvstore.snapshot_insert_failed");
                return false;
            }
        }
        true
    }

    fn list_persisted_vbuckets(&mut self) -> BTreeMap<(u16, u16), String> {
        let mut states = BTreeMap::new();
        let mut stmt = match self
            .meta
            .prepare("SELECT vbucket, vb_version, state FROM vbucket_states")
        {
            Ok(stmt) => stmt,
            Err(e) => {
                warn!(error = %e, "kvstore.list_states_failed");
                return states;
            }
        };
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, u16>(0)?,
                row.get::<_, u16>(1)?,
                row.get::<_, String>(2)?,
            ))
        });
        if let Ok(rows) = rows {
            for row in rows.flatten() {
                states.insert((row.0, row.1), row.2);
            }
        }
        states
    }

    fn dump(&mut self, cb: &mut dyn FnMut(GetValue)) {
        for conn in self.kv_connections() {
            let mut stmt = match conn
                .prepare("SELECT id, vbucket, vb_version, k, flags, exptime, cas, v FROM kv")
            {
                Ok(stmt) => stmt,
                Err(e) => {
                    warn!(error = %e, "kvstore.dump_failed");
                    continue;
                }
            };
            let rows = stmt.query_map([], |row| {
                let row_id: i64 = row.get(0)?;
                let vbucket: u16 = row.get(1)?;
                let vb_version: u16 = row.get(2)?;
                let key: Vec<u8> = row.get(3)?;
                let flags: u32 = row.get(4)?;
                let exptime: u32 = row.get(5)?;
                let cas: i64 = row.get(6)?;
                let value: Vec<u8> = row.get(7)?;
                Ok((row_id, vbucket, vb_version, key, flags, exptime, cas, value))
            });
            if let Ok(rows) = rows {
                for row in rows.flatten() {
                    let (row_id, vbucket, vb_version, key, flags, exptime, cas, value) = row;
                    let item =
                        Item::with_meta(key, flags, exptime, value, cas as u64, row_id, vbucket);
                    let mut gv = GetValue::hit(item, row_id);
                    gv.vb_version = vb_version;
                    cb(gv);
                }
            }
        }
    }

    fn reset(&mut self) {
        for conn in self.kv_connections() {
            if let Err(e) = conn.execute("DELETE FROM kv", []) {
                warn!(error = %e, "kvstore.reset_failed");
            }
        }
        if let Err(e) = self.meta.execute("DELETE FROM vbucket_states", []) {
            warn!(error = %e, "kvstore.reset_states_failed");
        }
    }
}
