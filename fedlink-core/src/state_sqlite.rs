use crate::id::{generate_id, sint64_to_uint64, uint64_to_sint64};
use crate::liveness::{node_unavailable_res, online_until};
use crate::state::LinkState;
use crate::task::{now_epoch, now_rfc3339, ConfigRecord, NodeRef, Run, Task, TaskIns, TaskRes};
use crate::validate::{validate_task_ins, validate_task_res};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::collections::HashSet;
use std::str::FromStr;
use uuid::Uuid;

const SQL_CREATE_TABLE_NODE: &str = r#"
    CREATE TABLE IF NOT EXISTS node (
        node_id       INTEGER UNIQUE,
        online_until  REAL,
        ping_interval REAL,
        public_key    BLOB UNIQUE
    )
"#;

const SQL_CREATE_INDEX_ONLINE_UNTIL: &str = r#"
    CREATE INDEX IF NOT EXISTS idx_online_until ON node (online_until)
"#;

const SQL_CREATE_TABLE_RUN: &str = r#"
    CREATE TABLE IF NOT EXISTS run (
        run_id          INTEGER UNIQUE,
        fab_id          TEXT,
        fab_version     TEXT,
        fab_hash        TEXT,
        override_config TEXT
    )
"#;

const SQL_CREATE_TABLE_CREDENTIAL: &str = r#"
    CREATE TABLE IF NOT EXISTS credential (
        private_key BLOB PRIMARY KEY,
        public_key  BLOB
    )
"#;

const SQL_CREATE_TABLE_PUBLIC_KEY: &str = r#"
    CREATE TABLE IF NOT EXISTS public_key (
        public_key BLOB PRIMARY KEY
    )
"#;

const SQL_CREATE_TABLE_TASK_INS: &str = r#"
    CREATE TABLE IF NOT EXISTS task_ins (
        task_id            TEXT UNIQUE,
        group_id           TEXT,
        run_id             INTEGER,
        producer_anonymous BOOLEAN,
        producer_node_id   INTEGER,
        consumer_anonymous BOOLEAN,
        consumer_node_id   INTEGER,
        created_at         TEXT,
        delivered_at       TEXT,
        pushed_at          REAL,
        ttl                REAL,
        ancestry           TEXT,
        task_type          TEXT,
        recordset          BLOB,
        FOREIGN KEY (run_id) REFERENCES run (run_id)
    )
"#;

const SQL_CREATE_TABLE_TASK_RES: &str = r#"
    CREATE TABLE IF NOT EXISTS task_res (
        task_id            TEXT UNIQUE,
        group_id           TEXT,
        run_id             INTEGER,
        producer_anonymous BOOLEAN,
        producer_node_id   INTEGER,
        consumer_anonymous BOOLEAN,
        consumer_node_id   INTEGER,
        created_at         TEXT,
        delivered_at       TEXT,
        pushed_at          REAL,
        ttl                REAL,
        ancestry           TEXT,
        task_type          TEXT,
        recordset          BLOB,
        FOREIGN KEY (run_id) REFERENCES run (run_id)
    )
"#;

const TASK_FIELDS: &str = "task_id, group_id, run_id, \
     producer_anonymous, producer_node_id, consumer_anonymous, consumer_node_id, \
     created_at, delivered_at, pushed_at, ttl, ancestry, task_type, recordset";

/// SQLite-backed implementation of `LinkState`.
///
/// The pool is capped at one connection: the store is single-writer,
/// and a `:memory:` database then serves every caller through the same
/// connection, so tests exercise the production code path unchanged.
/// Statements are logged at DEBUG when the query tracer is wanted.
#[derive(Clone)]
pub struct SqliteState {
    pool: sqlx::SqlitePool,
}

impl SqliteState {
    /// Open (or create) the database at `database_path`. `:memory:`
    /// gives a private in-memory database.
    pub async fn new(database_path: &str) -> Result<Self> {
        let options = if database_path == ":memory:" {
            SqliteConnectOptions::from_str("sqlite::memory:")?
        } else {
            SqliteConnectOptions::new()
                .filename(database_path)
                .create_if_missing(true)
        };
        let options = options
            .foreign_keys(true)
            .log_statements(log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open link state at {database_path}"))?;

        Ok(Self { pool })
    }

    /// Create all tables if absent and the online-horizon index.
    pub async fn init(&self) -> Result<()> {
        for sql in [
            SQL_CREATE_TABLE_RUN,
            SQL_CREATE_TABLE_NODE,
            SQL_CREATE_INDEX_ONLINE_UNTIL,
            SQL_CREATE_TABLE_CREDENTIAL,
            SQL_CREATE_TABLE_PUBLIC_KEY,
            SQL_CREATE_TABLE_TASK_INS,
            SQL_CREATE_TABLE_TASK_RES,
        ] {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .context("failed to initialize link state schema")?;
        }
        Ok(())
    }
}

// ── Row ↔ task conversions ──

fn join_ancestry(ancestry: &[String]) -> String {
    ancestry.join(",")
}

fn split_ancestry(ancestry: &str) -> Vec<String> {
    if ancestry.is_empty() {
        Vec::new()
    } else {
        ancestry.split(',').map(str::to_string).collect()
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn task_parts_from_row(row: &SqliteRow) -> Result<(String, String, u64, Task)> {
    let run_id: i64 = row.try_get("run_id")?;
    let producer_node_id: i64 = row.try_get("producer_node_id")?;
    let consumer_node_id: i64 = row.try_get("consumer_node_id")?;
    let ancestry: String = row.try_get("ancestry")?;

    let task = Task {
        producer: NodeRef {
            node_id: sint64_to_uint64(producer_node_id),
            anonymous: row.try_get("producer_anonymous")?,
        },
        consumer: NodeRef {
            node_id: sint64_to_uint64(consumer_node_id),
            anonymous: row.try_get("consumer_anonymous")?,
        },
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
        pushed_at: row.try_get("pushed_at")?,
        ttl: row.try_get("ttl")?,
        ancestry: split_ancestry(&ancestry),
        task_type: row.try_get("task_type")?,
        recordset: row.try_get("recordset")?,
    };
    Ok((
        row.try_get("task_id")?,
        row.try_get("group_id")?,
        sint64_to_uint64(run_id),
        task,
    ))
}

fn task_ins_from_row(row: &SqliteRow) -> Result<TaskIns> {
    let (task_id, group_id, run_id, task) = task_parts_from_row(row)?;
    Ok(TaskIns {
        task_id,
        group_id,
        run_id,
        task,
    })
}

fn task_res_from_row(row: &SqliteRow) -> Result<TaskRes> {
    let (task_id, group_id, run_id, task) = task_parts_from_row(row)?;
    Ok(TaskRes {
        task_id,
        group_id,
        run_id,
        task,
    })
}

fn bind_task<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    task_id: &'q str,
    group_id: &'q str,
    run_id: u64,
    task: &'q Task,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(task_id)
        .bind(group_id)
        .bind(uint64_to_sint64(run_id))
        .bind(task.producer.anonymous)
        .bind(uint64_to_sint64(task.producer.node_id))
        .bind(task.consumer.anonymous)
        .bind(uint64_to_sint64(task.consumer.node_id))
        .bind(&task.created_at)
        .bind(&task.delivered_at)
        .bind(task.pushed_at)
        .bind(task.ttl)
        .bind(join_ancestry(&task.ancestry))
        .bind(&task.task_type)
        .bind(&task.recordset)
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.kind() == sqlx::error::ErrorKind::ForeignKeyViolation)
        .unwrap_or(false)
}

#[async_trait]
impl LinkState for SqliteState {
    // ── Task instructions ──

    async fn store_task_ins(&self, mut ins: TaskIns) -> Result<Option<String>> {
        let errors = validate_task_ins(&ins);
        if !errors.is_empty() {
            tracing::error!(?errors, "refusing invalid task instruction");
            return Ok(None);
        }

        let task_id = Uuid::new_v4().to_string();
        ins.task_id = task_id.clone();

        let sql = format!(
            "INSERT INTO task_ins ({TASK_FIELDS}) VALUES ({})",
            placeholders(14)
        );
        let query = bind_task(
            sqlx::query(&sql),
            &ins.task_id,
            &ins.group_id,
            ins.run_id,
            &ins.task,
        );
        match query.execute(&self.pool).await {
            Ok(_) => Ok(Some(task_id)),
            Err(err) if is_foreign_key_violation(&err) => {
                tracing::error!(run_id = ins.run_id, "task instruction references unknown run");
                Ok(None)
            }
            Err(err) => Err(err).context("failed to store task instruction"),
        }
    }

    async fn get_task_ins(
        &self,
        node_id: Option<u64>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskIns>> {
        if limit == Some(0) {
            bail!("`limit` must be greater than zero");
        }
        if node_id == Some(0) {
            bail!("`node_id` must not be zero; anonymous callers pass no node id");
        }
        let lim = limit.map(i64::from).unwrap_or(-1);

        let mut tx = self.pool.begin().await?;

        let rows = match node_id {
            Some(id) => {
                let sql = format!(
                    "SELECT {TASK_FIELDS} FROM task_ins \
                     WHERE consumer_anonymous = 0 AND consumer_node_id = ? \
                       AND delivered_at = '' \
                     LIMIT ?"
                );
                sqlx::query(&sql)
                    .bind(uint64_to_sint64(id))
                    .bind(lim)
                    .fetch_all(&mut *tx)
                    .await?
            }
            None => {
                let sql = format!(
                    "SELECT {TASK_FIELDS} FROM task_ins \
                     WHERE consumer_anonymous = 1 AND consumer_node_id = 0 \
                       AND delivered_at = '' \
                     LIMIT ?"
                );
                sqlx::query(&sql).bind(lim).fetch_all(&mut *tx).await?
            }
        };
        let mut task_ins_list = rows
            .iter()
            .map(task_ins_from_row)
            .collect::<Result<Vec<_>>>()?;

        // The delivery mark commits with the select, so a row handed
        // out here is invisible to every concurrent pull.
        if !task_ins_list.is_empty() {
            let delivered_at = now_rfc3339();
            let sql = format!(
                "UPDATE task_ins SET delivered_at = ? WHERE task_id IN ({})",
                placeholders(task_ins_list.len())
            );
            let mut query = sqlx::query(&sql).bind(&delivered_at);
            for ins in &task_ins_list {
                query = query.bind(&ins.task_id);
            }
            query.execute(&mut *tx).await?;
            for ins in &mut task_ins_list {
                ins.task.delivered_at = delivered_at.clone();
            }
        }

        tx.commit().await?;
        Ok(task_ins_list)
    }

    // ── Task results ──

    async fn store_task_res(&self, mut res: TaskRes) -> Result<Option<String>> {
        let errors = validate_task_res(&res);
        if !errors.is_empty() {
            tracing::error!(?errors, "refusing invalid task result");
            return Ok(None);
        }

        let task_id = Uuid::new_v4().to_string();
        res.task_id = task_id.clone();

        let sql = format!(
            "INSERT INTO task_res ({TASK_FIELDS}) VALUES ({})",
            placeholders(14)
        );
        let query = bind_task(
            sqlx::query(&sql),
            &res.task_id,
            &res.group_id,
            res.run_id,
            &res.task,
        );
        match query.execute(&self.pool).await {
            Ok(_) => Ok(Some(task_id)),
            Err(err) if is_foreign_key_violation(&err) => {
                tracing::error!(run_id = res.run_id, "task result references unknown run");
                Ok(None)
            }
            Err(err) => Err(err).context("failed to store task result"),
        }
    }

    async fn get_task_res(
        &self,
        task_ids: &HashSet<String>,
        limit: Option<u32>,
    ) -> Result<Vec<TaskRes>> {
        if limit == Some(0) {
            bail!("`limit` must be greater than zero");
        }
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&String> = task_ids.iter().collect();
        let lim = limit.map(i64::from).unwrap_or(-1);

        let mut tx = self.pool.begin().await?;

        // Replies that actually arrived, fetched and marked delivered
        // in the same transaction (reply uniqueness).
        let sql = format!(
            "SELECT {TASK_FIELDS} FROM task_res \
             WHERE ancestry IN ({}) AND delivered_at = '' \
             LIMIT ?",
            placeholders(ids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }
        let rows = query.bind(lim).fetch_all(&mut *tx).await?;
        let mut replies = rows
            .iter()
            .map(task_res_from_row)
            .collect::<Result<Vec<_>>>()?;

        if !replies.is_empty() {
            let delivered_at = now_rfc3339();
            let sql = format!(
                "UPDATE task_res SET delivered_at = ? WHERE task_id IN ({})",
                placeholders(replies.len())
            );
            let mut query = sqlx::query(&sql).bind(&delivered_at);
            for res in &replies {
                query = query.bind(&res.task_id);
            }
            query.execute(&mut *tx).await?;
            for res in &mut replies {
                res.task.delivered_at = delivered_at.clone();
            }
        }

        // Instructions still unanswered: substitute a reply for each
        // one whose consumer node is past its online horizon.
        let answered: HashSet<&str> = replies
            .iter()
            .filter_map(|res| res.task.ancestry.first().map(String::as_str))
            .collect();
        let remaining: Vec<&String> = ids
            .iter()
            .copied()
            .filter(|id| !answered.contains(id.as_str()))
            .collect();

        let mut substitutes = Vec::new();
        if !remaining.is_empty() {
            let sql = format!(
                "SELECT {TASK_FIELDS} FROM task_ins WHERE task_id IN ({})",
                placeholders(remaining.len())
            );
            let mut query = sqlx::query(&sql);
            for id in &remaining {
                query = query.bind(*id);
            }
            let ins_rows = query.fetch_all(&mut *tx).await?;
            let pending = ins_rows
                .iter()
                .map(task_ins_from_row)
                .collect::<Result<Vec<_>>>()?;

            let consumers: HashSet<u64> = pending
                .iter()
                .filter(|ins| !ins.task.consumer.anonymous)
                .map(|ins| ins.task.consumer.node_id)
                .collect();
            if !consumers.is_empty() {
                let sql = format!(
                    "SELECT node_id FROM node \
                     WHERE node_id IN ({}) AND online_until < ?",
                    placeholders(consumers.len())
                );
                let mut query = sqlx::query(&sql);
                for id in &consumers {
                    query = query.bind(uint64_to_sint64(*id));
                }
                let offline_rows = query.bind(now_epoch()).fetch_all(&mut *tx).await?;
                let mut offline = HashSet::new();
                for row in &offline_rows {
                    offline.insert(sint64_to_uint64(row.try_get("node_id")?));
                }

                for ins in &pending {
                    if !offline.contains(&ins.task.consumer.node_id) {
                        continue;
                    }
                    if let Some(l) = limit {
                        if replies.len() + substitutes.len() >= l as usize {
                            break;
                        }
                    }
                    substitutes.push(node_unavailable_res(ins));
                }
            }
        }

        tx.commit().await?;

        replies.extend(substitutes);
        Ok(replies)
    }

    // ── Bookkeeping ──

    async fn num_task_ins(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM task_ins")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn num_task_res(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM task_res")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn delete_tasks(&self, task_ids: &HashSet<String>) -> Result<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let ids: Vec<&String> = task_ids.iter().collect();
        let ph = placeholders(ids.len());

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "DELETE FROM task_ins \
             WHERE delivered_at != '' \
               AND task_id IN ( \
                   SELECT ancestry FROM task_res \
                   WHERE ancestry IN ({ph}) AND delivered_at != '')"
        );
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }
        query.execute(&mut *tx).await?;

        let sql = format!("DELETE FROM task_res WHERE ancestry IN ({ph}) AND delivered_at != ''");
        let mut query = sqlx::query(&sql);
        for id in &ids {
            query = query.bind(*id);
        }
        query.execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    // ── Nodes ──

    async fn create_node(&self, ping_interval: f64, public_key: Option<&[u8]>) -> Result<u64> {
        if let Some(key) = public_key {
            if self.get_node_id(key).await?.is_some() {
                bail!("public key is already bound to a node");
            }
        }

        let node_id = generate_id();
        let horizon = online_until(now_epoch(), ping_interval);
        sqlx::query(
            "INSERT INTO node (node_id, online_until, ping_interval, public_key) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(uint64_to_sint64(node_id))
        .bind(horizon)
        .bind(ping_interval)
        .bind(public_key)
        .execute(&self.pool)
        .await
        .context("failed to register node")?;
        Ok(node_id)
    }

    async fn delete_node(&self, node_id: u64, public_key: Option<&[u8]>) -> Result<()> {
        let result = match public_key {
            Some(key) => {
                sqlx::query("DELETE FROM node WHERE node_id = ? AND public_key = ?")
                    .bind(uint64_to_sint64(node_id))
                    .bind(key)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM node WHERE node_id = ?")
                    .bind(uint64_to_sint64(node_id))
                    .execute(&self.pool)
                    .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(anyhow!("node not found: {node_id}"));
        }
        Ok(())
    }

    async fn get_nodes(&self, run_id: u64) -> Result<HashSet<u64>> {
        let run = sqlx::query("SELECT run_id FROM run WHERE run_id = ?")
            .bind(uint64_to_sint64(run_id))
            .fetch_optional(&self.pool)
            .await?;
        if run.is_none() {
            tracing::warn!(run_id, "`get_nodes` called for unknown run");
            return Ok(HashSet::new());
        }

        let rows = sqlx::query("SELECT node_id FROM node WHERE online_until > ?")
            .bind(now_epoch())
            .fetch_all(&self.pool)
            .await?;
        let mut nodes = HashSet::new();
        for row in &rows {
            nodes.insert(sint64_to_uint64(row.try_get("node_id")?));
        }
        Ok(nodes)
    }

    async fn get_node_id(&self, public_key: &[u8]) -> Result<Option<u64>> {
        let row = sqlx::query("SELECT node_id FROM node WHERE public_key = ?")
            .bind(public_key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(sint64_to_uint64(row.try_get("node_id")?))),
            None => Ok(None),
        }
    }

    async fn acknowledge_ping(&self, node_id: u64, ping_interval: f64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE node SET online_until = ?, ping_interval = ? WHERE node_id = ?",
        )
        .bind(online_until(now_epoch(), ping_interval))
        .bind(ping_interval)
        .bind(uint64_to_sint64(node_id))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Runs ──

    async fn create_run(
        &self,
        fab_id: &str,
        fab_version: &str,
        fab_hash: &str,
        override_config: ConfigRecord,
    ) -> Result<u64> {
        let run_id = generate_id();
        let config = serde_json::to_string(&override_config)?;

        // A run is referenced either by a pre-installed content hash
        // or by its id/version pair, never both.
        let (fab_id, fab_version, fab_hash) = if !fab_hash.is_empty() {
            ("", "", fab_hash)
        } else {
            (fab_id, fab_version, "")
        };

        sqlx::query(
            "INSERT INTO run (run_id, fab_id, fab_version, fab_hash, override_config) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(uint64_to_sint64(run_id))
        .bind(fab_id)
        .bind(fab_version)
        .bind(fab_hash)
        .bind(config)
        .execute(&self.pool)
        .await
        .context("failed to create run")?;
        Ok(run_id)
    }

    async fn get_run(&self, run_id: u64) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT run_id, fab_id, fab_version, fab_hash, override_config \
             FROM run WHERE run_id = ?",
        )
        .bind(uint64_to_sint64(run_id))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let config: String = row.try_get("override_config")?;
                let run_id: i64 = row.try_get("run_id")?;
                Ok(Some(Run {
                    run_id: sint64_to_uint64(run_id),
                    fab_id: row.try_get("fab_id")?,
                    fab_version: row.try_get("fab_version")?,
                    fab_hash: row.try_get("fab_hash")?,
                    override_config: serde_json::from_str(&config)
                        .context("corrupt override_config column")?,
                }))
            }
        }
    }

    // ── Server credential ──

    async fn store_server_private_public_key(
        &self,
        private_key: &[u8],
        public_key: &[u8],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM credential")
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 {
            bail!("server credential already stored; the keypair is written exactly once");
        }
        sqlx::query("INSERT INTO credential (private_key, public_key) VALUES (?, ?)")
            .bind(private_key)
            .bind(public_key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_server_private_key(&self) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT private_key FROM credential")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("private_key")).transpose()?)
    }

    async fn get_server_public_key(&self) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT public_key FROM credential")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("public_key")).transpose()?)
    }

    // ── Registered node public keys ──

    async fn store_node_public_keys(&self, public_keys: HashSet<Vec<u8>>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for key in &public_keys {
            sqlx::query("INSERT OR IGNORE INTO public_key (public_key) VALUES (?)")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn store_node_public_key(&self, public_key: Vec<u8>) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO public_key (public_key) VALUES (?)")
            .bind(&public_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_node_public_keys(&self) -> Result<HashSet<Vec<u8>>> {
        let rows = sqlx::query("SELECT public_key FROM public_key")
            .fetch_all(&self.pool)
            .await?;
        let mut keys = HashSet::new();
        for row in &rows {
            keys.insert(row.try_get("public_key")?);
        }
        Ok(keys)
    }
}
