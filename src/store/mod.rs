use crate::{
    error::{AppResult, ErrorReason},
    types::{CertRow, StateKind, StateRow, Validity},
};
use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    Row, SqlitePool,
};
use std::{path::Path, str::FromStr, time::Duration};
use tokio::sync::{mpsc, oneshot};

mod writer;

pub use writer::{SqlParam, Statement, StoreWriter, WriteRequest};

pub const DB_FILENAME: &str = "local.db";

const WRITER_QUEUE: usize = 1;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS states(
        id INTEGER NOT NULL PRIMARY KEY,
        host TEXT NOT NULL,
        sni TEXT NOT NULL DEFAULT '',
        kind INTEGER NOT NULL DEFAULT 0,
        valid INTEGER NOT NULL DEFAULT -1,
        description TEXT NOT NULL DEFAULT '',
        ts timestamp,
        last_discovery timestamp
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS states_dx ON states (host, sni)",
    "CREATE TABLE IF NOT EXISTS certs(
        id INTEGER NOT NULL PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        subject_hash TEXT NOT NULL DEFAULT '',
        issuer_hash TEXT NOT NULL DEFAULT '',
        common_name TEXT NOT NULL DEFAULT '',
        domains TEXT NOT NULL DEFAULT '',
        not_after timestamp,
        not_before timestamp
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS certs_dx ON certs (fingerprint)",
    "CREATE TABLE IF NOT EXISTS state_certs(
        id INTEGER NOT NULL PRIMARY KEY,
        state_id INTEGER,
        fingerprint TEXT
    )",
    "CREATE VIEW IF NOT EXISTS vCerts AS
        SELECT certs.*,
               CAST((strftime('%s', not_after) - strftime('%s', 'now')) / 86400 AS INTEGER) AS expired
        FROM certs",
    "CREATE VIEW IF NOT EXISTS vStates AS
        SELECT s.id AS state_id, host, sni, kind, valid, description,
               c.id AS cert_id, c.fingerprint, issuer_hash, subject_hash,
               common_name, domains, not_after, not_before, expired
        FROM states AS s
            INNER JOIN state_certs AS sc ON s.id = sc.state_id
            INNER JOIN vCerts AS c ON c.fingerprint = sc.fingerprint",
];

const STATE_COLUMNS: &str = "id, host, sni, kind, valid, description, ts, last_discovery";
const CERT_COLUMNS: &str =
    "id, fingerprint, subject_hash, issuer_hash, common_name, domains, not_after, not_before, expired";
const STATE_CERT_COLUMNS: &str = "state_id, host, sni, kind, valid, description, cert_id, \
     fingerprint, subject_hash, issuer_hash, common_name, domains, not_after, not_before, expired";

/// Durable store of monitored endpoints and the certificates they served.
///
/// Reads run directly against the pool; every mutation is funneled through
/// the [`StoreWriter`] so writes form a single linear history.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
    writer: mpsc::Sender<WriteRequest>,
}

impl Store {
    /// Opens (creating if missing) the database file and prepares the write
    /// funnel. The returned [`StoreWriter`] must be spawned by the caller.
    pub async fn open(path: impl AsRef<Path>) -> AppResult<(Self, StoreWriter)> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(ErrorReason::Database)?;

        Self::with_pool(pool).await
    }

    /// An ephemeral in-memory store, mainly for tests.
    pub async fn open_in_memory() -> AppResult<(Self, StoreWriter)> {
        let options =
            SqliteConnectOptions::from_str("sqlite::memory:").map_err(ErrorReason::Database)?;
        // A single connection keeps every handle on the same in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(ErrorReason::Database)?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> AppResult<(Self, StoreWriter)> {
        let (tx, rx) = mpsc::channel(WRITER_QUEUE);
        let store = Self { pool: pool.clone(), writer: tx };
        store.init_schema().await?;
        Ok((store, StoreWriter::new(pool, rx)))
    }

    async fn init_schema(&self) -> AppResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(ErrorReason::Database)?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Database is closed");
    }

    /// Submits a list of statements to run as one transaction.
    async fn single_write(&self, statements: Vec<Statement>) -> AppResult<()> {
        let (reply, outcome) = oneshot::channel();
        self.writer
            .send(WriteRequest { statements, reply })
            .await
            .map_err(|_| ErrorReason::WriterClosed)?;
        outcome.await.map_err(|_| ErrorReason::WriterClosed)??;
        Ok(())
    }

    // ---- reads ----

    pub async fn get_states(&self) -> Vec<StateRow> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM states");
        match sqlx::query_as(&sql).fetch_all(&self.pool).await {
            Ok(states) => states,
            Err(e) => {
                error!("Failed to read states: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn get_state_by_id(&self, id: i64) -> Option<StateRow> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM states WHERE id = ?");
        match sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to read state {}: {}", id, e);
                None
            }
        }
    }

    pub async fn get_states_by_valid(&self, validity: Validity) -> Vec<StateRow> {
        let sql = format!("SELECT {STATE_COLUMNS} FROM states WHERE valid = ?");
        match sqlx::query_as(&sql)
            .bind(validity as i32)
            .fetch_all(&self.pool)
            .await
        {
            Ok(states) => states,
            Err(e) => {
                error!("Failed to read states by validity: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn get_certificates(&self) -> Vec<CertRow> {
        let sql = format!("SELECT {CERT_COLUMNS} FROM vCerts");
        match sqlx::query_as(&sql).fetch_all(&self.pool).await {
            Ok(certs) => certs,
            Err(e) => {
                error!("Failed to read certificates: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn get_certificate_by_id(&self, id: i64) -> Option<CertRow> {
        let sql = format!("SELECT {CERT_COLUMNS} FROM vCerts WHERE id = ?");
        match sqlx::query_as(&sql).bind(id).fetch_optional(&self.pool).await {
            Ok(cert) => cert,
            Err(e) => {
                error!("Failed to read certificate {}: {}", id, e);
                None
            }
        }
    }

    /// Certificates expiring in less than `days` days (negative = expired).
    pub async fn get_certificates_by_expire(&self, days: i64) -> Vec<CertRow> {
        let sql = format!("SELECT {CERT_COLUMNS} FROM vCerts WHERE expired < ?");
        match sqlx::query_as(&sql).bind(days).fetch_all(&self.pool).await {
            Ok(certs) => certs,
            Err(e) => {
                error!("Failed to read certificates by expiry: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn get_states_with_certs(&self) -> Vec<StateRow> {
        let sql = format!("SELECT {STATE_CERT_COLUMNS} FROM vStates");
        self.read_grouped_states(sqlx::query(&sql)).await
    }

    pub async fn get_states_by_expire(&self, days: i64) -> Vec<StateRow> {
        let sql = format!("SELECT {STATE_CERT_COLUMNS} FROM vStates WHERE expired < ?");
        self.read_grouped_states(sqlx::query(&sql).bind(days)).await
    }

    /// The `vStates` join yields one row per (state, cert) pair; rows sharing
    /// a state id are merged into one state carrying its certificate list.
    async fn read_grouped_states<'a>(
        &self,
        query: sqlx::query::Query<'a, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'a>>,
    ) -> Vec<StateRow> {
        let rows = match query.fetch_all(&self.pool).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to read state certificates: {}", e);
                return Vec::new();
            }
        };

        let mut states: Vec<StateRow> = Vec::new();
        for row in rows {
            match Self::split_state_cert_row(&row) {
                Ok((state, cert)) => {
                    if let Some(existing) = states.iter_mut().find(|s| s.id == state.id) {
                        existing.certificates.push(cert);
                    } else {
                        let mut state = state;
                        state.certificates.push(cert);
                        states.push(state);
                    }
                }
                Err(e) => {
                    error!("Failed to decode state certificate row: {}", e);
                    break;
                }
            }
        }
        states
    }

    fn split_state_cert_row(
        row: &sqlx::sqlite::SqliteRow,
    ) -> Result<(StateRow, CertRow), sqlx::Error> {
        let state = StateRow {
            id: row.try_get("state_id")?,
            host: row.try_get("host")?,
            sni: row.try_get("sni")?,
            kind: row.try_get("kind")?,
            validity: row.try_get("valid")?,
            description: row.try_get("description")?,
            ts: None,
            last_discovery: None,
            certificates: Vec::new(),
        };
        let cert = CertRow {
            id: row.try_get("cert_id")?,
            fingerprint: row.try_get("fingerprint")?,
            subject_hash: row.try_get("subject_hash")?,
            issuer_hash: row.try_get("issuer_hash")?,
            common_name: row.try_get("common_name")?,
            domains: row.try_get("domains")?,
            not_after: row.try_get("not_after")?,
            not_before: row.try_get("not_before")?,
            expired: row.try_get("expired")?,
        };
        Ok((state, cert))
    }

    // ---- mutations ----

    /// Create-or-refresh: the insert is ignored on `(host, sni)` collision;
    /// discovered rows additionally get their `last_discovery` stamped in the
    /// same transaction.
    pub async fn insert_state(&self, state: &StateRow) -> AppResult<()> {
        let mut statements = vec![Statement::new(
            "INSERT OR IGNORE INTO states(host, sni, kind) VALUES (?, ?, ?)",
        )
        .bind_text(&state.host)
        .bind_text(&state.sni)
        .bind_int(state.kind as i64)];

        if state.kind == StateKind::Discovered {
            statements.push(Self::last_discovery_statement(state));
        }
        self.single_write(statements).await
    }

    pub async fn update_state_last_discovery(&self, state: &StateRow) -> AppResult<()> {
        self.single_write(vec![Self::last_discovery_statement(state)])
            .await
    }

    fn last_discovery_statement(state: &StateRow) -> Statement {
        Statement::new("UPDATE OR IGNORE states SET last_discovery = ? WHERE host = ? AND sni = ?")
            .bind_text(Utc::now().to_rfc3339())
            .bind_text(&state.host)
            .bind_text(&state.sni)
    }

    /// Persists a probe outcome in one transaction: new certificates are
    /// conditionally inserted, the state row updated, and the link set
    /// replaced. A probe that could not complete (validity Unknown) only
    /// touches the state row; the previously observed chain stays linked.
    pub async fn update_state(&self, state: &StateRow) -> AppResult<()> {
        let mut statements = Vec::with_capacity(state.certificates.len() * 2 + 3);

        for cert in &state.certificates {
            statements.push(
                Statement::new(
                    "INSERT INTO certs(fingerprint, subject_hash, issuer_hash, common_name, \
                     domains, not_after, not_before) \
                     SELECT ?, ?, ?, ?, ?, ?, ? \
                     WHERE NOT EXISTS (SELECT 1 FROM certs WHERE fingerprint = ?)",
                )
                .bind_text(&cert.fingerprint)
                .bind_text(&cert.subject_hash)
                .bind_text(&cert.issuer_hash)
                .bind_text(&cert.common_name)
                .bind_text(&cert.domains)
                .bind_text(cert.not_after.to_rfc3339())
                .bind_text(cert.not_before.to_rfc3339())
                .bind_text(&cert.fingerprint),
            );
        }

        statements.push(
            Statement::new(
                "UPDATE states SET valid = ?, description = ?, ts = ? WHERE host = ? AND sni = ?",
            )
            .bind_int(state.validity as i64)
            .bind_text(&state.description)
            .bind_text(Utc::now().to_rfc3339())
            .bind_text(&state.host)
            .bind_text(&state.sni),
        );

        if state.validity != Validity::Unknown {
            statements.push(
                Statement::new(
                    "DELETE FROM state_certs WHERE EXISTS (\
                     SELECT 1 FROM states \
                     WHERE state_certs.state_id = states.id AND host = ? AND sni = ?)",
                )
                .bind_text(&state.host)
                .bind_text(&state.sni),
            );
            for cert in &state.certificates {
                statements.push(
                    Statement::new(
                        "INSERT INTO state_certs(state_id, fingerprint) \
                         SELECT id, ? FROM states WHERE host = ? AND sni = ?",
                    )
                    .bind_text(&cert.fingerprint)
                    .bind_text(&state.host)
                    .bind_text(&state.sni),
                );
            }
        }

        self.single_write(statements).await
    }

    pub async fn delete_state_by_id(&self, id: i64) -> AppResult<()> {
        self.single_write(vec![
            Statement::new("DELETE FROM state_certs WHERE state_id = ?").bind_int(id),
            Statement::new("DELETE FROM states WHERE id = ?").bind_int(id),
        ])
        .await
    }

    /// Discovered rows the zones stopped asserting at least a day ago are
    /// dropped together with their chain links. Custom rows are never
    /// auto-deleted.
    pub async fn prune_stale_discovered(&self) -> AppResult<()> {
        let stale = "kind = ? AND julianday('now') - julianday(last_discovery) >= 1.0";
        self.single_write(vec![
            Statement::new(format!(
                "DELETE FROM state_certs WHERE state_id IN (SELECT id FROM states WHERE {stale})"
            ))
            .bind_int(StateKind::Discovered as i64),
            Statement::new(format!("DELETE FROM states WHERE {stale}"))
                .bind_int(StateKind::Discovered as i64),
        ])
        .await
    }

    pub async fn prune_orphan_certs(&self) -> AppResult<()> {
        self.single_write(vec![Statement::new(
            "DELETE FROM certs WHERE NOT EXISTS \
             (SELECT 1 FROM state_certs sc WHERE certs.fingerprint = sc.fingerprint)",
        )])
        .await
    }
}
