use sqlx::SqlitePool;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A value bound into a parameterized statement. Keeping the set small is
/// deliberate: everything the monitor persists is text, integers or RFC3339
/// timestamps rendered as text.
#[derive(Clone, Debug)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

/// One parameterized SQL statement. Mutations are submitted as lists of
/// these so that a multi-statement update keeps its transaction boundary.
#[derive(Clone, Debug)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind_text(mut self, value: impl Into<String>) -> Self {
        self.params.push(SqlParam::Text(value.into()));
        self
    }

    pub fn bind_int(mut self, value: i64) -> Self {
        self.params.push(SqlParam::Integer(value));
        self
    }
}

/// A write submission: the statements to run in one transaction and the
/// channel the outcome is reported on.
pub struct WriteRequest {
    pub statements: Vec<Statement>,
    pub reply: oneshot::Sender<Result<(), sqlx::Error>>,
}

/// The single consumer end of the write funnel. SQLite allows one writer at
/// a time; funneling every mutation through this task removes lock
/// contention and gives one place where transactions begin and commit.
pub struct StoreWriter {
    pool: SqlitePool,
    requests: mpsc::Receiver<WriteRequest>,
}

impl StoreWriter {
    pub(super) fn new(pool: SqlitePool, requests: mpsc::Receiver<WriteRequest>) -> Self {
        Self { pool, requests }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        debug!("database writer started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = self.requests.recv() => {
                    let Some(request) = request else { break };
                    let result = Self::execute(&self.pool, &request.statements).await;
                    if let Err(e) = &result {
                        error!("Write transaction failed: {}", e);
                    }
                    let _ = request.reply.send(result);
                }
            }
        }
        debug!("database writer stopped");
    }

    async fn execute(pool: &SqlitePool, statements: &[Statement]) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for statement in statements {
            let mut query = sqlx::query(&statement.sql);
            for param in &statement.params {
                query = match param {
                    SqlParam::Text(value) => query.bind(value),
                    SqlParam::Integer(value) => query.bind(value),
                };
            }
            // Dropping the transaction on error rolls the whole request back
            query.execute(&mut *tx).await?;
        }
        tx.commit().await
    }
}
