//! Scriptable in-memory connection provider.
//!
//! Statements are matched by exact SQL text against handlers registered by
//! the test. Handlers run against a shared [`Tables`] value, so a mutation
//! handler can insert a row that a later query handler finds. Unknown
//! statements are rejected the way a real store rejects malformed SQL.
//!
//! Besides scripting results, the provider records every statement it runs
//! in a journal, can be held shut with a [`Gate`] to keep workers busy, and
//! tracks how many statements ran at the same time.

use querybus_core::{
    BindValue, ConnectionProvider, ExecutionError, ExecutionSummary, MutationResult,
    ProviderFuture, ReadResult, RowCursor,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// A row: positional column values.
pub type Record = Vec<BindValue>;

type QueryHandler =
    Arc<dyn Fn(&Tables, &[BindValue]) -> Result<Vec<Record>, ExecutionError> + Send + Sync>;
type ExecuteHandler = Arc<dyn Fn(&mut Tables, &[BindValue]) -> MutationResult + Send + Sync>;

/// Named in-memory tables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    tables: HashMap<String, Vec<Record>>,
}

impl Tables {
    /// Append a row and return its one-based position as a generated id.
    pub fn insert(&mut self, table: &str, row: Record) -> i64 {
        let rows = self.tables.entry(table.to_string()).or_default();
        rows.push(row);
        i64::try_from(rows.len()).unwrap_or(i64::MAX)
    }

    /// All rows of a table, empty if it was never written.
    #[must_use]
    pub fn rows(&self, table: &str) -> &[Record] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }

    /// Rows whose `column` equals `value`.
    #[must_use]
    pub fn select_where(&self, table: &str, column: usize, value: &BindValue) -> Vec<Record> {
        self.rows(table)
            .iter()
            .filter(|row| row.get(column) == Some(value))
            .cloned()
            .collect()
    }

    /// Whether any row has `value` in `column`.
    #[must_use]
    pub fn contains(&self, table: &str, column: usize, value: &BindValue) -> bool {
        self.rows(table).iter().any(|row| row.get(column) == Some(value))
    }

    /// Set `column` to `value` on every row whose `key_column` equals `key`.
    /// Returns the number of rows changed.
    pub fn update_where(
        &mut self,
        table: &str,
        key_column: usize,
        key: &BindValue,
        column: usize,
        value: &BindValue,
    ) -> u64 {
        let Some(rows) = self.tables.get_mut(table) else {
            return 0;
        };
        let mut changed = 0;
        for row in rows.iter_mut().filter(|row| row.get(key_column) == Some(key)) {
            if let Some(cell) = row.get_mut(column) {
                cell.clone_from(value);
                changed += 1;
            }
        }
        changed
    }

    /// Remove rows whose `column` equals `value`. Returns how many went.
    pub fn delete_where(&mut self, table: &str, column: usize, value: &BindValue) -> u64 {
        let Some(rows) = self.tables.get_mut(table) else {
            return 0;
        };
        let before = rows.len();
        rows.retain(|row| row.get(column) != Some(value));
        (before - rows.len()) as u64
    }
}

/// Open/closed switch that holds statement execution back while closed.
#[derive(Debug, Clone)]
pub struct Gate {
    state: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// A gate that starts open.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(true);
        Self {
            state: Arc::new(state),
        }
    }

    /// Let statements through.
    pub fn open(&self) {
        self.state.send_replace(true);
    }

    /// Hold new statements until [`open`](Self::open) is called.
    pub fn close(&self) {
        self.state.send_replace(false);
    }

    /// Whether statements currently pass.
    #[must_use]
    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Statements currently held at the gate.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.state.receiver_count()
    }

    /// Wait until the gate is open.
    pub async fn wait_open(&self) {
        let mut receiver = self.state.subscribe();
        let _ = receiver.wait_for(|open| *open).await;
    }
}

impl Default for Gate {
    fn default() -> Self {
        Self::new()
    }
}

/// Which provider operation ran a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// `query`
    Query,
    /// `execute`
    Execute,
}

/// One statement the provider ran.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    /// Order in which statements reached the provider, starting at zero.
    pub sequence: u64,
    /// Operation used.
    pub kind: StatementKind,
    /// Statement text.
    pub sql: String,
    /// Bound arguments.
    pub args: Vec<BindValue>,
}

struct Shared {
    tables: Mutex<Tables>,
    queries: RwLock<HashMap<String, QueryHandler>>,
    executes: RwLock<HashMap<String, ExecuteHandler>>,
    journal: Mutex<Vec<JournalEntry>>,
    sequence: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
    latency: Mutex<Duration>,
    gate: Gate,
    row_buffer: usize,
}

/// In-memory [`ConnectionProvider`] for tests.
///
/// Cheap to clone; clones share tables, handlers and journal.
///
/// # Example
///
/// ```
/// use querybus_core::{BindValue, ConnectionProvider, ExecutionSummary};
/// use querybus_testing::InMemoryConnectionProvider;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let provider = InMemoryConnectionProvider::new();
/// provider.on_execute("INSERT INTO emails (email) VALUES (?)", |tables, args| {
///     tables.insert("emails", args.to_vec());
///     Ok(ExecutionSummary::new(1))
/// });
///
/// let args = [BindValue::from("kim@example.com")];
/// let summary = provider
///     .execute("INSERT INTO emails (email) VALUES (?)", &args)
///     .await
///     .unwrap();
/// assert_eq!(summary.rows_affected, 1);
/// assert_eq!(provider.rows("emails").len(), 1);
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryConnectionProvider {
    shared: Arc<Shared>,
}

impl InMemoryConnectionProvider {
    /// Empty provider with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::with_row_buffer(16)
    }

    /// Empty provider whose cursors buffer at most `row_buffer` rows ahead.
    #[must_use]
    pub fn with_row_buffer(row_buffer: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                queries: RwLock::new(HashMap::new()),
                executes: RwLock::new(HashMap::new()),
                journal: Mutex::new(Vec::new()),
                sequence: AtomicU64::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                latency: Mutex::new(Duration::ZERO),
                gate: Gate::new(),
                row_buffer,
            }),
        }
    }

    /// Register the rows returned for a read query.
    pub fn on_query<F>(&self, sql: impl Into<String>, handler: F)
    where
        F: Fn(&Tables, &[BindValue]) -> Result<Vec<Record>, ExecutionError> + Send + Sync + 'static,
    {
        self.shared
            .queries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sql.into(), Arc::new(handler));
    }

    /// Register the effect of a mutation.
    pub fn on_execute<F>(&self, sql: impl Into<String>, handler: F)
    where
        F: Fn(&mut Tables, &[BindValue]) -> MutationResult + Send + Sync + 'static,
    {
        self.shared
            .executes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sql.into(), Arc::new(handler));
    }

    /// Delay every statement by `latency` before it runs.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.shared.latency) = latency;
    }

    /// The gate statements must pass before running.
    #[must_use]
    pub fn gate(&self) -> Gate {
        self.shared.gate.clone()
    }

    /// Seed a row directly, bypassing the journal.
    pub fn insert_row(&self, table: &str, row: Record) {
        lock(&self.shared.tables).insert(table, row);
    }

    /// Current rows of a table.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Record> {
        lock(&self.shared.tables).rows(table).to_vec()
    }

    /// Every statement run so far, in arrival order.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.shared.journal).clone()
    }

    /// Statement texts run so far, in arrival order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        lock(&self.shared.journal)
            .iter()
            .map(|entry| entry.sql.clone())
            .collect()
    }

    /// Highest number of statements that were running at the same time.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }

    async fn enter(&self, kind: StatementKind, sql: &str, args: &[BindValue]) -> ActiveGuard<'_> {
        self.shared.gate.wait_open().await;
        let latency = *lock(&self.shared.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let active = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak.fetch_max(active, Ordering::SeqCst);

        let entry = JournalEntry {
            sequence: self.shared.sequence.fetch_add(1, Ordering::SeqCst),
            kind,
            sql: sql.to_string(),
            args: args.to_vec(),
        };
        tracing::trace!(sequence = entry.sequence, sql, "In-memory statement");
        lock(&self.shared.journal).push(entry);

        ActiveGuard {
            active: &self.shared.active,
        }
    }
}

impl Default for InMemoryConnectionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryConnectionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryConnectionProvider")
            .field("statements", &lock(&self.shared.journal).len())
            .field("gate_open", &self.shared.gate.is_open())
            .finish_non_exhaustive()
    }
}

// A handler that panicked must not take the rest of the test down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ActiveGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn no_handler(sql: &str) -> ExecutionError {
    ExecutionError::Rejected {
        code: None,
        message: format!("no handler registered for statement: {sql}"),
    }
}

impl ConnectionProvider for InMemoryConnectionProvider {
    type Row = Record;

    fn name(&self) -> &str {
        "in-memory"
    }

    fn query<'a>(&'a self, sql: &'a str, args: &'a [BindValue]) -> ProviderFuture<'a, ReadResult<Record>> {
        Box::pin(async move {
            let _active = self.enter(StatementKind::Query, sql, args).await;
            let handler = self
                .shared
                .queries
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(sql)
                .cloned()
                .ok_or_else(|| no_handler(sql))?;
            let rows = handler(&lock(&self.shared.tables), args)?;

            if rows.is_empty() {
                return Ok(RowCursor::empty());
            }
            let (sink, cursor) = RowCursor::channel(self.shared.row_buffer);
            tokio::spawn(async move {
                for row in rows {
                    if !sink.push(row).await {
                        break;
                    }
                }
            });
            Ok(cursor)
        })
    }

    fn execute<'a>(&'a self, sql: &'a str, args: &'a [BindValue]) -> ProviderFuture<'a, MutationResult> {
        Box::pin(async move {
            let _active = self.enter(StatementKind::Execute, sql, args).await;
            let handler = self
                .shared
                .executes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(sql)
                .cloned()
                .ok_or_else(|| no_handler(sql))?;
            handler(&mut lock(&self.shared.tables), args)
        })
    }
}

/// Handler for `INSERT`-style statements: append the arguments as a row.
///
/// Reports the row's position as `last_insert_id`.
pub fn insert_into(
    table: &'static str,
) -> impl Fn(&mut Tables, &[BindValue]) -> MutationResult + Send + Sync + 'static {
    move |tables, args| {
        let id = tables.insert(table, args.to_vec());
        Ok(ExecutionSummary::new(1).with_last_insert_id(id))
    }
}
