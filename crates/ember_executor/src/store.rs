//! Per-shard row store.
//!
//! Each shard keeps its rows in memory and an undo log per open transaction.
//! Commit discards the log; abort replays it backwards. Savepoints are marks
//! into the log.

use std::collections::{BTreeMap, HashMap};

use ember_common::datum::{Datum, OwnedRow};
use ember_common::error::{EmberResult, ExecutionError, SqlError, TxnError};
use ember_common::interrupt::InterruptCheck;
use ember_common::schema::TableSchema;
use ember_common::types::{ShardId, TableId, TxnId};
use ember_planner::PhysicalPlan;

use crate::eval::{eval_scalar, eval_values, resolve_filter, row_matches};

const INTERRUPT_CHECK_INTERVAL: usize = 1024;

/// Decides whether a row belongs to the shard executing a write.
pub trait RowOwnership {
    fn owns(&self, schema: &TableSchema, row: &OwnedRow) -> bool;
}

/// How a plan reached this shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// The router picked this shard for the statement's rows; a row the
    /// shard does not own is a routing bug.
    Routed,
    /// Every shard received the plan; rows owned elsewhere are skipped.
    Broadcast,
}

/// Result of running a plan against one shard.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionResult {
    pub rows: Vec<OwnedRow>,
    pub rows_affected: u64,
}

impl ExecutionResult {
    pub fn merge(&mut self, other: ExecutionResult) {
        self.rows.extend(other.rows);
        self.rows_affected += other.rows_affected;
    }
}

#[derive(Debug)]
enum UndoRecord {
    Inserted { table: TableId, row_id: u64 },
    Updated { table: TableId, row_id: u64, before: OwnedRow },
    Deleted { table: TableId, row_id: u64, before: OwnedRow },
}

#[derive(Debug, Default)]
struct TxnUndo {
    records: Vec<UndoRecord>,
    savepoints: Vec<(String, usize)>,
}

#[derive(Debug, Default)]
struct TableData {
    rows: BTreeMap<u64, OwnedRow>,
    next_row_id: u64,
}

/// In-memory storage for one shard.
#[derive(Debug)]
pub struct ShardStore {
    shard_id: ShardId,
    tables: HashMap<TableId, TableData>,
    undo: HashMap<TxnId, TxnUndo>,
}

impl ShardStore {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            tables: HashMap::new(),
            undo: HashMap::new(),
        }
    }

    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    pub fn create_table(&mut self, schema: &TableSchema) {
        self.tables.entry(schema.id).or_default();
    }

    pub fn drop_table(&mut self, id: TableId) {
        self.tables.remove(&id);
    }

    pub fn row_count(&self, id: TableId) -> usize {
        self.tables.get(&id).map(|t| t.rows.len()).unwrap_or(0)
    }

    /// Number of transactions with pending undo state.
    pub fn open_txn_count(&self) -> usize {
        self.undo.len()
    }

    /// Run `plan` once per parameter set, concatenating the results.
    pub fn execute_batch(
        &mut self,
        plan: &PhysicalPlan,
        param_sets: &[Vec<Datum>],
        txn: TxnId,
        mode: DispatchMode,
        ownership: &dyn RowOwnership,
        interrupts: &dyn InterruptCheck,
    ) -> EmberResult<ExecutionResult> {
        let mut total = ExecutionResult::default();
        if param_sets.is_empty() {
            return self.execute(plan, &[], txn, mode, ownership, interrupts);
        }
        for params in param_sets {
            let result = self.execute(plan, params, txn, mode, ownership, interrupts)?;
            total.merge(result);
        }
        Ok(total)
    }

    pub fn execute(
        &mut self,
        plan: &PhysicalPlan,
        params: &[Datum],
        txn: TxnId,
        mode: DispatchMode,
        ownership: &dyn RowOwnership,
        interrupts: &dyn InterruptCheck,
    ) -> EmberResult<ExecutionResult> {
        match plan {
            PhysicalPlan::Values { exprs } => {
                let row = eval_values(exprs, params)?;
                Ok(ExecutionResult {
                    rows: vec![row],
                    rows_affected: 1,
                })
            }
            PhysicalPlan::SeqScan {
                schema,
                projection,
                filter,
            } => {
                let resolved = resolve_filter(filter, schema, params)?;
                let data = self.table(schema)?;
                let mut rows = Vec::new();
                for (n, row) in data.rows.values().enumerate() {
                    if n % INTERRUPT_CHECK_INTERVAL == 0 {
                        interrupts.check_for_interrupts()?;
                    }
                    if row_matches(row, &resolved) {
                        let values = projection
                            .iter()
                            .map(|&i| row.get(i).cloned().unwrap_or(Datum::Null))
                            .collect();
                        rows.push(OwnedRow::new(values));
                    }
                }
                let rows_affected = rows.len() as u64;
                Ok(ExecutionResult {
                    rows,
                    rows_affected,
                })
            }
            PhysicalPlan::Insert {
                schema,
                columns,
                rows,
            } => {
                let mut inserted = 0;
                for exprs in rows {
                    let mut values = vec![Datum::Null; schema.columns.len()];
                    for (expr, &col) in exprs.iter().zip(columns) {
                        let value = eval_scalar(expr, None, params)?;
                        let ty = schema
                            .column_type(col)
                            .ok_or(ExecutionError::ColumnOutOfBounds(col))?;
                        values[col] = value.coerce_to(ty)?;
                    }
                    let row = OwnedRow::new(values);
                    if !ownership.owns(schema, &row) {
                        match mode {
                            DispatchMode::Broadcast => continue,
                            DispatchMode::Routed => return Err(ExecutionError::MisroutedRow.into()),
                        }
                    }
                    let data = self.table_mut(schema)?;
                    let row_id = data.next_row_id;
                    data.next_row_id += 1;
                    data.rows.insert(row_id, row);
                    self.log(txn, UndoRecord::Inserted {
                        table: schema.id,
                        row_id,
                    });
                    inserted += 1;
                }
                Ok(ExecutionResult {
                    rows: Vec::new(),
                    rows_affected: inserted,
                })
            }
            PhysicalPlan::Update {
                schema,
                assignments,
                filter,
            } => {
                if let Some(key) = schema.distribution_key() {
                    if assignments.iter().any(|(col, _)| *col == key) {
                        return Err(SqlError::Unsupported(
                            "updating the distribution key column".into(),
                        )
                        .into());
                    }
                }
                let resolved = resolve_filter(filter, schema, params)?;
                let mut new_values = Vec::with_capacity(assignments.len());
                for (col, expr) in assignments {
                    let ty = schema
                        .column_type(*col)
                        .ok_or(ExecutionError::ColumnOutOfBounds(*col))?;
                    new_values.push((*col, eval_scalar(expr, None, params)?.coerce_to(ty)?));
                }
                let targets = self.matching_row_ids(schema, &resolved, interrupts)?;
                let data = self.table_mut(schema)?;
                let mut undo = Vec::with_capacity(targets.len());
                for row_id in &targets {
                    if let Some(row) = data.rows.get_mut(row_id) {
                        let before = row.clone();
                        for (col, value) in &new_values {
                            row.values[*col] = value.clone();
                        }
                        undo.push(UndoRecord::Updated {
                            table: schema.id,
                            row_id: *row_id,
                            before,
                        });
                    }
                }
                let affected = undo.len() as u64;
                for record in undo {
                    self.log(txn, record);
                }
                Ok(ExecutionResult {
                    rows: Vec::new(),
                    rows_affected: affected,
                })
            }
            PhysicalPlan::Delete { schema, filter } => {
                let resolved = resolve_filter(filter, schema, params)?;
                let targets = self.matching_row_ids(schema, &resolved, interrupts)?;
                let data = self.table_mut(schema)?;
                let mut undo = Vec::with_capacity(targets.len());
                for row_id in targets {
                    if let Some(before) = data.rows.remove(&row_id) {
                        undo.push(UndoRecord::Deleted {
                            table: schema.id,
                            row_id,
                            before,
                        });
                    }
                }
                let affected = undo.len() as u64;
                for record in undo {
                    self.log(txn, record);
                }
                Ok(ExecutionResult {
                    rows: Vec::new(),
                    rows_affected: affected,
                })
            }
            other => Err(ExecutionError::Internal(format!(
                "plan {other:?} cannot run on {}",
                self.shard_id
            ))
            .into()),
        }
    }

    pub fn commit(&mut self, txn: TxnId) {
        self.undo.remove(&txn);
    }

    pub fn abort(&mut self, txn: TxnId) {
        if let Some(log) = self.undo.remove(&txn) {
            let count = log.records.len();
            self.replay_undo(log.records);
            tracing::debug!(shard = %self.shard_id, %txn, undone = count, "shard txn rolled back");
        }
    }

    pub fn savepoint(&mut self, txn: TxnId, name: &str) {
        let log = self.undo.entry(txn).or_default();
        let mark = log.records.len();
        log.savepoints.push((name.to_string(), mark));
    }

    /// Undo everything after the most recent savepoint called `name`. The
    /// savepoint itself stays defined.
    pub fn rollback_to(&mut self, txn: TxnId, name: &str) -> EmberResult<()> {
        let log = self
            .undo
            .get_mut(&txn)
            .ok_or_else(|| TxnError::SavepointNotFound(name.to_string()))?;
        let pos = log
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| TxnError::SavepointNotFound(name.to_string()))?;
        let mark = log.savepoints[pos].1;
        log.savepoints.truncate(pos + 1);
        let tail = log.records.split_off(mark);
        self.replay_undo(tail);
        Ok(())
    }

    /// Forget the most recent savepoint called `name` and any later ones.
    pub fn release(&mut self, txn: TxnId, name: &str) -> EmberResult<()> {
        let log = self
            .undo
            .get_mut(&txn)
            .ok_or_else(|| TxnError::SavepointNotFound(name.to_string()))?;
        let pos = log
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| TxnError::SavepointNotFound(name.to_string()))?;
        log.savepoints.truncate(pos);
        Ok(())
    }

    fn replay_undo(&mut self, records: Vec<UndoRecord>) {
        for record in records.into_iter().rev() {
            match record {
                UndoRecord::Inserted { table, row_id } => {
                    if let Some(data) = self.tables.get_mut(&table) {
                        data.rows.remove(&row_id);
                    }
                }
                UndoRecord::Updated {
                    table,
                    row_id,
                    before,
                }
                | UndoRecord::Deleted {
                    table,
                    row_id,
                    before,
                } => {
                    if let Some(data) = self.tables.get_mut(&table) {
                        data.rows.insert(row_id, before);
                    }
                }
            }
        }
    }

    fn matching_row_ids(
        &self,
        schema: &TableSchema,
        resolved: &[(usize, Datum)],
        interrupts: &dyn InterruptCheck,
    ) -> EmberResult<Vec<u64>> {
        let data = self.table(schema)?;
        let mut ids = Vec::new();
        for (n, (row_id, row)) in data.rows.iter().enumerate() {
            if n % INTERRUPT_CHECK_INTERVAL == 0 {
                interrupts.check_for_interrupts()?;
            }
            if row_matches(row, resolved) {
                ids.push(*row_id);
            }
        }
        Ok(ids)
    }

    fn log(&mut self, txn: TxnId, record: UndoRecord) {
        self.undo.entry(txn).or_default().records.push(record);
    }

    fn table(&self, schema: &TableSchema) -> EmberResult<&TableData> {
        self.tables
            .get(&schema.id)
            .ok_or_else(|| ExecutionError::TableNotFound(schema.id).into())
    }

    fn table_mut(&mut self, schema: &TableSchema) -> EmberResult<&mut TableData> {
        self.tables
            .get_mut(&schema.id)
            .ok_or_else(|| ExecutionError::TableNotFound(schema.id).into())
    }
}
