use std::sync::Arc;

use ember_common::datum::Datum;
use ember_common::schema::{ColumnDef, TableSchema};
use ember_common::types::DataType;

/// Transaction-control statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnControl {
    Begin,
    Commit,
    Rollback,
    Savepoint(String),
    Release(String),
    RollbackTo(String),
}

/// Coarse statement classification, available before full analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Empty,
    Select,
    Insert,
    Update,
    Delete,
    Merge,
    Transaction(TxnControl),
    CreateTable,
    DropTable,
    Other,
}

impl StatementKind {
    /// Statements still accepted inside a failed transaction block.
    pub fn is_transaction_exit(&self) -> bool {
        matches!(
            self,
            StatementKind::Transaction(
                TxnControl::Commit | TxnControl::Rollback | TxnControl::RollbackTo(_)
            )
        )
    }

    pub fn is_transaction_control(&self) -> bool {
        matches!(self, StatementKind::Transaction(_))
    }

    /// Kinds eligible for the batch bind-execute path.
    pub fn supports_batch(&self) -> bool {
        matches!(
            self,
            StatementKind::Select
                | StatementKind::Insert
                | StatementKind::Update
                | StatementKind::Delete
                | StatementKind::Merge
        )
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete | StatementKind::Merge
        )
    }

    /// CommandComplete tag for a statement that processed `rows` rows.
    pub fn command_tag(&self, rows: u64) -> String {
        match self {
            StatementKind::Select => format!("SELECT {rows}"),
            StatementKind::Insert => format!("INSERT 0 {rows}"),
            StatementKind::Update => format!("UPDATE {rows}"),
            StatementKind::Delete => format!("DELETE {rows}"),
            StatementKind::Merge => format!("MERGE {rows}"),
            StatementKind::CreateTable => "CREATE TABLE".into(),
            StatementKind::DropTable => "DROP TABLE".into(),
            StatementKind::Transaction(ctl) => match ctl {
                TxnControl::Begin => "BEGIN".into(),
                TxnControl::Commit => "COMMIT".into(),
                TxnControl::Rollback | TxnControl::RollbackTo(_) => "ROLLBACK".into(),
                TxnControl::Savepoint(_) => "SAVEPOINT".into(),
                TxnControl::Release(_) => "RELEASE".into(),
            },
            StatementKind::Empty | StatementKind::Other => String::new(),
        }
    }
}

/// Scalar expression usable in VALUES lists, assignments and predicates.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarExpr {
    Literal(Datum),
    /// 1-based parameter reference.
    Param { index: usize },
    Column(usize),
}

impl ScalarExpr {
    pub fn param_index(&self) -> Option<usize> {
        match self {
            ScalarExpr::Param { index } => Some(*index),
            _ => None,
        }
    }
}

/// `column = value` conjunct.
#[derive(Debug, Clone, PartialEq)]
pub struct EqPredicate {
    pub column: usize,
    pub value: ScalarExpr,
}

/// Conjunction of equality predicates. Empty matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub conjuncts: Vec<EqPredicate>,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.conjuncts.is_empty()
    }

    /// Value the filter pins `column` to, if any.
    pub fn pinned_value(&self, column: usize) -> Option<&ScalarExpr> {
        self.conjuncts
            .iter()
            .find(|p| p.column == column)
            .map(|p| &p.value)
    }
}

/// Output column of a row-returning statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone)]
pub enum StatementBody {
    Empty,
    /// SELECT without FROM: one row of scalar expressions.
    Values { exprs: Vec<ScalarExpr> },
    Select {
        table: Arc<TableSchema>,
        projection: Vec<usize>,
        filter: Filter,
    },
    Insert {
        table: Arc<TableSchema>,
        columns: Vec<usize>,
        rows: Vec<Vec<ScalarExpr>>,
    },
    Update {
        table: Arc<TableSchema>,
        assignments: Vec<(usize, ScalarExpr)>,
        filter: Filter,
    },
    Delete {
        table: Arc<TableSchema>,
        filter: Filter,
    },
    Transaction(TxnControl),
    CreateTable {
        name: String,
        columns: Vec<ColumnDef>,
        /// Primary-key column; tables without one are replicated.
        key_column: Option<usize>,
        if_not_exists: bool,
    },
    DropTable {
        names: Vec<String>,
        if_exists: bool,
    },
}

/// A statement resolved against the catalog, with parameter types fixed.
#[derive(Debug, Clone)]
pub struct AnalyzedStatement {
    pub kind: StatementKind,
    pub body: StatementBody,
    /// Types of `$1..$n`, in order.
    pub param_types: Vec<DataType>,
    pub result_columns: Vec<ResultColumn>,
    /// Catalog generation the analysis was performed against.
    pub catalog_generation: u64,
}

impl AnalyzedStatement {
    /// Analysis of an empty query string.
    pub fn empty(param_types: Vec<DataType>, catalog_generation: u64) -> Self {
        Self {
            kind: StatementKind::Empty,
            body: StatementBody::Empty,
            param_types,
            result_columns: Vec::new(),
            catalog_generation,
        }
    }

    /// The single relation a statement targets, if any.
    pub fn relation(&self) -> Option<&Arc<TableSchema>> {
        match &self.body {
            StatementBody::Select { table, .. }
            | StatementBody::Insert { table, .. }
            | StatementBody::Update { table, .. }
            | StatementBody::Delete { table, .. } => Some(table),
            _ => None,
        }
    }

    pub fn returns_rows(&self) -> bool {
        !self.result_columns.is_empty()
    }
}
