use thiserror::Error;

use crate::types::{TableId, TxnId};

/// Convenience alias for `Result<T, EmberError>`.
pub type EmberResult<T> = Result<T, EmberError>;

/// Error classification that drives session recovery.
///
/// - `ProtocolViolation`: malformed or inconsistent extended-query traffic
/// - `Statement`: anything raised while preparing, binding or running a statement
/// - `AbortedTransaction`: command rejected because the transaction block already failed
/// - `CancelOrTimeout`: user cancel or statement timeout, delivered at a safe point
/// - `FatalConnection`: the connection cannot continue and must be torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ProtocolViolation,
    Statement,
    AbortedTransaction,
    CancelOrTimeout,
    FatalConnection,
}

/// Why a running statement was interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    UserRequest,
    StatementTimeout,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::UserRequest => f.write_str("user request"),
            CancelReason::StatementTimeout => f.write_str("statement timeout"),
        }
    }
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum EmberError {
    #[error("SQL error: {0}")]
    Sql(#[from] SqlError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("canceling statement due to {0}")]
    Canceled(CancelReason),

    #[error("terminating connection due to administrator command")]
    Terminated,

    /// Transient resource/backpressure error.
    #[error("Transient: {reason}")]
    Transient { reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// SQL frontend errors.
#[derive(Error, Debug)]
pub enum SqlError {
    #[error("{0}")]
    Parse(String),

    #[error("cannot insert multiple commands into a prepared statement")]
    MultipleStatements,

    #[error("relation \"{0}\" does not exist")]
    UnknownTable(String),

    #[error("column \"{0}\" does not exist")]
    UnknownColumn(String),

    #[error("relation \"{0}\" already exists")]
    DuplicateTable(String),

    #[error("column \"{column}\" is of type {expected} but expression is of type {got}")]
    TypeMismatch {
        column: String,
        expected: String,
        got: String,
    },

    #[error("{0} is not supported")]
    Unsupported(String),

    #[error("invalid expression: {0}")]
    InvalidExpression(String),

    #[error("there is no parameter ${0}")]
    UndefinedParameter(usize),

    #[error("type with OID {0} does not exist")]
    UnknownParamType(i32),

    #[error("cached plan must not change result type")]
    ResultTypeChanged,
}

/// Protocol layer errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame could not be decoded; the stream position is lost.
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("invalid frontend message type {}", char::from(*.0))]
    UnknownMessageType(u8),

    #[error("invalid message length {len} (limit {max})")]
    MessageTooLarge { len: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    /// Well-framed message whose contents violate the protocol.
    #[error("{0}")]
    InvalidMessage(String),

    #[error("bind message supplies {supplied} parameters, but prepared statement \"{statement}\" requires {required}")]
    ParamCountMismatch {
        supplied: usize,
        required: usize,
        statement: String,
    },

    #[error("bind message has {codes} parameter formats but {params} parameters")]
    FormatCountMismatch { codes: usize, params: usize },

    #[error("bind message has {codes} result formats but query has {columns} columns")]
    ResultFormatCountMismatch { codes: usize, columns: usize },

    #[error("unsupported format code: {0}")]
    UnsupportedFormatCode(i16),

    #[error("batch execute does not support a row limit (got {0})")]
    BatchRowLimit(i32),
}

/// Statement preparation and execution errors.
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("prepared statement \"{0}\" does not exist")]
    UndefinedStatement(String),

    #[error("portal \"{0}\" does not exist")]
    UndefinedPortal(String),

    #[error("prepared statement \"{0}\" already exists")]
    DuplicateStatement(String),

    #[error("portal \"{0}\" already exists")]
    DuplicatePortal(String),

    #[error("portal \"{0}\" cannot be run")]
    PortalCannotRun(String),

    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    InFailedTransaction,

    #[error("invalid input syntax for type {type_name}: \"{value}\"")]
    InvalidTextRepresentation { type_name: String, value: String },

    #[error("incorrect binary data format in bind parameter {0}")]
    InvalidBinaryFormat(usize),

    #[error("invalid byte sequence for encoding \"UTF8\"")]
    InvalidEncoding,

    #[error("value \"{value}\" is out of range for type {type_name}")]
    NumericOutOfRange { type_name: String, value: String },

    #[error("Type error: {0}")]
    TypeError(String),

    #[error("Column index out of bounds: {0}")]
    ColumnOutOfBounds(usize),

    #[error("no value found for parameter {0}")]
    ParamMissing(usize),

    #[error("table {0} is not present on this shard")]
    TableNotFound(TableId),

    #[error("row routed to a shard that does not own it")]
    MisroutedRow,

    #[error("Internal: {0}")]
    Internal(String),
}

/// Transaction bracket errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("savepoint \"{0}\" does not exist")]
    SavepointNotFound(String),

    #[error("{0} can only be used in transaction blocks")]
    NoTransactionBlock(&'static str),

    #[error("transaction {0} could not be committed: {1}")]
    CommitFailed(TxnId, String),

    #[error("transaction {0} could not be rolled back: {1}")]
    AbortFailed(TxnId, String),
}

/// Cluster / shard link errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Shard not found: {0}")]
    ShardNotFound(u64),

    /// Link to a shard failed. `sent` records whether the request may have
    /// reached the shard.
    #[error("connection to shard {shard} failed: {reason}")]
    LinkFailed {
        shard: u64,
        reason: String,
        sent: bool,
    },
}

impl From<std::io::Error> for EmberError {
    fn from(e: std::io::Error) -> Self {
        EmberError::Protocol(ProtocolError::Io(e))
    }
}

// ── EmberError classification & helpers ──────────────────────────────────────

impl EmberError {
    /// Errors after which the connection must be closed.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            EmberError::Terminated
                | EmberError::Protocol(ProtocolError::Io(_))
                | EmberError::Protocol(ProtocolError::Malformed(_))
                | EmberError::Protocol(ProtocolError::UnknownMessageType(_))
                | EmberError::Protocol(ProtocolError::MessageTooLarge { .. })
                | EmberError::Protocol(ProtocolError::ConnectionClosed)
        )
    }

    /// Classify this error for the recovery path.
    pub fn class(&self) -> ErrorClass {
        if self.is_connection_fatal() {
            return ErrorClass::FatalConnection;
        }
        match self {
            EmberError::Canceled(_) => ErrorClass::CancelOrTimeout,
            EmberError::Execution(ExecutionError::InFailedTransaction) => {
                ErrorClass::AbortedTransaction
            }
            EmberError::Protocol(_) => ErrorClass::ProtocolViolation,
            _ => ErrorClass::Statement,
        }
    }

    /// True when the error is a link failure whose request was never sent.
    pub fn is_pre_send_failure(&self) -> bool {
        matches!(
            self,
            EmberError::Cluster(ClusterError::LinkFailed { sent: false, .. })
                | EmberError::Cluster(ClusterError::ShardNotFound(_))
        )
    }

    /// Map to a PostgreSQL SQLSTATE code.
    pub fn pg_sqlstate(&self) -> &'static str {
        match self {
            EmberError::Sql(SqlError::Parse(_)) => "42601", // syntax_error
            EmberError::Sql(SqlError::MultipleStatements) => "42601",
            EmberError::Sql(SqlError::UnknownTable(_)) => "42P01", // undefined_table
            EmberError::Sql(SqlError::UnknownColumn(_)) => "42703", // undefined_column
            EmberError::Sql(SqlError::DuplicateTable(_)) => "42P07", // duplicate_table
            EmberError::Sql(SqlError::TypeMismatch { .. }) => "42804", // datatype_mismatch
            EmberError::Sql(SqlError::Unsupported(_)) => "0A000", // feature_not_supported
            EmberError::Sql(SqlError::InvalidExpression(_)) => "42601",
            EmberError::Sql(SqlError::UndefinedParameter(_)) => "42P02", // undefined_parameter
            EmberError::Sql(SqlError::UnknownParamType(_)) => "42704", // undefined_object
            EmberError::Sql(SqlError::ResultTypeChanged) => "0A000",
            EmberError::Protocol(ProtocolError::Io(_)) => "08006", // connection_failure
            EmberError::Protocol(ProtocolError::ConnectionClosed) => "08006",
            EmberError::Protocol(_) => "08P01", // protocol_violation
            EmberError::Execution(ExecutionError::UndefinedStatement(_)) => "26000", // invalid_sql_statement_name
            EmberError::Execution(ExecutionError::UndefinedPortal(_)) => "34000", // invalid_cursor_name
            EmberError::Execution(ExecutionError::DuplicateStatement(_)) => "42P05", // duplicate_prepared_statement
            EmberError::Execution(ExecutionError::DuplicatePortal(_)) => "42P03", // duplicate_cursor
            EmberError::Execution(ExecutionError::PortalCannotRun(_)) => "55000", // object_not_in_prerequisite_state
            EmberError::Execution(ExecutionError::InFailedTransaction) => "25P02", // in_failed_sql_transaction
            EmberError::Execution(ExecutionError::InvalidTextRepresentation { .. }) => "22P02",
            EmberError::Execution(ExecutionError::InvalidBinaryFormat(_)) => "22P03",
            EmberError::Execution(ExecutionError::InvalidEncoding) => "22021", // character_not_in_repertoire
            EmberError::Execution(ExecutionError::NumericOutOfRange { .. }) => "22003",
            EmberError::Execution(ExecutionError::TypeError(_)) => "22000", // data_exception
            EmberError::Execution(ExecutionError::ParamMissing(_)) => "08P01",
            EmberError::Execution(ExecutionError::TableNotFound(_)) => "42P01",
            EmberError::Execution(_) => "XX000",
            EmberError::Txn(TxnError::SavepointNotFound(_)) => "3B001", // invalid_savepoint_specification
            EmberError::Txn(TxnError::NoTransactionBlock(_)) => "25P01", // no_active_sql_transaction
            EmberError::Txn(_) => "40000", // transaction_rollback
            EmberError::Cluster(ClusterError::LinkFailed { .. }) => "08006",
            EmberError::Cluster(_) => "XX000",
            EmberError::Canceled(_) => "57014", // query_canceled
            EmberError::Terminated => "57P01", // admin_shutdown
            EmberError::Transient { .. } => "53000", // insufficient_resources
            EmberError::Internal(_) => "XX000", // internal_error
        }
    }

    /// Map to a PostgreSQL severity string.
    pub fn pg_severity(&self) -> &'static str {
        if self.is_connection_fatal() {
            "FATAL"
        } else {
            "ERROR"
        }
    }

    /// Client-facing message, without the layer prefix used in logs.
    pub fn pg_message(&self) -> String {
        match self {
            EmberError::Sql(e) => e.to_string(),
            EmberError::Protocol(e) => e.to_string(),
            EmberError::Execution(e) => e.to_string(),
            EmberError::Txn(e) => e.to_string(),
            EmberError::Cluster(e) => e.to_string(),
            EmberError::Transient { reason } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Construct a transient backpressure error.
    pub fn transient(reason: impl Into<String>) -> Self {
        EmberError::Transient {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod error_classification {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(EmberError::Terminated.is_connection_fatal());
        assert!(EmberError::from(ProtocolError::UnknownMessageType(b'Z')).is_connection_fatal());
        assert!(EmberError::from(ProtocolError::Malformed("short".into())).is_connection_fatal());
        assert!(!EmberError::from(ProtocolError::BatchRowLimit(5)).is_connection_fatal());
        assert_eq!(EmberError::Terminated.pg_severity(), "FATAL");
    }

    #[test]
    fn test_error_classes() {
        assert_eq!(
            EmberError::Canceled(CancelReason::StatementTimeout).class(),
            ErrorClass::CancelOrTimeout
        );
        assert_eq!(
            EmberError::from(ExecutionError::InFailedTransaction).class(),
            ErrorClass::AbortedTransaction
        );
        assert_eq!(
            EmberError::from(ProtocolError::FormatCountMismatch { codes: 2, params: 3 }).class(),
            ErrorClass::ProtocolViolation
        );
        assert_eq!(
            EmberError::from(SqlError::UnknownTable("t".into())).class(),
            ErrorClass::Statement
        );
    }

    #[test]
    fn test_sqlstates() {
        let cases: Vec<(EmberError, &str)> = vec![
            (ExecutionError::UndefinedStatement("s".into()).into(), "26000"),
            (ExecutionError::UndefinedPortal("p".into()).into(), "34000"),
            (ExecutionError::DuplicateStatement("s".into()).into(), "42P05"),
            (ExecutionError::DuplicatePortal("p".into()).into(), "42P03"),
            (ExecutionError::InFailedTransaction.into(), "25P02"),
            (ExecutionError::InvalidBinaryFormat(1).into(), "22P03"),
            (ExecutionError::InvalidEncoding.into(), "22021"),
            (ProtocolError::BatchRowLimit(10).into(), "08P01"),
            (
                ProtocolError::ParamCountMismatch {
                    supplied: 1,
                    required: 2,
                    statement: "s".into(),
                }
                .into(),
                "08P01",
            ),
            (EmberError::Canceled(CancelReason::UserRequest), "57014"),
            (EmberError::Terminated, "57P01"),
            (SqlError::MultipleStatements.into(), "42601"),
        ];
        for (err, code) in cases {
            assert_eq!(err.pg_sqlstate(), code, "{err}");
        }
    }

    #[test]
    fn test_pg_message_has_no_layer_prefix() {
        let e: EmberError = ExecutionError::UndefinedPortal("c1".into()).into();
        assert_eq!(e.pg_message(), "portal \"c1\" does not exist");
        assert!(e.to_string().starts_with("Execution error"));
    }

    #[test]
    fn test_pre_send_failure() {
        let pre = EmberError::from(ClusterError::LinkFailed {
            shard: 1,
            reason: "refused".into(),
            sent: false,
        });
        let post = EmberError::from(ClusterError::LinkFailed {
            shard: 1,
            reason: "reset".into(),
            sent: true,
        });
        assert!(pre.is_pre_send_failure());
        assert!(!post.is_pre_send_failure());
    }
}
