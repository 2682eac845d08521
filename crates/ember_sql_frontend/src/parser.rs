use ember_common::error::SqlError;
use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

/// Parse a SQL string into zero or more AST statements using sqlparser-rs.
///
/// Text made only of whitespace, comments and semicolons yields an empty list.
pub fn parse_sql(sql: &str) -> Result<Vec<Statement>, SqlError> {
    if is_blank(sql) {
        return Ok(Vec::new());
    }
    let dialect = PostgreSqlDialect {};
    Parser::parse_sql(&dialect, sql).map_err(|e| SqlError::Parse(e.to_string()))
}

fn is_blank(sql: &str) -> bool {
    sql.lines()
        .map(|line| match line.find("--") {
            Some(pos) => &line[..pos],
            None => line,
        })
        .all(|line| line.chars().all(|c| c.is_whitespace() || c == ';'))
}
