//! Raw database results as handed over by a driver.

use std::str::FromStr;

/// What kind of result the driver produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// Statement without a row set completed.
    CommandOk,
    /// Statement returned a (possibly empty) row set.
    TuplesOk,
    /// A sync boundary was reached. Has no Ctx.
    PipelineSync,
    /// Per-command failure (constraint violation, bad cast, ...).
    Error,
    /// Skipped by the server because an earlier command in the same sync
    /// segment failed.
    Aborted,
    /// The connection is gone.
    ConnectionLost,
}

impl ResultStatus {
    /// Results that invalidate every in-flight command on the connection.
    #[inline]
    pub fn is_connection_fatal(self) -> bool {
        matches!(self, Self::Aborted | Self::ConnectionLost)
    }
}

/// One result: status, optional row set, optional error text.
#[derive(Debug, Clone, PartialEq)]
pub struct DbResult {
    status: ResultStatus,
    fields: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    command_tag: Option<String>,
    error: Option<String>,
}

impl DbResult {
    pub fn command_ok(tag: impl Into<String>) -> Self {
        Self {
            status: ResultStatus::CommandOk,
            fields: Vec::new(),
            rows: Vec::new(),
            command_tag: Some(tag.into()),
            error: None,
        }
    }

    pub fn tuples(fields: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            status: ResultStatus::TuplesOk,
            fields,
            rows,
            command_tag: None,
            error: None,
        }
    }

    /// Single-column row set, handy for `RETURNING x` / `SELECT x` results.
    pub fn single_column(field: &str, values: &[&str]) -> Self {
        Self::tuples(
            vec![field.to_string()],
            values.iter().map(|v| vec![Some(v.to_string())]).collect(),
        )
    }

    pub fn sync() -> Self {
        Self::with_status(ResultStatus::PipelineSync, None)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_status(ResultStatus::Error, Some(message.into()))
    }

    pub fn aborted() -> Self {
        Self::with_status(
            ResultStatus::Aborted,
            Some("pipeline aborted by an earlier error".to_string()),
        )
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::with_status(ResultStatus::ConnectionLost, Some(message.into()))
    }

    fn with_status(status: ResultStatus, error: Option<String>) -> Self {
        Self {
            status,
            fields: Vec::new(),
            rows: Vec::new(),
            command_tag: None,
            error,
        }
    }

    pub fn set_command_tag(&mut self, tag: impl Into<String>) {
        self.command_tag = Some(tag.into());
    }

    #[inline]
    pub fn status(&self) -> ResultStatus {
        self.status
    }

    #[inline]
    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.eq_ignore_ascii_case(name))
    }

    /// Cell text; `None` for SQL NULL or out of range.
    pub fn value(&self, row: usize, col: usize) -> Option<&str> {
        self.rows.get(row)?.get(col)?.as_deref()
    }

    /// Cell text looked up by column name.
    pub fn value_by_name(&self, row: usize, name: &str) -> Option<&str> {
        self.value(row, self.field_index(name)?)
    }

    pub fn is_null(&self, row: usize, col: usize) -> bool {
        self.value(row, col).is_none()
    }

    /// Cell parsed as `T`.
    pub fn parse<T: FromStr>(&self, row: usize, col: usize) -> Option<T> {
        self.value(row, col)?.trim().parse().ok()
    }

    pub fn parse_by_name<T: FromStr>(&self, row: usize, name: &str) -> Option<T> {
        self.parse(row, self.field_index(name)?)
    }

    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Rows touched according to the command tag (`INSERT 0 3` → 3).
    pub fn affected_rows(&self) -> Option<u64> {
        self.command_tag
            .as_deref()?
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
