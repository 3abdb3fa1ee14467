//! Turns the backend message stream into one [`DbResult`] per query.
//!
//! The assembler keeps the list of things the server still owes us, in
//! send order: one `Query` per statement and one `Sync` per sync point.
//! After a per-command error the server discards everything up to the
//! next Sync without answering, so the queries it skipped are reported as
//! `Aborted` when ReadyForQuery arrives.

use std::collections::VecDeque;

use chatd_pipeline::DbResult;
use tracing::{debug, trace, warn};

use crate::codec::BackendMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expect {
    Query,
    Sync,
}

#[derive(Debug, Default)]
pub struct ResultAssembler {
    expect: VecDeque<Expect>,
    fields: Option<Vec<String>>,
    rows: Vec<Vec<Option<String>>>,
    ready: VecDeque<DbResult>,
    lost: bool,
    skipping: bool,
}

impl ResultAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_query(&mut self) {
        self.expect.push_back(Expect::Query);
    }

    pub fn expect_sync(&mut self) {
        self.expect.push_back(Expect::Sync);
    }

    /// Assembled results not yet handed out.
    pub fn pop_result(&mut self) -> Option<DbResult> {
        self.ready.pop_front()
    }

    /// Owed results, queries and syncs together.
    pub fn outstanding(&self) -> usize {
        self.expect.len()
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// A statement failed and no Sync is owed yet, so the server will
    /// stay silent until one is sent.
    pub fn needs_sync(&self) -> bool {
        self.skipping && !self.lost && !self.expect.contains(&Expect::Sync)
    }

    /// Report the connection gone. Later messages are ignored.
    pub fn connection_lost(&mut self, reason: &str) {
        if self.lost {
            return;
        }
        self.lost = true;
        self.expect.clear();
        self.ready.push_back(DbResult::connection_lost(reason));
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn feed(&mut self, msg: BackendMessage) {
        if self.lost {
            return;
        }
        match msg {
            BackendMessage::ParseComplete | BackendMessage::BindComplete => {}
            BackendMessage::NoData => self.fields = None,
            BackendMessage::RowDescription(names) => self.fields = Some(names),
            BackendMessage::DataRow(cols) => self.rows.push(cols),
            BackendMessage::CommandComplete(tag) => {
                let mut res = match self.fields.take() {
                    Some(fields) => DbResult::tuples(fields, std::mem::take(&mut self.rows)),
                    None => DbResult::command_ok(tag.clone()),
                };
                res.set_command_tag(tag);
                self.rows.clear();
                self.finish_query(res);
            }
            BackendMessage::EmptyQueryResponse => self.finish_query(DbResult::command_ok("")),
            BackendMessage::Error(fields) => {
                if fields.is_fatal() {
                    self.connection_lost(&fields.describe());
                    return;
                }
                self.fields = None;
                self.rows.clear();
                match self.expect.front() {
                    Some(Expect::Query) => {
                        debug!(code = %fields.code, message = %fields.message, "statement failed");
                        self.skipping = true;
                        self.finish_query(DbResult::error(fields.message));
                    }
                    _ => {
                        warn!(code = %fields.code, message = %fields.message, "error outside a statement");
                        self.connection_lost(&fields.describe());
                    }
                }
            }
            BackendMessage::ReadyForQuery(_) => {
                self.skipping = false;
                while let Some(Expect::Query) = self.expect.front() {
                    self.expect.pop_front();
                    self.ready.push_back(DbResult::aborted());
                }
                match self.expect.pop_front() {
                    Some(Expect::Sync) => self.ready.push_back(DbResult::sync()),
                    _ => self.connection_lost("ReadyForQuery without a pending sync"),
                }
            }
            BackendMessage::Notice(fields) => {
                debug!(severity = %fields.severity, message = %fields.message, "server notice");
            }
            BackendMessage::ParameterStatus { name, value } => {
                trace!(%name, %value, "parameter status");
            }
            other => trace!(?other, "ignored backend message"),
        }
    }

    fn finish_query(&mut self, res: DbResult) {
        match self.expect.front() {
            Some(Expect::Query) => {
                self.expect.pop_front();
                self.ready.push_back(res);
            }
            _ => self.connection_lost("result for a statement that was never sent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ErrorFields;
    use chatd_pipeline::ResultStatus;

    fn statuses(a: &mut ResultAssembler) -> Vec<ResultStatus> {
        std::iter::from_fn(|| a.pop_result()).map(|r| r.status()).collect()
    }

    fn err(severity: &str) -> BackendMessage {
        BackendMessage::Error(ErrorFields {
            severity: severity.into(),
            code: "23505".into(),
            message: "duplicate key".into(),
            detail: None,
        })
    }

    #[test]
    fn test_insert_and_select() {
        let mut a = ResultAssembler::new();
        a.expect_query();
        a.expect_sync();
        a.expect_query();

        for m in [
            BackendMessage::ParseComplete,
            BackendMessage::BindComplete,
            BackendMessage::NoData,
            BackendMessage::CommandComplete("INSERT 0 1".into()),
            BackendMessage::ReadyForQuery(b'I'),
            BackendMessage::ParseComplete,
            BackendMessage::BindComplete,
            BackendMessage::RowDescription(vec!["ref_count".into()]),
            BackendMessage::DataRow(vec![Some("1".into())]),
            BackendMessage::CommandComplete("SELECT 1".into()),
        ] {
            a.feed(m);
        }

        let first = a.pop_result().unwrap();
        assert_eq!(first.status(), ResultStatus::CommandOk);
        assert_eq!(first.affected_rows(), Some(1));
        assert_eq!(a.pop_result().unwrap().status(), ResultStatus::PipelineSync);
        let third = a.pop_result().unwrap();
        assert_eq!(third.status(), ResultStatus::TuplesOk);
        assert_eq!(third.value(0, 0), Some("1"));
        assert_eq!(a.outstanding(), 0);
    }

    #[test]
    fn test_error_does_not_cross_sync() {
        let mut a = ResultAssembler::new();
        a.expect_query();
        a.expect_sync();
        a.expect_query();
        a.expect_sync();

        a.feed(err("ERROR"));
        a.feed(BackendMessage::ReadyForQuery(b'I'));
        a.feed(BackendMessage::NoData);
        a.feed(BackendMessage::CommandComplete("UPDATE 1".into()));
        a.feed(BackendMessage::ReadyForQuery(b'I'));
        assert_eq!(
            statuses(&mut a),
            vec![
                ResultStatus::Error,
                ResultStatus::PipelineSync,
                ResultStatus::CommandOk,
                ResultStatus::PipelineSync
            ]
        );
    }

    #[test]
    fn test_error_aborts_rest_of_segment() {
        let mut a = ResultAssembler::new();
        a.expect_query();
        a.expect_query();
        a.expect_query();
        a.expect_sync();
        a.feed(err("ERROR"));
        a.feed(BackendMessage::ReadyForQuery(b'I'));
        assert_eq!(
            statuses(&mut a),
            vec![
                ResultStatus::Error,
                ResultStatus::Aborted,
                ResultStatus::Aborted,
                ResultStatus::PipelineSync
            ]
        );
    }

    #[test]
    fn test_error_after_sync_point_needs_sync() {
        let mut a = ResultAssembler::new();
        a.expect_query();
        a.expect_sync();
        a.expect_query();
        a.expect_query();
        a.feed(BackendMessage::NoData);
        a.feed(BackendMessage::CommandComplete("INSERT 0 1".into()));
        a.feed(BackendMessage::ReadyForQuery(b'I'));
        assert!(!a.needs_sync());
        a.feed(err("ERROR"));
        assert!(a.needs_sync());
        a.expect_sync();
        assert!(!a.needs_sync());
        a.feed(BackendMessage::ReadyForQuery(b'I'));
        assert!(!a.needs_sync());
        assert_eq!(
            statuses(&mut a),
            vec![
                ResultStatus::CommandOk,
                ResultStatus::PipelineSync,
                ResultStatus::Error,
                ResultStatus::Aborted,
                ResultStatus::PipelineSync
            ]
        );
    }

    #[test]
    fn test_fatal_error_loses_connection() {
        let mut a = ResultAssembler::new();
        a.expect_query();
        a.feed(err("FATAL"));
        assert!(a.is_lost());
        assert_eq!(statuses(&mut a), vec![ResultStatus::ConnectionLost]);
        a.feed(BackendMessage::CommandComplete("SELECT 1".into()));
        assert!(a.pop_result().is_none());
    }

    #[test]
    fn test_unexpected_result_loses_connection() {
        let mut a = ResultAssembler::new();
        a.feed(BackendMessage::CommandComplete("SELECT 1".into()));
        assert_eq!(statuses(&mut a), vec![ResultStatus::ConnectionLost]);
    }
}
