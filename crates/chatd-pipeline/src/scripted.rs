//! In-memory driver fed with canned results.
//!
//! The test keeps a [`ScriptHandle`] to queue results and inspect what
//! the pipeline sent, while the pipeline owns the [`ScriptedDriver`].

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{Param, PipelineDriver};
use crate::error::{PipelineError, Result};
use crate::result::DbResult;

#[derive(Debug, Default)]
struct ScriptState {
    results: VecDeque<DbResult>,
    sent: Vec<(String, Vec<Param>)>,
    syncs: usize,
    flushes: usize,
    reconnects: usize,
    fail_next_send: bool,
    fail_consume: bool,
}

/// Driver half, handed to the pipeline.
pub struct ScriptedDriver {
    state: Arc<Mutex<ScriptState>>,
}

/// Test half.
#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDriver {
    pub fn new() -> (Self, ScriptHandle) {
        let state = Arc::new(Mutex::new(ScriptState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            ScriptHandle { state },
        )
    }
}

impl PipelineDriver for ScriptedDriver {
    fn send_query(&mut self, sql: &str, params: &[Param]) -> Result<()> {
        let mut st = self.state.lock();
        if std::mem::take(&mut st.fail_next_send) {
            return Err(PipelineError::Driver("scripted send failure".into()));
        }
        st.sent.push((sql.to_string(), params.to_vec()));
        Ok(())
    }

    fn pipeline_sync(&mut self) -> Result<()> {
        self.state.lock().syncs += 1;
        Ok(())
    }

    fn send_flush(&mut self) -> Result<()> {
        self.state.lock().flushes += 1;
        Ok(())
    }

    fn consume_input(&mut self) -> Result<()> {
        if std::mem::take(&mut self.state.lock().fail_consume) {
            return Err(PipelineError::Disconnected);
        }
        Ok(())
    }

    fn next_result(&mut self) -> Option<DbResult> {
        self.state.lock().results.pop_front()
    }

    fn socket(&self) -> RawFd {
        -1
    }

    fn reconnect(&mut self) -> Result<()> {
        let mut st = self.state.lock();
        st.reconnects += 1;
        st.results.clear();
        Ok(())
    }
}

impl ScriptHandle {
    pub fn push_result(&self, res: DbResult) {
        self.state.lock().results.push_back(res);
    }

    pub fn push_results(&self, results: impl IntoIterator<Item = DbResult>) {
        self.state.lock().results.extend(results);
    }

    /// SQL text of every query sent so far.
    pub fn sent_sql(&self) -> Vec<String> {
        self.state.lock().sent.iter().map(|(s, _)| s.clone()).collect()
    }

    /// Parameters of the `n`th query sent.
    pub fn sent_params(&self, n: usize) -> Option<Vec<Param>> {
        self.state.lock().sent.get(n).map(|(_, p)| p.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn sync_count(&self) -> usize {
        self.state.lock().syncs
    }

    pub fn flush_count(&self) -> usize {
        self.state.lock().flushes
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().reconnects
    }

    pub fn fail_next_send(&self) {
        self.state.lock().fail_next_send = true;
    }

    pub fn fail_next_consume(&self) {
        self.state.lock().fail_consume = true;
    }
}
