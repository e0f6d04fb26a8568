//! Scripted in-memory runner for tests.

use super::{Context, RunOptions, Runner};
use crate::error::RunError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;

type Handler = Box<dyn Fn(&str) -> Option<Result<String, RunError>> + Send + Sync>;

/// Records every command and answers from scripted responses.
///
/// Lookup order: one-shot responses (FIFO, first whose pattern is contained
/// in the command), then the handler, then persistent responses, then `Ok("")`.
pub(crate) struct FakeRunner {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    log: Vec<(String, Option<String>)>,
    once: VecDeque<(String, Result<String, RunError>)>,
    always: Vec<(String, Result<String, RunError>)>,
    handler: Option<Handler>,
}

impl FakeRunner {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Answer through a closure; returning `None` falls through.
    pub(crate) fn with_handler(
        handler: impl Fn(&str) -> Option<Result<String, RunError>> + Send + Sync + 'static,
    ) -> Self {
        let runner = Self::new();
        runner.inner.lock().unwrap().handler = Some(Box::new(handler));
        runner
    }

    pub(crate) fn respond(&self, pattern: &str, output: &str) {
        self.inner
            .lock()
            .unwrap()
            .always
            .push((pattern.to_string(), Ok(output.to_string())));
    }

    pub(crate) fn fail(&self, pattern: &str, exit_code: i32, output: &str) {
        self.inner.lock().unwrap().always.push((
            pattern.to_string(),
            Err(RunError::Exit {
                exit_code,
                output: output.to_string(),
            }),
        ));
    }

    pub(crate) fn respond_next(&self, pattern: &str, output: &str) {
        self.inner
            .lock()
            .unwrap()
            .once
            .push_back((pattern.to_string(), Ok(output.to_string())));
    }

    pub(crate) fn fail_next(&self, pattern: &str, exit_code: i32, output: &str) {
        self.inner.lock().unwrap().once.push_back((
            pattern.to_string(),
            Err(RunError::Exit {
                exit_code,
                output: output.to_string(),
            }),
        ));
    }

    pub(crate) fn error_next(&self, pattern: &str, err: RunError) {
        self.inner
            .lock()
            .unwrap()
            .once
            .push_back((pattern.to_string(), Err(err)));
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .log
            .iter()
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub(crate) fn stdin_of(&self, index: usize) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .log
            .get(index)
            .and_then(|(_, s)| s.clone())
    }
}

#[async_trait]
impl Runner for FakeRunner {
    async fn run(
        &self,
        ctx: &Context,
        command: &str,
        opts: &RunOptions,
    ) -> Result<String, RunError> {
        if let Some(reason) = ctx.err() {
            return Err(reason);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.log.push((command.to_string(), opts.stdin.clone()));

        if let Some(pos) = inner.once.iter().position(|(p, _)| command.contains(p.as_str())) {
            if let Some((_, result)) = inner.once.remove(pos) {
                return result;
            }
        }
        if let Some(handler) = &inner.handler {
            if let Some(result) = handler(command) {
                return result;
            }
        }
        inner
            .always
            .iter()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, r)| r.clone())
            .unwrap_or_else(|| Ok(String::new()))
    }

    fn target(&self) -> &str {
        "fake"
    }
}
