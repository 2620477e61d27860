//! Module run events and the handle a caller consumes them through.

use foothold_core::{Error, Fact, Result};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// Capacity of the per-run event channel.
pub(crate) const EVENT_BUFFER: usize = 64;

/// One event of a module run, in production order.
#[derive(Debug)]
pub enum ModuleEvent {
    Status(String),
    Progress { current: u64, total: Option<u64> },
    Fact(Fact),
    /// Intermediate result of a base or implant module.
    Result(Value),
    /// Terminal: the module returned.
    Done(Value),
    /// Terminal: the module failed.
    Failed(Error),
}

impl ModuleEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Failed(_))
    }
}

/// Everything a finished run produced.
#[derive(Clone, Debug, Default)]
pub struct ModuleOutput {
    pub module: String,
    pub facts: Vec<Fact>,
    pub results: Vec<Value>,
    pub value: Value,
    pub collapse: bool,
}

impl ModuleOutput {
    /// Presentation form: facts (one bare fact when collapsing), else results,
    /// else the return value.
    pub fn presented(&self) -> Value {
        if !self.facts.is_empty() {
            if self.collapse && self.facts.len() == 1 {
                return serde_json::to_value(&self.facts[0]).unwrap_or(Value::Null);
            }
            return serde_json::to_value(&self.facts).unwrap_or(Value::Null);
        }
        match self.results.len() {
            0 => self.value.clone(),
            1 if self.collapse => self.results[0].clone(),
            _ => Value::Array(self.results.clone()),
        }
    }
}

/// A running (or finished) module invocation.
///
/// Dropping the handle before the terminal event cancels the run.
pub struct ModuleRun {
    module: String,
    collapse: bool,
    rx: mpsc::Receiver<ModuleEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    finished: bool,
}

impl fmt::Debug for ModuleRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRun")
            .field("module", &self.module)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ModuleRun {
    pub(crate) fn new(
        module: String,
        collapse: bool,
        rx: mpsc::Receiver<ModuleEvent>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            module,
            collapse,
            rx,
            cancel,
            task: Some(task),
            finished: false,
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Stop the run. In-flight commands are interrupted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Next event; `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<ModuleEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => {
                self.finished = event.is_terminal();
                Some(event)
            }
            None => {
                self.finished = true;
                Some(ModuleEvent::Failed(self.worker_gone().await))
            }
        }
    }

    /// Run to completion and gather everything.
    pub async fn collect(mut self) -> Result<ModuleOutput> {
        let mut output = ModuleOutput {
            module: self.module.clone(),
            collapse: self.collapse,
            ..Default::default()
        };
        while let Some(event) = self.next_event().await {
            match event {
                ModuleEvent::Status(msg) => tracing::debug!(module = %self.module, "{}", msg),
                ModuleEvent::Progress { .. } => {}
                ModuleEvent::Fact(f) => output.facts.push(f),
                ModuleEvent::Result(v) => output.results.push(v),
                ModuleEvent::Done(v) => output.value = v,
                ModuleEvent::Failed(e) => return Err(e),
            }
        }
        Ok(output)
    }

    /// Raw event stream. Cancellation on drop no longer applies.
    pub fn into_stream(mut self) -> ReceiverStream<ModuleEvent> {
        self.finished = true;
        let (tx, rx) = mpsc::channel(1);
        drop(tx);
        ReceiverStream::new(std::mem::replace(&mut self.rx, rx))
    }

    async fn worker_gone(&mut self) -> Error {
        let reason = match self.task.take() {
            Some(task) => match task.await {
                Err(e) if e.is_panic() => "module panicked".to_string(),
                _ => "worker ended without a result".to_string(),
            },
            None => "worker ended without a result".to_string(),
        };
        Error::module_failed(&self.module, reason)
    }
}

impl Drop for ModuleRun {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fact(path: &str) -> Fact {
        Fact::new("m", ["file.suid"], json!({ "path": path })).unwrap()
    }

    #[test]
    fn collapse_single_fact() {
        let mut out = ModuleOutput {
            module: "m".into(),
            facts: vec![fact("/a")],
            collapse: true,
            ..Default::default()
        };
        assert!(out.presented().is_object());
        out.collapse = false;
        assert!(out.presented().is_array());
        out.facts.push(fact("/b"));
        out.collapse = true;
        assert_eq!(out.presented().as_array().unwrap().len(), 2);
    }

    #[test]
    fn value_when_nothing_else() {
        let out = ModuleOutput {
            value: json!("ok"),
            ..Default::default()
        };
        assert_eq!(out.presented(), json!("ok"));
    }

    #[tokio::test]
    async fn collect_gathers_until_done() {
        let (tx, rx) = mpsc::channel(8);
        let token = CancellationToken::new();
        let task = tokio::spawn(async move {
            let _ = tx.send(ModuleEvent::Status("working".into())).await;
            let _ = tx.send(ModuleEvent::Fact(fact("/a"))).await;
            let _ = tx.send(ModuleEvent::Done(json!(1))).await;
        });
        let run = ModuleRun::new("m".into(), false, rx, token.clone(), task);
        let out = run.collect().await.unwrap();
        assert_eq!(out.facts.len(), 1);
        assert_eq!(out.value, json!(1));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn silent_worker_is_module_failed() {
        let (tx, rx) = mpsc::channel::<ModuleEvent>(8);
        let task = tokio::spawn(async move { drop(tx) });
        let run = ModuleRun::new("m".into(), false, rx, CancellationToken::new(), task);
        assert!(matches!(run.collect().await, Err(Error::ModuleFailed { .. })));
    }

    #[tokio::test]
    async fn dropping_unfinished_run_cancels() {
        let (_tx, rx) = mpsc::channel::<ModuleEvent>(8);
        let token = CancellationToken::new();
        let task = tokio::spawn(async {});
        drop(ModuleRun::new("m".into(), false, rx, token.clone(), task));
        assert!(token.is_cancelled());
    }
}
