//! Reversible multi-step operations.
//!
//! A [`CommandProcessor`] runs an ordered list of [`Command`]s inside one
//! database transaction. If a command fails, the transaction is rolled back
//! and every already-executed command that requires rollback is undone in
//! reverse order. The original error is returned.
//!
//! A command with `requires_rollback() == false` marks the point of no return:
//! the transaction is committed before it runs, and a failure from there on
//! never unwinds the commands before it.

pub mod filesystem;

pub use filesystem::{CopiedFile, CopyDirectory, CreateDirectory, DeleteDirectory};

use crate::error::Result;
use crate::storage::{Broker, Storage};

/// A single step of a multi-step operation.
pub trait Command {
    fn description(&self) -> &str;

    /// Whether [`undo`](Command::undo) must run if a later command fails.
    fn requires_rollback(&self) -> bool {
        true
    }

    /// Perform the step. Database work goes through `broker`, which is bound to
    /// the processor's transaction until the point of no return.
    fn execute(&mut self, broker: &Broker<'_>) -> Result<()>;

    /// Best-effort reversal. Failures are logged, never returned.
    fn undo(&mut self);
}

/// Runs commands in submission order with reverse-order undo on failure.
pub struct CommandProcessor<'a> {
    description: String,
    commands: Vec<Box<dyn Command + 'a>>,
    failure_reason: Option<String>,
}

impl<'a> CommandProcessor<'a> {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            commands: Vec::new(),
            failure_reason: None,
        }
    }

    pub fn add_command(&mut self, command: impl Command + 'a) {
        self.commands.push(Box::new(command));
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// `"<command>: <error>"` for the last failed run.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Execute every command in order.
    ///
    /// On failure, commands `0..i` that require rollback (and were run since
    /// the point of no return) are undone in reverse order, commands after
    /// `i` never run, and the error raised by command `i` is returned.
    pub fn execute(&mut self, storage: &Storage) -> Result<()> {
        tracing::debug!(
            operation = %self.description,
            commands = self.commands.len(),
            "executing commands"
        );
        self.failure_reason = None;

        let mut ctx = Some(storage.open_update_context()?);
        let mut executed: Vec<usize> = Vec::new();

        for index in 0..self.commands.len() {
            if !self.commands[index].requires_rollback() {
                if let Some(open) = ctx.take() {
                    if let Err(e) = open.commit() {
                        self.record_failure(index, &e.to_string());
                        self.undo_executed(&executed);
                        return Err(e);
                    }
                    executed.clear();
                }
            }

            let command = &mut self.commands[index];
            tracing::debug!(command = %command.description(), "execute");
            let result = match &ctx {
                Some(open) => command.execute(&open.broker()),
                None => command.execute(&storage.broker()),
            };

            if let Err(e) = result {
                tracing::warn!(
                    operation = %self.description,
                    command = %self.commands[index].description(),
                    error = %e,
                    "command failed, rolling back"
                );
                self.record_failure(index, &e.to_string());
                if let Some(open) = ctx.take() {
                    if let Err(rollback) = open.rollback() {
                        tracing::error!(error = %rollback, "transaction rollback failed");
                    }
                }
                self.undo_executed(&executed);
                return Err(e);
            }
            executed.push(index);
        }

        if let Some(open) = ctx.take() {
            if let Err(e) = open.commit() {
                self.record_failure(self.commands.len().saturating_sub(1), &e.to_string());
                self.undo_executed(&executed);
                return Err(e);
            }
        }
        Ok(())
    }

    fn record_failure(&mut self, index: usize, error: &str) {
        let command = self
            .commands
            .get(index)
            .map_or("commit", |c| c.description());
        self.failure_reason = Some(format!("{command}: {error}"));
    }

    fn undo_executed(&mut self, executed: &[usize]) {
        for &index in executed.iter().rev() {
            let command = &mut self.commands[index];
            if command.requires_rollback() {
                tracing::debug!(command = %command.description(), "undo");
                command.undo();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::RefCell;

    struct Recorder<'l> {
        name: String,
        fail: bool,
        rollback: bool,
        log: &'l RefCell<Vec<String>>,
    }

    impl<'l> Recorder<'l> {
        fn new(name: &str, log: &'l RefCell<Vec<String>>) -> Self {
            Self {
                name: name.to_string(),
                fail: false,
                rollback: true,
                log,
            }
        }
    }

    impl Command for Recorder<'_> {
        fn description(&self) -> &str {
            &self.name
        }

        fn requires_rollback(&self) -> bool {
            self.rollback
        }

        fn execute(&mut self, _broker: &Broker<'_>) -> Result<()> {
            self.log.borrow_mut().push(format!("execute {}", self.name));
            if self.fail {
                return Err(Error::Other(format!("{} broke", self.name)));
            }
            Ok(())
        }

        fn undo(&mut self) {
            self.log.borrow_mut().push(format!("undo {}", self.name));
        }
    }

    #[test]
    fn all_succeed_nothing_undone() {
        let storage = Storage::in_memory().unwrap();
        let log = RefCell::new(Vec::new());
        let mut processor = CommandProcessor::new("test");
        processor.add_command(Recorder::new("a", &log));
        processor.add_command(Recorder::new("b", &log));

        processor.execute(&storage).unwrap();

        assert_eq!(*log.borrow(), vec!["execute a", "execute b"]);
        assert!(processor.failure_reason().is_none());
    }

    #[test]
    fn failure_after_point_of_no_return_keeps_earlier_work() {
        let storage = Storage::in_memory().unwrap();
        let log = RefCell::new(Vec::new());
        let mut processor = CommandProcessor::new("test");
        processor.add_command(Recorder::new("a", &log));
        let mut tail = Recorder::new("tail", &log);
        tail.rollback = false;
        processor.add_command(tail);
        let mut after = Recorder::new("after", &log);
        after.fail = true;
        processor.add_command(after);

        assert!(processor.execute(&storage).is_err());
        assert_eq!(
            *log.borrow(),
            vec!["execute a", "execute tail", "execute after"]
        );
        assert_eq!(processor.failure_reason(), Some("after: after broke"));
    }
}
