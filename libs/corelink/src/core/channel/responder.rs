// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use crate::core::channel::protocol::CommandOutput;
use crate::core::{CoreError, Result};

type Completion = Box<dyn FnOnce(Result<CommandOutput>) + Send + 'static>;

/// Completion slot for one command.
///
/// Resolved at most once. A responder dropped without being resolved
/// completes with a connection error, so a command whose executor vanished
/// still finishes.
pub struct Responder {
    command: &'static str,
    on_complete: Option<Completion>,
}

impl Responder {
    pub fn new<F>(command: &'static str, on_complete: F) -> Self
    where
        F: FnOnce(Result<CommandOutput>) + Send + 'static,
    {
        Self {
            command,
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// Responder that discards its result.
    pub fn detached(command: &'static str) -> Self {
        Self::new(command, |_| {})
    }

    pub fn command(&self) -> &'static str {
        self.command
    }

    pub fn resolve(mut self, result: Result<CommandOutput>) {
        if let Some(complete) = self.on_complete.take() {
            complete(result);
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if let Some(complete) = self.on_complete.take() {
            tracing::debug!("Responder for '{}' dropped unresolved", self.command);
            complete(Err(CoreError::connection_lost(self.command)));
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("command", &self.command)
            .field("resolved", &self.on_complete.is_none())
            .finish()
    }
}
