// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process handle that survives dropped runtime connections.

use std::sync::Arc;

use tracing::warn;

use crate::client::{Process, ProcessIo, RuntimeContainer, Signal};
use crate::error::{Error, Result};

enum State {
    Running(Box<dyn Process>),
    Reattaching,
    Terminal(i32),
}

/// Wraps a runtime process and re-attaches by process ID whenever the
/// connection to the runtime drops while waiting.
///
/// Only [`Error::ConnectionLost`] triggers a re-attach. Any other error is
/// returned as is, and a failed re-attach leaves the handle in the
/// re-attaching state so the next `wait` tries again.
pub struct ReattachingProcess {
    container: Arc<dyn RuntimeContainer>,
    process_id: String,
    io: ProcessIo,
    state: State,
}

impl ReattachingProcess {
    /// Wraps a process started or attached on `container`.
    pub fn new(container: Arc<dyn RuntimeContainer>, process: Box<dyn Process>, io: ProcessIo) -> Self {
        Self {
            container,
            process_id: process.id(),
            io,
            state: State::Running(process),
        }
    }

    /// Runtime process ID.
    pub fn id(&self) -> &str {
        &self.process_id
    }

    /// Current state, for logging.
    pub fn state_name(&self) -> &'static str {
        match self.state {
            State::Running(_) => "running",
            State::Reattaching => "reattaching",
            State::Terminal(_) => "terminal",
        }
    }

    /// Waits for the exit status, re-attaching across connection drops.
    pub async fn wait(&mut self) -> Result<i32> {
        loop {
            match std::mem::replace(&mut self.state, State::Reattaching) {
                State::Terminal(status) => {
                    self.state = State::Terminal(status);
                    return Ok(status);
                }
                State::Running(process) => match process.wait().await {
                    Ok(status) => {
                        self.state = State::Terminal(status);
                        return Ok(status);
                    }
                    Err(Error::ConnectionLost(reason)) => {
                        warn!(
                            process = %self.process_id,
                            reason = %reason,
                            "Lost connection to process, re-attaching"
                        );
                    }
                    Err(e) => {
                        self.state = State::Running(process);
                        return Err(e);
                    }
                },
                State::Reattaching => {
                    let process = self
                        .container
                        .attach(&self.process_id, self.io.clone())
                        .await?;
                    self.state = State::Running(process);
                }
            }
        }
    }

    /// Delivers a signal if the process is attached.
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        match &self.state {
            State::Running(process) => process.signal(signal).await,
            _ => Ok(()),
        }
    }
}
