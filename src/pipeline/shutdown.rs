// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Shutdown requests and the OS signals that trigger them.
//!
//! - **SIGINT** and **SIGTERM** request an immediate shutdown. A running copy
//!   receives the same signal.
//! - **SIGUSR1** requests a graceful shutdown. The current creation cycle is
//!   allowed to finish first.

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, Signal as SignalStream, SignalKind};

/// State of shutdown broadcast to all pipeline tasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// Keep going.
    #[default]
    Running,

    /// Finish current cycle, then stop.
    Graceful,

    /// Stop now, forwarding the signal to any running copy.
    Immediate(Signal),
}

impl Shutdown {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Listener for signals that request shutdown.
#[derive(Debug)]
pub struct SignalListener {
    sigint: SignalStream,
    sigterm: SignalStream,
    sigusr1: SignalStream,
}

impl SignalListener {
    /// Register handlers for shutdown signals.
    ///
    /// # Errors
    ///
    /// - Return [`std::io::Error`] if a signal handler cannot be registered.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigusr1: signal(SignalKind::user_defined1())?,
        })
    }

    /// Wait for the next shutdown request.
    pub async fn recv(&mut self) -> Shutdown {
        tokio::select! {
            _ = self.sigint.recv() => Shutdown::Immediate(Signal::SIGINT),
            _ = self.sigterm.recv() => Shutdown::Immediate(Signal::SIGTERM),
            _ = self.sigusr1.recv() => Shutdown::Graceful,
        }
    }
}
