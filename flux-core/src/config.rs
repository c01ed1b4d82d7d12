//! Configuration for the replication transport
//!
//! This module describes how the remote receive subprocess is built: which
//! ssh client to run, extra options for it, and the receive command executed
//! on the remote side.

use serde::{Deserialize, Serialize};

/// Default ssh client, resolved through `PATH`
pub const DEFAULT_SSH_PROGRAM: &str = "ssh";

/// Configuration structure for the remote receive subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Program that opens the secure session (`ssh`)
    pub ssh_program: String,
    /// Options placed between the program and the target host
    pub ssh_options: Vec<String>,
    /// Command run on the remote host; the destination is appended
    pub receive_command: Vec<String>,
}

impl TransportConfig {
    /// `ssh <target> zfs recv <dest>`
    pub fn default_ssh() -> Self {
        TransportConfig {
            ssh_program: DEFAULT_SSH_PROGRAM.to_string(),
            ssh_options: Vec::new(),
            receive_command: vec!["zfs".to_string(), "recv".to_string()],
        }
    }

    /// Use a different client program, keeping the default receive command
    pub fn with_program<S: Into<String>>(program: S) -> Self {
        TransportConfig {
            ssh_program: program.into(),
            ..Self::default_ssh()
        }
    }

    /// Add options passed to the client before the target
    pub fn with_ssh_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ssh_options.extend(options.into_iter().map(Into::into));
        self
    }

    /// Replace the remote receive command
    pub fn with_receive_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.receive_command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Full argument list for a transfer to `target:dest`
    pub fn arguments(&self, target: &str, dest: &str) -> Vec<String> {
        let mut args = self.ssh_options.clone();
        args.push(target.to_string());
        args.extend(self.receive_command.iter().cloned());
        args.push(dest.to_string());
        args
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.ssh_program.trim().is_empty() {
            return Err(crate::FluxError::config("transport program cannot be empty"));
        }
        if self.receive_command.is_empty() {
            return Err(crate::FluxError::config(
                "remote receive command cannot be empty",
            ));
        }
        Ok(())
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::default_ssh()
    }
}
