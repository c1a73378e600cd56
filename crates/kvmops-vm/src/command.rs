//! Host command execution.
//!
//! Every external tool (`virsh`, `qemu-img`, `nix-build`, `ssh-keygen`) is
//! invoked through a [`CommandRunner`], so callers can swap the real
//! process runner for a scripted one.

use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::fmt;
use std::process::Stdio;

/// A fully described host command: program, arguments and extra environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl HostCommand {
    /// Start describing an invocation of `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child, on top of the inherited environment.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_envs(&self) -> &[(String, String)] {
        &self.envs
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.is_empty() {
                write!(f, " \"\"")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

/// Executes host commands.
///
/// Implementations return the captured standard output on success and
/// [`VmError::ExternalTool`] when the command cannot be spawned or exits
/// with a nonzero status.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &HostCommand) -> Result<String>;
}

/// Runs commands as real child processes via `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &HostCommand) -> Result<String> {
        tracing::debug!(command = %cmd, "Running host command");

        let output = tokio::process::Command::new(&cmd.program)
            .args(&cmd.args)
            .envs(cmd.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| VmError::ExternalTool {
                program: cmd.program.clone(),
                status: format!("spawn failed: {e}"),
                stderr: String::new(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            tracing::error!(command = %cmd, status = %output.status, stderr = %stderr, "Host command failed");
            return Err(VmError::ExternalTool {
                program: cmd.program.clone(),
                status: output.status.to_string(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(any(test, feature = "testing"))]
pub use scripted::ScriptedRunner;

#[cfg(any(test, feature = "testing"))]
mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Rule {
        needle: String,
        replies: VecDeque<std::result::Result<String, String>>,
    }

    /// Records every command and answers from canned replies.
    ///
    /// A command is matched against rules by substring of its rendered
    /// command line, first rule wins. Each rule replays its queued replies in
    /// order and keeps repeating the last one. Unmatched commands succeed
    /// with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<HostCommand>>,
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a successful reply for commands containing `needle`.
        pub fn respond(&self, needle: &str, stdout: &str) -> &Self {
            self.push(needle, Ok(stdout.to_string()));
            self
        }

        /// Queue a failing reply for commands containing `needle`.
        pub fn fail(&self, needle: &str, stderr: &str) -> &Self {
            self.push(needle, Err(stderr.to_string()));
            self
        }

        /// Drop whatever is queued for `needle` and answer with `stdout` from now on.
        pub fn replace(&self, needle: &str, stdout: &str) -> &Self {
            self.rules
                .lock()
                .expect("rules lock poisoned")
                .retain(|r| r.needle != needle);
            self.respond(needle, stdout)
        }

        /// Every command issued so far, in order.
        pub fn calls(&self) -> Vec<HostCommand> {
            self.calls.lock().expect("calls lock poisoned").clone()
        }

        /// Number of issued commands whose command line contains `needle`.
        pub fn count(&self, needle: &str) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.to_string().contains(needle))
                .count()
        }

        fn push(&self, needle: &str, reply: std::result::Result<String, String>) {
            let mut rules = self.rules.lock().expect("rules lock poisoned");
            match rules.iter_mut().find(|r| r.needle == needle) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    needle: needle.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &HostCommand) -> Result<String> {
            self.calls
                .lock()
                .expect("calls lock poisoned")
                .push(cmd.clone());

            let line = cmd.to_string();
            let mut rules = self.rules.lock().expect("rules lock poisoned");
            let Some(rule) = rules.iter_mut().find(|r| line.contains(&r.needle)) else {
                return Ok(String::new());
            };

            let reply = if rule.replies.len() > 1 {
                rule.replies.pop_front()
            } else {
                rule.replies.front().cloned()
            };

            match reply {
                Some(Ok(stdout)) => Ok(stdout),
                Some(Err(stderr)) => Err(VmError::ExternalTool {
                    program: cmd.program().to_string(),
                    status: "exit status: 1".into(),
                    stderr,
                }),
                None => Ok(String::new()),
            }
        }
    }
}
