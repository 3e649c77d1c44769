//! Command normalization and sudo wrapping.

use serde::{Deserialize, Serialize};

/// A command rewrite: `from` becomes `program prefix_args... original_args...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rewrite {
    pub from: &'static str,
    pub program: &'static str,
    pub prefix_args: &'static [&'static str],
}

/// Package-manager invocations that must go through their dispatcher.
pub const REWRITES: &[Rewrite] = &[Rewrite {
    from: "pnpm",
    program: "corepack",
    prefix_args: &["pnpm"],
}];

/// A command and its argument vector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Invocation {
    /// Creates an invocation.
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Applies the first matching entry of [`REWRITES`], or returns the
    /// invocation unchanged.
    pub fn normalize(self) -> Self {
        let trimmed = self.command.trim();
        match REWRITES.iter().find(|rewrite| rewrite.from == trimmed) {
            Some(rewrite) => Self {
                command: rewrite.program.to_string(),
                args: rewrite
                    .prefix_args
                    .iter()
                    .map(|arg| arg.to_string())
                    .chain(self.args)
                    .collect(),
            },
            None => self,
        }
    }

    /// Returns what the transport should execute: `sudo command args...`
    /// when `sudo` is set, otherwise the invocation itself.
    pub fn dispatch(&self, sudo: bool) -> Invocation {
        if sudo {
            Invocation {
                command: "sudo".to_string(),
                args: std::iter::once(self.command.clone())
                    .chain(self.args.iter().cloned())
                    .collect(),
            }
        } else {
            self.clone()
        }
    }

    /// Space-joined display form, for logs and messages.
    pub fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
