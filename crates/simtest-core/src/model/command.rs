//! Test commands: the steps a run executes in order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::resolve::Handler;

/// A handler resolved while the definition was being built.
///
/// The reference string is kept for display; the handler itself stays
/// invocable long after the resolution window has closed.
#[derive(Clone)]
pub struct HandlerRef {
    pub reference: String,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandlerRef").field(&self.reference).finish()
    }
}

/// One executable step of a test.
#[derive(Debug, Clone)]
pub enum Command {
    /// Shell command line with its expected return code.
    Shell {
        name: String,
        cmd: String,
        retval: i32,
    },

    /// In-process callback.
    Call { name: String, handler: HandlerRef },

    /// Validation callback with bound arguments, run against the output
    /// produced by earlier commands.
    Checker {
        name: String,
        handler: HandlerRef,
        args: Vec<serde_json::Value>,
        kwargs: BTreeMap<String, serde_json::Value>,
    },
}

impl Command {
    pub fn shell(name: impl Into<String>, cmd: impl Into<String>) -> Self {
        Command::Shell {
            name: name.into(),
            cmd: cmd.into(),
            retval: 0,
        }
    }

    pub fn shell_with_retval(name: impl Into<String>, cmd: impl Into<String>, retval: i32) -> Self {
        Command::Shell {
            name: name.into(),
            cmd: cmd.into(),
            retval,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Command::Shell { name, .. } | Command::Call { name, .. } | Command::Checker { name, .. } => {
                name
            }
        }
    }

    /// Short kind label used in logs and output banners.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Shell { .. } => "shell",
            Command::Call { .. } => "call",
            Command::Checker { .. } => "check",
        }
    }
}
