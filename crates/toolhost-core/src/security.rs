//! Argument screening and execution environments.

use crate::error::{ConfigError, CoreError, CoreResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Patterns rejected unless the config overrides them.
pub const DEFAULT_BLOCKED_PATTERNS: &[&str] = &[
    // Path traversal
    r"(^|[/\\])\.\.([/\\]|$)",
    // Shell command substitution
    r"\$\([^)]*\)",
    r"`[^`]*`",
];

/// Default cap on serialized argument size.
pub const DEFAULT_MAX_ARGUMENT_BYTES: usize = 1024 * 1024;

/// Where tool calls are allowed to execute.
///
/// Only `Host` is implemented; the isolated variants are reserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionEnvironment {
    #[default]
    Host,
    Container,
    #[serde(rename = "vm")]
    VirtualMachine,
    Sandbox,
}

impl ExecutionEnvironment {
    /// Fail unless calls can run in this environment.
    pub fn ensure_supported(self) -> CoreResult<()> {
        match self {
            ExecutionEnvironment::Host => Ok(()),
            other => Err(CoreError::NotImplemented(format!(
                "tool execution in {other} environment"
            ))),
        }
    }
}

impl fmt::Display for ExecutionEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionEnvironment::Host => "host",
            ExecutionEnvironment::Container => "container",
            ExecutionEnvironment::VirtualMachine => "vm",
            ExecutionEnvironment::Sandbox => "sandbox",
        })
    }
}

/// Rejects tool arguments containing blocked patterns or too many bytes.
#[derive(Debug, Clone)]
pub struct InputValidator {
    patterns: Vec<Regex>,
    max_bytes: usize,
}

impl InputValidator {
    pub fn new<S: AsRef<str>>(patterns: &[S], max_bytes: usize) -> Result<Self, ConfigError> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p.as_ref()).map_err(|e| {
                    ConfigError::validation(format!("invalid blocked pattern {:?}: {e}", p.as_ref()))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            max_bytes,
        })
    }

    /// Validator that accepts everything below the size cap.
    pub fn permissive(max_bytes: usize) -> Self {
        Self {
            patterns: Vec::new(),
            max_bytes,
        }
    }

    pub fn validate(&self, arguments: &Value) -> CoreResult<()> {
        let size = arguments.to_string().len();
        if size > self.max_bytes {
            return Err(CoreError::InvalidInput(format!(
                "arguments are {size} bytes, limit is {}",
                self.max_bytes
            )));
        }
        self.check(arguments, "$")
    }

    fn check(&self, value: &Value, path: &str) -> CoreResult<()> {
        match value {
            Value::String(s) => {
                if let Some(pattern) = self.patterns.iter().find(|p| p.is_match(s)) {
                    return Err(CoreError::InvalidInput(format!(
                        "{path} matches blocked pattern {}",
                        pattern.as_str()
                    )));
                }
                Ok(())
            }
            Value::Array(items) => items
                .iter()
                .enumerate()
                .try_for_each(|(i, item)| self.check(item, &format!("{path}[{i}]"))),
            Value::Object(map) => map
                .iter()
                .try_for_each(|(key, item)| self.check(item, &format!("{path}.{key}"))),
            _ => Ok(()),
        }
    }
}

impl Default for InputValidator {
    fn default() -> Self {
        // The default patterns are known to compile.
        Self::new(DEFAULT_BLOCKED_PATTERNS, DEFAULT_MAX_ARGUMENT_BYTES)
            .unwrap_or_else(|_| Self::permissive(DEFAULT_MAX_ARGUMENT_BYTES))
    }
}
