//! Context for the current operation
//!

use core::fmt;

/// Holds the context for the current operation. Used for prefixing logs.
#[derive(Default, Debug, Clone)]
pub struct Context {
    /// The instance being operated on, e.g. `docker:n8n`.
    pub instance: Option<String>,

    /// The current step.
    pub current_context: &'static str,
}

impl Context {
    /// Create a context for an instance.
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: Some(instance.into()),
            current_context: "Start",
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(instance) = &self.instance {
            write!(f, "[{instance}] ")?;
        }

        write!(f, "[{}] ", self.current_context)?;

        Ok(())
    }
}
