//! Built-in job handlers.

use async_trait::async_trait;

use super::{HandlerRegistry, JobContext, JobHandler, JobResult};

/// Handler: emit a tracing event on every run.
///
/// Useful for heartbeats and for checking that a schedule fires when expected.
#[derive(Debug, Clone)]
pub struct LogHandler {
    message: String,
}

impl LogHandler {
    pub const NAME: &'static str = "log";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new("Scheduled job fired")
    }
}

#[async_trait]
impl JobHandler for LogHandler {
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        ctx.log_info(&format!(
            "{} (scheduled for {})",
            self.message,
            ctx.scheduled_for().to_rfc3339()
        ));
        Ok(())
    }
}

/// Register every built-in handler under its well-known name.
pub fn register_builtins(registry: &HandlerRegistry) {
    registry.register(LogHandler::NAME, LogHandler::default());
}
