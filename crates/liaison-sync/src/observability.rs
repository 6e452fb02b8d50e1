use tracing::error;

use liaison_types::report::{ErrorReport, ErrorReporter};

/// Forwards error reports to the tracing pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        match report {
            ErrorReport::DecryptFailure {
                conversation_id,
                message_id,
                reason,
            } => error!(
                conversation_id = ?conversation_id,
                message_id = ?message_id,
                "message decryption failed: {}",
                reason
            ),
            ErrorReport::FatalSession { reason } => {
                error!("real-time session lost, re-authentication required: {}", reason)
            }
        }
    }
}
