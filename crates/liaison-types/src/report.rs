use uuid::Uuid;

/// Structured error report handed to the observability collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorReport {
    /// One message body or preview could not be decrypted. Recovered locally.
    DecryptFailure {
        conversation_id: Option<Uuid>,
        message_id: Option<Uuid>,
        reason: String,
    },
    /// Credentials were rejected twice in a row; the session must be rebuilt.
    FatalSession { reason: String },
}

pub trait ErrorReporter: Send + Sync {
    fn report(&self, report: ErrorReport);
}
