use thiserror::Error;

/// Failures the sync driver raises on purpose. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Error on saving \"{title}\" ({language}): edit result was `{result}`\n{diagnostic}")]
    EditRejected {
        language: String,
        title: String,
        result: String,
        diagnostic: String,
    },
    #[error("conflict on `{language}` aborted by operator")]
    ConflictAborted { language: String },
}
