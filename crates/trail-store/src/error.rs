use std::path::PathBuf;

/// Failures surfaced by the queue and key-value stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// A stored value could not be read back into its Rust type.
    #[error("{table}.{column} holds an unreadable value ({detail})")]
    CorruptRow {
        table: &'static str,
        column: &'static str,
        detail: String,
    },

    /// The file was written by a newer build.
    #[error("database schema v{found} is newer than supported v{supported}")]
    NewerSchema { found: u32, supported: u32 },

    #[error("cannot create {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StoreError {
    pub(crate) fn corrupt(
        table: &'static str,
        column: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        Self::CorruptRow {
            table,
            column,
            detail: detail.into(),
        }
    }
}
