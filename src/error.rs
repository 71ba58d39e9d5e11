use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid index {index} (maximum: {len})")]
    InvalidIndex { index: usize, len: usize },
    #[error("no mod named \"{0}\"")]
    UnknownName(String),
    #[error("invalid mod name \"{0}\"")]
    InvalidName(String),
    #[error("a mod named \"{0}\" already exists")]
    NameTaken(String),
    #[error("failed to rename \"{from}\" to \"{to}\"")]
    RenameFailed {
        from: String,
        to: String,
        #[source]
        source: std::io::Error,
    },
}
