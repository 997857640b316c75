#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to serialize TOML: {0}")]
    SerializeTOML(#[from] toml_edit::ser::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml_edit::de::Error),

    #[error("Failed to parse TOML document: {0}")]
    Document(#[from] toml_edit::TomlError),

    #[error("Failed to read configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("Failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid scope entry at line {line}: {reason}")]
    InvalidScopeLine { line: usize, reason: String },

    #[error("Scope configuration contains no entries")]
    EmptyScopeConfig,
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::Extract(Box::new(err))
    }
}
