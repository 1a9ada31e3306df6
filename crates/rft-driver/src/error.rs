#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("virtualization backend not available: {0}")]
    Unavailable(String),

    #[error("define {kind} failed: {detail}")]
    Define { kind: &'static str, detail: String },

    #[error("{kind} '{name}' not found: {detail}")]
    NotFound {
        kind: &'static str,
        name: String,
        detail: String,
    },

    #[error("{operation} of '{name}' failed: {detail}")]
    Operation {
        name: String,
        operation: &'static str,
        detail: String,
    },

    #[error("listing networks failed: {0}")]
    List(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    #[error("remote shell not available: {0}")]
    Unavailable(String),

    #[error("connect to {user}@{host} failed: {detail}")]
    Connect {
        host: String,
        user: String,
        detail: String,
    },

    #[error("exec '{command}' failed: {detail}")]
    Exec { command: String, detail: String },

    #[error("transfer {src} -> {dst} failed: {detail}")]
    Transfer {
        src: String,
        dst: String,
        detail: String,
    },
}

pub type ShellResult<T> = std::result::Result<T, ShellError>;
