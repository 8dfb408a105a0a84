use std::fmt;

#[derive(Debug)]
pub enum Error {
    Parse(String),
    PathNotFound(String),
    NoChangesToFinalize,
    InsufficientCheckpoints { requested: usize, available: usize },
    Backup(String),
    Write(String),
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(msg) => write!(f, "XML parse error: {msg}"),
            Error::PathNotFound(path) => write!(f, "no such element path: {path}"),
            Error::NoChangesToFinalize => write!(f, "no pending changes to finalize"),
            Error::InsufficientCheckpoints {
                requested,
                available,
            } => write!(
                f,
                "cannot roll back {requested} checkpoints ({available} available)"
            ),
            Error::Backup(msg) => write!(f, "checkpoint backup failed: {msg}"),
            Error::Write(msg) => write!(f, "write failed: {msg}"),
            Error::Msg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
