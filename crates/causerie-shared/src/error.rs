use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key file IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key material error: {0}")]
    Malformed(String),
}
