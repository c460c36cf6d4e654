use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("entropy source unavailable: {0}")]
    Entropy(String),
    #[error("invalid compressed point")]
    InvalidPoint,
    #[error("small-order point")]
    SmallOrderPoint,
    #[error("scalar is zero")]
    ZeroScalar,
    #[error("scalar is not canonically encoded")]
    NonCanonicalScalar,
    #[error("secret does not match commitment")]
    CommitmentMismatch,
    #[error(transparent)]
    MoneroKey(#[from] monero::util::key::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
