use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The PEM block is not an RSA or P-256 key/certificate we can use.
    #[error("unsupported or malformed key: {0}")]
    InvalidKey(String),

    /// The signature text does not decode under the expected encoding.
    #[error("signature is not valid {encoding}: {reason}")]
    InvalidEncoding {
        encoding: &'static str,
        reason: String,
    },

    #[error("malformed ECDSA signature")]
    MalformedSignature,

    #[error("signature verification failed")]
    SignatureMismatch,

    /// Token shape, claims or expiry were rejected.
    #[error("token rejected: {0}")]
    Token(String),
}

impl From<jsonwebtoken::errors::Error> for CryptoError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match err.kind() {
            ErrorKind::InvalidSignature => CryptoError::SignatureMismatch,
            ErrorKind::InvalidKeyFormat
            | ErrorKind::InvalidRsaKey(_)
            | ErrorKind::InvalidEcdsaKey => CryptoError::InvalidKey(err.to_string()),
            _ => CryptoError::Token(err.to_string()),
        }
    }
}
