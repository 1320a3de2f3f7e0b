use thiserror::Error;

use talkwave_remote::RemoteError;

/// Errors surfaced by engine operations other than sends.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The operation needs a signed-in user and the auth context is empty.
    #[error("No signed-in user")]
    NotAuthenticated,
}

/// A failed send.
///
/// Carries the composed input back to the caller so a UI can restore it to
/// the input field instead of losing the draft.
#[derive(Error, Debug)]
#[error("Send failed: {reason}")]
pub struct SendError {
    pub reason: String,
    /// The original draft text, `Some` for text sends only.
    pub restored_input: Option<String>,
}
