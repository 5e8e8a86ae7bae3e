use mw_auth::AuthError;
use thiserror::Error;

use crate::registration::RegistrationStep;

/// Registration state machine errors
#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("Cannot complete '{attempted}' while registration is at '{current}'")]
    OutOfOrder {
        current: RegistrationStep,
        attempted: RegistrationStep,
    },

    #[error("Registration is already complete")]
    AlreadyComplete,

    #[error("A new code can only be sent while verifying the OTP (currently at '{current}')")]
    ResendNotAllowed { current: RegistrationStep },

    #[error("No account has been created yet")]
    MissingSubject,

    /// The server rejected the submitted data; `message` is meant for display
    #[error("{message}")]
    ValidationFailed { status: u16, message: String },

    #[error(transparent)]
    Api(#[from] AuthError),
}

pub type Result<T> = std::result::Result<T, RegistrationError>;
