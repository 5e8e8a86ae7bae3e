//! New-account onboarding.
//!
//! ```text
//! register --(account created)--> verify-otp --(otp confirmed)--> select-role --(role chosen)--> complete
//! ```
//!
//! Every transition needs a successful server call. A failed call leaves the
//! step where it was. `complete` is terminal.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::{RegistrationError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegistrationStep {
    Register,
    VerifyOtp,
    SelectRole,
    Complete,
}

impl RegistrationStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationStep::Register => "register",
            RegistrationStep::VerifyOtp => "verify-otp",
            RegistrationStep::SelectRole => "select-role",
            RegistrationStep::Complete => "complete",
        }
    }

    /// The step that follows this one, `None` once complete
    pub fn next(&self) -> Option<RegistrationStep> {
        match self {
            RegistrationStep::Register => Some(RegistrationStep::VerifyOtp),
            RegistrationStep::VerifyOtp => Some(RegistrationStep::SelectRole),
            RegistrationStep::SelectRole => Some(RegistrationStep::Complete),
            RegistrationStep::Complete => None,
        }
    }
}

impl fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an onboarding flow currently stands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationProgress {
    pub step: RegistrationStep,
    /// Account id assigned by the server once `register` succeeds
    pub subject_id: Option<String>,
}

impl Default for RegistrationProgress {
    fn default() -> Self {
        Self {
            step: RegistrationStep::Register,
            subject_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Candidate,
    Interviewer,
}

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterForm {
    pub full_name: String,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for RegisterForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterForm")
            .field("full_name", &self.full_name)
            .field("email", &self.email)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Completes the step named by the variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationAction {
    Register(RegisterForm),
    VerifyOtp { code: String },
    SelectRole { role: Role },
}

impl RegistrationAction {
    pub fn step(&self) -> RegistrationStep {
        match self {
            RegistrationAction::Register(_) => RegistrationStep::Register,
            RegistrationAction::VerifyOtp { .. } => RegistrationStep::VerifyOtp,
            RegistrationAction::SelectRole { .. } => RegistrationStep::SelectRole,
        }
    }
}

/// Server calls behind each registration step
#[async_trait::async_trait]
pub trait RegistrationApi: Send + Sync {
    /// Create the account and return its id
    async fn register(&self, form: &RegisterForm) -> Result<String>;
    async fn verify_otp(&self, subject_id: &str, code: &str) -> Result<()>;
    async fn resend_otp(&self, subject_id: &str) -> Result<()>;
    async fn select_role(&self, subject_id: &str, role: Role) -> Result<()>;
}

pub struct RegistrationStateMachine {
    api: Arc<dyn RegistrationApi>,
    progress: RegistrationProgress,
}

impl fmt::Debug for RegistrationStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationStateMachine")
            .field("progress", &self.progress)
            .finish()
    }
}

impl RegistrationStateMachine {
    pub fn new(api: Arc<dyn RegistrationApi>) -> Self {
        Self::resume(api, RegistrationProgress::default())
    }

    /// Pick up a flow saved earlier, e.g. after a restart
    pub fn resume(api: Arc<dyn RegistrationApi>, progress: RegistrationProgress) -> Self {
        Self { api, progress }
    }

    pub fn step(&self) -> RegistrationStep {
        self.progress.step
    }

    pub fn progress(&self) -> &RegistrationProgress {
        &self.progress
    }

    pub fn is_complete(&self) -> bool {
        self.progress.step == RegistrationStep::Complete
    }

    /// Run the server call for the current step and move to the next one.
    ///
    /// `action` must complete the current step; anything else is rejected
    /// with [`RegistrationError::OutOfOrder`] before any call is made.
    #[instrument(skip(self, action), fields(current = %self.progress.step, attempted = %action.step()))]
    pub async fn advance(&mut self, action: RegistrationAction) -> Result<RegistrationStep> {
        let current = self.progress.step;
        if current == RegistrationStep::Complete {
            return Err(RegistrationError::AlreadyComplete);
        }
        if action.step() != current {
            warn!("Rejecting out-of-order registration step");
            return Err(RegistrationError::OutOfOrder {
                current,
                attempted: action.step(),
            });
        }

        match action {
            RegistrationAction::Register(form) => {
                let subject_id = self.api.register(&form).await?;
                debug!(subject_id = %subject_id, "Account created");
                self.progress.subject_id = Some(subject_id);
            }
            RegistrationAction::VerifyOtp { code } => {
                let subject_id = self.subject_id()?;
                self.api.verify_otp(subject_id, &code).await?;
            }
            RegistrationAction::SelectRole { role } => {
                let subject_id = self.subject_id()?;
                self.api.select_role(subject_id, role).await?;
            }
        }

        // `current` is not Complete, so there is always a next step
        let next = current.next().unwrap_or(RegistrationStep::Complete);
        self.progress.step = next;
        info!(step = %next, "Registration advanced");
        Ok(next)
    }

    /// Ask the server for a fresh one-time code. Only valid while verifying.
    #[instrument(skip(self))]
    pub async fn resend_otp(&self) -> Result<()> {
        if self.progress.step != RegistrationStep::VerifyOtp {
            return Err(RegistrationError::ResendNotAllowed {
                current: self.progress.step,
            });
        }
        self.api.resend_otp(self.subject_id()?).await
    }

    fn subject_id(&self) -> Result<&str> {
        self.progress
            .subject_id
            .as_deref()
            .ok_or(RegistrationError::MissingSubject)
    }
}
