use crate::prelude::*;

/// Every way a reconcile can fail, carried on `SecretTemplate.status` as a
/// `ReconcileFailed` condition (reason = the variant's Display, message =
/// whatever context the site attached).
#[derive(Debug, Error)]
pub enum ControllerError {
  #[error("input {name}: not found ({reason})")]
  InputNotFound { name: String, reason: String },

  #[error("input {name}: forbidden ({reason})")]
  InputForbidden { name: String, reason: String },

  #[error("input {name}: malformed ({reason})")]
  InputMalformed { name: String, reason: String },

  #[error("input {name}: resolution failed ({reason})")]
  InputResolutionFailed { name: String, reason: String },

  #[error("cross-namespace inputs are disabled (input {name} references namespace {namespace})")]
  CrossNamespaceDisabled { name: String, namespace: String },

  #[error("cross-namespace input {name} not authorized for namespace {consumer_namespace} (source namespace {source_namespace})")]
  CrossNamespaceUnauthorized {
    name: String,
    source_namespace: String,
    consumer_namespace: String,
  },

  #[error("invalid template expression {expression:?}: {reason}")]
  InvalidTemplate { expression: String, reason: String },

  #[error("failed to write output secret: {0}")]
  OutputWriteFailed(#[source] kube::Error),

  #[error("reconcile exceeded its deadline")]
  Timeout,

  #[error("internal error: {0}")]
  InternalError(String),

  #[error("failed to get secret: {0}")]
  SecretGetFailed(#[source] kube::Error),

  #[error("failed to issue token for serviceaccount {namespace}/{name}: {source}")]
  TokenRequestFailed {
    namespace: String,
    name: String,
    #[source]
    source: kube::Error,
  },
}

impl ControllerError {
  /// The condition `reason` field: a short machine-stable identifier, distinct
  /// from the human-readable Display message.
  pub fn reason(&self) -> &'static str {
    match self {
      ControllerError::InputNotFound { .. } => "InputNotFound",
      ControllerError::InputForbidden { .. } => "InputForbidden",
      ControllerError::InputMalformed { .. } => "InputMalformed",
      ControllerError::InputResolutionFailed { .. } => "InputResolutionFailed",
      ControllerError::CrossNamespaceDisabled { .. } => "CrossNamespaceDisabled",
      ControllerError::CrossNamespaceUnauthorized { .. } => "CrossNamespaceUnauthorized",
      ControllerError::InvalidTemplate { .. } => "InvalidTemplate",
      ControllerError::OutputWriteFailed(_) => "OutputWriteFailed",
      ControllerError::Timeout => "Timeout",
      ControllerError::InternalError(_) => "InternalError",
      ControllerError::SecretGetFailed(_) => "OutputWriteFailed",
      ControllerError::TokenRequestFailed { .. } => "InputResolutionFailed",
    }
  }
}
