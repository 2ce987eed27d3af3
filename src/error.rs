use thiserror::Error;

/// Classification bucket per §7's error taxonomy. Every component error
/// maps into exactly one of these via `classify()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Fatal for this PTX: mark Failed, Orchestrator drops it.
    FatalForPtx,
    /// Transient/infrastructure: caller gets the error, state retained.
    Retryable,
    /// Non-terminal, reconciled by the Balance Manager or the gas market.
    Stalled,
    /// Context cancellation or startup config failure.
    Infrastructural,
}

/// Stable string identifiers surfaced externally (§6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PtxErrorCode {
    TransactionIdMissing,
    UnsupportedPayloadVariant,
    TerminalStatusUpdate,
    ContextCancelled,
    GasPriceConfigInvalid,
    GasPriceUnavailable,
    NonceQueryFailed,
    SubmissionRejected,
    NonceConsumedOutOfBand,
    DuplicateId,
}

impl std::fmt::Display for PtxErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransactionIdMissing => "TransactionIDMissing",
            Self::UnsupportedPayloadVariant => "UnsupportedPayloadVariant",
            Self::TerminalStatusUpdate => "TerminalStatusUpdate",
            Self::ContextCancelled => "ContextCancelled",
            Self::GasPriceConfigInvalid => "GasPriceConfigInvalid",
            Self::GasPriceUnavailable => "GasPriceUnavailable",
            Self::NonceQueryFailed => "NonceQueryFailed",
            Self::SubmissionRejected => "SubmissionRejected",
            Self::NonceConsumedOutOfBand => "NonceConsumedOutOfBand",
            Self::DuplicateId => "DuplicateID",
        };
        f.write_str(s)
    }
}

/// Errors raised while driving a single in-flight transaction (§4.3, §7).
#[derive(Debug, Error)]
pub enum IftError {
    #[error("nonce query failed: {0}")]
    NonceQueryFailed(String),

    #[error("gas estimate failed: execution reverted: {0}")]
    SubmissionRejected(String),

    #[error("gas estimate failed: {0}")]
    EstimateFailed(String),

    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("tracking failed: {0}")]
    TrackingFailed(String),

    #[error("nonce {nonce} was consumed out of band by hash {observed_hash}")]
    NonceConsumedOutOfBand { nonce: u64, observed_hash: String },

    #[error("insufficient balance for signer {signer}")]
    StalledForFunds { signer: String },

    #[error("gas price cap reached")]
    GasPriceCapReached,

    #[error("store update failed: {0}")]
    StoreFailed(String),

    #[error("context cancelled")]
    ContextCancelled,
}

impl IftError {
    #[must_use]
    pub const fn classify(&self) -> FailureClass {
        match self {
            Self::SubmissionRejected(_) | Self::NonceConsumedOutOfBand { .. } => {
                FailureClass::FatalForPtx
            }
            Self::StalledForFunds { .. } | Self::GasPriceCapReached => FailureClass::Stalled,
            Self::ContextCancelled => FailureClass::Infrastructural,
            Self::NonceQueryFailed(_)
            | Self::EstimateFailed(_)
            | Self::SigningFailed(_)
            | Self::SubmissionFailed(_)
            | Self::TrackingFailed(_)
            | Self::StoreFailed(_) => FailureClass::Retryable,
        }
    }

    /// Classifies a raw estimate-failure message per §4.3/§9: a message
    /// containing "execution reverted" is Fatal, everything else is
    /// Retryable. This string-matching fallback is preserved explicitly
    /// per §9's design note, even though a `LedgerRpc` implementation may
    /// prefer structured classification where available.
    #[must_use]
    pub fn from_estimate_failure(message: impl Into<String>) -> Self {
        let message = message.into();
        if message.to_lowercase().contains("execution reverted") {
            Self::SubmissionRejected(message)
        } else {
            Self::EstimateFailed(message)
        }
    }
}

/// Errors raised by an Orchestrator's own bookkeeping (§4.4, §7).
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Ift(#[from] IftError),

    #[error("nonce cursor refresh failed: {0}")]
    NonceCursorRefresh(String),

    #[error("context cancelled")]
    ContextCancelled,
}

/// Errors raised by the Engine's request-handling surface (§4.5, §6, §7).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    TransactionIdMissing(PtxErrorCode),

    #[error("{0}: {1}")]
    UnsupportedPayloadVariant(PtxErrorCode, String),

    #[error("{0}: {1}")]
    TerminalStatusUpdate(PtxErrorCode, String),

    #[error("{0}")]
    ContextCancelled(PtxErrorCode),

    #[error("key resolution failed: {0}")]
    KeyResolutionFailed(String),

    #[error("abi parse failed: {0}")]
    AbiParseFailed(String),

    #[error(transparent)]
    Ift(#[from] IftError),

    #[error("store error: {0}")]
    Store(String),

    #[error("no orchestrator available for signer and the bound on in-flight orchestrators was reached")]
    OrchestratorBoundReached,
}

impl EngineError {
    #[must_use]
    pub fn transaction_id_missing() -> Self {
        Self::TransactionIdMissing(PtxErrorCode::TransactionIdMissing)
    }

    #[must_use]
    pub fn unsupported_payload_variant(detail: impl Into<String>) -> Self {
        Self::UnsupportedPayloadVariant(PtxErrorCode::UnsupportedPayloadVariant, detail.into())
    }

    #[must_use]
    pub fn terminal_status_update(detail: impl Into<String>) -> Self {
        Self::TerminalStatusUpdate(PtxErrorCode::TerminalStatusUpdate, detail.into())
    }

    #[must_use]
    pub const fn context_cancelled() -> Self {
        Self::ContextCancelled(PtxErrorCode::ContextCancelled)
    }

    /// Whether this error is payload-fatal (`submissionRejected = true` in
    /// §4.5's `HandleNewTransaction` contract) as opposed to transient or
    /// infrastructural (`submissionRejected = false`).
    #[must_use]
    pub fn is_submission_rejected(&self) -> bool {
        match self {
            Self::UnsupportedPayloadVariant(..) | Self::AbiParseFailed(_) => true,
            Self::Ift(err) => err.classify() == FailureClass::FatalForPtx,
            Self::TransactionIdMissing(_)
            | Self::TerminalStatusUpdate(..)
            | Self::ContextCancelled(_)
            | Self::KeyResolutionFailed(_)
            | Self::Store(_)
            | Self::OrchestratorBoundReached => false,
        }
    }
}
