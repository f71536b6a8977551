use thiserror::Error;

/// The only hard-rejection reason the normalizer can raise; every other
/// failure mode downgrades to a null signal instead of refusing the
/// request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardRejectReason {
    InvalidSyntax,
}

impl HardRejectReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSyntax => "INVALID_SYNTAX",
        }
    }
}

/// Why a probe produced a null signal instead of a verdict. Tracked so
/// that metrics can be broken down by probe + error kind without
/// leaking transport detail to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    Timeout,
    Transport,
    Parse,
    Disabled,
    RateLimited,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Parse => "parse",
            Self::Disabled => "disabled",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// The error taxonomy from the spec's error-handling design: hard
/// rejections short-circuit scoring, probe/store failures fail open
/// and degrade quietly, and config errors are the only fail-closed
/// case, raised only at startup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    HardReject(HardRejectReason),

    #[error("probe '{probe}' failed: {kind:?}")]
    ProbeFailure {
        probe: &'static str,
        kind: ProbeErrorKind,
    },

    #[error("engine timed out before the minimum cheap-signal set was available")]
    EngineTimeout,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl std::fmt::Display for HardRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}
