use crate::vault::cleanup::JobSnapshot;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("capture tool unavailable: {0}")]
    ToolUnavailable(String),
    #[error("config file invalid or unreadable: {0}")]
    InvalidConfig(String),
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("state file corrupt: {0}")]
    StateCorrupt(String),
}

impl VaultError {
    pub fn code(&self) -> VaultErrorCode {
        match self {
            Self::ToolUnavailable(_) => VaultErrorCode::E002ToolMissing,
            Self::InvalidConfig(_) => VaultErrorCode::E003ConfigInvalid,
            Self::UnknownSource(_) => VaultErrorCode::E004SourceUnknown,
            Self::StateCorrupt(_) => VaultErrorCode::E005StateCorrupt,
        }
    }
}

/// A cleanup request that was refused because another job holds its slot.
#[derive(Debug, Error)]
pub enum CleanupConflict {
    #[error("cleanup already running for source {}", .0.source_id)]
    AlreadyRunning(Box<JobSnapshot>),
    #[error("cleanup lock held by source {holder}")]
    GlobalLockHeld {
        holder: String,
        snapshot: Option<Box<JobSnapshot>>,
    },
}

impl CleanupConflict {
    pub fn snapshot(&self) -> Option<&JobSnapshot> {
        match self {
            Self::AlreadyRunning(snapshot) => Some(&**snapshot),
            Self::GlobalLockHeld { snapshot, .. } => snapshot.as_deref(),
        }
    }

    pub fn code(&self) -> VaultErrorCode {
        VaultErrorCode::E001Locked
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultErrorCode {
    E001Locked,
    E002ToolMissing,
    E003ConfigInvalid,
    E004SourceUnknown,
    E005StateCorrupt,
}

impl VaultErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::E001Locked => "E001_LOCKED",
            Self::E002ToolMissing => "E002_TOOL_MISSING",
            Self::E003ConfigInvalid => "E003_CONFIG_INVALID",
            Self::E004SourceUnknown => "E004_SOURCE_UNKNOWN",
            Self::E005StateCorrupt => "E005_STATE_CORRUPT",
        }
    }
}

/// Stable code of a typed failure anywhere in an error chain.
pub fn error_code(err: &anyhow::Error) -> Option<VaultErrorCode> {
    err.chain().find_map(|cause| {
        if let Some(vault) = cause.downcast_ref::<VaultError>() {
            return Some(vault.code());
        }
        cause.downcast_ref::<CleanupConflict>().map(CleanupConflict::code)
    })
}
