//! Boundary to the external capture tool.
//!
//! The rest of the crate talks to [`CaptureTool`]; [`TdlCli`] is the only
//! implementation that spawns processes.

mod exporter;

pub use exporter::{TdlCli, resolve_tdl_bin};

use crate::vault::sources::SourceConfig;
use anyhow::Result;
use std::path::Path;

/// A chat as the tool lists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatListing {
    pub id: String,
    pub visible_name: String,
}

pub trait CaptureTool: Send + Sync {
    /// Write every record of `source` dated in `[from, to)` to `output`.
    /// An error means the output file must not be trusted.
    fn export(&self, source: &SourceConfig, from: u64, to: u64, output: &Path) -> Result<()>;

    /// Fetch the attachments referenced by an exported batch into `dest`.
    fn download(&self, source: &SourceConfig, batch: &Path, dest: &Path) -> Result<()>;

    /// Resolve a numeric id or a username to a chat.
    fn lookup(&self, query: &str) -> Result<Option<ChatListing>>;
}
