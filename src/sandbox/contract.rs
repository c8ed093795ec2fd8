use async_trait::async_trait;

use super::error::SandboxError;
use super::types::*;

/// The uniform lifecycle contract every provider adapter implements.
///
/// One instance per sandbox. Adapters must reject operational calls
/// (`exec`, uploads, terminals, file watches) issued before `start()` has
/// completed rather than forwarding them to a not-yet-ready backend.
/// `stop()` is idempotent: calling it on an already-stopped sandbox is a
/// no-op, and teardown failures are logged rather than re-thrown so a
/// caller's cleanup path is never blocked.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Human-diagnostic name, not an identity key.
    fn name(&self) -> String;

    fn provider(&self) -> SandboxProviderKind;

    /// Whether the adapter currently holds a live control channel.
    fn is_connected(&self) -> bool;

    // ── Lifecycle ───────────────────────────────────────────────

    /// Provision the backend resource and block until its services answer.
    /// On any failure after resource creation the adapter rolls the
    /// resource back before propagating the error.
    async fn start(&self) -> Result<SandboxInfo, SandboxError>;

    async fn stop(&self) -> Result<(), SandboxError>;

    /// Re-derives a fresh `SandboxInfo` snapshot; never serves cached
    /// mutable state.
    async fn status(&self) -> Result<SandboxStatusReport, SandboxError>;

    // ── Operations (accepted only after start) ──────────────────

    async fn exec(&self, req: ExecRequest) -> Result<ExecResult, SandboxError>;

    async fn upload_file(&self, path: &str, bytes: &[u8]) -> Result<(), SandboxError>;

    /// Bulk upload: a tar archive extracted at the backend's fixed root.
    async fn upload_tar(&self, archive: Vec<u8>) -> Result<(), SandboxError>;

    async fn create_terminal(&self, opts: TerminalOptions) -> Result<TerminalTab, SandboxError>;

    async fn start_file_watch(&self, path: &str) -> Result<(), SandboxError>;
    async fn stop_file_watch(&self) -> Result<(), SandboxError>;
}
