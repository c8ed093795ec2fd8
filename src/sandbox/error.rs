use std::io;

/// Errors from sandbox lifecycle and control-channel operations.
///
/// Backends map their internal failures into these variants. The four
/// lifecycle kinds carry distinct propagation policies: `Provision` and
/// `ServicesNotReady` mean the backend resource was rolled back before the
/// error surfaced; `Transport` leaves the sandbox running so the caller can
/// retry the specific operation; `Teardown` is logged by `stop()` paths and
/// never blocks a caller's cleanup.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("provision failed: {0}")]
    Provision(String),

    #[error("services not ready: {services:?}")]
    ServicesNotReady { services: Vec<String> },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("timeout")]
    Timeout,

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_displays_message() {
        let err = SandboxError::Provision("no docker socket".into());
        assert_eq!(err.to_string(), "provision failed: no docker socket");
    }

    #[test]
    fn services_not_ready_names_services() {
        let err = SandboxError::ServicesNotReady {
            services: vec!["vscode".into(), "terminal".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("vscode"));
        assert!(msg.contains("terminal"));
    }

    #[test]
    fn transport_and_teardown_display() {
        assert_eq!(
            SandboxError::Transport("connection reset".into()).to_string(),
            "transport error: connection reset"
        );
        assert_eq!(
            SandboxError::Teardown("container already gone".into()).to_string(),
            "teardown failed: container already gone"
        );
    }

    #[test]
    fn not_found_displays_id() {
        let err = SandboxError::NotFound("run-123".into());
        assert_eq!(err.to_string(), "sandbox not found: run-123");
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err: SandboxError = io_err.into();
        assert!(err.to_string().contains("file missing"));
        assert!(matches!(err, SandboxError::Io(_)));
    }

    #[test]
    fn error_is_send_and_sync() {
        // SandboxError must be Send + Sync for use in async trait returns
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SandboxError>();
    }
}
