//! Structured audit logging with secret redaction
//!
//! Audit events go to the dedicated `audit` tracing target so operators can
//! route them independently of application logs.

use serde_json::Value;
use tracing::info;

/// Audit event kinds covering every externally observable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    ContainerSpawn,
    ContainerAttach,
    ContainerKill,
    ExecStart,
    ExecCancel,
    ExecComplete,
    FsRead,
    FsWrite,
    FsDelete,
    FsBatch,
    TransferExport,
    TransferImport,
    SecurityAsRoot,
    SystemStartup,
    SystemShutdown,
    SystemReconcile,
    SystemGc,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::ContainerSpawn => "container_spawn",
            AuditEvent::ContainerAttach => "container_attach",
            AuditEvent::ContainerKill => "container_kill",
            AuditEvent::ExecStart => "exec_start",
            AuditEvent::ExecCancel => "exec_cancel",
            AuditEvent::ExecComplete => "exec_complete",
            AuditEvent::FsRead => "fs_read",
            AuditEvent::FsWrite => "fs_write",
            AuditEvent::FsDelete => "fs_delete",
            AuditEvent::FsBatch => "fs_batch",
            AuditEvent::TransferExport => "transfer_export",
            AuditEvent::TransferImport => "transfer_import",
            AuditEvent::SecurityAsRoot => "security_as_root",
            AuditEvent::SystemStartup => "system_startup",
            AuditEvent::SystemShutdown => "system_shutdown",
            AuditEvent::SystemReconcile => "system_reconcile",
            AuditEvent::SystemGc => "system_gc",
        }
    }
}

const SENSITIVE_KEY_MARKERS: &[&str] = &[
    "password",
    "token",
    "secret",
    "key",
    "auth",
    "credentials",
    "private",
];

/// Record an audit event. `details` is redacted before it reaches the log.
pub fn record(event: AuditEvent, container_id: Option<&str>, details: Value) {
    let details = redact(details);
    info!(
        target: "audit",
        event = event.as_str(),
        container_id = container_id.unwrap_or("-"),
        details = %details,
        "audit event"
    );
}

/// Replace values under sensitive keys with `"[REDACTED]"`, recursively.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted = map
                .into_iter()
                .map(|(k, v)| {
                    let lower = k.to_lowercase();
                    if SENSITIVE_KEY_MARKERS.iter().any(|m| lower.contains(m)) {
                        (k, Value::String("[REDACTED]".into()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacts_sensitive_keys() {
        let value = json!({
            "image": "alpine:latest",
            "registry_password": "hunter2",
            "API_TOKEN": "abc",
            "idempotency_key": "k1",
        });

        let redacted = redact(value);
        assert_eq!(redacted["image"], "alpine:latest");
        assert_eq!(redacted["registry_password"], "[REDACTED]");
        assert_eq!(redacted["API_TOKEN"], "[REDACTED]");
        // "key" is a sensitive marker, even inside compound names
        assert_eq!(redacted["idempotency_key"], "[REDACTED]");
    }

    #[test]
    fn test_redacts_nested_and_arrays() {
        let value = json!({
            "env": [{"name": "DB_SECRET", "auth_header": "Bearer x"}],
            "nested": {"credentials": {"user": "u"}},
        });

        let redacted = redact(value);
        assert_eq!(redacted["env"][0]["auth_header"], "[REDACTED]");
        assert_eq!(redacted["nested"]["credentials"], "[REDACTED]");
    }

    #[test]
    fn test_leaves_plain_values_alone() {
        let value = json!({"path": "/workspace/a.txt", "size": 42});
        assert_eq!(redact(value.clone()), value);
    }
}
