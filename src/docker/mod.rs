//! Docker runtime adapter

mod service;

pub use service::{
    DockerService, ExecOutput, ExecStream, ALIAS_LABEL, CONTAINER_ID_LABEL, MANAGED_LABEL,
    WORKSPACE_DIR,
};
