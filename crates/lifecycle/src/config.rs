use std::time::Duration;

use converge_core::{ConvergeError, ConvergeResult, WorkloadSpec};
use serde::Serialize;

pub const DEFAULT_NAMESPACE: &str = "lyx-prj-jnrpm7np";
pub const DEFAULT_WORKLOAD: &str = "lyx-deployment";
pub const DEFAULT_IMAGE: &str = "nginx:latest";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything one workflow run needs; passed to the orchestrator by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleConfig {
    pub namespace: String,
    pub workload: String,
    pub image: String,
    pub container_port: i32,
    /// Replicas the workload is created with.
    pub replicas: i32,
    /// Replicas the workload is scaled to afterwards.
    pub scale_to: i32,
    /// Bound on each convergence wait; `None` waits forever.
    pub timeout: Option<Duration>,
    /// Capacity of the shared watch event queue.
    pub queue_cap: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            workload: DEFAULT_WORKLOAD.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            container_port: 80,
            replicas: 1,
            scale_to: 2,
            timeout: Some(DEFAULT_TIMEOUT),
            queue_cap: 1024,
        }
    }
}

impl LifecycleConfig {
    pub fn validate(&self) -> ConvergeResult<()> {
        check_name("namespace", &self.namespace)?;
        check_name("workload", &self.workload)?;
        if self.image.trim().is_empty() {
            return Err(invalid("image must not be empty"));
        }
        if !(1..=65535).contains(&self.container_port) {
            return Err(invalid(format!("container port {} out of range", self.container_port)));
        }
        if self.replicas < 0 || self.scale_to < 0 {
            return Err(invalid("replica counts must be non-negative"));
        }
        if self.queue_cap == 0 {
            return Err(invalid("queue capacity must be positive"));
        }
        Ok(())
    }

    pub fn workload_spec(&self, replicas: i32) -> WorkloadSpec {
        WorkloadSpec::new(self.workload.clone(), self.image.clone(), self.container_port, replicas)
    }
}

fn invalid(msg: impl Into<String>) -> ConvergeError {
    ConvergeError::fault(format!("invalid config: {}", msg.into()))
}

// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends, at most 63 chars.
fn check_name(what: &str, name: &str) -> ConvergeResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 63
        && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(invalid(format!("{} name {:?} is not a valid DNS label", what, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = LifecycleConfig::default();
        cfg.validate().expect("valid");
        assert_eq!(cfg.workload_spec(cfg.replicas).selector(), "app=lyx-deployment");
    }

    #[test]
    fn rejects_bad_names_and_counts() {
        let mut cfg = LifecycleConfig { namespace: "Demo".into(), ..Default::default() };
        assert!(cfg.validate().is_err());
        cfg.namespace = "demo-".into();
        assert!(cfg.validate().is_err());
        cfg.namespace = "demo".into();
        cfg.scale_to = -1;
        assert!(cfg.validate().is_err());
        cfg.scale_to = 3;
        cfg.queue_cap = 0;
        assert!(matches!(cfg.validate(), Err(ConvergeError::Fault(_))));
    }
}
