//! Optional external service registry.
//!
//! The orchestrator announces itself while a plan runs. Registry failures are
//! the caller's to log; they never affect the plan.

use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::debug;

use crate::io::config::RegistryConfig;
use crate::io::process::run_command_with_timeout;

const REGISTRY_OUTPUT_LIMIT: usize = 16 * 1024;

pub trait ServiceRegistry {
    fn register(&mut self, name: &str) -> Result<()>;
    fn heartbeat(&mut self) -> Result<()>;
    fn deregister(&mut self, name: &str) -> Result<()>;
}

/// Registry used when none is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistry;

impl ServiceRegistry for NoopRegistry {
    fn register(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        Ok(())
    }

    fn deregister(&mut self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Shells out to `<command...> <action> <name>` with a timeout.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    command: Vec<String>,
    timeout: Duration,
    registered: Option<String>,
}

impl CommandRegistry {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            registered: None,
        }
    }

    fn invoke(&self, action: &str, name: &str) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("registry command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(action).arg(name);
        let output = run_command_with_timeout(cmd, None, self.timeout, REGISTRY_OUTPUT_LIMIT)?;
        if output.timed_out {
            return Err(anyhow!(
                "registry {action} timed out after {}s",
                self.timeout.as_secs()
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "registry {action} failed with status {:?}: {}",
                output.status.code(),
                output.stderr_excerpt()
            ));
        }
        debug!(action, name, "registry call succeeded");
        Ok(())
    }
}

impl ServiceRegistry for CommandRegistry {
    fn register(&mut self, name: &str) -> Result<()> {
        self.invoke("register", name)?;
        self.registered = Some(name.to_string());
        Ok(())
    }

    fn heartbeat(&mut self) -> Result<()> {
        let name = self
            .registered
            .clone()
            .ok_or_else(|| anyhow!("heartbeat before register"))?;
        self.invoke("heartbeat", &name)
    }

    fn deregister(&mut self, name: &str) -> Result<()> {
        self.registered = None;
        self.invoke("deregister", name)
    }
}

/// Build the registry described by `config`.
pub fn registry_from_config(config: &RegistryConfig) -> Box<dyn ServiceRegistry> {
    if config.command.is_empty() {
        return Box::new(NoopRegistry);
    }
    Box::new(CommandRegistry::new(
        config.command.clone(),
        Duration::from_secs(config.timeout_secs),
    ))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn command_registry_passes_action_and_name() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = temp.path().join("calls.log");
        let script = format!("echo \"$0 $1\" >> {}", log.display());
        let mut registry = CommandRegistry::new(
            vec!["sh".to_string(), "-c".to_string(), script],
            Duration::from_secs(5),
        );

        registry.register("cycler-test").expect("register");
        registry.heartbeat().expect("heartbeat");
        registry.deregister("cycler-test").expect("deregister");

        let calls = fs::read_to_string(&log).expect("log");
        assert_eq!(
            calls,
            "register cycler-test\nheartbeat cycler-test\nderegister cycler-test\n"
        );
    }

    #[test]
    fn failing_registry_reports_error() {
        let mut registry = CommandRegistry::new(
            vec!["sh".to_string(), "-c".to_string(), "echo down >&2; exit 1".to_string()],
            Duration::from_secs(5),
        );
        let err = registry.register("cycler").unwrap_err();
        assert!(err.to_string().contains("down"));
        assert!(registry.heartbeat().is_err());
    }

    #[test]
    fn empty_config_yields_noop() {
        let mut registry = registry_from_config(&RegistryConfig::default());
        registry.register("x").expect("noop");
        registry.heartbeat().expect("noop");
    }
}
