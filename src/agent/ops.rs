//! The agent operation surface (§4.C): one entry point per verb named in
//! `libinterface/client-interface.h`, each producing an
//! [`crate::engine::Operation`] the iteration engine can run on a worker
//! thread.

use crate::agent::command::{AgentCommand, CommandError, ExecutableCommand};
use crate::engine::Operation;
use crate::errors::Error;

fn exit_code_of(error: &CommandError) -> i32 {
    match error {
        CommandError::ExitStatusError(status) => status.code().unwrap_or(-1),
        _ => -1,
    }
}

fn to_agent_failure(verb: &str, target: &str, error: CommandError) -> Error {
    match error {
        CommandError::ExitStatusError(_) => Error::agent_failure(verb, target, exit_code_of(&error)),
        other => Error::Command(other),
    }
}

/// One per-target, per-verb agent: wraps the executable identified by a
/// target's `clientInterface` and the target key it is addressing.
#[derive(Clone)]
pub struct AgentInterface {
    executable: String,
    target: String,
}

impl AgentInterface {
    pub fn new(executable: impl Into<String>, target: impl Into<String>) -> AgentInterface {
        AgentInterface {
            executable: executable.into(),
            target: target.into(),
        }
    }

    fn run_detached(&self, verb: &'static str, args: Vec<String>) -> Result<(), Error> {
        let mut argv = vec![verb.to_string(), "--target".to_string(), self.target.clone()];
        argv.extend(args);
        let arg_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        let mut command = AgentCommand::new(&self.executable, &arg_refs, &[]);
        command.exec().map_err(|err| to_agent_failure(verb, &self.target, err))
    }

    fn run_future(&self, verb: &'static str, args: Vec<String>) -> Result<Vec<String>, Error> {
        let mut argv = vec![verb.to_string(), "--target".to_string(), self.target.clone()];
        argv.extend(args);
        let arg_refs: Vec<&str> = argv.iter().map(String::as_str).collect();
        let mut command = AgentCommand::new(&self.executable, &arg_refs, &[]);

        let mut lines = Vec::new();
        command
            .exec_with_output(&mut |line| lines.push(line), &mut |_line| {})
            .map_err(|err| to_agent_failure(verb, &self.target, err))?;
        Ok(lines)
    }

    fn activation_args(container: &str, service_type: &str, arguments: &[(String, String)], service: &str) -> Vec<String> {
        let mut args = vec!["--container".to_string(), container.to_string(), "--type".to_string(), service_type.to_string()];
        if !arguments.is_empty() {
            args.push("--arguments".to_string());
            for (key, value) in arguments {
                args.push(format!("{key}={value}"));
            }
        }
        args.push(service.to_string());
        args
    }

    pub fn activate(&self, container: &str, service_type: &str, arguments: &[(String, String)], service: &str) -> Operation {
        let this = self.clone();
        let args = Self::activation_args(container, service_type, arguments, service);
        Operation::Detached(Box::new(move || this.run_detached("activate", args)))
    }

    pub fn deactivate(&self, container: &str, service_type: &str, arguments: &[(String, String)], service: &str) -> Operation {
        let this = self.clone();
        let args = Self::activation_args(container, service_type, arguments, service);
        Operation::Detached(Box::new(move || this.run_detached("deactivate", args)))
    }

    pub fn lock(&self, profile: &str) -> Operation {
        let this = self.clone();
        let profile = profile.to_string();
        Operation::Detached(Box::new(move || this.run_detached("lock", vec!["--profile".to_string(), profile])))
    }

    pub fn unlock(&self, profile: &str) -> Operation {
        let this = self.clone();
        let profile = profile.to_string();
        Operation::Detached(Box::new(move || this.run_detached("unlock", vec!["--profile".to_string(), profile])))
    }

    pub fn snapshot(&self, container: &str, service_type: &str, arguments: &[(String, String)], service: &str) -> Operation {
        let this = self.clone();
        let args = Self::activation_args(container, service_type, arguments, service);
        Operation::Detached(Box::new(move || this.run_detached("snapshot", args)))
    }

    pub fn restore(&self, container: &str, service_type: &str, arguments: &[(String, String)], service: &str) -> Operation {
        let this = self.clone();
        let args = Self::activation_args(container, service_type, arguments, service);
        Operation::Detached(Box::new(move || this.run_detached("restore", args)))
    }

    pub fn delete_state(&self, container: &str, service_type: &str, arguments: &[(String, String)], service: &str) -> Operation {
        let this = self.clone();
        let args = Self::activation_args(container, service_type, arguments, service);
        Operation::Detached(Box::new(move || this.run_detached("delete-state", args)))
    }

    pub fn collect_garbage(&self, delete_old: bool) -> Operation {
        let this = self.clone();
        let mut args = Vec::new();
        if delete_old {
            args.push("--delete-old".to_string());
        }
        Operation::Detached(Box::new(move || this.run_detached("collect-garbage", args)))
    }

    pub fn set(&self, profile: &str, component: &str) -> Operation {
        let this = self.clone();
        let args = vec!["--profile".to_string(), profile.to_string(), component.to_string()];
        Operation::Detached(Box::new(move || this.run_detached("set", args)))
    }

    pub fn query_installed(&self, profile: &str) -> Operation {
        let this = self.clone();
        let args = vec!["--profile".to_string(), profile.to_string()];
        Operation::Future(Box::new(move || this.run_future("query-installed", args)))
    }

    pub fn copy_closure_to(&self, paths: &[String]) -> Operation {
        let this = self.clone();
        let args = paths.to_vec();
        Operation::Detached(Box::new(move || this.run_detached("copy-closure-to", args)))
    }

    pub fn copy_closure_from(&self, paths: &[String]) -> Operation {
        let this = self.clone();
        let args = paths.to_vec();
        Operation::Detached(Box::new(move || this.run_detached("copy-closure-from", args)))
    }

    pub fn copy_snapshots_to(&self, container: &str, component: &str, all: bool) -> Operation {
        let this = self.clone();
        let args = Self::snapshot_transfer_args(container, component, all);
        Operation::Detached(Box::new(move || this.run_detached("copy-snapshots-to", args)))
    }

    pub fn copy_snapshots_from(&self, container: &str, component: &str, all: bool) -> Operation {
        let this = self.clone();
        let args = Self::snapshot_transfer_args(container, component, all);
        Operation::Detached(Box::new(move || this.run_detached("copy-snapshots-from", args)))
    }

    fn snapshot_transfer_args(container: &str, component: &str, all: bool) -> Vec<String> {
        let mut args = vec!["--container".to_string(), container.to_string(), component.to_string()];
        if all {
            args.push("--all".to_string());
        }
        args
    }

    pub fn clean_snapshots(&self, keep: u32, container: Option<&str>, component: Option<&str>) -> Operation {
        let this = self.clone();
        let mut args = vec!["--keep".to_string(), keep.to_string()];
        if let Some(container) = container {
            args.push("--container".to_string());
            args.push(container.to_string());
        }
        if let Some(component) = component {
            args.push(component.to_string());
        }
        Operation::Detached(Box::new(move || this.run_detached("clean-snapshots", args)))
    }

    pub fn realise(&self, derivation: &str) -> Operation {
        let this = self.clone();
        let args = vec![derivation.to_string()];
        Operation::Future(Box::new(move || this.run_future("realise", args)))
    }

    pub fn capture_config(&self) -> Operation {
        let this = self.clone();
        Operation::Future(Box::new(move || this.run_future("capture-config", Vec::new())))
    }

    pub fn query_requisites(&self, derivation: &str) -> Operation {
        let this = self.clone();
        let args = vec![derivation.to_string()];
        Operation::Future(Box::new(move || this.run_future("query-requisites", args)))
    }

    /// No-op agent invocation used by tests to exercise the engine without a
    /// real agent executable.
    pub fn exec_true(&self) -> Operation {
        let this = self.clone();
        Operation::Detached(Box::new(move || this.run_detached("true", Vec::new())))
    }
}
