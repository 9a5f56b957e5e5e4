use crate::engine::capability::{Capability, CapabilityError, CapabilityOutput, CapabilityRequest, Role};
use crate::error::EngineResult;
use crate::models::EngineConfig;
use indicatif::{ProgressBar as IndicatifProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::runtime::Runtime;

/// Exit code a producer command uses to ask for a retry (EX_TEMPFAIL)
pub const EXIT_TRANSIENT: i32 = 75;

/// Capability backed by one external command per role
///
/// The request is written to the command's stdin as JSON; stdout must be a
/// single JSON object `{content, truncated, model}`.
pub struct CommandCapability {
    commands: BTreeMap<Role, Vec<String>>,
    runtime: Runtime,
    show_progress: bool,
}

impl CommandCapability {
    pub fn new(commands: BTreeMap<Role, Vec<String>>) -> EngineResult<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        Ok(Self {
            commands,
            runtime,
            show_progress: false,
        })
    }

    /// Build from the `[producer]` table; unknown role names are ignored
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        let mut commands = BTreeMap::new();
        for (name, argv) in &config.producer {
            match Role::parse(name) {
                Some(role) if !argv.is_empty() => {
                    commands.insert(role, argv.clone());
                }
                Some(role) => tracing::warn!(role = %role, "empty producer command ignored"),
                None => tracing::warn!(role = %name, "unknown producer role ignored"),
            }
        }
        Self::new(commands)
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.commands.contains_key(&role)
    }

    pub fn missing_roles(&self) -> Vec<Role> {
        Role::ALL.into_iter().filter(|r| !self.has_role(*r)).collect()
    }

    fn spinner(&self, request: &CapabilityRequest) -> Option<IndicatifProgressBar> {
        if !self.show_progress {
            return None;
        }
        let pb = IndicatifProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style.tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "));
        }
        pb.set_message(format!("Running {} ({})...", request.role, request.task));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));
        Some(pb)
    }

    async fn run_command(&self, argv: &[String], request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(CapabilityError::Fatal(format!("empty command for role {}", request.role)));
        };
        let payload = serde_json::to_vec(request).map_err(|e| CapabilityError::Fatal(e.to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CapabilityError::Fatal(format!(
                    "command '{}' could not be started ({}). Please ensure it is installed and in your PATH.",
                    program, e
                ))
            })?;

        let stdin = child.stdin.take();
        let write = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&payload).await?;
                stdin.flush().await?;
            }
            Ok::<_, std::io::Error>(())
        };
        // Reading and writing together keeps a chatty child from blocking on a full pipe
        let (written, output) = tokio::join!(write, child.wait_with_output());
        let output = output.map_err(|e| CapabilityError::Transient(format!("failed to collect output: {}", e)))?;
        if let Err(e) = written {
            tracing::debug!(program = %program, error = %e, "stdin closed early");
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let stderr_tail = lines[lines.len().saturating_sub(5)..].join("\n");
        match output.status.code() {
            Some(0) => {}
            Some(EXIT_TRANSIENT) => {
                return Err(CapabilityError::Transient(format!("'{}' asked for retry: {}", program, stderr_tail)));
            }
            Some(code) => {
                return Err(CapabilityError::Fatal(format!(
                    "'{}' failed with exit code {}\nStderr: {}",
                    program, code, stderr_tail
                )));
            }
            None => {
                return Err(CapabilityError::Transient(format!("'{}' was terminated by a signal", program)));
            }
        }

        serde_json::from_slice::<CapabilityOutput>(&output.stdout)
            .map_err(|e| CapabilityError::Malformed(format!("stdout is not a capability response: {}", e)))
    }
}

impl Capability for CommandCapability {
    fn generate(&self, request: &CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
        let argv = self
            .commands
            .get(&request.role)
            .ok_or_else(|| CapabilityError::Fatal(format!("no producer command configured for role {}", request.role)))?;
        tracing::debug!(role = %request.role, task = %request.task, attempt = request.attempt, "invoking producer command");

        let progress = self.spinner(request);
        let timeout = request.timeout();
        let result = self.runtime.block_on(async {
            match tokio::time::timeout(timeout, self.run_command(argv, request)).await {
                Ok(result) => result,
                Err(_) => Err(CapabilityError::Timeout(timeout)),
            }
        });
        if let Some(pb) = progress {
            pb.finish_and_clear();
        }
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(timeout_secs: u64) -> CapabilityRequest {
        CapabilityRequest {
            role: Role::Writer,
            task: "write_unit".to_string(),
            project: "alpha".to_string(),
            run_id: "run-0001".to_string(),
            chapter: 1,
            round: 1,
            attempt: 1,
            instructions: "write".to_string(),
            context: json!({}),
            timeout_secs,
        }
    }

    fn shell(script: &str) -> CommandCapability {
        let mut commands = BTreeMap::new();
        commands.insert(Role::Writer, vec!["sh".to_string(), "-c".to_string(), script.to_string()]);
        CommandCapability::new(commands).unwrap()
    }

    #[test]
    fn test_reads_structured_response() {
        let cap = shell(r#"cat >/dev/null; echo '{"content": {"text": "hi"}, "truncated": true, "model": "m1"}'"#);
        let out = cap.generate(&request(10)).unwrap();
        assert_eq!(out.content, json!({"text": "hi"}));
        assert!(out.truncated);
        assert_eq!(out.model.as_deref(), Some("m1"));
    }

    #[test]
    fn test_request_arrives_on_stdin() {
        let cap = shell(r#"grep -q '"task":"write_unit"' && echo '{"content": "ok"}'"#);
        assert_eq!(cap.generate(&request(10)).unwrap().content, json!("ok"));
    }

    #[test]
    fn test_exit_codes_are_classified() {
        let transient = shell("cat >/dev/null; echo busy >&2; exit 75").generate(&request(10)).unwrap_err();
        assert!(matches!(transient, CapabilityError::Transient(_)));

        let fatal = shell("cat >/dev/null; exit 2").generate(&request(10)).unwrap_err();
        assert!(matches!(fatal, CapabilityError::Fatal(_)));

        let malformed = shell("cat >/dev/null; echo not-json").generate(&request(10)).unwrap_err();
        assert!(matches!(malformed, CapabilityError::Malformed(_)));
    }

    #[test]
    fn test_timeout_and_missing_commands() {
        let slow = shell("sleep 5").generate(&request(1)).unwrap_err();
        assert!(matches!(slow, CapabilityError::Timeout(_)));

        let mut commands = BTreeMap::new();
        commands.insert(Role::Writer, vec!["inkgate-no-such-producer".to_string()]);
        let missing = CommandCapability::new(commands).unwrap().generate(&request(10)).unwrap_err();
        assert!(matches!(missing, CapabilityError::Fatal(_)));

        let mut req = request(10);
        req.role = Role::Editor;
        assert!(!shell("true").generate(&req).unwrap_err().is_retryable());
    }

    #[test]
    fn test_from_config_skips_unknown_roles() {
        let mut config = EngineConfig::default();
        config.producer.insert("writer".to_string(), vec!["w".to_string()]);
        config.producer.insert("narrator".to_string(), vec!["n".to_string()]);
        let cap = CommandCapability::from_config(&config).unwrap();
        assert!(cap.has_role(Role::Writer));
        assert_eq!(cap.missing_roles().len(), Role::ALL.len() - 1);
    }
}
