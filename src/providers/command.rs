// ABOUTME: Unit migrator that shells out to an external command per unit
// ABOUTME: Non-zero exits are classified from stderr into structured unit errors

use async_trait::async_trait;
use tokio::process::Command;

use super::UnitMigrator;
use crate::config::RunOptions;
use crate::error::{UnitError, UnitErrorKind};

/// Runs argv templates; `{unit}`, `{source}` and `{target}` are substituted per call.
#[derive(Debug, Clone)]
pub struct CommandMigrator {
    shared_command: Vec<String>,
    unit_command: Vec<String>,
}

impl CommandMigrator {
    pub fn new(shared_command: Vec<String>, unit_command: Vec<String>) -> Self {
        Self {
            shared_command,
            unit_command,
        }
    }

    fn render(template: &[String], unit: &str, source: &str, target: &str) -> Vec<String> {
        template
            .iter()
            .map(|arg| {
                arg.replace("{unit}", unit)
                    .replace("{source}", source)
                    .replace("{target}", target)
            })
            .collect()
    }

    async fn run(&self, argv: Vec<String>) -> Result<(), UnitError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| UnitError::fatal("migration command is empty"))?;

        tracing::debug!("Running {} {}", program, args.join(" "));

        // The child is deliberately not killed if the caller times out and drops us.
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                UnitError::new(
                    UnitErrorKind::Fatal,
                    format!("Failed to start '{}': {}", program, e),
                )
            })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let detail = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };

        Err(UnitError::from_output(format!(
            "'{}' exited with {}: {}",
            program, output.status, detail
        )))
    }
}

#[async_trait]
impl UnitMigrator for CommandMigrator {
    async fn migrate_shared(
        &self,
        source: &str,
        target: &str,
        _options: &RunOptions,
    ) -> Result<(), UnitError> {
        if self.shared_command.is_empty() {
            tracing::info!("No shared-resource command configured, nothing to transfer");
            return Ok(());
        }
        self.run(Self::render(&self.shared_command, "", source, target))
            .await
    }

    async fn migrate_unit(
        &self,
        unit_id: &str,
        source: &str,
        target: &str,
        _options: &RunOptions,
    ) -> Result<(), UnitError> {
        self.run(Self::render(&self.unit_command, unit_id, source, target))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn options() -> RunOptions {
        RunOptions::new(&OrchestratorConfig::default(), "prod", "dev")
    }

    #[test]
    fn test_placeholders_are_substituted() {
        let argv = CommandMigrator::render(
            &["migrate".into(), "--site={unit}".into(), "{source}:{target}".into()],
            "12",
            "prod",
            "dev",
        );
        assert_eq!(argv, vec!["migrate", "--site=12", "prod:dev"]);
    }

    #[tokio::test]
    async fn test_successful_command() {
        let migrator = CommandMigrator::new(Vec::new(), sh("test {unit} = 7"));
        assert!(migrator
            .migrate_unit("7", "prod", "dev", &options())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_stderr_is_classified() {
        let migrator = CommandMigrator::new(
            Vec::new(),
            sh("echo 'ERROR 1213: Deadlock found when trying to get lock' >&2; exit 1"),
        );
        let err = migrator
            .migrate_unit("3", "prod", "dev", &options())
            .await
            .unwrap_err();
        assert_eq!(err.kind, UnitErrorKind::Lock);
    }

    #[tokio::test]
    async fn test_missing_program_is_fatal() {
        let migrator = CommandMigrator::new(
            Vec::new(),
            vec!["/nonexistent/site-migrate-binary".into()],
        );
        let err = migrator
            .migrate_unit("3", "prod", "dev", &options())
            .await
            .unwrap_err();
        assert_eq!(err.kind, UnitErrorKind::Fatal);
    }
}
