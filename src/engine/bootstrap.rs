use std::str::FromStr;

use crate::engine::{
    environment::Environment,
    error::EngineError,
    language::LanguageProfile,
    models::StagedFile,
    runner::{CapturedRun, CommandRunner},
    sandbox::{CommandLine, ProcessSpec},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Npm,
    Pip,
    Apt,
    Cargo,
}

impl PackageManager {
    pub const ALL: [PackageManager; 4] = [Self::Npm, Self::Pip, Self::Apt, Self::Cargo];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pip => "pip",
            Self::Apt => "apt",
            Self::Cargo => "cargo",
        }
    }

    pub fn supported() -> Vec<String> {
        Self::ALL.iter().map(|m| m.as_str().to_string()).collect()
    }

    pub fn install_command(self, packages: &[String]) -> CommandLine {
        let prefix: &[&str] = match self {
            Self::Npm => &["npm", "install"],
            Self::Pip => &["pip", "install"],
            Self::Apt => &["sudo", "apt-get", "install", "-y"],
            Self::Cargo => &["cargo", "install"],
        };
        CommandLine::Argv(
            prefix
                .iter()
                .map(|s| s.to_string())
                .chain(packages.iter().cloned())
                .collect(),
        )
    }
}

impl FromStr for PackageManager {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| EngineError::UnsupportedPackageManager {
                requested: s.to_string(),
                supported: Self::supported(),
            })
    }
}

/// Rejects names the installer would read as an option.
pub fn validate_packages(packages: &[String]) -> Result<(), EngineError> {
    match packages
        .iter()
        .find(|p| p.trim().is_empty() || p.starts_with('-'))
    {
        Some(bad) => Err(EngineError::InvalidPackage(bad.clone())),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct DependencyBootstrapper {
    work_dir: String,
}

impl DependencyBootstrapper {
    pub fn new(work_dir: impl Into<String>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    /// The install command implied by the staged manifests, if any.
    pub fn install_command(
        &self,
        language: &LanguageProfile,
        files: &[StagedFile],
    ) -> Option<CommandLine> {
        let has = |name: &str| files.iter().any(|f| f.path == name);
        match language.id {
            "javascript" | "typescript" if has("package.json") => {
                Some(CommandLine::argv(["npm", "install"]))
            }
            "python" if has("requirements.txt") => {
                Some(CommandLine::argv(["pip", "install", "-r", "requirements.txt"]))
            }
            _ => None,
        }
    }

    /// Runs the install to completion when a manifest is present. The install
    /// exit code does not gate the main action; a non-zero code is only logged.
    pub async fn maybe_install(
        &self,
        environment: &mut Environment,
        runner: &CommandRunner,
        language: &LanguageProfile,
        files: &[StagedFile],
    ) -> anyhow::Result<Option<CapturedRun>> {
        let Some(command) = self.install_command(language, files) else {
            return Ok(None);
        };
        tracing::info!(env_id = %environment.id(), command = %command, "installing dependencies");
        let spec = ProcessSpec {
            command,
            cwd: Some(self.work_dir.clone()),
            timeout_ms: None,
        };
        let run = runner.run(environment, spec, None).await?;
        if run.exit_code() != 0 {
            tracing::warn!(
                env_id = %environment.id(),
                exit_code = run.exit_code(),
                timed_out = run.timed_out(),
                stderr = %run.local.stderr,
                "dependency install failed, continuing with main command"
            );
        }
        Ok(Some(run))
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{DependencyBootstrapper, PackageManager, validate_packages};
    use crate::engine::{
        environment::EnvironmentManager,
        error::EngineError,
        language::LanguageRegistry,
        metrics::MetricsRegistry,
        models::StagedFile,
        runner::CommandRunner,
        sandbox::fake::{FakeProvider, FakeRun},
    };

    fn file(path: &str) -> StagedFile {
        StagedFile {
            path: path.to_string(),
            content: String::new(),
        }
    }

    #[test]
    fn manifests_match_by_exact_path_and_language() {
        let registry = LanguageRegistry::new();
        let boot = DependencyBootstrapper::new("/home/user");
        let js = registry.resolve("javascript").unwrap();
        let ts = registry.resolve("typescript").unwrap();
        let py = registry.resolve("python").unwrap();

        let npm = boot.install_command(js, &[file("package.json")]).unwrap();
        assert_eq!(npm.render(), "npm install");
        assert!(boot.install_command(ts, &[file("package.json")]).is_some());
        assert!(boot.install_command(py, &[file("package.json")]).is_none());
        assert!(boot.install_command(js, &[file("app/package.json")]).is_none());

        let pip = boot.install_command(py, &[file("requirements.txt")]).unwrap();
        assert_eq!(pip.render(), "pip install -r requirements.txt");
        assert!(boot.install_command(js, &[file("requirements.txt")]).is_none());
    }

    #[tokio::test]
    async fn install_failure_does_not_stop_the_request() {
        let provider = FakeProvider::new()
            .responding(|cmd| {
                if cmd.starts_with("pip") {
                    FakeRun::exit(1).stderr("no matching distribution")
                } else {
                    FakeRun::exit(0)
                }
            })
            .shared();
        let manager = EnvironmentManager::new(provider.clone(), Arc::new(MetricsRegistry::new()));
        let mut env = manager.provision("python", 1_000).await.unwrap();
        let registry = LanguageRegistry::new();
        let runner = CommandRunner::new(Duration::from_millis(10));

        let run = DependencyBootstrapper::new("/home/user")
            .maybe_install(
                &mut env,
                &runner,
                registry.resolve("python").unwrap(),
                &[file("requirements.txt")],
            )
            .await
            .unwrap()
            .unwrap();
        env.close().await.unwrap();

        assert_eq!(run.exit_code(), 1);
        let details = provider.command_details();
        assert_eq!(details[0].1.as_deref(), Some("/home/user"));
    }

    #[tokio::test]
    async fn no_manifest_skips_the_step() {
        let provider = FakeProvider::new().shared();
        let manager = EnvironmentManager::new(provider.clone(), Arc::new(MetricsRegistry::new()));
        let mut env = manager.provision("node", 1_000).await.unwrap();
        let registry = LanguageRegistry::new();
        let runner = CommandRunner::new(Duration::from_millis(10));

        let run = DependencyBootstrapper::new("/home/user")
            .maybe_install(&mut env, &runner, registry.resolve("javascript").unwrap(), &[])
            .await
            .unwrap();
        env.close().await.unwrap();

        assert!(run.is_none());
        assert!(provider.commands().is_empty());
    }

    #[test]
    fn package_managers_parse_and_build_argv() {
        assert_eq!("pip".parse::<PackageManager>().unwrap(), PackageManager::Pip);
        match "yarn".parse::<PackageManager>() {
            Err(EngineError::UnsupportedPackageManager { supported, .. }) => {
                assert_eq!(supported, vec!["npm", "pip", "apt", "cargo"]);
            }
            other => panic!("expected unsupported manager, got {other:?}"),
        }
        let apt = PackageManager::Apt.install_command(&["curl".into(), "jq".into()]);
        assert_eq!(apt.render(), "sudo apt-get install -y curl jq");
    }

    #[test]
    fn option_like_package_names_are_rejected() {
        assert!(validate_packages(&["lodash".into(), "@types/node".into()]).is_ok());
        assert!(matches!(
            validate_packages(&["lodash".into(), "--global".into()]),
            Err(EngineError::InvalidPackage(name)) if name == "--global"
        ));
        assert!(validate_packages(&["  ".into()]).is_err());
    }
}
