use serde::{Deserialize, Serialize};

use crate::engine::{bootstrap::PackageManager, language::LanguageProfile};

pub const DEFAULT_LANGUAGE: &str = "javascript";
pub const DEFAULT_CWD: &str = "/home/user";
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PACKAGE_MANAGER: &str = "npm";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Command,
    Install,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Command => "command",
            Self::Install => "install",
        }
    }

    pub fn failure_message(self) -> &'static str {
        match self {
            Self::Run => "Code execution failed",
            Self::Command => "Command execution failed",
            Self::Install => "Package installation failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequestBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    /// `null` reads as absent.
    #[serde(default)]
    pub files: Option<Vec<StagedFile>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequestBody {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequestBody {
    #[serde(default)]
    pub package_manager: Option<String>,
    #[serde(default)]
    pub packages: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time: u64,
    pub preview_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallResponse {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub packages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RunCode {
    pub language: LanguageProfile,
    pub code: String,
    pub input: String,
    pub files: Vec<StagedFile>,
}

#[derive(Debug, Clone)]
pub struct RunCommand {
    pub command: String,
    pub cwd: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone)]
pub struct InstallPackages {
    pub manager: PackageManager,
    pub packages: Vec<String>,
}

/// A validated request. Constructing one never touches the provider.
#[derive(Debug, Clone)]
pub enum ExecutionRequest {
    RunCode(RunCode),
    RunCommand(RunCommand),
    InstallPackages(InstallPackages),
}

impl ExecutionRequest {
    pub fn action(&self) -> Action {
        match self {
            Self::RunCode(_) => Action::Run,
            Self::RunCommand(_) => Action::Command,
            Self::InstallPackages(_) => Action::Install,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub preview_url: Option<String>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Request fields echoed back next to the result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEcho {
    Run,
    Command { cwd: String },
    Install { packages: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub result: ExecutionResult,
    pub echo: ActionEcho,
}

impl From<ExecutionReport> for RunResponse {
    fn from(report: ExecutionReport) -> Self {
        let result = report.result;
        Self {
            success: result.success(),
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            execution_time: result.elapsed_ms,
            preview_url: result.preview_url,
        }
    }
}

impl From<ExecutionReport> for CommandResponse {
    fn from(report: ExecutionReport) -> Self {
        let cwd = match report.echo {
            ActionEcho::Command { cwd } => cwd,
            _ => String::new(),
        };
        let result = report.result;
        Self {
            success: result.success(),
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            cwd,
        }
    }
}

impl From<ExecutionReport> for InstallResponse {
    fn from(report: ExecutionReport) -> Self {
        let packages = match report.echo {
            ActionEcho::Install { packages } => packages,
            _ => Vec::new(),
        };
        let result = report.result;
        Self {
            success: result.success(),
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            packages,
        }
    }
}
