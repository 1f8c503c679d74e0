use crate::engine::{
    models::{ActionEcho, ExecutionReport, ExecutionRequest, ExecutionResult},
    runner::CapturedRun,
};

#[derive(Debug, Clone, Default)]
pub struct ResultAssembler;

impl ResultAssembler {
    pub fn build(
        &self,
        hostname: &str,
        request: &ExecutionRequest,
        run: CapturedRun,
    ) -> ExecutionReport {
        let CapturedRun {
            local,
            reported,
            elapsed_ms,
        } = run;

        let result = ExecutionResult {
            exit_code: reported.exit_code,
            stdout: prefer_local(local.stdout, reported.stdout),
            stderr: prefer_local(local.stderr, reported.stderr),
            elapsed_ms,
            timed_out: reported.timed_out,
            preview_url: preview_url(hostname, request),
        };
        let echo = match request {
            ExecutionRequest::RunCode(_) => ActionEcho::Run,
            ExecutionRequest::RunCommand(cmd) => ActionEcho::Command {
                cwd: cmd.cwd.clone(),
            },
            ExecutionRequest::InstallPackages(install) => ActionEcho::Install {
                packages: install.packages.clone(),
            },
        };
        ExecutionReport { result, echo }
    }
}

fn prefer_local(local: String, reported: String) -> String {
    if local.is_empty() { reported } else { local }
}

fn preview_url(hostname: &str, request: &ExecutionRequest) -> Option<String> {
    let ExecutionRequest::RunCode(run) = request else {
        return None;
    };
    let has_html = run.files.iter().any(|f| f.path.ends_with(".html"));
    (run.language.serves_preview() && has_html).then(|| format!("https://{hostname}"))
}
