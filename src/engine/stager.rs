use anyhow::Context;

use crate::engine::{environment::Environment, language::LanguageProfile, models::StagedFile};

#[derive(Debug, Clone, Default)]
pub struct FileStager;

impl FileStager {
    pub async fn write(
        &self,
        environment: &Environment,
        path: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        environment
            .provider()
            .write_file(environment.id(), path, content)
            .await
            .with_context(|| format!("failed to write {path}"))
    }

    /// Writes `code.<ext>` first, then the auxiliary files in caller order.
    /// Stops at the first failed write. Returns the primary file name.
    pub async fn stage(
        &self,
        environment: &Environment,
        language: &LanguageProfile,
        code: &str,
        files: &[StagedFile],
    ) -> anyhow::Result<String> {
        let source_name = language.source_name();
        self.write(environment, &source_name, code).await?;
        for file in files {
            self.write(environment, &file.path, &file.content).await?;
        }
        tracing::debug!(
            env_id = %environment.id(),
            files = files.len() + 1,
            "staged files"
        );
        Ok(source_name)
    }
}
