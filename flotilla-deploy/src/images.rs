//! Image production glue: drive the local `docker build`/`docker push`
//! executor through the [`CommandRunner`] seam.

use async_trait::async_trait;
use flotilla_core::error::{FlotillaError, FlotillaResult};
use flotilla_core::ops::{CommandRunner, ImageBuilder};
use flotilla_core::types::ImageSource;
use std::sync::Arc;
use tracing::info;

pub struct ShellImageBuilder {
    runner: Arc<dyn CommandRunner>,
    /// Build context directory
    context: String,
}

impl ShellImageBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, context: &str) -> Self {
        Self {
            runner,
            context: context.to_string(),
        }
    }
}

#[async_trait]
impl ImageBuilder for ShellImageBuilder {
    async fn build(&self, source: &ImageSource, image_ref: &str) -> FlotillaResult<()> {
        let dockerfile = match source {
            ImageSource::Registry(_) => return Ok(()),
            ImageSource::DockerfilePath(path) => path.display().to_string(),
            ImageSource::Inline(content) => {
                let path = std::env::temp_dir().join(format!(
                    "Dockerfile.{}",
                    image_ref.replace(['/', ':'], "-")
                ));
                tokio::fs::write(&path, content).await?;
                path.display().to_string()
            }
        };

        info!("building {} from {}", image_ref, dockerfile);
        self.runner
            .run(
                "localhost",
                &format!(
                    "docker build -f {} -t {} {}",
                    dockerfile, image_ref, self.context
                ),
            )
            .await
            .map_err(|e| FlotillaError::Internal(format!("image build failed: {}", e)))?;
        Ok(())
    }

    async fn push(&self, image_ref: &str) -> FlotillaResult<()> {
        info!("pushing {}", image_ref);
        self.runner
            .run("localhost", &format!("docker push {}", image_ref))
            .await
            .map_err(|e| FlotillaError::Internal(format!("image push failed: {}", e)))?;
        Ok(())
    }
}
