//! CLI route: single route table and run context.

use crate::api::IllustrationApi;
use crate::batch::BatchSpec;
use crate::cli::parse::Commands;
use crate::cli::presentation::{self, OutputFormat, ProviderRow, WrittenImage};
use crate::config::{ConfigLoader, StoryboardConfig};
use crate::coordinator::BatchCoordinator;
use crate::status::BatchStatusReport;
use crate::task::TaskStatus;
use crate::types::BatchId;
use anyhow::{anyhow, bail, Context, Result};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Runtime context for CLI execution, built from the layered configuration.
pub struct RunContext {
    config: StoryboardConfig,
}

impl RunContext {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self> {
        let config = ConfigLoader::load(config_path.as_deref())
            .context("Failed to load configuration")?;
        Ok(Self { config })
    }

    pub fn from_config(config: StoryboardConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StoryboardConfig {
        &self.config
    }

    /// Execute a CLI command via the single route table.
    pub fn execute(&self, command: &Commands) -> Result<String> {
        match command {
            Commands::Run {
                batch_file,
                provider,
                max_parallel,
                output,
                timeout_secs,
                format,
            } => {
                let format = OutputFormat::parse(format)?;
                let mut spec = load_batch_file(batch_file)?;
                if let Some(provider) = provider {
                    spec.provider = Some(provider.clone());
                }
                if let Some(max_parallel) = max_parallel {
                    spec.max_parallel = *max_parallel;
                }
                let timeout = timeout_secs.map(Duration::from_secs);
                let runtime =
                    tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
                runtime.block_on(self.run_batch(spec, output, timeout, format))
            }
            Commands::Validate { batch_file } => {
                let spec = load_batch_file(batch_file)?;
                spec.validate()?;
                let provider = spec
                    .provider
                    .clone()
                    .unwrap_or_else(|| self.config.default_provider.clone());
                if !self.config.providers.contains_key(&provider) {
                    bail!("Batch names unknown provider '{}'", provider);
                }
                Ok(presentation::format_batch_validation(&spec, &provider))
            }
            Commands::Providers { format } => {
                let format = OutputFormat::parse(format)?;
                Ok(presentation::format_providers(&self.provider_rows(), format))
            }
        }
    }

    fn provider_rows(&self) -> Vec<ProviderRow> {
        let mut rows: Vec<ProviderRow> = self
            .config
            .providers
            .iter()
            .map(|(name, config)| ProviderRow {
                name: name.clone(),
                provider_type: config.provider_type.slug().to_string(),
                model: config.model.clone(),
                endpoint: config.endpoint.clone(),
                cost_per_image: config.cost_per_image,
                is_default: *name == self.config.default_provider,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    async fn run_batch(
        &self,
        spec: BatchSpec,
        output_dir: &Path,
        timeout: Option<Duration>,
        format: OutputFormat,
    ) -> Result<String> {
        let coordinator = Arc::new(BatchCoordinator::from_config(&self.config)?);
        coordinator.start()?;
        let api = IllustrationApi::new(Arc::clone(&coordinator));

        let response = api.submit_spec(spec);
        let batch_id = match (response.success, response.data) {
            (true, Some(batch_id)) => batch_id,
            _ => bail!(response
                .message
                .unwrap_or_else(|| "Batch submission failed".to_string())),
        };
        info!(batch_id = %batch_id, "Waiting for batch to settle");

        let report = wait_with_progress(&coordinator, batch_id, timeout).await;
        let images = match &report {
            Ok(_) => write_images(&coordinator, batch_id, output_dir)?,
            Err(_) => Vec::new(),
        };
        coordinator.shutdown().await;
        let report = report?;

        let tasks = coordinator.tasks(batch_id)?;
        Ok(presentation::format_run_result(&report, &tasks, &images, format))
    }
}

fn load_batch_file(path: &Path) -> Result<BatchSpec> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read batch file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("Failed to parse batch file {}", path.display()))
}

/// Wait for the batch, printing a progress line to stderr when attached to a terminal.
async fn wait_with_progress(
    coordinator: &BatchCoordinator,
    batch_id: BatchId,
    timeout: Option<Duration>,
) -> Result<BatchStatusReport> {
    let show_progress = std::io::stderr().is_terminal();
    let wait = coordinator.wait_for_batch(batch_id, timeout);
    tokio::pin!(wait);
    let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);

    let report = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = ticker.tick() => {
                if show_progress {
                    if let Ok(report) = coordinator.get_status(batch_id) {
                        eprint!("\r{}", presentation::format_progress_line(&report));
                        let _ = std::io::stderr().flush();
                    }
                }
            }
        }
    };
    if show_progress {
        eprintln!();
    }
    report.map_err(|e| anyhow!(e))
}

fn write_images(
    coordinator: &BatchCoordinator,
    batch_id: BatchId,
    output_dir: &Path,
) -> Result<Vec<WrittenImage>> {
    let tasks = coordinator.tasks(batch_id)?;
    if !tasks.iter().any(|t| t.status == TaskStatus::Completed) {
        return Ok(Vec::new());
    }
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let mut written = Vec::new();
    for (index, task) in tasks.iter().enumerate() {
        let Some(image) = coordinator.take_image(task.id) else {
            continue;
        };
        let path = output_dir.join(format!("{:03}-{}.{}", index + 1, task.id, image.extension()));
        std::fs::write(&path, &image.bytes)
            .with_context(|| format!("Failed to write image {}", path.display()))?;
        debug!(task_id = %task.id, path = %path.display(), "Wrote image");
        written.push(WrittenImage {
            task_id: task.id,
            path,
            size_bytes: image.bytes.len(),
        });
    }
    Ok(written)
}
