//! Command-line entry points.

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    async_utils::io::write_json,
    compositor::TextCompositor,
    encode::LopdfEncoder,
    jobs::{JobRunner, JobSpec, JobState, JobStatus},
    ocr::tesseract::TesseractOcrEngine,
    pipeline::{Collaborators, DEFAULT_DPI, Pipeline},
    prelude::*,
    raster::PopplerRasterizer,
    ui::{ProgressConfig, Ui},
    vector::MutoolReader,
};

pub mod apply;
pub mod extract;
pub mod schema;

/// How often we poll a running job for progress.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Each CLI invocation runs exactly one job.
const JOB_CONCURRENCY: usize = 1;

/// Options shared by `extract` and `apply`.
///
/// Edits are in pixel coordinates, so `apply` must use the same `--dpi` as the
/// `extract` run that produced the boxes.
#[derive(Debug, Clone, Args)]
pub struct PipelineOpts {
    /// Resolution to rasterize pages at.
    #[clap(long, default_value_t = DEFAULT_DPI)]
    dpi: u32,

    /// TrueType or OpenType font for replacement text. Falls back to a system
    /// font.
    #[clap(long, env = "DOCPATCH_FONT")]
    font: Option<PathBuf>,

    /// Tesseract language code(s), like `eng` or `eng+deu`.
    #[clap(long, default_value = "eng")]
    ocr_lang: String,
}

impl PipelineOpts {
    /// Build a pipeline backed by our external tools. `max_pages` caps how
    /// many pages of a PDF we rasterize and read, and must only be set when
    /// extracting, since an edited document keeps every page.
    fn pipeline(&self, compositor: TextCompositor, max_pages: Option<usize>) -> Pipeline {
        let collaborators = Collaborators {
            ocr: Arc::new(TesseractOcrEngine::new(self.ocr_lang.clone())),
            rasterizer: Arc::new(PopplerRasterizer::new(max_pages)),
            vector_reader: Arc::new(MutoolReader::new(max_pages)),
            encoder: Arc::new(LopdfEncoder::new()),
            compositor: Arc::new(compositor),
        };
        Pipeline::new(collaborators, self.dpi)
    }
}

/// Run a single job, showing its progress on a spinner, and write its result
/// to `output_path` (or stdout).
///
/// If the job fails, we write its full status record instead and return an
/// error.
#[instrument(level = "debug", skip_all)]
async fn run_job_to_completion(
    ui: &Ui,
    pipeline: Pipeline,
    spec: JobSpec,
    progress_config: &ProgressConfig<'_>,
    output_path: Option<&Path>,
) -> Result<()> {
    let (runner, worker) = JobRunner::new(pipeline, JOB_CONCURRENCY)?;
    let (id, mut rx) = runner.submit(spec).await?;
    debug!(job = %id, "submitted job");

    let spinner = ui.new_spinner(progress_config);
    let status: JobStatus = loop {
        tokio::select! {
            status = &mut rx => break status.context("job runner exited before the job finished")?,
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                if let Some(meta) = runner.store().poll(&id).meta {
                    spinner.set_message(meta.status);
                }
            }
        }
    };
    drop(runner);
    worker.join().await?;

    match (status.state, &status.result) {
        (JobState::Success, Some(result)) => {
            spinner.finish_using_style();
            write_json(output_path, result).await
        }
        _ => {
            spinner.abandon_with_message("Failed");
            write_json(output_path, &status).await?;
            Err(anyhow!(
                "job {} failed: {}",
                id,
                status.error.as_deref().unwrap_or("unknown error")
            ))
        }
    }
}
