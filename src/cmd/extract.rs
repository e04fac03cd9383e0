//! The `extract` subcommand.

use clap::Args;

use crate::{
    compositor::TextCompositor,
    jobs::JobSpec,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::{PipelineOpts, run_job_to_completion};

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// The PDF, PNG or JPEG to extract text from.
    pub source: PathBuf,

    #[clap(flatten)]
    pub pipeline_opts: PipelineOpts,

    /// Only extract the first N pages of a PDF.
    #[clap(long)]
    pub max_pages: Option<usize>,

    /// Write the extraction result here instead of stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all, fields(source = %opts.source.display()))]
pub async fn cmd_extract(ui: Ui, opts: &ExtractOpts) -> Result<()> {
    // We never draw text while extracting, so don't bother loading fonts.
    let compositor = TextCompositor::from_fonts(None, None);
    run_job_to_completion(
        &ui,
        opts.pipeline_opts.pipeline(compositor, opts.max_pages),
        JobSpec::Extract {
            source: opts.source.clone(),
        },
        &ProgressConfig {
            emoji: "🔎",
            msg: "Extracting text",
            done_msg: "Extracted text",
        },
        opts.output_path.as_deref(),
    )
    .await
}
