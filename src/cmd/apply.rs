//! The `apply` subcommand.

use clap::Args;

use crate::{
    async_utils::{io::read_json, spawn_blocking_propagating_panics},
    compositor::TextCompositor,
    jobs::JobSpec,
    model::EditRequest,
    prelude::*,
    ui::{ProgressConfig, Ui},
};

use super::{PipelineOpts, run_job_to_completion};

/// Apply command line arguments.
#[derive(Debug, Args)]
pub struct ApplyOpts {
    /// The PDF, PNG or JPEG to edit. It is never modified.
    pub source: PathBuf,

    /// A JSON file containing a list of edits, or an object with an `edits`
    /// list.
    #[clap(value_name = "EDITS")]
    pub edits_path: PathBuf,

    /// Add the job ID to the output file name, so that concurrent runs on the
    /// same source don't overwrite each other's output.
    #[clap(long)]
    pub unique_output: bool,

    #[clap(flatten)]
    pub pipeline_opts: PipelineOpts,

    /// Write the apply result here instead of stdout.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The two layouts we accept for edit files.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EditsFile {
    List(Vec<EditRequest>),
    Wrapped { edits: Vec<EditRequest> },
}

impl EditsFile {
    fn into_edits(self) -> Vec<EditRequest> {
        match self {
            EditsFile::List(edits) | EditsFile::Wrapped { edits } => edits,
        }
    }
}

/// The `apply` subcommand.
#[instrument(level = "debug", skip_all, fields(source = %opts.source.display()))]
pub async fn cmd_apply(ui: Ui, opts: &ApplyOpts) -> Result<()> {
    let edits = read_json::<EditsFile>(&opts.edits_path).await?.into_edits();
    debug!(count = edits.len(), "read edits");

    let font_path = opts.pipeline_opts.font.clone();
    let compositor =
        spawn_blocking_propagating_panics(move || TextCompositor::load(font_path.as_deref()))
            .await;

    run_job_to_completion(
        &ui,
        opts.pipeline_opts.pipeline(compositor, None),
        JobSpec::ApplyEdits {
            source: opts.source.clone(),
            edits,
            unique_output: opts.unique_output,
        },
        &ProgressConfig {
            emoji: "✏️",
            msg: "Applying edits",
            done_msg: "Applied edits",
        },
        opts.output_path.as_deref(),
    )
    .await
}
