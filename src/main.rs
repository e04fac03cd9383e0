use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing_subscriber::{
    EnvFilter, Layer as _, filter::Directive, fmt::format::FmtSpan, layer::SubscriberExt,
    util::SubscriberInitExt as _,
};

use self::{prelude::*, ui::Ui};

mod async_utils;
mod cmd;
mod color;
mod compositor;
mod cpu_limit;
mod encode;
mod error;
mod eraser;
mod geometry;
mod jobs;
mod model;
mod ocr;
mod page_edit;
mod pipeline;
mod prelude;
mod raster;
mod sources;
mod ui;
mod vector;
mod work;

/// OCR scanned documents into editable text blocks, and patch their text in
/// place.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Workflow:
  1. `docpatch extract scan.pdf -o blocks.json` finds text blocks and their
     colors.
  2. Write an edits file, copying `rect` and `fg_color` from the blocks you
     want to change.
  3. `docpatch apply scan.pdf edits.json` writes `scan-edited.pdf`.

External Tools:
  - tesseract (OCR)
  - pdfinfo and pdftocairo from poppler-utils (PDF rasterization)
  - mutool from MuPDF (PDF text colors)

Environment Variables:
  - DOCPATCH_FONT (optional): Font used for replacement text.
  - RUST_LOG (optional): Log filter, like `docpatch=debug`.

  These variables may be set in a standard `.env` file.
"#
)]
struct Opts {
    #[clap(subcommand)]
    subcmd: Cmd,
}

/// The subcommands we support.
#[derive(Debug, Subcommand)]
enum Cmd {
    /// OCR a PDF or image into text blocks with colors.
    Extract(cmd::extract::ExtractOpts),
    /// Erase text regions and draw replacement text, writing a new document.
    Apply(cmd::apply::ApplyOpts),
    /// Print schemas for input and output formats.
    Schema(cmd::schema::SchemaOpts),
}

impl Cmd {
    /// Are we using stdout for output?
    fn using_stdout_for_output(&self) -> bool {
        match self {
            Cmd::Extract(opts) => opts.output_path.is_none(),
            Cmd::Apply(opts) => opts.output_path.is_none(),
            Cmd::Schema(opts) => opts.output_path.is_none(),
        }
    }
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    let ui = Ui::init();

    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();

    let subscriber = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(ui.get_stderr_writer())
        .with_filter(env_filter);

    // We can stack multiple layers here if we need to.
    tracing_subscriber::registry().with(subscriber).init();

    // Call our real `main` function now that logging is set up.
    real_main(ui).await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main", skip_all)]
async fn real_main(ui: Ui) -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();
    debug!("Parsed options: {:?}", opts);

    // Hide the spinner if we're using stdout for output.
    if opts.subcmd.using_stdout_for_output() {
        ui.hide_spinners();
    }

    // Run the appropriate subcommand.
    match &opts.subcmd {
        Cmd::Extract(opts) => {
            cmd::extract::cmd_extract(ui, opts).await?;
        }
        Cmd::Apply(opts) => {
            cmd::apply::cmd_apply(ui, opts).await?;
        }
        Cmd::Schema(schema_opts) => {
            cmd::schema::cmd_schema(schema_opts).await?;
        }
    }
    Ok(())
}
