//! Terminal UI: one spinner per running job, and a stderr writer for log
//! lines that keeps them from tearing through it.
//!
//! This is adapted from `substudy` by Eric Kidd, which is licensed under
//! Apache-2.0 OR MIT. Used with permission.

use std::{borrow::Cow, io, sync::Arc, time::Duration};

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

/// Terminal UI state.
#[derive(Clone)]
pub struct Ui {
    /// Job spinners. Log output suspends these while it prints.
    spinners: Arc<MultiProgress>,
}

impl Ui {
    /// Create a new UI.
    pub fn init() -> Ui {
        Ui {
            spinners: Arc::new(MultiProgress::new()),
        }
    }

    /// Hide job spinners, for when the job result goes to `stdout`.
    pub fn hide_spinners(&self) {
        self.spinners.set_draw_target(ProgressDrawTarget::hidden());
    }

    /// Get a writer than can be used to write to stderr, for use with `tracing`
    /// and other output code.
    pub fn get_stderr_writer(&self) -> SafeStderrWriter {
        SafeStderrWriter { ui: self.clone() }
    }

    /// Create a spinner for a job. Its message is replaced by the job's
    /// progress as it runs.
    pub fn new_spinner(&self, config: &ProgressConfig<'_>) -> ProgressBar {
        let sp = ProgressBar::new_spinner().with_style(default_spinner_style());
        let sp = self.spinners.add(sp);
        #[cfg(test)]
        sp.set_draw_target(ProgressDrawTarget::hidden());
        sp.set_prefix(config.emoji.to_owned());
        sp.set_message(config.msg.to_owned());
        sp.enable_steady_tick(Duration::from_millis(250));
        sp.with_finish(indicatif::ProgressFinish::WithMessage(Cow::Owned(
            config.done_msg.to_owned(),
        )))
    }
}

/// How a job's spinner looks.
pub struct ProgressConfig<'a> {
    pub emoji: &'a str,
    /// Shown until the job reports its first progress message.
    pub msg: &'a str,
    /// Shown once the job succeeds.
    pub done_msg: &'a str,
}

fn default_spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{spinner} {prefix:3}{msg}")
        .expect("bad progress bar template")
}

/// A `stderr` writer for `tracing` which hides job spinners while each log
/// line is written.
#[derive(Clone)]
pub struct SafeStderrWriter {
    ui: Ui,
}

impl io::Write for SafeStderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ui.spinners.suspend(|| io::stderr().write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.ui.spinners.suspend(|| io::stderr().flush())
    }

    fn write_vectored(&mut self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize> {
        self.ui
            .spinners
            .suspend(|| io::stderr().write_vectored(bufs))
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.ui
            .spinners
            .suspend(|| io::stderr().write_all(buf))
    }

    fn write_fmt(&mut self, fmt: std::fmt::Arguments<'_>) -> io::Result<()> {
        self.ui
            .spinners
            .suspend(|| io::stderr().write_fmt(fmt))
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SafeStderrWriter {
    type Writer = SafeStderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    const CONFIG: ProgressConfig<'static> = ProgressConfig {
        emoji: "🔎",
        msg: "Extracting text",
        done_msg: "Extracted text",
    };

    #[test]
    fn spinners_show_job_progress_then_the_done_message() {
        let ui = Ui::init();
        ui.hide_spinners();
        let spinner = ui.new_spinner(&CONFIG);
        assert_eq!(spinner.prefix(), "🔎");
        assert_eq!(spinner.message(), "Extracting text");

        spinner.set_message("Processing page 1 of 2...");
        assert_eq!(spinner.message(), "Processing page 1 of 2...");

        spinner.finish_using_style();
        assert_eq!(spinner.message(), "Extracted text");
        assert!(spinner.is_finished());
    }

    #[test]
    fn log_lines_can_be_written_while_a_spinner_runs() -> io::Result<()> {
        let ui = Ui::init();
        ui.hide_spinners();
        let _spinner = ui.new_spinner(&CONFIG);
        let mut writer = ui.get_stderr_writer();
        writer.write_all(b"")?;
        writer.flush()
    }
}
