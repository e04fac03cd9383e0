//! Limits on how many CPU-hungry external tools run at once.

use std::sync::LazyLock;

use tokio::sync::Semaphore;

use crate::prelude::*;

/// One permit per core, shared by every `pdftocairo`, `mutool` and
/// `tesseract` process we start.
static TOOL_PERMITS: LazyLock<Semaphore> = LazyLock::new(|| Semaphore::new(num_cpus::get()));

/// Run an external tool while holding one of [`TOOL_PERMITS`].
///
/// Rasterizing, reading vector text and OCR each take a whole core, and
/// several jobs may be doing them at once. In-process work goes through
/// [`crate::async_utils::spawn_blocking_propagating_panics`] instead.
#[instrument(level = "trace", skip_all)]
pub async fn with_cpu_semaphore<Func, Fut, R>(f: Func) -> Result<R>
where
    Func: FnOnce() -> Fut,
    Fut: Future<Output = Result<R>>,
{
    let _permit = TOOL_PERMITS
        .acquire()
        .await
        .context("could not acquire a permit to run an external tool")?;
    f().await
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[tokio::test]
    async fn results_and_errors_pass_through() -> Result<()> {
        assert_eq!(with_cpu_semaphore(|| async { Ok(7) }).await?, 7);
        let err = with_cpu_semaphore(|| async { Err::<(), _>(anyhow!("tesseract exited")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "tesseract exited");
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn tools_never_outnumber_cores() -> Result<()> {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for _ in 0..num_cpus::get() * 3 {
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                with_cpu_semaphore(|| async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await??;
        }
        assert!(peak.load(Ordering::SeqCst) <= num_cpus::get());
        assert_eq!(running.load(Ordering::SeqCst), 0);
        Ok(())
    }
}
