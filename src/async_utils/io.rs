//! I/O utilities.
//!
//! We read small JSON inputs, write JSON outputs to a file or standard output,
//! and write finished documents atomically so readers never see half a file.

use std::io::Write as _;

use serde::de::DeserializeOwned;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _},
};

use crate::prelude::*;

use super::spawn_blocking_propagating_panics;

/// Read and parse a JSON file.
pub async fn read_json<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse JSON from file at path: {:?}", path))
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a value as pretty-printed JSON to either standard output or a file.
pub async fn write_json<T>(path: Option<&Path>, value: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let mut json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    json.push('\n');
    let mut wtr = create_writer(path).await?;
    wtr.write_all(json.as_bytes())
        .await
        .context("Failed to write JSON to output")?;
    wtr.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write `data` to `path`, replacing any existing file.
///
/// The data goes to a temporary file in the same directory first, which is
/// then renamed into place. If anything fails, the temporary file is removed
/// and `path` is left as it was.
#[instrument(level = "debug", skip_all, fields(path = %path.display(), bytes = data.len()))]
pub async fn write_atomically(path: &Path, data: Vec<u8>) -> Result<()> {
    let path = path.to_owned();
    spawn_blocking_propagating_panics(move || {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_owned(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("cannot create temporary file in {:?}", dir))?;
        tmp.write_all(&data)
            .context("cannot write temporary file")?;
        tmp.as_file()
            .sync_all()
            .context("cannot sync temporary file")?;
        tmp.persist(&path)
            .with_context(|| format!("cannot move output into place at {:?}", path))?;
        Ok(())
    })
    .await
}
