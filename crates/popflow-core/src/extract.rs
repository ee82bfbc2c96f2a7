use std::path::{Path, PathBuf};

use chrono::Utc;
use reqwest::Client;
use tokio::fs;
use tracing::{debug, info};

use crate::error::FetchError;
use crate::table::Snapshot;

pub fn build_client() -> reqwest::Result<Client> {
    Client::builder()
        .user_agent(concat!("popflow/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Downloads `source_url` and stores the body at `scratch_path`, replacing any
/// previous snapshot there.
pub async fn fetch_snapshot(
    client: &Client,
    source_url: &str,
    scratch_path: &Path,
) -> Result<Snapshot, FetchError> {
    let request_error = |source| FetchError::Request {
        url: source_url.to_string(),
        source,
    };

    let response = client
        .get(source_url)
        .send()
        .await
        .map_err(request_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: source_url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = response.bytes().await.map_err(request_error)?;
    let columns = check_tabular(&bytes).map_err(|reason| FetchError::NotTabular {
        url: source_url.to_string(),
        reason,
    })?;
    debug!(url = source_url, columns, "Snapshot content is tabular");

    write_replacing(scratch_path, &bytes).await?;

    let snapshot = Snapshot {
        source_url: source_url.to_string(),
        retrieved_at: Utc::now(),
        path: scratch_path.to_path_buf(),
        size_bytes: bytes.len() as u64,
    };
    info!(
        url = source_url,
        path = %snapshot.path.display(),
        size_bytes = snapshot.size_bytes,
        "Data extracted successfully"
    );
    Ok(snapshot)
}

/// Returns the header width when `content` reads as a rectangular CSV with a
/// header of at least two columns.
pub fn check_tabular(content: &[u8]) -> Result<usize, String> {
    if content.iter().all(u8::is_ascii_whitespace) {
        return Err("response body is empty".into());
    }
    if std::str::from_utf8(content).is_err() {
        return Err("response body is not valid UTF-8".into());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(content);
    let width = reader
        .headers()
        .map_err(|err| format!("unreadable header: {err}"))?
        .len();
    if width < 2 {
        return Err(format!("header has {width} column(s), expected at least 2"));
    }

    for record in reader.records() {
        record.map_err(|err| format!("malformed record: {err}"))?;
    }
    Ok(width)
}

async fn write_replacing(path: &Path, contents: &[u8]) -> Result<(), FetchError> {
    let io_error = |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_error)?;
    }

    let staging = staging_path(path);
    let staged = match fs::write(&staging, contents).await {
        Ok(()) => fs::rename(&staging, path).await,
        Err(err) => Err(err),
    };
    if let Err(source) = staged {
        let _ = fs::remove_file(&staging).await;
        return Err(io_error(source));
    }
    Ok(())
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
