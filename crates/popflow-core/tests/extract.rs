use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{extract::State, routing::get, Router};
use popflow_core::error::FetchError;
use popflow_core::extract::{build_client, fetch_snapshot};
use tempfile::TempDir;
use tokio::net::TcpListener;

const FIRST: &str = "year,country,total_population,population_60_plus\n2023,Testland,1000,100\n";
const SECOND: &str = "year,country,total_population,population_60_plus\n2024,Testland,1100,120\n";

async fn versioned(State(hits): State<Arc<AtomicUsize>>) -> &'static str {
    if hits.fetch_add(1, Ordering::SeqCst) == 0 {
        FIRST
    } else {
        SECOND
    }
}

async fn serve() -> String {
    let app = Router::new()
        .route("/population.csv", get(versioned))
        .route("/page.html", get(|| async { "<html><body>moved</body></html>" }))
        .with_state(Arc::new(AtomicUsize::new(0)));

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("fixture server");
    });
    format!("http://{addr}")
}

fn files_in(dir: &TempDir) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn second_extract_overwrites_snapshot() {
    let base = serve().await;
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("population_data.csv");
    let client = build_client().unwrap();
    let url = format!("{base}/population.csv");

    let first = fetch_snapshot(&client, &url, &scratch).await.unwrap();
    assert_eq!(first.path, scratch);
    assert_eq!(first.size_bytes, FIRST.len() as u64);
    assert_eq!(first.source_url, url);

    fetch_snapshot(&client, &url, &scratch).await.unwrap();

    assert_eq!(files_in(&dir), vec!["population_data.csv"]);
    assert_eq!(fs::read_to_string(&scratch).unwrap(), SECOND);
}

#[tokio::test]
async fn creates_missing_scratch_directory() {
    let base = serve().await;
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("nested").join("population_data.csv");

    fetch_snapshot(&build_client().unwrap(), &format!("{base}/population.csv"), &scratch)
        .await
        .unwrap();

    assert_eq!(fs::read_to_string(&scratch).unwrap(), FIRST);
}

#[tokio::test]
async fn http_error_status_is_a_fetch_error() {
    let base = serve().await;
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("population_data.csv");

    let err = fetch_snapshot(&build_client().unwrap(), &format!("{base}/missing.csv"), &scratch)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::Status { status: 404, .. }), "{err:?}");
    assert!(files_in(&dir).is_empty());
}

#[tokio::test]
async fn non_tabular_body_keeps_previous_snapshot() {
    let base = serve().await;
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("population_data.csv");
    let client = build_client().unwrap();

    fetch_snapshot(&client, &format!("{base}/population.csv"), &scratch)
        .await
        .unwrap();
    let err = fetch_snapshot(&client, &format!("{base}/page.html"), &scratch)
        .await
        .unwrap_err();

    assert!(matches!(err, FetchError::NotTabular { .. }), "{err:?}");
    assert_eq!(files_in(&dir), vec!["population_data.csv"]);
    assert_eq!(fs::read_to_string(&scratch).unwrap(), FIRST);
}

#[tokio::test]
async fn unreachable_host_is_a_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let dir = TempDir::new().unwrap();
    let err = fetch_snapshot(
        &build_client().unwrap(),
        &format!("http://{addr}/population.csv"),
        &dir.path().join("population_data.csv"),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, FetchError::Request { .. }), "{err:?}");
}
