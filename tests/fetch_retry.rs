use std::thread;

use weread_export::error::AcquireError;
use weread_export::fetch::{FetchRequest, ReqwestFetcher, fetch_with_retry};

/// Serve one canned status per expected request, then stop.
fn spawn_stub(statuses: Vec<u16>) -> (String, thread::JoinHandle<usize>) {
    let server = tiny_http::Server::http("127.0.0.1:0").expect("start stub server");
    let addr = server.server_addr();
    let url = format!("http://{addr}/asset.css");

    let handle = thread::spawn(move || {
        let mut served = 0usize;
        for status in statuses {
            let Ok(request) = server.recv() else {
                break;
            };
            let response = tiny_http::Response::from_string("body{color:red}")
                .with_status_code(tiny_http::StatusCode(status));
            let _ = request.respond(response);
            served += 1;
        }
        served
    });

    (url, handle)
}

#[tokio::test]
async fn transient_server_errors_are_retried() -> anyhow::Result<()> {
    let (url, handle) = spawn_stub(vec![500, 500, 200]);
    let fetcher = ReqwestFetcher::new()?;

    let response = fetch_with_retry(&fetcher, &FetchRequest::get(&url)).await?;

    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"body{color:red}");
    assert_eq!(handle.join().expect("stub thread"), 3);
    Ok(())
}

#[tokio::test]
async fn persistent_server_errors_exhaust_the_budget() -> anyhow::Result<()> {
    let (url, handle) = spawn_stub(vec![500, 500, 500]);
    let fetcher = ReqwestFetcher::new()?;

    let err = fetch_with_retry(&fetcher, &FetchRequest::get(&url))
        .await
        .unwrap_err();

    assert!(matches!(err, AcquireError::FetchFailed { .. }));
    assert_eq!(handle.join().expect("stub thread"), 3);
    Ok(())
}

#[tokio::test]
async fn client_errors_are_returned_without_retry() -> anyhow::Result<()> {
    let (url, handle) = spawn_stub(vec![404]);
    let fetcher = ReqwestFetcher::new()?;

    let response = fetch_with_retry(&fetcher, &FetchRequest::get(&url)).await?;

    assert_eq!(response.status, 404);
    assert_eq!(handle.join().expect("stub thread"), 1);
    Ok(())
}
