use std::error::Error;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atelier::errors::AtelierError;
use atelier::store::http::HttpFetcher;
use atelier::store::{ArtifactRef, ArtifactSource, CapturePolicy, EnvCredentials, FsObjectStore};
use atelier_test_utils::builders::TestEnv;
use atelier_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

/// Serve HTTP on an ephemeral port; `handler` maps the request index to a
/// response. The server thread lives for the rest of the test process.
fn serve<F>(handler: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(usize) -> tiny_http::Response<Cursor<Vec<u8>>> + Send + 'static,
{
    let server = tiny_http::Server::http("127.0.0.1:0").expect("binding test http server");
    let addr = server.server_addr().to_ip().expect("tcp listen address");
    let base = format!("http://{addr}");
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);

    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            let n = hits_clone.fetch_add(1, Ordering::SeqCst);
            let _ = request.respond(handler(n));
        }
    });
    (base, hits)
}

fn fast_fetcher() -> HttpFetcher {
    HttpFetcher::new(3, Duration::from_millis(5))
}

#[tokio::test]
async fn http_source_round_trips() -> TestResult {
    init_tracing();
    let (base, hits) = serve(|_| tiny_http::Response::from_string("remote-bytes"));
    let env = TestEnv::with_store_setup(|s| s.with_http(fast_fetcher()));

    let artifact = ArtifactRef::new(
        "data",
        ArtifactSource::RemoteUrl {
            url: format!("{base}/data.txt"),
        },
        CapturePolicy::AlwaysCapture,
    );
    let path = with_timeout(env.store.fetch(&env.db, "exp", &artifact)).await?;
    assert_eq!(std::fs::read(&path)?, b"remote-bytes");

    // Re-publish the fetched content and fetch it back: byte-identical, and
    // served from the store payload without another network hit.
    let published = with_timeout(env.store.publish(&path, "exp", &artifact)).await?;
    assert!(published.is_published());
    let resolved = with_timeout(env.store.fetch(&env.db, "exp", &published)).await?;
    assert_eq!(std::fs::read(&resolved)?, b"remote-bytes");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn http_404_fails_immediately_without_retry() -> TestResult {
    init_tracing();
    let (base, hits) = serve(|_| tiny_http::Response::from_string("gone").with_status_code(404));
    let env = TestEnv::with_store_setup(|s| s.with_http(fast_fetcher()));

    let artifact = ArtifactRef::new(
        "data",
        ArtifactSource::RemoteUrl {
            url: format!("{base}/missing.txt"),
        },
        CapturePolicy::AlwaysCapture,
    );
    let err = with_timeout(env.store.fetch(&env.db, "exp", &artifact))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AtelierError::Fetch { transient: false, .. }),
        "got: {err}"
    );
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn http_5xx_is_retried_until_success() -> TestResult {
    init_tracing();
    let (base, hits) = serve(|n| {
        if n < 2 {
            tiny_http::Response::from_string("busy").with_status_code(503)
        } else {
            tiny_http::Response::from_string("finally")
        }
    });
    let env = TestEnv::with_store_setup(|s| s.with_http(fast_fetcher()));

    let artifact = ArtifactRef::new(
        "data",
        ArtifactSource::RemoteUrl {
            url: format!("{base}/flaky.txt"),
        },
        CapturePolicy::AlwaysCapture,
    );
    let path = with_timeout(env.store.fetch(&env.db, "exp", &artifact)).await?;
    assert_eq!(std::fs::read(&path)?, b"finally");
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn http_5xx_exhausts_retry_budget_as_transient() -> TestResult {
    init_tracing();
    let (base, hits) = serve(|_| tiny_http::Response::from_string("busy").with_status_code(500));
    let env = TestEnv::with_store_setup(|s| s.with_http(fast_fetcher()));

    let artifact = ArtifactRef::new(
        "data",
        ArtifactSource::RemoteUrl {
            url: format!("{base}/down.txt"),
        },
        CapturePolicy::AlwaysCapture,
    );
    let err = with_timeout(env.store.fetch(&env.db, "exp", &artifact))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AtelierError::Fetch { transient: true, .. }),
        "got: {err}"
    );
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    Ok(())
}

#[tokio::test]
async fn cloud_source_fetches_through_backend() -> TestResult {
    init_tracing();
    let cloud_root = tempfile::tempdir()?;
    std::fs::create_dir_all(cloud_root.path().join("models"))?;
    std::fs::write(cloud_root.path().join("models").join("weights.bin"), b"w0")?;
    // SAFETY: test-local variable name, no concurrent reader of this name.
    unsafe {
        std::env::set_var("ATELIER_TEST_CLOUD_KEY_OK", "secret");
    }

    let root = cloud_root.path().to_path_buf();
    let env = TestEnv::with_store_setup(move |s| {
        s.with_cloud(Box::new(FsObjectStore::new(
            root,
            EnvCredentials::new("ATELIER_TEST_CLOUD_KEY_OK"),
        )))
    });

    let artifact = ArtifactRef::new(
        "weights",
        ArtifactSource::CloudUri {
            bucket: "models".to_string(),
            object: "weights.bin".to_string(),
        },
        CapturePolicy::AlwaysCapture,
    );
    let path = with_timeout(env.store.fetch(&env.db, "exp", &artifact)).await?;
    assert_eq!(std::fs::read(&path)?, b"w0");

    // Round trip through the store: publish the fetched bytes, then resolve
    // the published ref back out byte-identical.
    let published = with_timeout(env.store.publish(&path, "exp", &artifact)).await?;
    assert!(published.is_published());
    let resolved = with_timeout(env.store.fetch(&env.db, "exp", &published)).await?;
    assert_eq!(std::fs::read(&resolved)?, b"w0");
    Ok(())
}

#[tokio::test]
async fn cloud_source_without_backend_is_permanent_failure() -> TestResult {
    init_tracing();
    let env = TestEnv::new();

    let artifact = ArtifactRef::new(
        "weights",
        ArtifactSource::CloudUri {
            bucket: "models".to_string(),
            object: "weights.bin".to_string(),
        },
        CapturePolicy::AlwaysCapture,
    );
    let err = with_timeout(env.store.fetch(&env.db, "exp", &artifact))
        .await
        .unwrap_err();
    assert!(
        matches!(err, AtelierError::Fetch { transient: false, .. }),
        "got: {err}"
    );
    Ok(())
}

#[tokio::test]
async fn cloud_source_without_credentials_is_auth_error() -> TestResult {
    init_tracing();
    let cloud_root = tempfile::tempdir()?;
    let root = cloud_root.path().to_path_buf();
    let env = TestEnv::with_store_setup(move |s| {
        s.with_cloud(Box::new(FsObjectStore::new(
            root,
            EnvCredentials::new("ATELIER_TEST_CLOUD_KEY_UNSET"),
        )))
    });

    let artifact = ArtifactRef::new(
        "weights",
        ArtifactSource::CloudUri {
            bucket: "models".to_string(),
            object: "weights.bin".to_string(),
        },
        CapturePolicy::AlwaysCapture,
    );
    let err = with_timeout(env.store.fetch(&env.db, "exp", &artifact))
        .await
        .unwrap_err();
    assert!(matches!(err, AtelierError::Auth(_)), "got: {err}");
    Ok(())
}

#[tokio::test]
async fn tampered_published_payload_fails_integrity_check() -> TestResult {
    init_tracing();
    let env = TestEnv::new();
    let data = env.dir.path().join("f.txt");
    std::fs::write(&data, b"trusted")?;

    let r = ArtifactRef::new(
        "f",
        ArtifactSource::LocalPath { path: data.clone() },
        CapturePolicy::AlwaysCapture,
    );
    let published = with_timeout(env.store.publish(&data, "exp", &r)).await?;

    std::fs::write(env.store.payload_path("exp", "f"), b"corrupted")?;
    let err = with_timeout(env.store.fetch(&env.db, "exp", &published))
        .await
        .unwrap_err();
    assert!(matches!(err, AtelierError::Integrity { .. }), "got: {err}");
    Ok(())
}
