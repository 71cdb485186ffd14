mod utils;

use std::time::Duration;

use googletest::prelude::*;
use noteport_kernel::{ClientError, KernelClient, KernelProcess, KernelStatus, ProtocolError};
use stub_kernel::StubKernel;
use utils::{fast_config, is_running, write_connection_file};

#[googletest::test]
#[tokio::test]
async fn client_executes_code_against_a_live_kernel() {
    let kernel = StubKernel::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_connection_file(dir.path(), &kernel.connection_json());

    let mut client = KernelClient::connect(&path, fast_config(dir.path()))
        .await
        .unwrap();
    client.wait_until_ready().await.unwrap();
    let mut statuses = client.subscribe_status();

    let output = client.execute("1+1").await;
    let echoed = client.execute("print('hi')").await;

    expect_that!(output, eq("2"));
    expect_that!(echoed, eq("print('hi')"));
    expect_that!(statuses.recv().await, some(eq(KernelStatus::Busy)));
    expect_that!(statuses.recv().await, some(eq(KernelStatus::Idle)));

    client.shutdown().await;
}

#[googletest::test]
#[tokio::test]
async fn wrongly_signed_requests_never_become_ready() {
    let kernel = StubKernel::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut connection = kernel.connection.clone();
    connection.key = "not-the-kernel-key".to_string();
    let path = write_connection_file(dir.path(), &serde_json::to_string(&connection).unwrap());

    let config = fast_config(dir.path()).ready_timeout(Duration::from_millis(300));
    let mut client = KernelClient::connect(&path, config).await.unwrap();

    expect_that!(
        matches!(client.wait_until_ready().await, Err(ClientError::NotReady(_))),
        eq(true)
    );

    client.shutdown().await;
}

#[googletest::test]
#[tokio::test]
async fn strict_client_rejects_unsupported_signature_scheme() {
    let kernel = StubKernel::start().await;
    let dir = tempfile::tempdir().unwrap();
    let mut connection = kernel.connection.clone();
    connection.signature_scheme = "hmac-md5".to_string();
    let path = write_connection_file(dir.path(), &serde_json::to_string(&connection).unwrap());

    let result = KernelClient::connect(&path, fast_config(dir.path()).strict_signatures(true)).await;

    expect_that!(
        matches!(
            result,
            Err(ClientError::Protocol(ProtocolError::UnsupportedScheme(_)))
        ),
        eq(true)
    );
}

#[googletest::test]
#[tokio::test]
async fn missing_connection_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();

    let result = KernelClient::connect(dir.path().join("absent.json"), fast_config(dir.path())).await;

    expect_that!(matches!(result, Err(ClientError::Config(_))), eq(true));
}

#[googletest::test]
#[tokio::test]
async fn shutdown_twice_removes_connection_file_once() {
    let kernel = StubKernel::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_connection_file(dir.path(), &kernel.connection_json());

    let mut client = KernelClient::connect(&path, fast_config(dir.path()))
        .await
        .unwrap();
    client.adopt_process(KernelProcess::from_pid(None, path.clone()));

    client.shutdown().await;
    client.shutdown().await;

    expect_that!(path.exists(), eq(false));
}

#[cfg(unix)]
#[googletest::test]
#[tokio::test]
async fn shutdown_terminates_an_owned_child_process() {
    let kernel = StubKernel::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_connection_file(dir.path(), &kernel.connection_json());
    let child = tokio::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();

    let mut client = KernelClient::connect(&path, fast_config(dir.path()))
        .await
        .unwrap();
    client.adopt_process(KernelProcess::from_child(child, path.clone()));
    let pid = client.kernel_pid().unwrap();

    expect_that!(is_running(pid), eq(true));
    client.shutdown().await;

    expect_that!(is_running(pid), eq(false));
    expect_that!(path.exists(), eq(false));
}

#[cfg(unix)]
#[googletest::test]
#[tokio::test]
async fn shutdown_kills_an_owned_child_that_ignores_terminate() {
    let kernel = StubKernel::start().await;
    let dir = tempfile::tempdir().unwrap();
    let path = write_connection_file(dir.path(), &kernel.connection_json());
    let child = tokio::process::Command::new("sh")
        .args(["-c", "trap '' TERM; while :; do sleep 1; done"])
        .spawn()
        .unwrap();

    let mut client = KernelClient::connect(&path, fast_config(dir.path()))
        .await
        .unwrap();
    client.adopt_process(KernelProcess::from_child(child, path.clone()));
    let pid = client.kernel_pid().unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    client.shutdown().await;

    expect_that!(is_running(pid), eq(false));
    expect_that!(path.exists(), eq(false));
}
