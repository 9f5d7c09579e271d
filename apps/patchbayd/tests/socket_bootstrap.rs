// SPDX-FileCopyrightText: © 2025 Patchbay Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Socket and lockfile bootstrap behavior.

use patchbayd::socket::ServerSocket;

#[tokio::test]
async fn creates_socket_and_lock_under_the_runtime_dir() {
    let dir = tempfile::tempdir().unwrap();
    // The default name resolution applies when the env carries nothing.
    std::env::set_var("XDG_RUNTIME_DIR", dir.path());
    std::env::remove_var("PATCHBAY_CORE");

    let config = patchbayd::config::Config::default();
    assert_eq!(config.socket_name(), "patchbay-0");

    let socket = ServerSocket::create(&config.socket_name()).unwrap();
    assert!(dir.path().join("patchbay-0").exists());
    assert!(dir.path().join("patchbay-0.lock").exists());

    // A second daemon on the same runtime dir must refuse to start.
    let second = ServerSocket::create_in(dir.path(), "patchbay-0");
    let message = format!("{:#}", second.err().unwrap());
    assert!(message.contains("unable to lock lockfile"), "got: {message}");

    // Dropping the first instance cleans up both files.
    drop(socket);
    assert!(!dir.path().join("patchbay-0").exists());
    assert!(!dir.path().join("patchbay-0.lock").exists());
}

#[tokio::test]
async fn stale_sockets_are_replaced() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("core-x"), b"stale").unwrap();

    let socket = ServerSocket::create_in(dir.path(), "core-x").unwrap();
    // The stale file was replaced by a live socket we can connect to.
    let stream = tokio::net::UnixStream::connect(dir.path().join("core-x")).await;
    assert!(stream.is_ok());
    drop(socket);
}
