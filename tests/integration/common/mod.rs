//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::{
    env,
    net::TcpListener,
    path::{Path, PathBuf},
    sync::MutexGuard,
    time::{Duration, Instant},
};

use stigmer::{constants, paths, test_utils};
use tempfile::TempDir;

/// Points `STIGMER_HOME` at a fresh temp directory for the duration of a
/// test, serializing env mutation across threads.
pub struct HomeEnvGuard {
    _env: MutexGuard<'static, ()>,
    temp: TempDir,
    previous: Option<std::ffi::OsString>,
}

impl HomeEnvGuard {
    pub fn new() -> Self {
        let env_guard = test_utils::env_lock();
        let temp = TempDir::new().expect("tempdir");
        let previous = env::var_os(constants::ENV_HOME);
        unsafe {
            env::set_var(constants::ENV_HOME, temp.path());
        }
        paths::init();
        paths::ensure_data_dir().expect("data dir");
        Self {
            _env: env_guard,
            temp,
            previous,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }
}

impl Drop for HomeEnvGuard {
    fn drop(&mut self) {
        unsafe {
            match &self.previous {
                Some(value) => env::set_var(constants::ENV_HOME, value),
                None => env::remove_var(constants::ENV_HOME),
            }
        }
        paths::init();
    }
}

/// Path of the built stigmer binary, for spawning personalities.
pub fn stigmer_bin() -> PathBuf {
    assert_cmd::cargo::cargo_bin("stigmer")
}

/// Picks a free localhost TCP port.
pub fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

/// Polls a predicate until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    predicate()
}
