#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use wait_timeout::ChildExt;

/// Upper bound on any single run of the binary under test.
pub const RUN_TIMEOUT: Duration = Duration::from_secs(20);

/// Scratch workspace with a config directory whose `ferry.toml` points at a
/// shell script standing in for rclone.
pub struct TestContext {
    pub work: TempDir,
    pub config_dir: PathBuf,
    pub tool: PathBuf,
}

impl TestContext {
    pub fn new(tool_body: &str) -> Self {
        let work = tempfile::tempdir().expect("tempdir");
        let config_dir = work.path().join("config");
        fs::create_dir_all(&config_dir).expect("config dir");

        let tool = work.path().join("fake-rclone");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> \"$(dirname \"$0\")/args.txt\"\nfor last; do :; done\n{tool_body}\n"
        );
        fs::write(&tool, script).expect("write fake tool");
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");

        let toml = format!(
            "tool_path = \"{}\"\nparallelism = 2\nterminate_timeout_ms = 2000\n",
            tool.display()
        );
        fs::write(config_dir.join("ferry.toml"), toml).expect("write config");

        Self {
            work,
            config_dir,
            tool,
        }
    }

    pub fn path(&self) -> &Path {
        self.work.path()
    }

    /// `ferry --config-dir <dir> <args>` with stdin closed.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_ferry"));
        cmd.arg("--config-dir")
            .arg(&self.config_dir)
            .args(args)
            .env_remove("RCLONE_PATH")
            .env_remove("RCLONE_CONFIG")
            .env_remove("RUST_LOG")
            .stdin(Stdio::null());
        cmd
    }

    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.work.path().join("args.txt"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn marker(&self, name: &str) -> PathBuf {
        self.work.path().join(name)
    }
}

pub fn wait_for_file(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(25));
    }
    panic!("{} never appeared", path.display());
}

pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> Output {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let child = cmd.spawn().expect("spawn ferry");
    wait_with_timeout(child, timeout)
}

/// Wait for `child` to exit, killing it and failing the test after `timeout`.
pub fn wait_with_timeout(mut child: Child, timeout: Duration) -> Output {
    match child.wait_timeout(timeout).expect("wait for ferry") {
        Some(_status) => child
            .wait_with_output()
            .expect("collect ferry output after completion"),
        None => {
            let _ = child.kill();
            let output = child
                .wait_with_output()
                .expect("collect output after killing ferry");
            panic!(
                "ferry timed out after {:?}\nstdout:\n{}\nstderr:\n{}",
                timeout,
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
        }
    }
}
