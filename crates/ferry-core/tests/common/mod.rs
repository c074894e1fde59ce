#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ferry_core::EngineConfig;
use tempfile::TempDir;

/// A shell script standing in for the transfer tool. Every invocation appends
/// its arguments as one line to `args.txt` next to the script.
pub struct FakeTool {
    pub dir: TempDir,
    pub path: PathBuf,
}

impl FakeTool {
    pub fn new(body: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("fake-rclone");
        let script = format!(
            "#!/bin/sh\necho \"$@\" >> \"$(dirname \"$0\")/args.txt\"\nfor last; do :; done\n{body}\n"
        );
        fs::write(&path, script).expect("write fake tool");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake tool");
        Self { dir, path }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            tool_path: self.path.clone(),
            parallelism: 2,
            terminate_timeout_ms: 2_000,
            ..EngineConfig::default()
        }
    }

    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(self.dir.path().join("args.txt"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn marker(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// Poll until `path` exists.
pub async fn wait_for_file(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("{} never appeared", path.display());
}

/// Two stats blocks: half way, then complete.
pub const TWO_BLOCKS: &str = r#"cat >&2 <<'BLOCK'
2024/05/01 10:00:00 NOTICE: 
Transferred:   	  512 MiB / 1 GiB, 50%, 10 MiB/s, ETA 51s
Transferred:            1 / 2, 50%
Elapsed time:        1.0s
Transferring:
 *                                  big.iso: 50% /1Gi, 10Mi/s, 51s

BLOCK
sleep 0.2
cat >&2 <<'BLOCK'
2024/05/01 10:00:01 NOTICE: 
Transferred:   	    1 GiB / 1 GiB, 100%, 10 MiB/s, ETA 0s
Transferred:            2 / 2, 100%
Elapsed time:        2.0s

BLOCK"#;
