#![allow(dead_code)]

use assert_cmd::Command;
use boxforge_test_utils::ContextFixture;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

/// Stand-in for `python3 -m pip`: honours `--target`, `--python-version`
/// and `-r`, fails like pip on an unknown distribution.
const FAKE_PIP: &str = r#"#!/bin/sh
target=""
version=""
manifest=""
while [ $# -gt 0 ]; do
  case "$1" in
    --target) target="$2"; shift 2 ;;
    --python-version) version="$2"; shift 2 ;;
    -r) manifest="$2"; shift 2 ;;
    *) shift ;;
  esac
done
if [ -z "$target" ] || [ -z "$version" ]; then
  echo "ERROR: no target interpreter given" >&2
  exit 2
fi
if grep -q this-package-does-not-exist "$manifest"; then
  echo "ERROR: No matching distribution found for this-package-does-not-exist" >&2
  exit 1
fi
site="$target/fakepkg"
mkdir -p "$site"
echo "python = '$version'" > "$site/__init__.py"
echo "Successfully installed fakepkg"
"#;

/// Each test gets its own home, so no cross-test locking is needed.
pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
    pub scratch: TempDir,
}

impl TestContext {
    /// Another command on the same home directory.
    pub fn new_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_boxforge");
        let mut cmd = Command::new(bin_path);
        cmd.timeout(Duration::from_secs(60));
        cmd.env_remove("BOXFORGE_HOME");
        cmd.arg("--home").arg(self.home.path());
        cmd
    }

    pub fn scratch(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }
}

pub fn boxforge() -> TestContext {
    let home = TempDir::new().expect("Failed to create home dir");
    let scratch = TempDir::new().expect("Failed to create scratch dir");

    let bin_path: &str = env!("CARGO_BIN_EXE_boxforge");
    let mut cmd = Command::new(bin_path);
    // You can override this with .timeout(Duration::from_secs(N))
    cmd.timeout(Duration::from_secs(60));
    cmd.env_remove("BOXFORGE_HOME");
    cmd.arg("--home").arg(home.path());

    TestContext { cmd, home, scratch }
}

/// Write the fake pip into `ctx` and point the build file's installer at it.
pub fn use_fake_pip(ctx: &ContextFixture) -> PathBuf {
    let pip = ctx.path().join("tools").join("pip");
    std::fs::create_dir_all(pip.parent().unwrap()).unwrap();
    std::fs::write(&pip, FAKE_PIP).unwrap();
    std::fs::set_permissions(&pip, std::fs::Permissions::from_mode(0o755)).unwrap();

    let build_file = ctx.build_file();
    let mut content = std::fs::read_to_string(&build_file).unwrap();
    content.push_str(&format!("install:\n  command: [\"{}\"]\n", pip.display()));
    std::fs::write(&build_file, content).unwrap();
    pip
}

/// Script app wired to the fake pip.
pub fn script_app() -> ContextFixture {
    let ctx = ContextFixture::script_app();
    use_fake_pip(&ctx);
    ctx
}
