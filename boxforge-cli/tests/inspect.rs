use predicates::prelude::*;

mod common;

fn build(ctx: &common::TestContext, name: &str) -> std::path::PathBuf {
    let app = common::script_app();
    let out = ctx.scratch(name);
    ctx.new_cmd()
        .arg("build")
        .arg("--context")
        .arg(app.path())
        .arg("-o")
        .arg(&out)
        .assert()
        .success();
    out
}

#[test]
fn test_inspect_table() {
    let mut ctx = common::boxforge();
    let image = build(&ctx, "image");

    ctx.cmd
        .arg("inspect")
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains("Cmd:         python /src/main.py"))
        .stdout(predicate::str::contains("Entrypoint:  (none)"))
        .stdout(predicate::str::contains("org.opencontainers.image.base.digest"))
        .stdout(predicate::str::contains("application/vnd.oci.image.layer.v1.tar+gzip"));
}

#[test]
fn test_inspect_json() {
    let ctx = common::boxforge();
    let image = build(&ctx, "image");

    let output = ctx
        .new_cmd()
        .arg("inspect")
        .arg(&image)
        .args(["--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let details: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(details["config"]["cmd"], serde_json::json!(["python", "/src/main.py"]));
    assert_eq!(details["config"]["entrypoint"], serde_json::json!([]));
    assert_eq!(details["config"]["created"], "1970-01-01T00:00:00Z");
    // base layer + source, config, manifest, dependencies
    assert_eq!(details["layers"].as_array().unwrap().len(), 5);
}

#[test]
fn test_inspect_not_an_image() {
    let mut ctx = common::boxforge();
    let dir = ctx.scratch("empty");
    std::fs::create_dir_all(&dir).unwrap();

    ctx.cmd
        .arg("inspect")
        .arg(&dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("index.json"));
}

#[test]
fn test_unpack() {
    let mut ctx = common::boxforge();
    let image = build(&ctx, "image");
    let rootfs = ctx.scratch("rootfs");

    ctx.cmd
        .arg("unpack")
        .arg(&image)
        .arg(&rootfs)
        .assert()
        .success()
        .stdout(predicate::str::contains("Unpacked 5 layers"));

    assert_eq!(
        std::fs::read_to_string(rootfs.join("src/main.py")).unwrap(),
        "print('hello from boxforge')\n"
    );
    assert_eq!(
        std::fs::read_to_string(
            rootfs.join("usr/local/lib/python3.12/site-packages/fakepkg/__init__.py")
        )
        .unwrap(),
        "python = '3.12'\n"
    );
    assert!(!rootfs.join("src/stale.txt").exists());

    ctx.new_cmd()
        .arg("unpack")
        .arg(&image)
        .arg(&rootfs)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not empty"));
}

#[test]
fn test_pull_rejects_unpinned_reference() {
    let mut ctx = common::boxforge();

    ctx.cmd
        .args(["pull", "python:latest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not pinned"));
}
