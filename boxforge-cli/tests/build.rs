use boxforge_test_utils::ContextFixture;
use predicates::prelude::*;
use rstest::rstest;

mod common;

#[test]
fn test_build_script_app() {
    let mut ctx = common::boxforge();
    let app = common::script_app();
    let out = ctx.scratch("image");

    ctx.cmd
        .arg("build")
        .arg("--context")
        .arg(app.path())
        .arg("-o")
        .arg(&out)
        .args(["-t", "app:1.0"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("sha256:"))
        .stdout(predicate::str::contains("Entry:  python /src/main.py"))
        .stdout(predicate::str::contains("Tag:    app:1.0"));

    assert!(out.join("index.json").is_file());
    assert!(out.join("oci-layout").is_file());
}

#[test]
fn test_build_twice_same_digest() {
    let ctx = common::boxforge();
    let app = common::script_app();

    let digest = |name: &str| {
        let output = ctx
            .new_cmd()
            .arg("build")
            .arg("--context")
            .arg(app.path())
            .arg("-o")
            .arg(ctx.scratch(name))
            .arg("--json")
            .output()
            .unwrap();
        assert!(output.status.success());
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        report["manifest_digest"].as_str().unwrap().to_string()
    };

    assert_eq!(digest("one"), digest("two"));
}

#[test]
fn test_build_failed_install() {
    let mut ctx = common::boxforge();
    let app = ContextFixture::module_app();
    common::use_fake_pip(&app);
    let out = ctx.scratch("image");

    ctx.cmd
        .arg("build")
        .arg("--context")
        .arg(app.path())
        .arg("-o")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("manifest_copied"))
        .stderr(predicate::str::contains("No matching distribution"));

    assert!(!out.exists());
    let builds: Vec<_> = std::fs::read_dir(ctx.home.path().join("builds"))
        .unwrap()
        .collect();
    assert!(builds.is_empty());
}

#[rstest]
#[case("python")]
#[case("python:latest")]
#[case("python:slim")]
fn test_build_rejects_unpinned_base(#[case] base: &str) {
    let mut ctx = common::boxforge();
    let app = common::script_app();
    app.write(
        "boxforge.yaml",
        &format!("base:\n  image: {}\nsource:\n  path: src\nentry:\n  script: /src/main.py\n", base),
    );

    let out = ctx.scratch("image");
    ctx.cmd
        .arg("build")
        .arg("--context")
        .arg(app.path())
        .arg("-o")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("not pinned"))
        .stderr(predicate::str::contains("not_started"));
}

#[test]
fn test_build_explicit_file() {
    let mut ctx = common::boxforge();
    let app = common::script_app();
    let file = ctx.scratch("custom.yaml");
    std::fs::copy(app.build_file(), &file).unwrap();
    app.remove("boxforge.yaml");

    let out = ctx.scratch("image");
    ctx.cmd
        .arg("build")
        .arg("-f")
        .arg(&file)
        .arg("--context")
        .arg(app.path())
        .arg("-o")
        .arg(&out)
        .assert()
        .success();
}

#[test]
fn test_build_missing_build_file() {
    let mut ctx = common::boxforge();
    let app = ContextFixture::new();

    let out = ctx.scratch("image");
    ctx.cmd
        .arg("build")
        .arg("--context")
        .arg(app.path())
        .arg("-o")
        .arg(&out)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load build file"));
}
