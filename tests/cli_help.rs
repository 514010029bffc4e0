use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("weread-export");
    cmd.arg("--help").assert().success().stdout(
        predicate::str::contains("info").and(predicate::str::contains("export")),
    );
}

#[test]
fn export_requires_book_id_and_out() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("weread-export");
    cmd.arg("export")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--book-id"));
}

#[test]
fn rust_log_debug_emits_debug_line_to_stderr() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    // Pre-seeded metadata keeps the run offline; the empty PATH makes the
    // browser launch fail deterministically right after argument parsing.
    std::fs::write(
        dir.path().join("meta.json"),
        r#"{"title":"T","author":"A","cover":"","intro":"","chapters":[]}"#,
    )?;

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("weread-export");
    cmd.env("RUST_LOG", "debug")
        .env("PATH", "")
        .args(["export", "--book-id", "x"])
        .arg("--out")
        .arg(dir.path())
        .arg("--cookie")
        .arg(dir.path().join("cookie.txt"))
        .arg("--cache-dir")
        .arg(dir.path().join("cache"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("parsed cli"));
    Ok(())
}
