//! The `upload` command, run through the binary.

use std::fs;
use std::path::Path;
use std::process::Output;

use anyhow::Result;
use serde_json::json;
use tempfile::TempDir;

const PERSON: &str = "http://onto-ns.com/meta/0.1/Person";

fn registry_command() -> Result<assert_cmd::Command> {
    let mut cmd = assert_cmd::Command::cargo_bin("entities-registry")?;
    for var in ["BACKEND", "DATA_DIR", "ACCESS_TOKEN"] {
        cmd.env_remove(format!("ENTITIES_REGISTRY_{var}"));
    }
    Ok(cmd)
}

fn run(args: &[&str]) -> Result<Output> {
    Ok(registry_command()?.args(args).output()?)
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn write_person(dir: &Path, file: &str, description: &str) -> Result<String> {
    let path = dir.join(file);
    let entity = json!({
        "uri": PERSON,
        "namespace": "http://onto-ns.com/meta",
        "version": "0.1",
        "name": "Person",
        "description": description,
        "properties": {"age": {"type": "int"}},
    });
    fs::write(&path, serde_json::to_vec(&entity)?)?;
    Ok(path.display().to_string())
}

#[test]
fn test_no_files_found_exits_with_an_error() -> Result<()> {
    let empty = TempDir::new()?;
    let dir = empty.path().display().to_string();

    let output = run(&["upload", "--format", "json", "--dir", &dir])?;
    assert_eq!(output.status.code(), Some(1), "stderr: {}", stderr(&output));
    assert!(stderr(&output).contains("No files found with the given options."));

    let yaml_only = TempDir::new()?;
    fs::write(yaml_only.path().join("Person.yaml"), "uri: x\n")?;
    let dir = yaml_only.path().display().to_string();
    let output = run(&["upload", "--dir", &dir])?;
    assert_eq!(output.status.code(), Some(1));
    Ok(())
}

#[test]
fn test_files_of_another_format_are_skipped_with_a_hint() -> Result<()> {
    let files = TempDir::new()?;
    let person = write_person(files.path(), "Person.json", "A person")?;

    let output = run(&["upload", "--format", "yaml", "--file", &person])?;
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains(&format!("Skipping file: {person}")));
    assert!(out.contains(
        "Entities using the file format 'json' can be uploaded by adding the option: --format=json"
    ));
    assert!(out.contains("No entities were uploaded."));
    Ok(())
}

#[test]
fn test_memory_backend_warns_that_uploads_are_discarded() -> Result<()> {
    let files = TempDir::new()?;
    let person = write_person(files.path(), "Person.json", "A person")?;

    let output = registry_command()?
        .env_remove("RUST_LOG")
        .args(["upload", "--file", person.as_str()])
        .output()?;
    assert_eq!(output.status.code(), Some(0));
    assert!(stderr(&output).contains("in-memory backend"));
    Ok(())
}

#[cfg(feature = "persistent")]
#[test]
fn test_changed_entity_is_skipped_or_bumped() -> Result<()> {
    let data = TempDir::new()?;
    let files = TempDir::new()?;
    let data_dir = data.path().display().to_string();

    let original = write_person(files.path(), "Person.json", "A person")?;
    let changed = write_person(files.path(), "Person2.json", "Someone else")?;

    let output = run(&["--data-dir", &data_dir, "upload", "--file", &original])?;
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let output = run(&["--data-dir", &data_dir, "upload", "--file", &changed])?;
    assert_eq!(output.status.code(), Some(0));
    assert!(stderr(&output).contains("differ in their content"));
    assert!(stdout(&output).contains(&format!("Skipping file: {changed}")));

    let output = run(&[
        "--data-dir", &data_dir, "upload", "--file", &changed, "--bump-version",
    ])?;
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));
    assert!(stdout(&output).contains("http://onto-ns.com/meta/0.1.1/Person"));

    let output = run(&[
        "--data-dir", &data_dir, "upload", "--bump-version", "0.2", "--file", &changed,
    ])?;
    assert_eq!(output.status.code(), Some(0), "stderr: {}", stderr(&output));

    let output = run(&[
        "--data-dir",
        &data_dir,
        "get",
        "http://onto-ns.com/meta/0.2/Person",
    ])?;
    assert_eq!(output.status.code(), Some(0));
    let stored: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(stored["version"], json!("0.2"));
    assert_eq!(stored["description"], json!("Someone else"));
    Ok(())
}

#[cfg(feature = "persistent")]
#[test]
fn test_same_or_invalid_bump_version_fails() -> Result<()> {
    let data = TempDir::new()?;
    let files = TempDir::new()?;
    let data_dir = data.path().display().to_string();

    let original = write_person(files.path(), "Person.json", "A person")?;
    let changed = write_person(files.path(), "Person2.json", "Someone else")?;
    run(&["--data-dir", &data_dir, "upload", "--file", &original])?;

    let output = run(&[
        "--data-dir", &data_dir, "upload", "--bump-version", "0.1", "--file", &changed,
    ])?;
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output)
        .contains("New version (0.1) is the same as the existing version (0.1)."));

    let output = run(&[
        "--data-dir", &data_dir, "upload", "--bump-version", "v0.1", "--file", &changed,
    ])?;
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("New version (v0.1) is not a valid entity version."));
    Ok(())
}
