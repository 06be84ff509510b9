use std::process::Command;

use assert_cmd::{
  cargo,
  prelude::*,
};
use predicates::prelude::*;

#[test]
fn help_lists_all_modes() -> Result<(), Box<dyn std::error::Error>> {
  let mut cmd = Command::new(cargo::cargo_bin!());
  cmd.arg("--help");
  cmd
    .assert()
    .success()
    .stdout(predicate::str::contains("attach"))
    .stdout(predicate::str::contains("create"))
    .stdout(predicate::str::contains("new"))
    .stdout(predicate::str::contains("push"));
  Ok(())
}

#[test]
fn no_mode_is_an_error() -> Result<(), Box<dyn std::error::Error>> {
  let mut cmd = Command::new(cargo::cargo_bin!());
  cmd.assert().failure();
  Ok(())
}

#[test]
fn create_requires_a_command() -> Result<(), Box<dyn std::error::Error>> {
  let mut cmd = Command::new(cargo::cargo_bin!());
  cmd.arg("create").arg("/tmp/retach-smoke-no-cmd");
  cmd.assert().failure();
  Ok(())
}

#[test]
fn invalid_redraw_method_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
  let mut cmd = Command::new(cargo::cargo_bin!());
  cmd
    .arg("new")
    .arg("/tmp/retach-smoke-bad-redraw")
    .arg("-r")
    .arg("sideways")
    .arg("--")
    .arg("true");
  cmd
    .assert()
    .failure()
    .stderr(predicate::str::contains("sideways"));
  Ok(())
}
