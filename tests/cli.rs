mod support;

use anyhow::{Context as _, Result};
use assert_cmd::Command;
use predicates::prelude::*;

use ln_swap_sdk::Network;
use ln_swap_sdk::keys::NodeIdentity;
use support::invoice::{invoice_for, payment_hash};
use support::mock::regtest_address;

fn sdk_cli() -> Result<Command> {
    Command::cargo_bin("sdk_cli").context("locate sdk_cli binary")
}

#[test]
fn parse_invoice_prints_json() -> Result<()> {
    let bolt11 = invoice_for(Some(250_000), [0x61; 32]);
    let output = sdk_cli()?
        .args(["--network", "regtest", "parse-invoice", &bolt11])
        .assert()
        .success()
        .stdout(predicate::str::contains(payment_hash(&[0x61; 32])))
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).context("stdout is json")?;
    assert_eq!(json["amount_msat"], 250_000);
    assert_eq!(json["description"], "coffee");
    Ok(())
}

#[test]
fn parse_invoice_rejects_wrong_network() -> Result<()> {
    let bolt11 = invoice_for(Some(250_000), [0x61; 32]);
    sdk_cli()?
        .args(["parse-invoice", &bolt11])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid invoice"));
    Ok(())
}

#[test]
fn parse_input_classifies_addresses_offline() -> Result<()> {
    let address = regtest_address(0x41);
    sdk_cli()?
        .args(["--network", "regtest", "parse-input", &format!("bitcoin:{address}?amount=0.001")])
        .assert()
        .success()
        .stdout(predicate::str::contains(address).and(predicate::str::contains("100000")));
    Ok(())
}

#[test]
fn check_message_verifies_offline() -> Result<()> {
    let identity = NodeIdentity::from_seed(&[0x07; 32], Network::Regtest)?;
    let signature = identity.sign_message("hello")?;
    let pubkey = identity.node_pubkey().to_string();

    sdk_cli()?
        .args(["check-message", "hello", &pubkey, &signature])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""is_valid": true"#));
    sdk_cli()?
        .args(["check-message", "goodbye", &pubkey, &signature])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""is_valid": false"#));
    Ok(())
}

#[test]
fn garbage_input_fails() -> Result<()> {
    sdk_cli()?
        .args(["--network", "regtest", "parse-input", "definitely not a payment"])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn commands_needing_the_node_require_a_seed() -> Result<()> {
    let dir = tempfile::tempdir().context("create tempdir")?;
    sdk_cli()?
        .arg("--working-dir")
        .arg(dir.path())
        .args(["--network", "regtest", "node-info"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--seed is required"));
    Ok(())
}
