#![allow(dead_code)]

pub mod mocks;

use databridge::config::BridgeConfig;
use std::path::PathBuf;

pub fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/databridge.json")
}

pub fn load_bridge_config() -> BridgeConfig {
    BridgeConfig::from_path(fixture_path()).expect("fixture config")
}
