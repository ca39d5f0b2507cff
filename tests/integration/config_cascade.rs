#[path = "common/mod.rs"]
mod common;

use common::HomeEnvGuard;
use stigmer::config::{
    self, BackendType, Config, ExecutionMode, ExecutionOverrides,
};

#[test]
fn set_then_get_round_trips_through_the_file() {
    let _home = HomeEnvGuard::new();

    let mut config = config::load_config().expect("load defaults");
    config::set_key(&mut config, "backend.local.execution.mode", "sandbox").expect("set");
    config::set_key(&mut config, "backend.cloud.organization", "org-acme").expect("set");
    config::save_config(&config).expect("save");

    let reloaded = config::load_config().expect("reload");
    assert_eq!(
        config::get_key(&reloaded, "backend.local.execution.mode").expect("get"),
        "sandbox"
    );
    assert_eq!(
        config::get_key(&reloaded, "backend.cloud.organization").expect("get"),
        "org-acme"
    );
}

#[test]
fn every_listed_key_is_readable() {
    let _home = HomeEnvGuard::new();
    let config = config::load_config().expect("load");
    for key in config::CONFIG_KEYS {
        config::get_key(&config, key).expect("every listed key resolves");
    }
}

#[test]
fn backend_toggle_survives_reload() {
    let _home = HomeEnvGuard::new();

    let mut config = config::load_config().expect("load");
    config.backend.backend_type = BackendType::Cloud;
    config::save_config(&config).expect("save");

    let reloaded = config::load_config().expect("reload");
    assert_eq!(reloaded.backend.backend_type, BackendType::Cloud);
}

#[test]
fn flag_beats_file_value_in_the_cascade() {
    let _home = HomeEnvGuard::new();

    let mut config = Config::default();
    config.backend.local.execution.mode = ExecutionMode::Sandbox;
    config.backend.local.execution.ttl = 100;

    let overrides = ExecutionOverrides {
        mode: Some(ExecutionMode::Local),
        ttl: Some(250),
        ..Default::default()
    };
    let settings = config::resolve_execution(&config, &overrides);
    assert_eq!(settings.mode, ExecutionMode::Local);
    assert_eq!(settings.ttl, 250);

    let settings = config::resolve_execution(&config, &ExecutionOverrides::default());
    assert_eq!(settings.mode, ExecutionMode::Sandbox);
    assert_eq!(settings.ttl, 100);
}

#[test]
fn config_set_does_not_disturb_other_keys() {
    let _home = HomeEnvGuard::new();

    let mut config = config::load_config().expect("load");
    config::set_key(&mut config, "backend.local.execution.ttl", "777").expect("set");
    config::save_config(&config).expect("save");

    let reloaded = config::load_config().expect("reload");
    assert_eq!(reloaded.backend.local.execution.ttl, 777);
    assert_eq!(reloaded.backend.backend_type, BackendType::Local);
    assert_eq!(
        reloaded.backend.local.execution.sandbox_image,
        stigmer::constants::DEFAULT_SANDBOX_IMAGE
    );
}
