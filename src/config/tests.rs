use super::*;
use std::sync::Mutex;

// Environment variables are process-global; serialise the tests that
// mutate them.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_meridian_env() {
    for (key, _) in env::vars() {
        if key.starts_with("MERIDIAN_") {
            env::remove_var(key);
        }
    }
}

#[test]
fn missing_token_secret_is_a_configuration_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_meridian_env();

    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, CoreError::Configuration(_)));
}

#[test]
fn short_token_secret_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_meridian_env();
    env::set_var("MERIDIAN_TOKEN_SECRET", "too-short");

    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, CoreError::Configuration(_)));
}

#[test]
fn defaults_apply_when_only_required_values_are_set() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_meridian_env();
    env::set_var(
        "MERIDIAN_TOKEN_SECRET",
        "0123456789abcdef0123456789abcdef",
    );

    let config = Config::from_env().unwrap();
    assert_eq!(config.api.host, "127.0.0.1");
    assert_eq!(config.api.port, 4000);
    assert_eq!(config.api.environment, Environment::Development);
    assert!(config.provider.api_key.is_none());
    assert_eq!(config.auth.session_ttl_secs, 8 * 3600);
}

#[test]
fn unknown_variables_do_not_fail_startup() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_meridian_env();
    env::set_var(
        "MERIDIAN_TOKEN_SECRET",
        "0123456789abcdef0123456789abcdef",
    );
    env::set_var("MERIDIAN_FUTURE_FLAG", "whatever");

    assert!(Config::from_env().is_ok());
    env::remove_var("MERIDIAN_FUTURE_FLAG");
}

#[test]
fn invalid_environment_name_is_rejected() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_meridian_env();
    env::set_var(
        "MERIDIAN_TOKEN_SECRET",
        "0123456789abcdef0123456789abcdef",
    );
    env::set_var("MERIDIAN_ENV", "staging");

    let err = Config::from_env().unwrap_err();
    assert!(matches!(err, CoreError::Configuration(_)));
    env::remove_var("MERIDIAN_ENV");
}
