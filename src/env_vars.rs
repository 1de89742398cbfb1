/// Variables read straight from the environment, outside of `tripwire.toml`.
#[derive(strum::Display, Clone, Copy)]
#[allow(non_camel_case_types)]
pub(crate) enum SupportedEnvVar {
    TOKIO_CONSOLE,
}

pub(crate) fn is_env_true(key: SupportedEnvVar) -> bool {
    std::env::var(key.to_string())
        .is_ok_and(|val| val.trim().eq_ignore_ascii_case("true") || val.trim() == "1")
}
