use std::env;
use std::path::PathBuf;

/// Path of the configuration file, if set
pub fn config_path() -> Option<PathBuf> {
    env::var_os("SIMNET_CONFIG").map(PathBuf::from)
}

/// Overrides the compose program, e.g. `docker compose` wrappers or `podman-compose`
pub fn compose_program() -> Option<String> {
    env::var("SIMNET_COMPOSE").ok().filter(|s| !s.is_empty())
}
