use anyhow::Result;
use partitioncache_cache::ConfigError;
use std::process::ExitCode;

pub fn runtime_failure() -> ExitCode {
    ExitCode::from(2)
}

/// 0 on success, 1 for configuration errors, 2 for runtime failures.
pub fn from_result(result: Result<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            if error.downcast_ref::<ConfigError>().is_some() {
                ExitCode::from(1)
            } else {
                ExitCode::from(2)
            }
        }
    }
}
