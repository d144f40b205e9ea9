use crate::{Error, Result};
use rayon::ThreadPoolBuilder;
use std::env;
use std::sync::OnceLock;

pub const CPU_THREADS_ENV: &str = "DEM_CPU_THREADS";

static THREAD_POOL_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

/// Initialize the global Rayon thread pool used by tile-parallel routines.
///
/// Repeated calls are idempotent and return the first initialization result.
///
/// Priority:
/// 1. `num_threads` argument
/// 2. `DEM_CPU_THREADS` environment variable
/// 3. Rayon default
pub fn init_global_thread_pool(num_threads: Option<usize>) -> Result<()> {
    THREAD_POOL_INIT
        .get_or_init(|| {
            let configured_threads = match num_threads {
                Some(n) => Some(n),
                None => read_cpu_threads_from_env().map_err(|e| e.to_string())?,
            };

            let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("dem-worker-{i}"));
            if let Some(n) = configured_threads {
                if n == 0 {
                    return Err(format!("{CPU_THREADS_ENV} must be >= 1"));
                }
                builder = builder.num_threads(n);
            }

            builder.build_global().map_err(|e| e.to_string())?;
            tracing::debug!(threads = rayon::current_num_threads(), "global thread pool ready");
            Ok(())
        })
        .clone()
        .map_err(Error::Config)
}

/// Dedicated pool for one run, used when the configuration pins a thread count.
pub fn build_thread_pool(num_threads: usize) -> Result<rayon::ThreadPool> {
    if num_threads == 0 {
        return Err(Error::config("thread count must be >= 1"));
    }
    ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .thread_name(|i| format!("dem-run-{i}"))
        .build()
        .map_err(|e| Error::config(format!("failed to build thread pool: {e}")))
}

pub fn current_cpu_threads() -> usize {
    rayon::current_num_threads()
}

fn read_cpu_threads_from_env() -> Result<Option<usize>> {
    let raw = match env::var(CPU_THREADS_ENV) {
        Ok(v) => v,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(e) => {
            return Err(Error::config(format!(
                "Failed to read {CPU_THREADS_ENV}: {e}"
            )))
        }
    };

    let parsed: usize = raw.trim().parse().map_err(|_| {
        Error::config(format!(
            "{CPU_THREADS_ENV} must be a positive integer, got '{raw}'"
        ))
    })?;
    if parsed == 0 {
        return Err(Error::config(format!("{CPU_THREADS_ENV} must be >= 1")));
    }
    Ok(Some(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_thread_pool_is_rejected() {
        assert!(matches!(build_thread_pool(0), Err(Error::Config(_))));
    }

    #[test]
    fn dedicated_pool_has_requested_size() {
        let pool = build_thread_pool(2).unwrap();
        assert_eq!(pool.install(current_cpu_threads), 2);
    }
}
