use std::sync::{Mutex, OnceLock};

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Runs `run` with the given variables set (`Some`) or removed (`None`),
/// restoring the previous values afterwards. Holds a process-wide lock so
/// parallel tests never observe each other's environment.
pub(crate) fn with_env_vars<R>(vars: &[(&str, Option<&str>)], run: impl FnOnce() -> R) -> R {
    let _guard = env_lock().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let saved: Vec<(String, Option<String>)> = vars
        .iter()
        .map(|(key, _)| (key.to_string(), std::env::var(key).ok()))
        .collect();
    for (key, value) in vars {
        set_or_remove(key, *value);
    }
    let result = run();
    for (key, value) in &saved {
        set_or_remove(key, value.as_deref());
    }
    result
}

fn set_or_remove(key: &str, value: Option<&str>) {
    // SAFETY: callers hold the env lock, so no other test thread mutates the
    // environment concurrently.
    unsafe {
        match value {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
    }
}
