#![allow(dead_code)]

use parking_lot::{Mutex, MutexGuard};
use std::env;

static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Sets a batch of environment variables for the lifetime of the guard and
/// restores the previous values on drop. Holds a process-wide lock so tests
/// touching the environment never interleave.
pub struct ScopedEnv {
    saved: Vec<(&'static str, Option<String>)>,
    _lock: MutexGuard<'static, ()>,
}

impl ScopedEnv {
    pub fn new() -> Self {
        Self {
            saved: Vec::new(),
            _lock: ENV_LOCK.lock(),
        }
    }

    pub fn set(mut self, key: &'static str, value: &str) -> Self {
        self.saved.push((key, env::var(key).ok()));
        env::set_var(key, value);
        self
    }

    pub fn clear(mut self, key: &'static str) -> Self {
        self.saved.push((key, env::var(key).ok()));
        env::remove_var(key);
        self
    }
}

impl Drop for ScopedEnv {
    fn drop(&mut self) {
        for (key, original) in self.saved.drain(..).rev() {
            match original {
                Some(value) => env::set_var(key, value),
                None => env::remove_var(key),
            }
        }
    }
}
