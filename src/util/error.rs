use crate::allocator::{AllocError, AllocatorInvariantError};
use crate::objectmap::{BitmapError, DiffError};
use crate::pglog::{LogInvariantError, LogWriteError};
use crate::util::config::ConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PgCoreError {
    #[error(transparent)]
    Alloc(#[from] AllocError),
    #[error(transparent)]
    AllocatorInvariant(#[from] AllocatorInvariantError),
    #[error(transparent)]
    Diff(#[from] DiffError),
    #[error(transparent)]
    Bitmap(#[from] BitmapError),
    #[error(transparent)]
    LogInvariant(#[from] LogInvariantError),
    #[error(transparent)]
    LogWrite(#[from] LogWriteError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
