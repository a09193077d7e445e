//! Extent allocator keeping free space in two ordered indices, switching
//! between cursor-affine first-fit and best-fit as space runs low.

pub mod avl;
pub mod extent;

pub use avl::{
    AllocError, AllocatorConfig, AllocatorInvariantError, ExtentAllocator, DEFAULT_BF_FREE_PCT,
    DEFAULT_BF_THRESHOLD,
};
pub use extent::{cbits, isp2, p2align, p2roundup, Extent};
