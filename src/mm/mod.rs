//! Physical memory management.
//!
//! - [`frame`]: the user frame pool, the frame table and eviction.
//! - [`swap`]: swap slots for evicted anonymous pages.
//! - [`page_table`]: the interface to the hardware page table.

pub mod frame;
pub mod page_table;
pub mod swap;
