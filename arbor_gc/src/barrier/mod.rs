//! Write-barrier support: remembered sets for cross-level pointers.

mod remembered_set;

pub use remembered_set::{
    for_each_remembered, num_remembered, remember, remember_down_ptr, RememberedEntry,
};
