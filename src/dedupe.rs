//! Hash Lock Engine: coordinates concurrent writers of identical data
//! so they collapse onto a single index query, a single duplicate
//! verification, and a single shared physical-block reference.

mod collaborators;
pub use collaborators::*;

mod wait_queue;
pub use wait_queue::*;

mod pbn_lock;
pub use pbn_lock::*;

mod hash_lock;
pub use hash_lock::*;

mod hash_zone;
pub use hash_zone::*;
