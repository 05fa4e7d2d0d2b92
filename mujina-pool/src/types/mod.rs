//! Value types shared across the pool.

mod difficulty;
mod extranonce;
mod share_rate;

pub use difficulty::{hash_to_difficulty, meets_difficulty, Difficulty};
pub use extranonce::{AllocError, Extranonce1, ExtranonceAllocator, EXTRANONCE1_SIZE};
pub use share_rate::ShareRate;
