pub mod locks;
pub mod derive;
pub mod updater;

pub use derive::derive_tags;
pub use locks::UserLocks;
pub use updater::{ProfileUpdater, SyncAck};

use thiserror::Error;

use crate::pipeline::storage::StoreError;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Profile store error: {0}")]
    Store(#[from] StoreError),

    #[error("Profile write for user {user_id} still conflicting after {attempts} attempts")]
    ConflictExhausted { user_id: String, attempts: usize },
}
