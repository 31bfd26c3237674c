pub mod generation;
pub mod image_jobs;
pub mod latch;
pub mod ledger;
pub mod message_tree;
pub mod rate_guard;
