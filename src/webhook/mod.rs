pub mod dedup;
pub mod event;
pub mod mapper;
pub mod normalizer;
pub mod pipeline;
pub mod state_machine;
