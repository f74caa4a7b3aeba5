pub mod cache;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod engine;
pub mod index;
pub mod journal;
pub mod limits;
pub mod lock;
pub mod model;
pub mod notify;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod wire;
