pub mod announcer;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod monitor;
pub mod offline;
pub mod pose;
pub mod producer;
pub mod segment;
pub mod video;
