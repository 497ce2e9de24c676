pub mod alias;
pub mod app;
pub mod catalog;
pub mod config;
pub mod error;
pub mod handlers;
pub mod normalize;
pub mod stream;
pub mod translate;
pub mod upstream;
