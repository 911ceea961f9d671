pub mod context;
pub mod dispatcher;
pub mod engine;
