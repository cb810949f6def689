pub mod audit;
pub mod batch;
pub mod capture;
pub mod cleanup;
pub mod config;
pub mod model;
pub mod normalize;
pub mod paths;
pub mod query;
pub mod scheduler;
pub mod schema;
pub mod sources;
pub mod store;
pub mod util;
