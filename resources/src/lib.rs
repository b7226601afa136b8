pub mod annotations;
pub mod informer;
pub mod models;
pub mod objects;
