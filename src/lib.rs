pub mod certificate;
pub mod db;
pub mod error;
pub mod grading;
pub mod models;
pub mod progress;
pub mod routes;
