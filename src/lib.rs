pub mod code_generator;
pub mod config;
mod orm;
pub mod url_repo;
pub mod url_service;
