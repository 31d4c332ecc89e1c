pub mod attempt_service;
pub mod cache;
pub mod content_service;
pub mod scoring;
pub mod timer;
