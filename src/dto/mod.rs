pub mod attempt_dto;
pub mod content_dto;
