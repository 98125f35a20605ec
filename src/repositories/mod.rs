pub mod annotation_repository;
pub mod post_repository;
pub mod view_repository;
