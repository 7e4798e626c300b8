pub mod expression;
pub mod federation;
pub mod sources;
pub mod templates;
