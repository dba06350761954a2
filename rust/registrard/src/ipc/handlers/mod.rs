pub mod auth;
pub mod backup;
pub mod catalog;
pub mod cor;
pub mod core;
pub mod enrollments;
pub mod faculty;
pub mod grades;
pub mod notifications;
pub mod reports;
pub mod school_years;
pub mod setup;
pub mod students;
