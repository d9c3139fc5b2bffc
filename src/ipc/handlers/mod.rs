pub mod accounts;
pub mod core;
pub mod grades;
pub mod honors;
pub mod offerings;
pub mod reports;
pub mod sections;
pub mod session;
pub mod students;
