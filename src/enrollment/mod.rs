pub mod capture;
pub mod client;

pub use capture::EnrollmentCapture;
pub use client::{EnrollmentClient, EnrollmentError, EnrollmentReceipt};
