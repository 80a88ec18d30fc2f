//! Tuition billing service: invoices, payments and overdue tracking for
//! tutoring-center fee administration.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod lifecycle;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
