//! Price tracking: scheduled price checks over arbitrary product pages, price
//! history, and a digest email summarizing trends.
//!
//! Work runs through a durable job queue stored next to the application data.
//! A digest is a flow: one `check-price` job per active product, gated behind
//! a `digest-flow` parent that publishes a [`flow::FlowCompleted`] event once
//! every check has settled.

pub mod config;
pub mod database;
pub mod digest;
pub mod flow;
pub mod mailer;
pub mod models;
pub mod price;
pub mod queue;
pub mod schedule;
pub mod scraper;
pub mod scrapers;
pub mod tracker;
pub mod traits;
pub mod trends;
