pub mod client;
pub mod reliable;

pub mod mock;

pub use client::VepClient;
pub use mock::{MockAnnotator, MockResponse};
pub use reliable::{ReliabilityStats, ReliableAnnotator, ReliableConfig};
