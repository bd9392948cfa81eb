pub mod config;
pub mod curator;
pub mod cycle;
pub mod document;
pub mod epoch;
pub mod error;
pub mod feedback;
pub mod lock;
pub mod portability;
pub mod ports;
pub mod process;
pub mod report;
pub mod response;
pub mod server;
pub mod similarity;
pub mod store;
pub mod time;
pub mod tools;
pub mod training;
