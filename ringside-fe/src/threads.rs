pub mod link_reader;
pub mod monitoring;

pub use link_reader::{link_reader,
                      ReaderBoard};
pub use monitoring::{monitor_boards,
                     HealthTap};
