pub mod schema;

pub use schema::{AudioConfig, Config, LiveConfig, TutorConfig};
