pub mod error;
pub mod file_repository;
pub mod models;
pub mod pool;
pub mod sensor_record_repository;

pub use error::DbError;
pub use file_repository::FileRepository;
pub use models::*;
pub use pool::{connect, connect_in_memory};
pub use sensor_record_repository::SensorRecordRepository;
