mod detection_store;

pub use detection_store::{DetectionStore, SqliteDetectionStore, StoreError};
