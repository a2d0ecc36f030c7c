pub mod aggregate;
pub mod channel;
pub mod config;
pub mod error;
pub mod generate;
pub mod history;
pub mod ingest;
pub mod pacing;
pub mod publish;
pub mod store;
pub mod types;

pub use aggregate::{LatestStateAggregator, reading_from_point, reduce_latest};
pub use channel::{Delivery, MessageChannel, Recorded, RecordingChannel};
pub use config::{BackfillConfig, BrokerConfig, LiveConfig, QueryConfig};
pub use error::{ChannelError, ConfigError, IngestError, PublishError, RetrievalError};
pub use generate::{ReadingGenerator, probe_reading, round2};
pub use history::HistoryRangeReader;
pub use ingest::{ingest_payload, parse_timestamp, point_from_payload};
pub use pacing::{RateController, pause, stopped};
pub use publish::{
    BackfillCursor, HistoricalBackfillPublisher, LivePublisher, PublishReport, round_robin_id,
};
pub use store::{DuckDbStore, PointQuery, PointSource, StorageMode, StoreError};
pub use types::{FieldValue, LatestSnapshot, Metric, Point, Reading, display_name_for};
