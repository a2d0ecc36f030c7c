use std::fmt::Display;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use time::OffsetDateTime;

use crate::types::{Metric, Reading, display_name_for};

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Synthetic reading source. Each producer owns one, so no random state is shared.
pub struct ReadingGenerator<R = StdRng> {
    rng: R,
}

impl ReadingGenerator<StdRng> {
    /// Seeded generators repeat the same metric sequence.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }
}

impl<R: Rng> ReadingGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        Self { rng }
    }

    pub fn generate(&mut self, entity_id: impl Display, timestamp: Option<OffsetDateTime>) -> Reading {
        let entity_id = entity_id.to_string();
        let mut reading = Reading {
            display_name: display_name_for(&entity_id),
            entity_id,
            ph: 0.0,
            moisture: 0.0,
            co2: 0.0,
            o2: 0.0,
            nh3: 0.0,
            h2s: 0.0,
            temperature: 0.0,
            humidity: 0.0,
            timestamp: timestamp.unwrap_or_else(OffsetDateTime::now_utc),
        };
        for metric in Metric::ALL {
            let (low, high) = metric.range();
            let value = round2(self.rng.gen_range(low..=high));
            reading.set_metric(metric, value.clamp(low, high));
        }
        reading
    }
}

/// Fixed nominal reading used to verify a broker end to end.
pub fn probe_reading(timestamp: OffsetDateTime) -> Reading {
    Reading {
        entity_id: "test_001".into(),
        display_name: "Test_Device".into(),
        ph: 7.0,
        moisture: 50.0,
        co2: 400.0,
        o2: 21.0,
        nh3: 0.0,
        h2s: 0.0,
        temperature: 25.0,
        humidity: 60.0,
        timestamp,
    }
}
