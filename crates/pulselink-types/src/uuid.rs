//! Bluetooth UUIDs for the Heart Rate GATT profile.

use uuid::{Uuid, uuid};

/// Standard Heart Rate service.
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

/// Heart Rate Measurement characteristic, notified per beat report.
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");
