//! Hostel rooms: the shared, concurrently edited entity.

use crate::domain::versioned::VersionedEntity;
use serde::{Deserialize, Serialize};

/// Whether a room can currently be booked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomStatus {
    /// Open for bookings
    Available,
    /// Temporarily closed
    Maintenance,
    /// No longer offered
    Retired,
}

/// A bookable room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    /// Room id
    pub id: String,
    /// Display name
    pub name: String,
    /// Number of beds
    pub capacity: u32,
    /// Nightly price in cents
    pub price_per_night_cents: u64,
    /// Booking availability
    pub status: RoomStatus,
}

/// Partial update of a room. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomChanges {
    /// New display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// New bed count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    /// New nightly price in cents
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_per_night_cents: Option<u64>,
    /// New availability
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RoomStatus>,
}

impl RoomChanges {
    /// Change only the price.
    pub fn price(cents: u64) -> Self {
        Self {
            price_per_night_cents: Some(cents),
            ..Self::default()
        }
    }

    /// Change only the status.
    pub fn status(status: RoomStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

impl VersionedEntity for Room {
    const TABLE: &'static str = "rooms";
    type Changes = RoomChanges;

    fn id(&self) -> String {
        self.id.clone()
    }
}
