// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::resource::ResourceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AvailabilityType {
    Up,
    Down,
}

impl AvailabilityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UP" => Some(Self::Up),
            "DOWN" => Some(Self::Down),
            _ => None,
        }
    }
}

/// One availability interval. At most one record per resource is open
/// (`end_time == None`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRecord {
    pub resource_id: ResourceId,
    pub avail_type: AvailabilityType,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AvailabilityRecord {
    pub fn open(resource_id: ResourceId, avail_type: AvailabilityType, start_time: DateTime<Utc>) -> Self {
        Self {
            resource_id,
            avail_type,
            start_time,
            end_time: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.end_time.is_none()
    }
}
