// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entities moved between stores.
//!
//! Two shapes exist for the same domain:
//! - **Records** ([`BookingRecord`], [`TicketRecord`], [`FlightRecord`]): flat,
//!   one per natural key, tickets referencing their booking by key.
//! - **Documents** ([`BookingDocument`], [`AirportDocument`]): denormalized
//!   graphs with children embedded (booking → tickets → flight segments,
//!   airport → flight summaries).

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::load::{EntityKind, Loadable, ParentRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlightStatus {
    Scheduled,
    #[serde(rename = "On Time")]
    OnTime,
    Delayed,
    Departed,
    Arrived,
    Cancelled,
}

/// A flight leg embedded under a ticket. Has no identity of its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightSegment {
    pub flight_no: String,
    pub departure_airport: String,
    pub arrival_airport: String,
    pub scheduled_departure: String,
    pub status: FlightStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketDocument {
    pub ticket_no: String,
    pub passenger: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_data: Option<Value>,
    #[serde(default)]
    pub flights: Vec<FlightSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingDocument {
    pub booking_ref: String,
    pub booking_date: String,
    pub total_amount: f64,
    #[serde(default)]
    pub tickets: Vec<TicketDocument>,
}

impl BookingDocument {
    pub fn segments(&self) -> impl Iterator<Item = &FlightSegment> {
        self.tickets.iter().flat_map(|t| t.flights.iter())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightSummary {
    pub flight_no: String,
    pub departure_time: String,
    pub arrival_airport: String,
    pub aircraft: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirportDocument {
    pub airport_code: String,
    pub airport_name: String,
    #[serde(default)]
    pub flights: Vec<FlightSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub book_ref: String,
    pub book_date: NaiveDate,
    pub total_amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightRecord {
    pub flight_id: i64,
    pub flight_no: String,
    pub scheduled_departure: NaiveDateTime,
    pub scheduled_arrival: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicketRecord {
    pub ticket_no: String,
    pub book_ref: String,
    pub passenger_name: String,
    /// Opaque contact payload (phone, email, ...)
    pub contact_data: Value,
}

impl Loadable for BookingDocument {
    const KIND: EntityKind = EntityKind::Booking;

    fn natural_key(&self) -> String {
        self.booking_ref.clone()
    }
}

impl Loadable for AirportDocument {
    const KIND: EntityKind = EntityKind::Airport;

    fn natural_key(&self) -> String {
        self.airport_code.clone()
    }
}

impl Loadable for BookingRecord {
    const KIND: EntityKind = EntityKind::Booking;

    fn natural_key(&self) -> String {
        self.book_ref.clone()
    }
}

impl Loadable for FlightRecord {
    const KIND: EntityKind = EntityKind::Flight;

    fn natural_key(&self) -> String {
        self.flight_id.to_string()
    }
}

impl Loadable for TicketRecord {
    const KIND: EntityKind = EntityKind::Ticket;

    fn natural_key(&self) -> String {
        self.ticket_no.clone()
    }

    fn parent(&self) -> Option<ParentRef> {
        Some(ParentRef {
            collection: EntityKind::Booking.collection(),
            key: self.book_ref.clone(),
        })
    }
}
