//! Grid domain types
//!
//! Coordinates, bounds, colors and the authoritative cell record.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ConquestError, Result};

/// Default grid width (public API accepts 0-99)
pub const DEFAULT_GRID_WIDTH: u32 = 100;

/// Default grid height
pub const DEFAULT_GRID_HEIGHT: u32 = 100;

/// Color assigned to cells at grid initialization
pub const DEFAULT_CELL_COLOR: &str = "#0A0A0A";

/// Identity of an actor (wallet address or agent key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActorId(String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cell coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    pub x: u32,
    pub y: u32,
}

impl Coord {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Fixed grid dimensions; valid coordinates are `[0, width) x [0, height)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridBounds {
    pub width: u32,
    pub height: u32,
}

impl Default for GridBounds {
    fn default() -> Self {
        Self {
            width: DEFAULT_GRID_WIDTH,
            height: DEFAULT_GRID_HEIGHT,
        }
    }
}

impl GridBounds {
    /// Check raw (possibly negative) client coordinates and convert them
    pub fn coord(&self, x: i64, y: i64) -> Result<Coord> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return Err(ConquestError::InvalidCell {
                x,
                y,
                reason: format!(
                    "coordinates must be within 0..{} x 0..{}",
                    self.width, self.height
                ),
            });
        }
        Ok(Coord::new(x as u32, y as u32))
    }

    pub fn contains(&self, coord: Coord) -> bool {
        coord.x < self.width && coord.y < self.height
    }

    pub fn cell_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

/// `#RRGGBB` display color, stored upper-case
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl Color {
    pub fn parse(raw: &str) -> Result<Self> {
        let hex = raw
            .strip_prefix('#')
            .filter(|h| h.len() == 6 && h.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| {
                ConquestError::InvalidInput(format!(
                    "Invalid color format. Must be hex color like #FF0000. Got: {raw}"
                ))
            })?;
        Ok(Self(format!("#{}", hex.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Color {
    type Error = ConquestError;

    fn try_from(value: String) -> Result<Self> {
        Color::parse(&value)
    }
}

impl From<Color> for String {
    fn from(value: Color) -> Self {
        value.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authoritative cell state as held by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cell {
    pub coord: Coord,
    pub color: Color,
    pub current_price: Decimal,
    pub owner_id: Option<ActorId>,
    pub conquest_count: u64,
    pub last_settlement_ref: Option<String>,
}

impl Cell {
    pub fn is_owned_by(&self, actor: &ActorId) -> bool {
        self.owner_id.as_ref() == Some(actor)
    }
}

/// One requested cell, as sent by a client
#[derive(Debug, Clone, Deserialize)]
pub struct CellRequest {
    pub x: i64,
    pub y: i64,
    pub color: String,
}
