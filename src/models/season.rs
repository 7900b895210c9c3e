use chrono::{Datelike, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Meteorological season
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Season {
    DJF = 1,
    MAM = 2,
    JJA = 3,
    SON = 4,
}

impl Season {
    /// Season of a calendar month (1-12)
    pub fn from_month(month: u32) -> Self {
        match (month % 12 + 3) / 3 {
            1 => Season::DJF,
            2 => Season::MAM,
            3 => Season::JJA,
            _ => Season::SON,
        }
    }

    pub fn from_datetime(datetime: &NaiveDateTime) -> Self {
        Self::from_month(datetime.month())
    }

    pub fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Season::DJF),
            2 => Some(Season::MAM),
            3 => Some(Season::JJA),
            4 => Some(Season::SON),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_uppercase().as_str() {
            "DJF" => Some(Season::DJF),
            "MAM" => Some(Season::MAM),
            "JJA" => Some(Season::JJA),
            "SON" => Some(Season::SON),
            _ => None,
        }
    }

    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        match self {
            Season::DJF => "DJF",
            Season::MAM => "MAM",
            Season::JJA => "JJA",
            Season::SON => "SON",
        }
    }

    pub fn contains(&self, datetime: &NaiveDateTime) -> bool {
        Self::from_datetime(datetime) == *self
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_season_lookup() {
        let expected = [
            (1, Season::DJF),
            (2, Season::DJF),
            (3, Season::MAM),
            (5, Season::MAM),
            (6, Season::JJA),
            (8, Season::JJA),
            (9, Season::SON),
            (11, Season::SON),
            (12, Season::DJF),
        ];
        for (month, season) in expected {
            assert_eq!(Season::from_month(month), season, "month {}", month);
        }
    }

    #[test]
    fn test_season_numbers_and_names() {
        assert_eq!(Season::JJA.number(), 3);
        assert_eq!(Season::from_number(4), Some(Season::SON));
        assert_eq!(Season::from_number(0), None);
        assert_eq!(Season::from_name("djf"), Some(Season::DJF));
        assert_eq!(Season::MAM.to_string(), "MAM");
    }
}
