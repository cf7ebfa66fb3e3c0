//! A validated `0..=100` percentage, serialized as a plain integer. Used for
//! rule thresholds expressed as a fraction of a volume or cap.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Percent(u8);

impl Percent {
    pub fn new(value: u8) -> Option<Self> {
        if value <= 100 {
            Some(Percent(value))
        } else {
            None
        }
    }

    pub fn get(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Percent {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Percent::new(value).ok_or_else(|| format!("{value} is not a valid percent (0..=100)"))
    }
}

impl From<Percent> for u8 {
    fn from(p: Percent) -> u8 {
        p.0
    }
}

#[cfg(test)]
mod tests {
    use super::Percent;

    #[test]
    fn accepts_boundary_values() {
        assert!(Percent::new(0).is_some());
        assert!(Percent::new(100).is_some());
        assert!(Percent::new(101).is_none());
    }

    #[test]
    fn round_trips_through_json() {
        let p = Percent::new(85).unwrap();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "85");
        let back: Percent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn rejects_out_of_range_json() {
        let err = serde_json::from_str::<Percent>("150");
        assert!(err.is_err());
    }
}
