use std::fmt;
use std::str::FromStr;

use shared::error::Error;

/// Media direction of an m-line.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl Direction {
    /// The direction an answerer declares for this offered direction,
    /// per RFC 3264 section 6.1.
    pub fn reciprocal(self) -> Direction {
        match self {
            Direction::SendRecv => Direction::SendRecv,
            Direction::SendOnly => Direction::RecvOnly,
            Direction::RecvOnly => Direction::SendOnly,
            Direction::Inactive => Direction::Inactive,
        }
    }

    pub fn can_send(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::SendOnly)
    }

    pub fn can_recv(self) -> bool {
        matches!(self, Direction::SendRecv | Direction::RecvOnly)
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::SendRecv => "sendrecv",
            Direction::SendOnly => "sendonly",
            Direction::RecvOnly => "recvonly",
            Direction::Inactive => "inactive",
        };
        f.write_str(s)
    }
}

impl FromStr for Direction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sendrecv" => Ok(Direction::SendRecv),
            "sendonly" => Ok(Direction::SendOnly),
            "recvonly" => Ok(Direction::RecvOnly),
            "inactive" => Ok(Direction::Inactive),
            _ => Err(Error::ErrSdpInvalidLine(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod direction_test {
    use super::*;

    #[test]
    fn test_reciprocal() {
        assert_eq!(Direction::SendOnly.reciprocal(), Direction::RecvOnly);
        assert_eq!(Direction::RecvOnly.reciprocal(), Direction::SendOnly);
        assert_eq!(Direction::SendRecv.reciprocal(), Direction::SendRecv);
        assert_eq!(Direction::Inactive.reciprocal(), Direction::Inactive);
    }
}
