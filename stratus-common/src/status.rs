use core::fmt::{self, Display, Formatter};
use std::borrow::Cow;

/// SMTP reply codes used by the relay.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    Ok = 250,
    StartMailInput = 354,
    Unavailable = 421,
    ActionUnavailable = 451,
    Unprocessable = 500,
    InvalidArguments = 501,
    InvalidCommandSequence = 503,
    Error = 550,
    ExceededStorage = 552,
}

impl Status {
    /// Checks if the status is a permanent rejection
    pub fn is_permanent(self) -> bool {
        u32::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u32::from(self))
    }
}

impl From<Status> for u32 {
    fn from(value: Status) -> Self {
        value as Self
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u32::from(*self))
    }
}

/// A complete SMTP reply line, such as `250 OK`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub status: Status,
    pub text: Cow<'static, str>,
}

impl Reply {
    pub fn new(status: Status, text: impl Into<Cow<'static, str>>) -> Self {
        Self {
            status,
            text: text.into(),
        }
    }

    pub fn ok() -> Self {
        Self::new(Status::Ok, "OK")
    }

    /// Returns `true` if the reply accepts whatever it answers.
    pub fn is_positive(&self) -> bool {
        u32::from(self.status) < 400
    }
}

impl Display for Reply {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} {}", self.status, self.text)
    }
}
