use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A group of instrumentation that can be toggled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Suite {
    /// Request totals, timings and slow requests.
    Request,
    /// Request counts and timings per HTTP method.
    RequestMethod,
    /// Request counts and timings per response status.
    RequestStatus,
    /// Time spent in the request queue before reaching the application.
    Queue,
}

impl Suite {
    /// All known suites.
    pub const ALL: [Suite; 4] = [
        Suite::Request,
        Suite::RequestMethod,
        Suite::RequestStatus,
        Suite::Queue,
    ];

    /// Suites enabled without explicit configuration.
    pub const DEFAULT: [Suite; 3] = [Suite::Request, Suite::RequestMethod, Suite::RequestStatus];

    /// Returns the configuration name of the suite.
    pub fn name(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::RequestMethod => "request_method",
            Self::RequestStatus => "request_status",
            Self::Queue => "queue",
        }
    }
}

/// Error parsing a list of suites.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseSuitesError {
    /// The suite name is not known.
    #[error("unknown suite {0:?}")]
    UnknownSuite(String),
    /// Explicit suites cannot be combined with `+suite` or `-suite` modifiers.
    #[error("cannot mix explicit suites with +/- modifiers")]
    MixedModifiers,
}

impl FromStr for Suite {
    type Err = ParseSuitesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Suite::ALL
            .into_iter()
            .find(|suite| suite.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ParseSuitesError::UnknownSuite(s.to_owned()))
    }
}

/// The set of enabled instrumentation suites.
///
/// Parsed from a comma-separated list:
///
///  - an empty string enables the [default suites](Suite::DEFAULT),
///  - `all` and `none` enable all or no suites,
///  - `request,queue` enables exactly the listed suites,
///  - `+queue,-request_method` adds to or removes from the defaults.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct Suites {
    request: bool,
    request_method: bool,
    request_status: bool,
    queue: bool,
}

impl Suites {
    /// No suites enabled.
    pub fn none() -> Self {
        Self {
            request: false,
            request_method: false,
            request_status: false,
            queue: false,
        }
    }

    /// All suites enabled.
    pub fn all() -> Self {
        Self {
            request: true,
            request_method: true,
            request_status: true,
            queue: true,
        }
    }

    fn flag(&mut self, suite: Suite) -> &mut bool {
        match suite {
            Suite::Request => &mut self.request,
            Suite::RequestMethod => &mut self.request_method,
            Suite::RequestStatus => &mut self.request_status,
            Suite::Queue => &mut self.queue,
        }
    }

    /// Enables or disables a suite.
    pub fn set(&mut self, suite: Suite, enabled: bool) {
        *self.flag(suite) = enabled;
    }

    /// Returns `true` if the suite is enabled.
    pub fn enabled(&self, suite: Suite) -> bool {
        match suite {
            Suite::Request => self.request,
            Suite::RequestMethod => self.request_method,
            Suite::RequestStatus => self.request_status,
            Suite::Queue => self.queue,
        }
    }

    /// Returns all enabled suites.
    pub fn iter(&self) -> impl Iterator<Item = Suite> + '_ {
        Suite::ALL.into_iter().filter(|suite| self.enabled(*suite))
    }
}

impl Default for Suites {
    fn default() -> Self {
        let mut suites = Self::none();
        for suite in Suite::DEFAULT {
            suites.set(suite, true);
        }
        suites
    }
}

impl FromStr for Suites {
    type Err = ParseSuitesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(Self::default());
        } else if s.eq_ignore_ascii_case("all") {
            return Ok(Self::all());
        } else if s.eq_ignore_ascii_case("none") {
            return Ok(Self::none());
        }

        let items: Vec<&str> = s.split(',').map(str::trim).filter(|i| !i.is_empty()).collect();
        let modifiers = items
            .iter()
            .filter(|item| item.starts_with(['+', '-']))
            .count();

        if modifiers == 0 {
            let mut suites = Self::none();
            for item in items {
                suites.set(item.parse()?, true);
            }
            return Ok(suites);
        }

        if modifiers != items.len() {
            return Err(ParseSuitesError::MixedModifiers);
        }

        let mut suites = Self::default();
        for item in items {
            let (enabled, name) = match item.split_at(1) {
                ("+", name) => (true, name),
                (_, name) => (false, name),
            };
            suites.set(name.trim().parse()?, enabled);
        }

        Ok(suites)
    }
}

impl TryFrom<String> for Suites {
    type Error = ParseSuitesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Suites> for String {
    fn from(suites: Suites) -> Self {
        suites.to_string()
    }
}

impl fmt::Display for Suites {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::all() {
            return f.write_str("all");
        } else if *self == Self::none() {
            return f.write_str("none");
        }

        for (index, suite) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            f.write_str(suite.name())?;
        }

        Ok(())
    }
}

impl fmt::Debug for Suites {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Suites {
        s.parse().unwrap()
    }

    #[test]
    fn test_defaults() {
        let suites = parse("");
        assert!(suites.enabled(Suite::Request));
        assert!(suites.enabled(Suite::RequestMethod));
        assert!(suites.enabled(Suite::RequestStatus));
        assert!(!suites.enabled(Suite::Queue));
        assert_eq!(suites, Suites::default());
    }

    #[test]
    fn test_explicit_list() {
        let suites = parse("queue, request_status ");
        assert_eq!(suites.iter().collect::<Vec<_>>(), [Suite::RequestStatus, Suite::Queue]);
    }

    #[test]
    fn test_inclusion_and_exclusion() {
        let suites = parse("+queue");
        assert_eq!(suites, Suites::all());

        let suites = parse("-request_method, +queue");
        assert!(suites.enabled(Suite::Request));
        assert!(suites.enabled(Suite::RequestStatus));
        assert!(suites.enabled(Suite::Queue));
        assert!(!suites.enabled(Suite::RequestMethod));
    }

    #[test]
    fn test_all_and_none() {
        assert_eq!(parse("all"), Suites::all());
        assert_eq!(parse("NONE"), Suites::none());
        assert!(!parse("none").enabled(Suite::Request));
    }

    #[test]
    fn test_invalid() {
        assert_eq!(
            "-request_method, +queue ,request".parse::<Suites>(),
            Err(ParseSuitesError::MixedModifiers)
        );
        assert_eq!(
            "foo".parse::<Suites>(),
            Err(ParseSuitesError::UnknownSuite("foo".to_owned()))
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(Suites::default().to_string(), "request,request_method,request_status");
        assert_eq!(parse("queue").to_string(), "queue");
        assert_eq!(parse("+queue").to_string(), "all");
        assert_eq!(Suites::none().to_string(), "none");
    }
}
