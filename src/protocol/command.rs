use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::error::ExecError;
use crate::protocol::table::DataTable;

/// Wire tag of a parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ParamType {
    Integer = 0,
    Double = 1,
    Boolean = 2,
    Date = 3,
    String = 4,
    IntArray = 5,
    DoubleArray = 6,
}

impl TryFrom<i32> for ParamType {
    type Error = ExecError;

    fn try_from(tag: i32) -> Result<Self, Self::Error> {
        Ok(match tag {
            0 => ParamType::Integer,
            1 => ParamType::Double,
            2 => ParamType::Boolean,
            3 => ParamType::Date,
            4 => ParamType::String,
            5 => ParamType::IntArray,
            6 => ParamType::DoubleArray,
            other => {
                return Err(ExecError::Protocol(format!(
                    "unknown parameter type tag {}",
                    other
                )))
            }
        })
    }
}

/// A typed parameter value carried by an override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ParamValue {
    Integer(i32),
    Double(f64),
    Boolean(bool),
    Date(NaiveDateTime),
    String(String),
    IntArray(Vec<i32>),
    DoubleArray(Vec<f64>),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            ParamValue::Integer(_) => ParamType::Integer,
            ParamValue::Double(_) => ParamType::Double,
            ParamValue::Boolean(_) => ParamType::Boolean,
            ParamValue::Date(_) => ParamType::Date,
            ParamValue::String(_) => ParamType::String,
            ParamValue::IntArray(_) => ParamType::IntArray,
            ParamValue::DoubleArray(_) => ParamType::DoubleArray,
        }
    }

    /// Parse `raw` as a value of the named kind: `int`, `double`, `bool`,
    /// `date`, `string`, `int[]` or `double[]`. Arrays are comma-separated;
    /// dates are `YYYY-MM-DD` or `YYYY-MM-DDTHH:MM:SS`.
    pub fn parse(kind: &str, raw: &str) -> Result<Self, ExecError> {
        let invalid = |what: &str| ExecError::Protocol(format!("invalid {} value '{}'", what, raw));
        Ok(match kind {
            "int" => ParamValue::Integer(raw.trim().parse().map_err(|_| invalid("int"))?),
            "double" => ParamValue::Double(raw.trim().parse().map_err(|_| invalid("double"))?),
            "bool" => ParamValue::Boolean(raw.trim().parse().map_err(|_| invalid("bool"))?),
            "date" => ParamValue::Date(parse_date(raw.trim()).ok_or_else(|| invalid("date"))?),
            "string" => ParamValue::String(raw.to_string()),
            "int[]" => ParamValue::IntArray(
                split_list(raw)
                    .map(|v| v.parse())
                    .collect::<Result<_, _>>()
                    .map_err(|_| invalid("int[]"))?,
            ),
            "double[]" => ParamValue::DoubleArray(
                split_list(raw)
                    .map(|v| v.parse())
                    .collect::<Result<_, _>>()
                    .map_err(|_| invalid("double[]"))?,
            ),
            other => {
                return Err(ExecError::Protocol(format!(
                    "unknown parameter kind '{}'",
                    other
                )))
            }
        })
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|v| !v.is_empty())
}

fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join<T: ToString>(values: &[T]) -> String {
            values
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        }
        match self {
            ParamValue::Integer(v) => write!(f, "{}", v),
            ParamValue::Double(v) => write!(f, "{}", v),
            ParamValue::Boolean(v) => write!(f, "{}", v),
            ParamValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%dT%H:%M:%S")),
            ParamValue::String(v) => write!(f, "{}", v),
            ParamValue::IntArray(v) => write!(f, "[{}]", join(v)),
            ParamValue::DoubleArray(v) => write!(f, "[{}]", join(v)),
        }
    }
}

/// How an override's path is matched against the model by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchPolicy {
    #[default]
    FullPath,
    Name,
    NameAndType,
}

/// One parameter change applied before a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub path: String,
    pub value: ParamValue,
    #[serde(default)]
    pub policy: MatchPolicy,
}

impl Override {
    pub fn new(path: impl Into<String>, value: ParamValue) -> Self {
        Self {
            path: path.into(),
            value,
            policy: MatchPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Parses `path=kind:value`, e.g. `[Clock].StartDate=date:2020-01-01`.
/// The path is split at the last `=` so that paths may contain `=`.
impl FromStr for Override {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, typed) = s.rsplit_once('=').ok_or_else(|| {
            ExecError::Protocol(format!("expected path=kind:value, got '{}'", s))
        })?;
        let (kind, raw) = typed.split_once(':').ok_or_else(|| {
            ExecError::Protocol(format!("expected kind:value after '=', got '{}'", typed))
        })?;
        Ok(Override::new(path.trim(), ParamValue::parse(kind.trim(), raw)?))
    }
}

impl fmt::Display for Override {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} = {}", self.path, self.value)
    }
}

/// A command sent by a client. Exactly one is in flight per connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Run { overrides: Vec<Override> },
    Read { table: String, columns: Vec<String> },
    Version,
}

impl Command {
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Run { .. } => super::RUN,
            Command::Read { .. } => super::READ,
            Command::Version => super::VERSION,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Run { overrides } => write!(f, "RUN with {} override(s)", overrides.len()),
            Command::Read { table, columns } => {
                write!(f, "READ {} [{}]", table, columns.join(", "))
            }
            Command::Version => write!(f, "VERSION"),
        }
    }
}

/// What executing a command produced, before it is reported to the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Completed,
    Table(DataTable),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_type_tags_are_fixed() {
        for tag in 0..=6 {
            assert_eq!(ParamType::try_from(tag).unwrap() as i32, tag);
        }
        assert!(ParamType::try_from(7).is_err());
        assert!(ParamType::try_from(-1).is_err());
    }

    #[test]
    fn parse_override_assignment() {
        let o: Override = "[Wheat].Sowing.Population=double:120.5".parse().unwrap();
        assert_eq!(o.path, "[Wheat].Sowing.Population");
        assert_eq!(o.value, ParamValue::Double(120.5));
        assert_eq!(o.policy, MatchPolicy::FullPath);

        let o: Override = "[Clock].Start=date:2020-01-31".parse().unwrap();
        assert_eq!(
            o.value,
            ParamValue::Date(
                NaiveDate::from_ymd_opt(2020, 1, 31)
                    .unwrap()
                    .and_hms_opt(0, 0, 0)
                    .unwrap()
            )
        );

        let o: Override = "Layers=int[]:1, 2,3".parse().unwrap();
        assert_eq!(o.value, ParamValue::IntArray(vec![1, 2, 3]));
    }

    #[test]
    fn parse_override_rejects_bad_input() {
        assert!("no-equals".parse::<Override>().is_err());
        assert!("a=nokind".parse::<Override>().is_err());
        assert!("a=int:abc".parse::<Override>().is_err());
        assert!("a=float:1".parse::<Override>().is_err());
    }

    #[test]
    fn string_values_keep_their_text() {
        let o: Override = "Name=string: spaced out ".parse().unwrap();
        assert_eq!(o.value, ParamValue::String(" spaced out ".to_string()));
        assert_eq!(o.value.param_type(), ParamType::String);
    }

    #[test]
    fn command_keywords() {
        assert_eq!(Command::Version.keyword(), "VERSION");
        assert_eq!(Command::Run { overrides: vec![] }.keyword(), "RUN");
        assert_eq!(
            Command::Read {
                table: "Report".into(),
                columns: vec![]
            }
            .keyword(),
            "READ"
        );
    }
}
